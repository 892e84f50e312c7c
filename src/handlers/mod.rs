pub mod config;
pub mod gestures;

pub use self::config::*;
pub use self::gestures::*;

use crate::error::AppError;
use actix_web::{error::JsonPayloadError, web};

/// Largest accepted JSON body. A 1260-value window with long decimals stays well below it.
const JSON_LIMIT_BYTES: usize = 256 * 1024;

/// JSON extractor settings shared by every route: a missing or wrong `Content-Type` is a 415,
/// any other body problem a 400, both in the standard error envelope.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(JSON_LIMIT_BYTES)
        .error_handler(|err, _req| {
            let app_error = match err {
                JsonPayloadError::ContentType => {
                    AppError::UnsupportedMediaType("Content-Type must be application/json".to_string())
                }
                other => AppError::BadRequest(format!("Invalid JSON body: {}", other)),
            };
            app_error.into()
        })
}
