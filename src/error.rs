//! # Error Handling
//!
//! This module defines custom error types and how they're converted to HTTP responses.
//!
//! ## Error Categories:
//! - **ValidationError / BadRequest**: malformed payloads, never queued (400)
//! - **UnsupportedMediaType**: body is not JSON (415)
//! - **ServiceOverloaded**: feature queue full after one eviction attempt (503, transient)
//! - **ClassifierUnavailable**: the classifier could not be loaded (500 on the admin toggle;
//!   the streaming paths turn this into a 200 "try again" outcome instead)
//! - **Internal / ConfigError**: anything unexpected (500); the detail is logged, never returned
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "status": "error",
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Expected 126 or 1260 features, got 12",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (unexpected failures anywhere in the pipeline)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Request body was not `application/json`
    UnsupportedMediaType(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A bounded queue could not admit the item even after evicting the oldest one
    ServiceOverloaded(String),

    /// The classifier is not loaded and could not be loaded on demand
    ClassifierUnavailable(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::UnsupportedMediaType(msg) => write!(f, "Unsupported media type: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceOverloaded(msg) => write!(f, "Service overloaded: {}", msg),
            AppError::ClassifierUnavailable(msg) => write!(f, "Classifier unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable error type used in the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::UnsupportedMediaType(_) => "unsupported_media_type",
            AppError::ValidationError(_) => "validation_error",
            AppError::ServiceOverloaded(_) => "service_overloaded",
            AppError::ClassifierUnavailable(_) => "classifier_unavailable",
            AppError::ConfigError(_) => "config_error",
        }
    }

    /// Message safe to show to the client.
    ///
    /// Internal and configuration failures are replaced with a generic text so
    /// that pipeline internals never leak into responses.
    fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => {
                "Internal server error".to_string()
            }
            AppError::BadRequest(msg)
            | AppError::UnsupportedMediaType(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceOverloaded(msg)
            | AppError::ClassifierUnavailable(msg) => msg.clone(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ClassifierUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::ServiceOverloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, AppError::Internal(_) | AppError::ConfigError(_)) {
            tracing::error!(error = %self, "Request failed with internal error");
        }

        HttpResponse::build(self.status_code()).json(json!({
            "status": "error",
            "error": {
                "type": self.kind(),
                "message": self.public_message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request) response.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
