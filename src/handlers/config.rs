use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut config = state.get_config();
    // The toggle lives on the pipeline; report its live value
    config.recognition.auto_recognition_enabled = state.pipeline.is_enabled();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partially update recognition tuning, e.g. `{"recognition": {"confidence_threshold": 0.7}}`.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "recognition": current_config.recognition
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers::json_config;
    use crate::pipeline::context::test_support::failing_loader;
    use crate::pipeline::PipelineContext;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_config_round_trip_through_http() {
        let config = AppConfig::default();
        let pipeline = Arc::new(PipelineContext::new(&config, failing_loader()));
        let state = AppState::new(config, pipeline);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .app_data(json_config())
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "recognition": { "confidence_threshold": 0.75, "idle_reset_ms": 3000 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.pipeline.policy().confidence_threshold, 0.75);
        assert_eq!(state.pipeline.settings().idle_reset_ms, 3000);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["recognition"]["idle_reset_ms"], 3000);
        assert_eq!(body["config"]["server"]["port"], 5000);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "recognition": { "confidence_threshold": 2.0 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.pipeline.policy().confidence_threshold, 0.75);
    }
}
