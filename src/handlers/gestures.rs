//! # Gesture Stream Handlers
//!
//! - `POST /features`: submit one frame (126 values) or a pre-batched window (1260 values)
//! - `GET /translation`: poll the next recognition result, never blocks
//! - `POST /toggle_auto_recognition`: turn the pipeline on or off
//! - `GET /api/v1/gestures`: the class-index → label table
//!
//! Ingestion and classifier loading are synchronous and may take a while, so they run on
//! actix's blocking thread pool via `web::block` instead of the async workers.

use crate::error::AppError;
use crate::pipeline::item::now_ms;
use crate::pipeline::{ingest, FeatureRequest};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};
use tracing::{error, info};

pub async fn receive_features(
    state: web::Data<AppState>,
    body: web::Json<FeatureRequest>,
) -> Result<HttpResponse, AppError> {
    let received_ms = now_ms();
    let pipeline = state.pipeline.clone();
    let request = body.into_inner();

    let outcome = web::block(move || ingest(&pipeline, request, received_ms))
        .await
        .map_err(|e| AppError::Internal(format!("Feature ingestion task failed: {}", e)))??;

    Ok(HttpResponse::Ok().json(outcome.into_reply(received_ms)))
}

pub async fn get_translation(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.pipeline.publisher().poll(now_ms()))
}

pub async fn toggle_auto_recognition(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> Result<HttpResponse, AppError> {
    let enabled = body.get("enabled").and_then(Value::as_bool).ok_or_else(|| {
        AppError::BadRequest("Invalid request format: expected {\"enabled\": true/false}".to_string())
    })?;

    let pipeline = state.pipeline.clone();
    let toggled = web::block(move || pipeline.set_enabled(enabled))
        .await
        .map_err(|e| AppError::Internal(format!("Toggle task failed: {}", e)))?;

    if let Err(err) = toggled {
        error!(error = %format!("{:#}", err), "Failed to enable auto recognition");
        return Err(AppError::ClassifierUnavailable("Failed to load model".to_string()));
    }

    let enabled = state.pipeline.is_enabled();
    info!(enabled, "Auto recognition toggled");
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "auto_recognition": enabled
    })))
}

pub async fn list_gestures(state: web::Data<AppState>) -> HttpResponse {
    let labels = state.pipeline.labels();
    let gestures: Vec<Value> = labels
        .iter()
        .map(|(class_id, label)| json!({ "class_id": class_id, "label": label }))
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "label_order": state.get_config().classifier.label_order,
        "count": labels.len(),
        "gestures": gestures
    }))
}
