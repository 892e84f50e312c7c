use crate::pipeline::classifier::ClassifierStatus;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// Service status: uptime, recognition toggle, classifier and queue state.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let pipeline = &state.pipeline;
    let classifier = pipeline.classifier_status();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "gesture-stream-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "auto_recognition_enabled": pipeline.is_enabled(),
        "classifier": classifier_json(&classifier, &config.classifier.model_path),
        "queues": pipeline.queue_status(),
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "memory": get_memory_info(),
        "system": get_system_status(&state)
    }))
}

/// Per-endpoint request metrics plus pipeline counters.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats(&metrics),
        "pipeline": {
            "auto_recognition_enabled": state.pipeline.is_enabled(),
            "classifier_load_attempts": state.pipeline.classifier().load_attempts(),
            "classifier_calls_running": state.pipeline.inference_calls_running(),
            "counters": state.pipeline.stats().snapshot(),
            "queues": state.pipeline.queue_status()
        },
        "memory": get_memory_info()
    }))
}

fn classifier_json(status: &ClassifierStatus, model_path: &str) -> serde_json::Value {
    // Load errors may name local paths; only the status is reported
    let name = match status {
        ClassifierStatus::Loaded { name } => Some(name.as_str()),
        _ => None,
    };
    json!({
        "status": status.as_str(),
        "name": name,
        "model_path": model_path
    })
}

fn endpoint_stats(metrics: &AppMetrics) -> Vec<serde_json::Value> {
    let mut stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));
    stats
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |key: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(key))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": process::id(),
        "available": false
    })
}

/// Load indicator from queue occupancy. A feature queue that stays near capacity means
/// the aggregator cannot keep up with the client frame rate.
fn get_system_status(state: &AppState) -> serde_json::Value {
    let features = state.pipeline.features();
    let usage = if features.capacity() > 0 {
        features.size() as f64 / features.capacity() as f64
    } else {
        0.0
    };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "feature_queue_usage_percent": (usage * 100.0).round(),
        "load_warnings": if usage > 0.8 {
            vec!["Feature queue nearly full - frames are being evicted"]
        } else {
            vec![]
        }
    })
}
