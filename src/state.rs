//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## Layout:
//! - **config**: `Arc<RwLock<AppConfig>>`; many readers, the config endpoint is the only writer
//! - **metrics**: per-endpoint request counters written by the metrics middleware
//! - **pipeline**: the recognition pipeline; it synchronizes itself, so it is only wrapped in `Arc`
//! - **start_time**: never changes, read directly for uptime
//!
//! ## Locking:
//! Locks are held only long enough to copy or update a value. A poisoned lock still guards
//! consistent data (every critical section is a single assignment or increment), so it is
//! recovered instead of propagating the panic into unrelated requests.

use crate::config::AppConfig;
use crate::pipeline::PipelineContext;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub pipeline: Arc<PipelineContext>,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: route pattern (e.g. "POST /features")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one route.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<PipelineContext>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            pipeline,
        }
    }

    /// Copy of the current configuration. Cloning releases the lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Validate and store a new configuration.
    ///
    /// The recognition section is pushed into the pipeline as well, so the aggregator and
    /// ingest path pick it up on their next item.
    pub fn update_config(&self, new_config: AppConfig) -> anyhow::Result<()> {
        new_config.validate()?;
        self.pipeline.update_settings(new_config.recognition.clone())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Record one finished request (called by the metrics middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        // The first request to a route creates its entry
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot for the health and metrics endpoints, taken without holding the lock while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::test_support::failing_loader;

    fn state() -> AppState {
        let config = AppConfig::default();
        let pipeline = Arc::new(PipelineContext::new(&config, failing_loader()));
        AppState::new(config, pipeline)
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("POST /features", 4, false);
        state.record_endpoint_request("POST /features", 6, true);
        state.record_endpoint_request("GET /translation", 1, false);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);

        let features = &metrics.endpoint_metrics["POST /features"];
        assert_eq!(features.average_duration_ms(), 5.0);
        assert_eq!(features.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_reaches_pipeline() {
        let state = state();
        let mut config = state.get_config();
        config.recognition.confidence_threshold = 0.8;
        state.update_config(config).unwrap();

        assert_eq!(state.get_config().recognition.confidence_threshold, 0.8);
        assert_eq!(state.pipeline.policy().confidence_threshold, 0.8);
    }

    #[test]
    fn test_invalid_update_changes_nothing() {
        let state = state();
        let mut config = state.get_config();
        config.recognition.confidence_threshold = -1.0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().recognition.confidence_threshold, 0.6);
    }
}
