//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_RECOGNITION__CONFIDENCE_THRESHOLD, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The HTTP server, the classifier artifact, the recognition policy and the
/// queue bounds change for different reasons, so each gets its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub classifier: ClassifierConfig,
    pub recognition: RecognitionConfig,
    pub queues: QueueConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How class indices in the classifier output map onto gesture labels.
///
/// The classifier artifact was produced with a fixed index assignment. The
/// label table must reproduce it exactly; a mismatch silently mislabels every
/// recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOrder {
    /// Index `i` is the `i`-th label after sorting the vocabulary.
    Alphabetical,
    /// Index `i` is the `i`-th label exactly as listed.
    AsListed,
}

/// Gesture classifier artifact settings.
///
/// ## Fields:
/// - `model_path`: safetensors file holding the classifier head
/// - `labels`: the gesture vocabulary the classifier was trained on
/// - `label_order`: how `labels` maps onto class indices
/// - `timeout_ms`: upper bound on a single prediction (0 = wait indefinitely)
/// - `load_on_startup`: load the classifier before the server accepts traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub model_path: String,
    pub labels: Vec<String>,
    pub label_order: LabelOrder,
    pub timeout_ms: u64,
    pub load_on_startup: bool,
}

/// Recognition policy: gating, thresholds and timing of the windowing loop.
///
/// ## Tuning guidelines:
/// - Raising `confidence_threshold` trades missed gestures for fewer false positives
/// - `min_recognition_interval_ms` caps classifier invocations per second
/// - `idle_reset_ms` discards a half-filled window once the client goes quiet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub auto_recognition_enabled: bool,
    pub confidence_threshold: f32,
    pub min_recognition_interval_ms: u64,
    pub idle_reset_ms: u64,
    pub poll_timeout_ms: u64,
    /// Single frames with fewer non-zero values are skipped as "no hand".
    pub min_frame_non_zero: usize,
    /// Pre-batched sequences with fewer non-zero values are skipped.
    pub min_sequence_non_zero: usize,
    /// Windows below this non-zero percentage never reach the classifier.
    pub min_window_non_zero_percent: f32,
}

/// Bounded queue capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub feature_queue_size: usize,
    pub result_queue_size: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            classifier: ClassifierConfig {
                model_path: "model/gesture_classifier.safetensors".to_string(),
                labels: vec![
                    "binoculars".to_string(),
                    "hello".to_string(),
                    "hi".to_string(),
                    "read".to_string(),
                ],
                label_order: LabelOrder::Alphabetical,
                timeout_ms: 2000,
                load_on_startup: true,
            },
            recognition: RecognitionConfig {
                auto_recognition_enabled: true,
                confidence_threshold: 0.6,
                min_recognition_interval_ms: 100,
                idle_reset_ms: 5000,
                poll_timeout_ms: 500,
                min_frame_non_zero: 10,
                min_sequence_non_zero: 50,
                min_window_non_zero_percent: 5.0,
            },
            queues: QueueConfig {
                feature_queue_size: 50,
                result_queue_size: 20,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=8080`: Override server port
    /// - `APP_CLASSIFIER__MODEL_PATH=/models/lstm.safetensors`: Override artifact path
    /// - `APP_RECOGNITION__CONFIDENCE_THRESHOLD=0.75`: Override the threshold
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names may keep theirs
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// A zero-capacity queue or an empty label table would make the pipeline
    /// silently useless; failing at startup gives a clear message instead.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.queues.feature_queue_size == 0 {
            return Err(anyhow::anyhow!("Feature queue size must be greater than 0"));
        }

        if self.queues.result_queue_size == 0 {
            return Err(anyhow::anyhow!("Result queue size must be greater than 0"));
        }

        if self.classifier.labels.is_empty() {
            return Err(anyhow::anyhow!("Gesture vocabulary cannot be empty"));
        }

        let mut seen = HashSet::new();
        for label in &self.classifier.labels {
            if label.trim().is_empty() {
                return Err(anyhow::anyhow!("Gesture labels cannot be blank"));
            }
            if !seen.insert(label.as_str()) {
                return Err(anyhow::anyhow!("Duplicate gesture label '{}'", label));
            }
        }

        self.recognition.validate()
    }

    /// Update the recognition tuning from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example `{"recognition": {"confidence_threshold": 0.7}}`
    /// changes only the threshold. Server, classifier and queue settings are fixed for the
    /// lifetime of the process and are ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(recognition) = partial_config.get("recognition") {
            let r = &mut self.recognition;
            if let Some(v) = recognition.get("confidence_threshold").and_then(|v| v.as_f64()) {
                r.confidence_threshold = v as f32;
            }
            if let Some(v) = recognition.get("min_recognition_interval_ms").and_then(|v| v.as_u64()) {
                r.min_recognition_interval_ms = v;
            }
            if let Some(v) = recognition.get("idle_reset_ms").and_then(|v| v.as_u64()) {
                r.idle_reset_ms = v;
            }
            if let Some(v) = recognition.get("min_frame_non_zero").and_then(|v| v.as_u64()) {
                r.min_frame_non_zero = v as usize;
            }
            if let Some(v) = recognition.get("min_sequence_non_zero").and_then(|v| v.as_u64()) {
                r.min_sequence_non_zero = v as usize;
            }
            if let Some(v) = recognition.get("min_window_non_zero_percent").and_then(|v| v.as_f64()) {
                r.min_window_non_zero_percent = v as f32;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl RecognitionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow::anyhow!(
                "Confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }

        if !(0.0..=100.0).contains(&self.min_window_non_zero_percent) {
            return Err(anyhow::anyhow!(
                "Window non-zero percentage must be within [0, 100], got {}",
                self.min_window_non_zero_percent
            ));
        }

        if self.poll_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Poll timeout must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.queues.feature_queue_size, 50);
        assert_eq!(config.queues.result_queue_size, 20);
        assert_eq!(config.recognition.confidence_threshold, 0.6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queues.feature_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognition.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let mut config = AppConfig::default();
        config.classifier.labels.push("hello".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"recognition": {"confidence_threshold": 0.75, "idle_reset_ms": 2000}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.recognition.confidence_threshold, 0.75);
        assert_eq!(config.recognition.idle_reset_ms, 2000);
        // Untouched fields keep their values
        assert_eq!(config.recognition.min_recognition_interval_ms, 100);
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_config_update_rejects_invalid_threshold() {
        let mut config = AppConfig::default();
        let json = r#"{"recognition": {"confidence_threshold": 2.0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
