//! # Frame Ingestor
//!
//! Boundary between `POST /features` and the pipeline. Validates the payload, applies the
//! sparse-input gates and either queues a single frame for the aggregator or classifies a
//! pre-batched window inline.
//!
//! ## Order of checks:
//! 1. `features` must be a list of exactly 126 or 1260 numbers (numeric strings are accepted)
//! 2. Disabled recognition acknowledges the payload and stops
//! 3. Sparse frames and mostly-empty sequences are skipped, never rejected
//! 4. Single frames go through the evict-oldest overflow policy; pre-batched windows are classified
//!
//! Only structural problems and overload are errors. Everything else is an [`IngestOutcome`]
//! that the handler turns into a `200`.

use crate::error::{AppError, AppResult};
use crate::pipeline::context::{PipelineContext, Publication};
use crate::pipeline::frame::{count_non_zero, Frame, Window, FRAME_LEN, WINDOW_LEN};
use crate::pipeline::item::{now_ms, QueueItem, Stamp};
use crate::pipeline::policy::ClassifyOutcome;
use crate::pipeline::publisher::RecognitionResult;
use crate::pipeline::queue::PutOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Below this mean frame-to-frame difference a window is most likely one frame repeated.
const DUPLICATE_FRAME_DIFFERENCE: f32 = 0.0005;

/// Body of `POST /features`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureRequest {
    pub features: Option<Value>,
    /// Client capture time, opaque to the server.
    pub timestamp: Option<Value>,
}

impl FeatureRequest {
    pub fn client_timestamp(&self) -> Option<String> {
        match &self.timestamp {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Frame,
    Sequence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Queued,
    QueuedAfterEviction,
    SkippedSparseFrame { non_zero: usize },
    Disabled(PayloadKind),
    SequenceSkipped { non_zero: usize },
    SequenceRecognized(RecognitionResult),
    SequenceNoGesture,
    ClassifierUnavailable,
    ClassificationTimedOut,
    ClassificationFailed,
}

/// JSON body returned for every accepted payload.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReply {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RecognitionResult>,
}

impl IngestOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            IngestOutcome::Queued | IngestOutcome::QueuedAfterEviction => "Features received",
            IngestOutcome::SkippedSparseFrame { .. } => "Features received (mostly empty, skipped)",
            IngestOutcome::Disabled(PayloadKind::Frame) => {
                "Features received (auto-recognition disabled)"
            }
            IngestOutcome::Disabled(PayloadKind::Sequence) => {
                "Sequence received (auto-recognition disabled)"
            }
            IngestOutcome::SequenceSkipped { .. } => "Sequence received (mostly empty, skipped)",
            IngestOutcome::SequenceRecognized(_) => "Sequence received (gesture recognized)",
            IngestOutcome::SequenceNoGesture => "Sequence received (no gesture recognized)",
            IngestOutcome::ClassifierUnavailable => {
                "Server is still initializing or model file is missing. Please try again in a moment."
            }
            IngestOutcome::ClassificationTimedOut => "Sequence received (classification timed out)",
            IngestOutcome::ClassificationFailed => "Sequence received (classification failed)",
        }
    }

    /// `"error"` for outcomes where the payload was accepted but not acted on because of
    /// a server-side condition the client may retry.
    pub fn status(&self) -> &'static str {
        match self {
            IngestOutcome::ClassifierUnavailable
            | IngestOutcome::ClassificationTimedOut
            | IngestOutcome::ClassificationFailed => "error",
            _ => "success",
        }
    }

    pub fn into_reply(self, received_ms: u64) -> IngestReply {
        let status = self.status();
        let message = self.message();
        let result = match self {
            IngestOutcome::SequenceRecognized(result) => Some(result),
            _ => None,
        };
        IngestReply {
            status,
            message,
            timestamp: received_ms,
            result,
        }
    }
}

/// Validate `request` and hand it to the pipeline.
pub fn ingest(ctx: &PipelineContext, request: FeatureRequest, received_ms: u64) -> AppResult<IngestOutcome> {
    let values = parse_features(request.features.as_ref())?;
    let kind = if values.len() == FRAME_LEN {
        PayloadKind::Frame
    } else {
        PayloadKind::Sequence
    };

    if !ctx.is_enabled() {
        debug!(?kind, "Auto recognition disabled, payload acknowledged without processing");
        return Ok(IngestOutcome::Disabled(kind));
    }

    let stamp = Stamp::new(request.client_timestamp(), received_ms);
    match kind {
        PayloadKind::Frame => ingest_frame(ctx, values, stamp),
        PayloadKind::Sequence => ingest_sequence(ctx, &values, stamp),
    }
}

/// Extract exactly 126 or 1260 finite numbers from the `features` field.
pub fn parse_features(features: Option<&Value>) -> AppResult<Vec<f32>> {
    let features = features
        .filter(|v| !v.is_null())
        .ok_or_else(|| AppError::BadRequest("Missing 'features' key in JSON".to_string()))?;

    let items = features.as_array().ok_or_else(|| {
        AppError::ValidationError(format!(
            "Invalid features format: expected a list, got {}",
            json_type_name(features)
        ))
    })?;

    if items.len() != FRAME_LEN && items.len() != WINDOW_LEN {
        return Err(AppError::ValidationError(format!(
            "Invalid number of features. Expected {} or {}, got {}",
            FRAME_LEN,
            WINDOW_LEN,
            items.len()
        )));
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let value = match item {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .map(|v| v as f32)
            .filter(|v| v.is_finite());

            value.ok_or_else(|| {
                AppError::ValidationError(format!("Non-numeric data in features at index {}", index))
            })
        })
        .collect()
}

fn ingest_frame(ctx: &PipelineContext, values: Vec<f32>, stamp: Stamp) -> AppResult<IngestOutcome> {
    let min_non_zero = ctx.settings().min_frame_non_zero;
    let non_zero = count_non_zero(&values);
    if non_zero < min_non_zero {
        ctx.stats().record_frame_skipped();
        debug!(non_zero, threshold = min_non_zero, "Near-empty frame skipped");
        return Ok(IngestOutcome::SkippedSparseFrame { non_zero });
    }

    let frame = Frame::from_vec(values).map_err(|e| AppError::ValidationError(e.to_string()))?;
    let queue = ctx.features();
    match queue.put_or_evict_oldest(QueueItem::frame(frame.into_inner(), stamp)) {
        PutOutcome::Inserted => {
            ctx.stats().record_frame_queued();
            Ok(IngestOutcome::Queued)
        }
        PutOutcome::EvictedOldest => {
            ctx.stats().record_frame_evicted();
            ctx.stats().record_frame_queued();
            warn!(
                queue = queue.name(),
                capacity = queue.capacity(),
                "Feature queue full, oldest frame evicted"
            );
            Ok(IngestOutcome::QueuedAfterEviction)
        }
        PutOutcome::Rejected(_) => {
            ctx.stats().record_overload();
            error!(
                queue = queue.name(),
                capacity = queue.capacity(),
                "Feature queue still full after eviction, rejecting frame"
            );
            Err(AppError::ServiceOverloaded("Server overloaded (queue full)".to_string()))
        }
    }
}

fn ingest_sequence(ctx: &PipelineContext, values: &[f32], stamp: Stamp) -> AppResult<IngestOutcome> {
    let window = Window::from_flat(values).map_err(|e| AppError::ValidationError(e.to_string()))?;
    let epoch = ctx.epoch();

    let min_non_zero = ctx.settings().min_sequence_non_zero;
    let non_zero = window.non_zero_count();
    if non_zero < min_non_zero {
        ctx.stats().record_sequence_skipped();
        warn!(non_zero, threshold = min_non_zero, "Sequence mostly empty, skipped");
        return Ok(IngestOutcome::SequenceSkipped { non_zero });
    }

    let variation = window.mean_frame_difference();
    if variation < DUPLICATE_FRAME_DIFFERENCE {
        warn!(
            mean_difference = variation,
            "Sequence frames are nearly identical, recognition quality may suffer"
        );
    }

    let classifier = match ctx.classifier().get_or_load() {
        Ok(classifier) => classifier,
        Err(_) => {
            warn!("Classifier not available for pre-batched sequence");
            return Ok(IngestOutcome::ClassifierUnavailable);
        }
    };

    info!(non_zero, "Classifying pre-batched sequence");
    match ctx.classify(&window, &classifier) {
        ClassifyOutcome::Gesture(detection) => {
            let result =
                RecognitionResult::from_detection(&detection, stamp.client, stamp.received_ms, now_ms());
            match ctx.publish_if_current(epoch, result.clone()) {
                Publication::Stale => Ok(IngestOutcome::Disabled(PayloadKind::Sequence)),
                Publication::Published | Publication::Dropped => {
                    Ok(IngestOutcome::SequenceRecognized(result))
                }
            }
        }
        ClassifyOutcome::NoGesture => Ok(IngestOutcome::SequenceNoGesture),
        ClassifyOutcome::LowQuality { non_zero } => {
            ctx.stats().record_sequence_skipped();
            Ok(IngestOutcome::SequenceSkipped { non_zero })
        }
        ClassifyOutcome::TimedOut => Ok(IngestOutcome::ClassificationTimedOut),
        ClassifyOutcome::Failed(_) => Ok(IngestOutcome::ClassificationFailed),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::context::test_support::*;
    use serde_json::json;

    /// A frame with `non_zero` non-zero values spread across the 126 slots.
    fn spread_frame(non_zero: usize) -> Vec<f32> {
        let mut values = vec![0.0; FRAME_LEN];
        let step = FRAME_LEN / non_zero.max(1);
        for i in 0..non_zero {
            values[i * step] = 0.1 + i as f32 * 0.01;
        }
        values
    }

    fn request(values: &[f32]) -> FeatureRequest {
        FeatureRequest {
            features: Some(json!(values)),
            timestamp: Some(json!("client-1")),
        }
    }

    #[test]
    fn test_valid_frame_is_queued_once() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        let outcome = ingest(&ctx, request(&spread_frame(20)), 100).unwrap();
        assert_eq!(outcome, IngestOutcome::Queued);
        assert_eq!(ctx.features().size(), 1);

        let item = ctx.features().try_get_now().unwrap();
        assert_eq!(item.stamp, Stamp::new(Some("client-1".to_string()), 100));
    }

    #[test]
    fn test_sparse_frame_is_skipped() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        let outcome = ingest(&ctx, request(&spread_frame(2)), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::SkippedSparseFrame { non_zero: 2 });
        assert_eq!(outcome.message(), "Features received (mostly empty, skipped)");
        assert_eq!(ctx.features().size(), 0);
    }

    #[test]
    fn test_wrong_length_is_validation_error() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        let err = ingest(&ctx, request(&[0.5; 12]), 0).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert_eq!(ctx.features().size(), 0);
    }

    #[test]
    fn test_non_numeric_values_are_rejected() {
        let mut items: Vec<Value> = spread_frame(20).into_iter().map(|v| json!(v)).collect();
        items[5] = json!("abc");
        let err = parse_features(Some(&Value::Array(items.clone()))).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        items[5] = json!(true);
        assert!(parse_features(Some(&Value::Array(items))).is_err());
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let items: Vec<Value> = (0..FRAME_LEN).map(|i| json!(format!("{}", i as f32 / 10.0))).collect();
        let values = parse_features(Some(&Value::Array(items))).unwrap();
        assert_eq!(values.len(), FRAME_LEN);
        assert_eq!(values[10], 1.0);
    }

    #[test]
    fn test_missing_features_is_bad_request() {
        assert!(matches!(parse_features(None), Err(AppError::BadRequest(_))));
        assert!(matches!(
            parse_features(Some(&json!({"x": 1}))),
            Err(AppError::ValidationError(_))
        ));
    }

    #[test]
    fn test_disabled_acknowledges_without_enqueue() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        ctx.set_enabled(false).unwrap();

        let outcome = ingest(&ctx, request(&spread_frame(20)), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::Disabled(PayloadKind::Frame));
        assert_eq!(ctx.features().size(), 0);

        let outcome = ingest(&ctx, request(&vec![0.3; WINDOW_LEN]), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::Disabled(PayloadKind::Sequence));

        // Structural validation still applies while disabled
        assert!(ingest(&ctx, request(&[1.0; 3]), 0).is_err());
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let mut config = AppConfig::default();
        config.queues.feature_queue_size = 2;
        let ctx = context_with(&config, failing_loader());

        for ts in 0..2u64 {
            ingest(&ctx, request(&spread_frame(20)), ts).unwrap();
        }
        let outcome = ingest(&ctx, request(&spread_frame(30)), 99).unwrap();
        assert_eq!(outcome, IngestOutcome::QueuedAfterEviction);
        assert_eq!(ctx.features().size(), 2);

        assert_eq!(ctx.features().try_get_now().unwrap().stamp.received_ms, 1);
        assert_eq!(ctx.features().try_get_now().unwrap().stamp.received_ms, 99);
        assert_eq!(ctx.stats().snapshot().frames_evicted, 1);
    }

    #[test]
    fn test_overload_when_eviction_cannot_make_room() {
        let mut config = AppConfig::default();
        config.queues.feature_queue_size = 0;
        let ctx = context_with(&config, failing_loader());

        let err = ingest(&ctx, request(&spread_frame(20)), 0).unwrap_err();
        assert!(matches!(err, AppError::ServiceOverloaded(_)));
        assert_eq!(ctx.stats().snapshot().overload_rejections, 1);
    }

    #[test]
    fn test_mostly_empty_sequence_skips_classifier() {
        let stub = StubClassifier::new(vec![0.1, 0.9, 0.05, 0.0]);
        let ctx = context_with(&AppConfig::default(), loader_for(stub.clone()));

        let mut values = vec![0.0; WINDOW_LEN];
        for v in values.iter_mut().step_by(40).take(30) {
            *v = 0.7;
        }
        let outcome = ingest(&ctx, request(&values), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::SequenceSkipped { non_zero: 30 });
        assert_eq!(outcome.message(), "Sequence received (mostly empty, skipped)");
        assert_eq!(stub.call_count(), 0);
    }

    #[test]
    fn test_sequence_is_classified_inline_and_published() {
        let stub = StubClassifier::new(vec![0.1, 0.9, 0.05, 0.0]);
        let ctx = context_with(&AppConfig::default(), loader_for(stub.clone()));

        let values: Vec<f32> = (0..WINDOW_LEN).map(|i| (i % 7) as f32 * 0.1).collect();
        let outcome = ingest(&ctx, request(&values), 42).unwrap();

        let IngestOutcome::SequenceRecognized(result) = outcome else {
            panic!("expected a recognized sequence, got {:?}", outcome);
        };
        assert_eq!(result.gesture, "hello");
        assert_eq!(result.class_id, 1);
        assert_eq!(result.client_timestamp.as_deref(), Some("client-1"));
        assert_eq!(result.server_received_timestamp, Some(42));
        assert_eq!(stub.call_count(), 1);
        // Nothing went through the feature queue
        assert_eq!(ctx.features().size(), 0);
        assert_eq!(ctx.results().size(), 1);
    }

    #[test]
    fn test_sequence_below_threshold_publishes_nothing() {
        let stub = StubClassifier::new(vec![0.3, 0.3, 0.2, 0.2]);
        let ctx = context_with(&AppConfig::default(), loader_for(stub));

        let outcome = ingest(&ctx, request(&vec![0.4; WINDOW_LEN]), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::SequenceNoGesture);
        assert_eq!(ctx.results().size(), 0);
    }

    #[test]
    fn test_disable_during_sequence_classification_publishes_nothing() {
        let (classifier, gate) = GatedClassifier::new(vec![0.1, 0.95, 0.05, 0.0]);
        let ctx = context_with(&AppConfig::default(), loader_for(classifier));

        let worker_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            ingest(&worker_ctx, request(&vec![0.4; WINDOW_LEN]), 5)
        });

        gate.started
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        ctx.set_enabled(false).unwrap();
        gate.release.send(()).unwrap();

        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome, IngestOutcome::Disabled(PayloadKind::Sequence));
        assert_eq!(ctx.results().size(), 0);
        assert!(!ctx.publisher().poll(0).result.is_gesture());
        assert_eq!(ctx.stats().snapshot().stale_results_discarded, 1);
    }

    #[test]
    fn test_sequence_without_classifier_asks_to_retry() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        let outcome = ingest(&ctx, request(&vec![0.4; WINDOW_LEN]), 7).unwrap();
        assert_eq!(outcome, IngestOutcome::ClassifierUnavailable);

        let reply = outcome.into_reply(7);
        assert_eq!(reply.status, "error");
        assert_eq!(reply.timestamp, 7);
    }
}
