//! Result queue producer side and the poll consumer.

use crate::pipeline::policy::Detection;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stats::PipelineStats;
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome handed to clients by the poll endpoint.
///
/// An empty `gesture` with `class_id == -1` and zero confidence means "no gesture".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub gesture: String,
    pub confidence: f32,
    pub class_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_received_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition_timestamp: Option<u64>,
}

impl RecognitionResult {
    /// The canonical "no gesture" placeholder.
    pub fn none() -> Self {
        Self {
            gesture: String::new(),
            confidence: 0.0,
            class_id: -1,
            client_timestamp: None,
            server_received_timestamp: None,
            recognition_timestamp: None,
        }
    }

    pub fn from_detection(
        detection: &Detection,
        client_timestamp: Option<String>,
        server_received_timestamp: u64,
        recognition_timestamp: u64,
    ) -> Self {
        Self {
            gesture: detection.label.clone(),
            confidence: detection.confidence,
            class_id: detection.class_id as i64,
            client_timestamp,
            server_received_timestamp: Some(server_received_timestamp),
            recognition_timestamp: Some(recognition_timestamp),
        }
    }

    pub fn is_gesture(&self) -> bool {
        !self.gesture.is_empty()
    }
}

/// Body of `GET /translation`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResponse {
    #[serde(flatten)]
    pub result: RecognitionResult,
    pub server_timestamp_ms: u64,
}

/// Borrowed view over the result queue.
pub struct ResultPublisher<'a> {
    results: &'a BoundedQueue<RecognitionResult>,
    stats: &'a PipelineStats,
}

impl<'a> ResultPublisher<'a> {
    pub fn new(results: &'a BoundedQueue<RecognitionResult>, stats: &'a PipelineStats) -> Self {
        Self { results, stats }
    }

    /// Best-effort enqueue. A full result queue drops the new result.
    pub fn publish(&self, result: RecognitionResult) -> bool {
        match self.results.try_put(result) {
            Ok(()) => {
                self.stats.record_published();
                true
            }
            Err(dropped) => {
                self.stats.record_result_dropped();
                warn!(
                    queue = self.results.name(),
                    capacity = self.results.capacity(),
                    gesture = %dropped.gesture,
                    "Result queue full, dropping recognition result"
                );
                false
            }
        }
    }

    /// Next result, or the placeholder when none is waiting. Never blocks.
    pub fn poll(&self, now_ms: u64) -> PollResponse {
        let result = match self.results.try_get_now() {
            Some(result) => {
                debug!(gesture = %result.gesture, class_id = result.class_id, "Result polled");
                result
            }
            None => RecognitionResult::none(),
        };
        PollResponse {
            result,
            server_timestamp_ms: now_ms,
        }
    }
}
