//! Envelopes that travel through the feature queue.

use crate::pipeline::publisher::RecognitionResult;

/// When a frame was captured (client clock, opaque) and received (server clock).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stamp {
    pub client: Option<String>,
    pub received_ms: u64,
}

impl Stamp {
    pub fn new(client: Option<String>, received_ms: u64) -> Self {
        Self { client, received_ms }
    }
}

/// Server wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueuePayload {
    /// Raw values of one frame. The aggregator re-checks the shape on dequeue.
    Frame(Vec<f32>),
    /// A recognition result. Never expected on the feature queue; dropped with a warning.
    Result(RecognitionResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub stamp: Stamp,
    pub payload: QueuePayload,
}

impl QueueItem {
    pub fn frame(values: Vec<f32>, stamp: Stamp) -> Self {
        Self {
            stamp,
            payload: QueuePayload::Frame(values),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            QueuePayload::Frame(_) => "frame",
            QueuePayload::Result(_) => "result",
        }
    }
}
