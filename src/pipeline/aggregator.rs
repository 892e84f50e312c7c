//! # Window Aggregator
//!
//! The single consumer of the feature queue. Keeps a sliding buffer of the most recent
//! frames and classifies it when it is full and the rate limit allows.
//!
//! ## States:
//! - **Idle**: buffer empty
//! - **Filling**: 1..10 frames buffered
//! - **Ready**: exactly 10 frames; every further frame slides the window by one
//!
//! ## Loop contract:
//! - Waits at most `poll_timeout_ms` for a frame, so shutdown and idle resets are noticed
//! - A partially or fully buffered window untouched for `idle_reset_ms` is discarded
//! - Frames received while recognition is disabled are dropped and the buffer is cleared
//! - A disable/enable cycle (epoch change) always starts from an empty buffer
//! - A window whose classification overlaps a disable is never published
//! - Classifier errors, timeouts and panics are logged and never end the loop
//!
//! Exactly one aggregator runs per [`PipelineContext`]; the buffer is never shared.

use crate::pipeline::context::{PipelineContext, Publication};
use crate::pipeline::frame::{Frame, Window, WINDOW_FRAMES};
use crate::pipeline::item::{now_ms, QueueItem, QueuePayload, Stamp};
use crate::pipeline::policy::ClassifyOutcome;
use crate::pipeline::publisher::RecognitionResult;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause after an unexpected panic so a persistent fault cannot spin the loop.
const PANIC_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Filling,
    Ready,
}

/// What happened to one dequeued item.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameDisposition {
    /// Appended; the window is not full yet.
    Buffered,
    /// Appended and the window was classified.
    Classified(ClassifyOutcome),
    /// Appended, but a classification ran too recently.
    RateLimited,
    /// Appended, but the classifier could not be loaded.
    ClassifierUnavailable,
    /// Dropped because recognition is disabled.
    Discarded,
    /// Dropped because it was not a well-formed frame.
    Malformed,
}

pub struct WindowAggregator {
    ctx: Arc<PipelineContext>,
    buffer: VecDeque<Frame>,
    last_recognition: Instant,
    last_frame: Option<Instant>,
    epoch: u64,
}

impl WindowAggregator {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let epoch = ctx.epoch();
        Self {
            ctx,
            buffer: VecDeque::with_capacity(WINDOW_FRAMES + 1),
            last_recognition: Instant::now(),
            last_frame: None,
            epoch,
        }
    }

    pub fn state(&self) -> AggregatorState {
        match self.buffer.len() {
            0 => AggregatorState::Idle,
            n if n < WINDOW_FRAMES => AggregatorState::Filling,
            _ => AggregatorState::Ready,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Start the loop on a dedicated thread. It returns once `shutdown` is set.
    pub fn spawn(ctx: Arc<PipelineContext>, shutdown: &'static AtomicBool) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("window-aggregator".to_string())
            .spawn(move || WindowAggregator::new(ctx).run(shutdown))
    }

    pub fn run(mut self, shutdown: &AtomicBool) {
        info!("Window aggregator started");

        while !shutdown.load(Ordering::SeqCst) {
            let poll_timeout = Duration::from_millis(self.ctx.settings().poll_timeout_ms);
            let item = self.ctx.features().try_get(poll_timeout);

            let step = panic::catch_unwind(AssertUnwindSafe(|| match item {
                Some(item) => {
                    self.handle_item(item, Instant::now());
                }
                None => self.handle_idle(Instant::now()),
            }));

            if step.is_err() {
                error!("Window aggregator recovered from a panic, clearing buffer");
                self.buffer.clear();
                thread::sleep(PANIC_BACKOFF);
            }
        }

        info!("Window aggregator stopped");
    }

    /// Process one dequeued item.
    pub fn handle_item(&mut self, item: QueueItem, now: Instant) -> FrameDisposition {
        self.sync_epoch();

        let frame = match item.payload {
            QueuePayload::Frame(values) => match Frame::from_vec(values) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "Dropping malformed frame from feature queue");
                    return FrameDisposition::Malformed;
                }
            },
            QueuePayload::Result(_) => {
                warn!(kind = "result", "Unexpected item type on feature queue");
                return FrameDisposition::Malformed;
            }
        };

        if !self.ctx.is_enabled() {
            if !self.buffer.is_empty() {
                debug!(frames = self.buffer.len(), "Recognition disabled, clearing buffer");
                self.buffer.clear();
            }
            return FrameDisposition::Discarded;
        }

        self.buffer.push_back(frame);
        while self.buffer.len() > WINDOW_FRAMES {
            self.buffer.pop_front();
        }
        self.last_frame = Some(now);

        if self.buffer.len() < WINDOW_FRAMES {
            return FrameDisposition::Buffered;
        }

        let min_interval = Duration::from_millis(self.ctx.settings().min_recognition_interval_ms);
        if now.saturating_duration_since(self.last_recognition) < min_interval {
            self.ctx.stats().record_rate_limited();
            return FrameDisposition::RateLimited;
        }

        self.classify_buffer(&item.stamp, now)
    }

    /// Called when the queue wait timed out.
    pub fn handle_idle(&mut self, now: Instant) {
        self.sync_epoch();
        if self.buffer.is_empty() {
            return;
        }

        let idle_reset = Duration::from_millis(self.ctx.settings().idle_reset_ms);
        let last_activity = match self.last_frame {
            Some(frame) => frame.max(self.last_recognition),
            None => self.last_recognition,
        };
        if now.saturating_duration_since(last_activity) > idle_reset {
            info!(frames = self.buffer.len(), "No new frames for a while, discarding partial window");
            self.buffer.clear();
            self.ctx.stats().record_idle_reset();
        }
    }

    fn classify_buffer(&mut self, stamp: &Stamp, now: Instant) -> FrameDisposition {
        // The attempt counts against the rate limit even if the classifier is missing
        self.last_recognition = now;

        let classifier = match self.ctx.classifier().get_or_load() {
            Ok(classifier) => classifier,
            Err(_) => {
                warn!("Classifier unavailable, window not classified");
                return FrameDisposition::ClassifierUnavailable;
            }
        };

        let window = match Window::from_frames(self.buffer.iter().cloned().collect()) {
            Ok(window) => window,
            Err(err) => {
                error!(error = %err, "Sliding buffer did not form a window");
                return FrameDisposition::Malformed;
            }
        };

        debug!(frames = WINDOW_FRAMES, "Buffer full, classifying window");
        let outcome = self.ctx.classify(&window, &classifier);
        match &outcome {
            ClassifyOutcome::Gesture(detection) => {
                let result = RecognitionResult::from_detection(
                    detection,
                    stamp.client.clone(),
                    stamp.received_ms,
                    now_ms(),
                );
                if self.ctx.publish_if_current(self.epoch, result) == Publication::Stale {
                    self.buffer.clear();
                    return FrameDisposition::Discarded;
                }
            }
            other => debug!(outcome = other.as_str(), "No gesture published for window"),
        }
        FrameDisposition::Classified(outcome)
    }

    fn sync_epoch(&mut self) {
        let epoch = self.ctx.epoch();
        if epoch != self.epoch {
            if !self.buffer.is_empty() {
                debug!(frames = self.buffer.len(), "Recognition was toggled, starting from an empty buffer");
            }
            self.buffer.clear();
            self.epoch = epoch;
        }
    }
}
