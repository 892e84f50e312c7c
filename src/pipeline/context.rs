//! # Pipeline Context
//!
//! Everything the ingest path, the aggregator thread and the HTTP handlers share, owned in
//! one place and passed around as `Arc<PipelineContext>`.
//!
//! ## Shared state:
//! - **enabled**: the auto-recognition flag; an `AtomicBool`, so readers never see a torn value
//! - **epoch**: bumped on every disable; the aggregator clears its buffer when it sees a new one
//! - **features / results**: the two bounded queues
//! - **classifier**: load-once-then-cache slot
//! - **settings**: recognition tuning, updatable at runtime
//! - **inference**: cap on classifier calls running on helper threads
//!
//! Results are published through [`PipelineContext::publish_if_current`], which checks the
//! epoch under the toggle gate, so nothing classified before a disable lands afterwards.
//!
//! The sliding buffer is not here: it belongs to the aggregator thread.

use crate::config::{AppConfig, RecognitionConfig};
use crate::pipeline::classifier::{
    Classifier, ClassifierLoader, ClassifierSlot, ClassifierStatus, LabelTable,
};
use crate::pipeline::frame::Window;
use crate::pipeline::item::QueueItem;
use crate::pipeline::policy::{classify_window, ClassifyOutcome, InferenceSlots, RecognitionPolicy};
use crate::pipeline::publisher::{RecognitionResult, ResultPublisher};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stats::PipelineStats;
use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct PipelineContext {
    enabled: AtomicBool,
    epoch: AtomicU64,
    features: BoundedQueue<QueueItem>,
    results: BoundedQueue<RecognitionResult>,
    classifier: ClassifierSlot,
    labels: LabelTable,
    settings: RwLock<RecognitionConfig>,
    classifier_timeout: Option<Duration>,
    inference: Arc<InferenceSlots>,
    stats: PipelineStats,
    // Serializes toggles and epoch-checked publishes so a slow enable cannot interleave with a disable
    toggle_gate: Mutex<()>,
}

/// What [`PipelineContext::publish_if_current`] did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    Published,
    /// The result queue was full.
    Dropped,
    /// Recognition was toggled while the result was computed.
    Stale,
}

/// Timed classifier calls allowed to run at once, including abandoned ones.
const MAX_INFERENCE_CALLS: usize = 1;

/// Queue occupancy for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: &'static str,
    pub size: usize,
    pub capacity: usize,
}

impl PipelineContext {
    pub fn new(config: &AppConfig, loader: ClassifierLoader) -> Self {
        let labels = LabelTable::new(&config.classifier.labels, config.classifier.label_order);
        let classifier_timeout = match config.classifier.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Self {
            enabled: AtomicBool::new(config.recognition.auto_recognition_enabled),
            epoch: AtomicU64::new(0),
            features: BoundedQueue::new("features", config.queues.feature_queue_size),
            results: BoundedQueue::new("results", config.queues.result_queue_size),
            classifier: ClassifierSlot::new(loader, labels.len()),
            labels,
            settings: RwLock::new(config.recognition.clone()),
            classifier_timeout,
            inference: InferenceSlots::new(MAX_INFERENCE_CALLS),
            stats: PipelineStats::default(),
            toggle_gate: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Flip auto recognition.
    ///
    /// Enabling loads the classifier first; if that fails the flag stays off and the load
    /// error is returned. Disabling drains both queues and advances the epoch so the
    /// aggregator starts the next session with an empty buffer.
    pub fn set_enabled(&self, enable: bool) -> Result<()> {
        let _gate = self.toggle_gate.lock().unwrap_or_else(PoisonError::into_inner);

        if enable {
            if let Err(err) = self.classifier.get_or_load() {
                self.enabled.store(false, Ordering::SeqCst);
                warn!("Auto recognition stays disabled: classifier could not be loaded");
                return Err(err);
            }
            self.enabled.store(true, Ordering::SeqCst);
            info!("Auto recognition enabled");
        } else {
            self.enabled.store(false, Ordering::SeqCst);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let frames = self.features.drain_all();
            let results = self.results.drain_all();
            info!(
                drained_frames = frames,
                drained_results = results,
                "Auto recognition disabled, queues drained"
            );
        }
        Ok(())
    }

    /// Used at startup when the configured initial load fails.
    pub fn force_disabled(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn features(&self) -> &BoundedQueue<QueueItem> {
        &self.features
    }

    pub fn results(&self) -> &BoundedQueue<RecognitionResult> {
        &self.results
    }

    pub fn classifier(&self) -> &ClassifierSlot {
        &self.classifier
    }

    pub fn classifier_status(&self) -> ClassifierStatus {
        self.classifier.status()
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn publisher(&self) -> ResultPublisher<'_> {
        ResultPublisher::new(&self.results, &self.stats)
    }

    /// Publish a result computed during `epoch`.
    ///
    /// The result is dropped as stale when recognition was disabled since, or is off now.
    /// Holding the toggle gate keeps a disable from draining the queue between the check and
    /// the enqueue.
    pub fn publish_if_current(&self, epoch: u64, result: RecognitionResult) -> Publication {
        let _gate = self.toggle_gate.lock().unwrap_or_else(PoisonError::into_inner);

        if self.epoch() != epoch || !self.is_enabled() {
            self.stats.record_stale_result();
            debug!(
                gesture = %result.gesture,
                epoch,
                current_epoch = self.epoch(),
                "Recognition toggled during classification, result discarded"
            );
            return Publication::Stale;
        }
        if self.publisher().publish(result) {
            Publication::Published
        } else {
            Publication::Dropped
        }
    }

    pub fn inference_calls_running(&self) -> usize {
        self.inference.running()
    }

    pub fn settings(&self) -> RecognitionConfig {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the recognition tuning. The new values apply from the next item onward.
    pub fn update_settings(&self, settings: RecognitionConfig) -> Result<()> {
        settings.validate()?;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }

    pub fn policy(&self) -> RecognitionPolicy {
        RecognitionPolicy::from_config(&self.settings(), self.classifier_timeout)
    }

    /// Run [`classify_window`] with the current policy and count the outcome.
    pub fn classify(&self, window: &Window, classifier: &Arc<dyn Classifier>) -> ClassifyOutcome {
        let outcome =
            classify_window(window, classifier, &self.labels, &self.policy(), &self.inference);
        match &outcome {
            ClassifyOutcome::Gesture(_) | ClassifyOutcome::NoGesture => {
                self.stats.record_window_classified()
            }
            ClassifyOutcome::TimedOut => self.stats.record_classifier_timeout(),
            ClassifyOutcome::Failed(_) => self.stats.record_classifier_failure(),
            ClassifyOutcome::LowQuality { .. } => {}
        }
        outcome
    }

    pub fn queue_status(&self) -> [QueueStatus; 2] {
        [
            QueueStatus {
                name: self.features.name(),
                size: self.features.size(),
                capacity: self.features.capacity(),
            },
            QueueStatus {
                name: self.results.name(),
                size: self.results.size(),
                capacity: self.results.capacity(),
            },
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::pipeline::item::{QueueItem, Stamp};

    #[test]
    fn test_disable_drains_both_queues_and_bumps_epoch() {
        let ctx = context_with(&AppConfig::default(), loader_for(StubClassifier::new(vec![1.0])));
        ctx.features()
            .try_put(QueueItem::frame(vec![0.5; 126], Stamp::default()))
            .unwrap();
        ctx.results().try_put(RecognitionResult::none()).unwrap();

        let epoch = ctx.epoch();
        ctx.set_enabled(false).unwrap();

        assert!(!ctx.is_enabled());
        assert_eq!(ctx.features().size(), 0);
        assert_eq!(ctx.results().size(), 0);
        assert_eq!(ctx.epoch(), epoch + 1);
    }

    #[test]
    fn test_publish_checks_epoch_and_flag() {
        let ctx = context_with(&AppConfig::default(), loader_for(StubClassifier::new(vec![1.0])));
        let hello = RecognitionResult {
            gesture: "hello".to_string(),
            confidence: 0.9,
            class_id: 1,
            ..RecognitionResult::none()
        };

        let epoch = ctx.epoch();
        assert_eq!(ctx.publish_if_current(epoch, hello.clone()), Publication::Published);
        assert_eq!(ctx.results().size(), 1);

        // Computed before a disable/enable cycle
        ctx.set_enabled(false).unwrap();
        ctx.set_enabled(true).unwrap();
        assert_eq!(ctx.publish_if_current(epoch, hello.clone()), Publication::Stale);
        assert_eq!(ctx.results().size(), 0);

        ctx.force_disabled();
        assert_eq!(ctx.publish_if_current(ctx.epoch(), hello), Publication::Stale);
        assert_eq!(ctx.results().size(), 0);
        assert_eq!(ctx.stats().snapshot().stale_results_discarded, 2);
    }

    #[test]
    fn test_enable_loads_classifier_on_demand() {
        let mut config = AppConfig::default();
        config.recognition.auto_recognition_enabled = false;
        let ctx = context_with(&config, loader_for(StubClassifier::new(vec![1.0])));
        assert!(!ctx.classifier().is_loaded());

        ctx.set_enabled(true).unwrap();
        assert!(ctx.is_enabled());
        assert!(ctx.classifier().is_loaded());
    }

    #[test]
    fn test_enable_reverts_when_load_fails() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        assert!(ctx.is_enabled());

        assert!(ctx.set_enabled(true).is_err());
        assert!(!ctx.is_enabled());
        assert_eq!(ctx.classifier_status().as_str(), "failed");
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let ctx = context_with(&AppConfig::default(), failing_loader());
        let mut settings = ctx.settings();
        settings.confidence_threshold = 1.5;
        assert!(ctx.update_settings(settings).is_err());
        assert_eq!(ctx.policy().confidence_threshold, 0.6);
    }

    #[test]
    fn test_timeout_zero_disables_bound() {
        let mut config = AppConfig::default();
        config.classifier.timeout_ms = 0;
        let ctx = context_with(&config, failing_loader());
        assert_eq!(ctx.policy().timeout, None);
    }
}
