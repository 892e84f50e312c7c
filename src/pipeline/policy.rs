//! # Recognition Policy
//!
//! One function, [`classify_window`], turns a window into a recognition decision. Both entry
//! paths use it: the aggregator's sliding window and the inline pre-batched submission.
//!
//! ## Decision steps:
//! 1. **Quality gate**: windows whose non-zero share is below the configured percentage never
//!    reach the classifier
//! 2. **Bounded inference**: the classifier runs under an optional timeout; panics and errors
//!    become [`ClassifyOutcome::Failed`]. Timed calls run on helper threads capped by
//!    [`InferenceSlots`]; a helper whose caller gave up still holds its slot until it returns
//! 3. **Argmax + threshold**: the best class counts as a gesture when `confidence >= threshold`

use crate::config::RecognitionConfig;
use crate::pipeline::classifier::{Classifier, LabelTable};
use crate::pipeline::frame::Window;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Settings [`classify_window`] needs, snapshotted from [`RecognitionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionPolicy {
    pub confidence_threshold: f32,
    pub min_window_non_zero_percent: f32,
    pub timeout: Option<Duration>,
}

impl RecognitionPolicy {
    pub fn from_config(config: &RecognitionConfig, timeout: Option<Duration>) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            min_window_non_zero_percent: config.min_window_non_zero_percent,
            timeout,
        }
    }
}

/// Caps the number of classifier calls running on helper threads, abandoned ones included.
pub struct InferenceSlots {
    running: Mutex<usize>,
    released: Condvar,
    limit: usize,
}

/// Held by a helper thread for as long as its classifier call runs.
struct InferencePermit {
    slots: Arc<InferenceSlots>,
}

impl InferenceSlots {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(0),
            released: Condvar::new(),
            limit: limit.max(1),
        })
    }

    /// Calls currently running, including ones whose caller timed out.
    pub fn running(&self) -> usize {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `wait` for a free slot.
    fn acquire(self: &Arc<Self>, wait: Duration) -> Option<InferencePermit> {
        let deadline = Instant::now() + wait;
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        while *running >= self.limit {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(running, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            running = guard;
        }
        *running += 1;
        Some(InferencePermit {
            slots: Arc::clone(self),
        })
    }
}

impl Drop for InferencePermit {
    fn drop(&mut self) {
        let mut running = self.slots.running.lock().unwrap_or_else(PoisonError::into_inner);
        *running = running.saturating_sub(1);
        self.slots.released.notify_one();
    }
}

/// A gesture that cleared the confidence threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub class_id: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyOutcome {
    Gesture(Detection),
    /// The best class was below the threshold.
    NoGesture,
    /// The window was too sparse to be worth scoring.
    LowQuality { non_zero: usize },
    /// The classifier did not answer within the timeout.
    TimedOut,
    /// The classifier returned an error, panicked, or produced no scores.
    Failed(String),
}

impl ClassifyOutcome {
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            ClassifyOutcome::Gesture(detection) => Some(detection),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifyOutcome::Gesture(_) => "gesture",
            ClassifyOutcome::NoGesture => "no_gesture",
            ClassifyOutcome::LowQuality { .. } => "low_quality",
            ClassifyOutcome::TimedOut => "timed_out",
            ClassifyOutcome::Failed(_) => "failed",
        }
    }
}

/// Gate, score and threshold one window.
pub fn classify_window(
    window: &Window,
    classifier: &Arc<dyn Classifier>,
    labels: &LabelTable,
    policy: &RecognitionPolicy,
    slots: &Arc<InferenceSlots>,
) -> ClassifyOutcome {
    let non_zero = window.non_zero_count();
    let percent = window.non_zero_percent();
    if percent < policy.min_window_non_zero_percent {
        warn!(
            non_zero,
            percent = format!("{:.2}", percent),
            "Window too sparse for recognition, skipping classifier"
        );
        return ClassifyOutcome::LowQuality { non_zero };
    }

    let start_time = Instant::now();
    let scores = match predict_bounded(classifier, window, policy.timeout, slots) {
        Ok(scores) => scores,
        Err(outcome) => return outcome,
    };
    let elapsed_ms = millis(start_time.elapsed());

    let Some((class_id, confidence)) = best_class(&scores) else {
        return ClassifyOutcome::Failed("classifier returned no usable scores".to_string());
    };

    if confidence >= policy.confidence_threshold {
        let label = labels.label_or_unknown(class_id);
        info!(
            gesture = %label,
            class_id,
            confidence = format!("{:.3}", confidence),
            elapsed_ms,
            top = %top_k_summary(&scores, labels, 5),
            "Gesture recognized"
        );
        ClassifyOutcome::Gesture(Detection {
            label,
            confidence,
            class_id,
        })
    } else {
        debug!(
            best = %labels.label_or_unknown(class_id),
            class_id,
            confidence = format!("{:.3}", confidence),
            threshold = policy.confidence_threshold,
            elapsed_ms,
            "Best class below confidence threshold"
        );
        ClassifyOutcome::NoGesture
    }
}

/// Run the classifier, optionally on a helper thread bounded by `timeout`.
///
/// Waiting for a free slot counts against the same timeout. A timed-out helper keeps its slot
/// until the classifier returns; its result is discarded.
fn predict_bounded(
    classifier: &Arc<dyn Classifier>,
    window: &Window,
    timeout: Option<Duration>,
    slots: &Arc<InferenceSlots>,
) -> Result<Vec<f32>, ClassifyOutcome> {
    let Some(timeout) = timeout else {
        return match panic::catch_unwind(AssertUnwindSafe(|| classifier.predict(window))) {
            Ok(Ok(scores)) => Ok(scores),
            Ok(Err(err)) => Err(failed(format!("{:#}", err))),
            Err(_) => Err(failed("classifier panicked".to_string())),
        };
    };

    let started = Instant::now();
    let Some(permit) = slots.acquire(timeout) else {
        warn!(
            timeout_ms = millis(timeout),
            running = slots.running(),
            "Classifier still busy with earlier calls, giving up"
        );
        return Err(ClassifyOutcome::TimedOut);
    };

    let (tx, rx) = mpsc::channel();
    let worker_classifier = classifier.clone();
    let worker_window = window.clone();
    let spawned = thread::Builder::new()
        .name("classifier-call".to_string())
        .spawn(move || {
            let _permit = permit;
            // The receiver is gone after a timeout; nothing left to report to
            let _ = tx.send(worker_classifier.predict(&worker_window));
        });
    if let Err(err) = spawned {
        return Err(failed(format!("could not start classifier thread: {}", err)));
    }

    match rx.recv_timeout(timeout.saturating_sub(started.elapsed())) {
        Ok(Ok(scores)) => Ok(scores),
        Ok(Err(err)) => Err(failed(format!("{:#}", err))),
        Err(RecvTimeoutError::Timeout) => {
            warn!(timeout_ms = millis(timeout), "Classifier timed out");
            Err(ClassifyOutcome::TimedOut)
        }
        Err(RecvTimeoutError::Disconnected) => Err(failed("classifier panicked".to_string())),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn failed(message: String) -> ClassifyOutcome {
    warn!(error = %message, "Classifier invocation failed");
    ClassifyOutcome::Failed(message)
}

/// Index and value of the highest finite score.
fn best_class(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .fold(None, |best, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
}

fn top_k_summary(scores: &[f32], labels: &LabelTable, k: usize) -> String {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(k)
        .map(|(i, s)| format!("{}: {:.3}", labels.label_or_unknown(i), s))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelOrder;
    use crate::pipeline::frame::{FRAME_LEN, WINDOW_LEN};
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scores(Vec<f32>);

    impl Classifier for Scores {
        fn predict(&self, _window: &Window) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &str {
            "scores"
        }
    }

    struct Slow(Duration);

    impl Classifier for Slow {
        fn predict(&self, _window: &Window) -> Result<Vec<f32>> {
            thread::sleep(self.0);
            Ok(vec![1.0])
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    /// Blocks every call until a release token arrives; counts calls that started.
    struct Hanging {
        started: AtomicUsize,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Classifier for Hanging {
        fn predict(&self, _window: &Window) -> Result<Vec<f32>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let release = self.release.lock().unwrap();
            release.recv()?;
            Ok(vec![0.9])
        }
        fn name(&self) -> &str {
            "hanging"
        }
    }

    struct Broken;

    impl Classifier for Broken {
        fn predict(&self, _window: &Window) -> Result<Vec<f32>> {
            Err(anyhow!("tensor shape mismatch"))
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    struct Panicky;

    impl Classifier for Panicky {
        fn predict(&self, _window: &Window) -> Result<Vec<f32>> {
            panic!("inference blew up")
        }
        fn name(&self) -> &str {
            "panicky"
        }
    }

    fn labels() -> LabelTable {
        let words: Vec<String> = ["read", "hello", "binoculars", "hi"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        LabelTable::new(&words, LabelOrder::Alphabetical)
    }

    fn policy(timeout: Option<Duration>) -> RecognitionPolicy {
        RecognitionPolicy {
            confidence_threshold: 0.6,
            min_window_non_zero_percent: 5.0,
            timeout,
        }
    }

    fn dense_window() -> Window {
        Window::from_flat(&vec![0.25; WINDOW_LEN]).unwrap()
    }

    fn run(classifier: impl Classifier + 'static, window: &Window, timeout: Option<Duration>) -> ClassifyOutcome {
        let classifier: Arc<dyn Classifier> = Arc::new(classifier);
        classify_window(window, &classifier, &labels(), &policy(timeout), &InferenceSlots::new(1))
    }

    #[test]
    fn test_best_class_above_threshold_is_reported() {
        let outcome = run(Scores(vec![0.1, 0.9, 0.05, 0.0]), &dense_window(), None);
        assert_eq!(
            outcome,
            ClassifyOutcome::Gesture(Detection {
                label: "hello".to_string(),
                confidence: 0.9,
                class_id: 1,
            })
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let outcome = run(Scores(vec![0.6, 0.2, 0.1, 0.1]), &dense_window(), None);
        assert_eq!(outcome.detection().map(|d| d.class_id), Some(0));
        assert_eq!(outcome.detection().map(|d| d.confidence), Some(0.6));
    }

    #[test]
    fn test_below_threshold_is_no_gesture() {
        let outcome = run(Scores(vec![0.3, 0.59, 0.05, 0.06]), &dense_window(), None);
        assert_eq!(outcome, ClassifyOutcome::NoGesture);
    }

    #[test]
    fn test_sparse_window_skips_classifier() {
        // 30 non-zero values out of 1260 is under 5%
        let mut values = vec![0.0; WINDOW_LEN];
        for v in values.iter_mut().step_by(FRAME_LEN / 3).take(30) {
            *v = 0.5;
        }
        let window = Window::from_flat(&values).unwrap();
        let outcome = run(Panicky, &window, None);
        assert!(matches!(outcome, ClassifyOutcome::LowQuality { .. }));
    }

    #[test]
    fn test_errors_and_panics_become_failures() {
        assert!(matches!(run(Broken, &dense_window(), None), ClassifyOutcome::Failed(_)));
        assert!(matches!(run(Panicky, &dense_window(), None), ClassifyOutcome::Failed(_)));
        assert!(matches!(
            run(Panicky, &dense_window(), Some(Duration::from_secs(1))),
            ClassifyOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_timeout_is_distinct_from_no_gesture() {
        let outcome = run(
            Slow(Duration::from_millis(300)),
            &dense_window(),
            Some(Duration::from_millis(20)),
        );
        assert_eq!(outcome, ClassifyOutcome::TimedOut);

        let outcome = run(Slow(Duration::from_millis(5)), &dense_window(), Some(Duration::from_secs(2)));
        assert_eq!(outcome.detection().map(|d| d.class_id), Some(0));
    }

    #[test]
    fn test_hung_classifier_holds_a_single_slot() {
        let (release_tx, release_rx) = mpsc::channel();
        let hanging = Arc::new(Hanging {
            started: AtomicUsize::new(0),
            release: Mutex::new(release_rx),
        });
        let classifier: Arc<dyn Classifier> = hanging.clone();
        let slots = InferenceSlots::new(1);
        let short = policy(Some(Duration::from_millis(10)));

        for _ in 0..20 {
            let outcome = classify_window(&dense_window(), &classifier, &labels(), &short, &slots);
            assert_eq!(outcome, ClassifyOutcome::TimedOut);
            assert!(slots.running() <= 1);
        }
        // Only the first call reached the classifier; the rest gave up waiting for its slot
        assert_eq!(hanging.started.load(Ordering::SeqCst), 1);
        assert_eq!(slots.running(), 1);

        // Unblock the abandoned call and let the next one through immediately
        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while slots.running() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(slots.running(), 0);

        let outcome = classify_window(
            &dense_window(),
            &classifier,
            &labels(),
            &policy(Some(Duration::from_secs(2))),
            &slots,
        );
        assert_eq!(outcome.detection().map(|d| d.class_id), Some(0));
        assert_eq!(hanging.started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_empty_or_nan_scores_fail() {
        assert!(matches!(run(Scores(vec![]), &dense_window(), None), ClassifyOutcome::Failed(_)));
        assert!(matches!(
            run(Scores(vec![f32::NAN, f32::NAN]), &dense_window(), None),
            ClassifyOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_best_class_prefers_first_on_ties() {
        assert_eq!(best_class(&[0.7, 0.7, 0.1]), Some((0, 0.7)));
        assert_eq!(best_class(&[f32::NAN, 0.2]), Some((1, 0.2)));
    }
}
