//! Lock-free pipeline counters, reported by `GET /api/v1/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_queued: AtomicU64,
    frames_skipped: AtomicU64,
    frames_evicted: AtomicU64,
    overload_rejections: AtomicU64,
    sequences_skipped: AtomicU64,
    windows_classified: AtomicU64,
    rate_limited: AtomicU64,
    idle_resets: AtomicU64,
    gestures_published: AtomicU64,
    results_dropped: AtomicU64,
    stale_results_discarded: AtomicU64,
    classifier_failures: AtomicU64,
    classifier_timeouts: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub frames_queued: u64,
    pub frames_skipped: u64,
    pub frames_evicted: u64,
    pub overload_rejections: u64,
    pub sequences_skipped: u64,
    pub windows_classified: u64,
    pub rate_limited: u64,
    pub idle_resets: u64,
    pub gestures_published: u64,
    pub results_dropped: u64,
    pub stale_results_discarded: u64,
    pub classifier_failures: u64,
    pub classifier_timeouts: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn record_frame_queued(&self) {
        bump(&self.frames_queued);
    }

    pub fn record_frame_skipped(&self) {
        bump(&self.frames_skipped);
    }

    pub fn record_frame_evicted(&self) {
        bump(&self.frames_evicted);
    }

    pub fn record_overload(&self) {
        bump(&self.overload_rejections);
    }

    pub fn record_sequence_skipped(&self) {
        bump(&self.sequences_skipped);
    }

    pub fn record_window_classified(&self) {
        bump(&self.windows_classified);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_idle_reset(&self) {
        bump(&self.idle_resets);
    }

    pub fn record_published(&self) {
        bump(&self.gestures_published);
    }

    pub fn record_result_dropped(&self) {
        bump(&self.results_dropped);
    }

    pub fn record_stale_result(&self) {
        bump(&self.stale_results_discarded);
    }

    pub fn record_classifier_failure(&self) {
        bump(&self.classifier_failures);
    }

    pub fn record_classifier_timeout(&self) {
        bump(&self.classifier_timeouts);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_queued: read(&self.frames_queued),
            frames_skipped: read(&self.frames_skipped),
            frames_evicted: read(&self.frames_evicted),
            overload_rejections: read(&self.overload_rejections),
            sequences_skipped: read(&self.sequences_skipped),
            windows_classified: read(&self.windows_classified),
            rate_limited: read(&self.rate_limited),
            idle_resets: read(&self.idle_resets),
            gestures_published: read(&self.gestures_published),
            results_dropped: read(&self.results_dropped),
            stale_results_discarded: read(&self.stale_results_discarded),
            classifier_failures: read(&self.classifier_failures),
            classifier_timeouts: read(&self.classifier_timeouts),
        }
    }
}
