//! Store self-metrics: counters describing what the writer has done.
//!
//! Uses atomics only, so the writer task and any number of readers can
//! update and sample them without locking.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::snapshot::ApplyOutcome;

/// Counters shared between the facade and the writer task.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    requests_applied: AtomicU64,
    deletes_applied: AtomicU64,
    families_written: AtomicU64,
    families_rejected: AtomicU64,
    metrics_rejected: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoint_failures: AtomicU64,
    last_checkpoint_unix_secs: AtomicU64,
    queue_depth: AtomicI64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub requests_applied: u64,
    pub deletes_applied: u64,
    pub families_written: u64,
    pub families_rejected: u64,
    pub metrics_rejected: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
    /// Unix seconds of the last successful checkpoint, 0 if none.
    pub last_checkpoint_unix_secs: u64,
    pub queue_depth: i64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_apply(&self, outcome: &ApplyOutcome) {
        self.requests_applied.fetch_add(1, Ordering::Relaxed);
        if outcome.delete {
            self.deletes_applied.fetch_add(1, Ordering::Relaxed);
        }
        self.families_written
            .fetch_add(outcome.families_written as u64, Ordering::Relaxed);
        self.families_rejected
            .fetch_add(outcome.families_rejected as u64, Ordering::Relaxed);
        self.metrics_rejected
            .fetch_add(outcome.metrics_rejected as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self, ok: bool) {
        if ok {
            self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
            self.last_checkpoint_unix_secs
                .store(epoch_secs(), Ordering::Relaxed);
        } else {
            self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            requests_applied: self.requests_applied.load(Ordering::Relaxed),
            deletes_applied: self.deletes_applied.load(Ordering::Relaxed),
            families_written: self.families_written.load(Ordering::Relaxed),
            families_rejected: self.families_rejected.load(Ordering::Relaxed),
            metrics_rejected: self.metrics_rejected.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            last_checkpoint_unix_secs: self.last_checkpoint_unix_secs.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
