use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for server activity.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    cancel_noops: AtomicU64,
    worker_standdowns: AtomicU64,
    resets: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub cancelled: u64,
    /// Cancels that found nothing to cancel, at submit time or after the race
    pub cancel_noops: u64,
    /// Workers that lost the race to a cancellation
    pub worker_standdowns: u64,
    pub resets: u64,
}

impl StatsSnapshot {
    pub fn responses(&self) -> u64 {
        self.completed + self.cancelled
    }
}

impl ServerStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel_noop(&self) {
        self.cancel_noops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_standdown(&self) {
        self.worker_standdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            cancel_noops: self.cancel_noops.load(Ordering::Relaxed),
            worker_standdowns: self.worker_standdowns.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}
