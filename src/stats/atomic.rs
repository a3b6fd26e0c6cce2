//! Lock-free batch statistics using atomic operations
//!
//! Tracks task-state counts without mutex contention. Invariant:
//! `succeeded + failed + pending + running == total` at all times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Aggregate counters for one batch run
#[derive(Debug, Default)]
pub struct BatchStats {
    pub total: AtomicU64,
    pub pending: AtomicU64,
    pub running: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub start_time: AtomicU64,
}

impl BatchStats {
    /// Create new batch stats
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            total: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            running: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            start_time: AtomicU64::new(now),
        }
    }

    /// Record a newly admitted task
    pub fn record_submitted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Transition one task from pending to running
    pub fn record_running(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    /// Transition one running task to succeeded
    pub fn record_succeeded(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Transition one running task to failed
    pub fn record_failed(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of tasks admitted so far
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of tasks currently running
    pub fn running_count(&self) -> u64 {
        self.running.load(Ordering::Relaxed)
    }

    /// Seconds elapsed since the stats were created
    pub fn elapsed_secs(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        now.saturating_sub(self.start_time.load(Ordering::Relaxed))
    }

    /// Get snapshot for reporting
    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            elapsed_secs: self.elapsed_secs(),
        }
    }
}

/// Serializable snapshot of a batch run
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub running: u64,
    pub elapsed_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_balance_through_transitions() {
        let stats = BatchStats::new();

        for _ in 0..5 {
            stats.record_submitted();
        }
        let s = stats.snapshot();
        assert_eq!(s.total, 5);
        assert_eq!(s.pending, 5);
        assert_eq!(s.succeeded + s.failed + s.pending + s.running, s.total);

        stats.record_running();
        stats.record_running();
        stats.record_succeeded();
        stats.record_running();
        stats.record_failed();

        let s = stats.snapshot();
        assert_eq!(s.total, 5);
        assert_eq!(s.succeeded, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.running, 1);
        assert_eq!(s.pending, 2);
        assert_eq!(s.succeeded + s.failed + s.pending + s.running, s.total);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let stats = BatchStats::new();
        stats.record_submitted();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total"], 1);
        assert!(json.get("elapsedSecs").is_some());
    }
}
