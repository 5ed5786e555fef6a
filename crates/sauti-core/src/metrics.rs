//! Engine metrics.
//!
//! Pools count their own traffic on the actor task; the dispatcher keeps
//! process-wide counters behind atomics. Both surface as serializable
//! snapshots next to the health summary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-pool traffic counters, maintained by the pool task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolCounters {
    /// Tasks accepted into the queue.
    pub tasks_submitted: u64,
    /// Tasks that returned a response frame.
    pub tasks_completed: u64,
    /// Tasks rejected by a worker as malformed.
    pub tasks_invalid: u64,
    /// Tasks dropped because their deadline passed before assignment.
    pub tasks_expired: u64,
    /// Submissions rejected with `QueueFull`.
    pub tasks_rejected: u64,
    /// Worker crashes, timeouts, and reported task failures.
    pub worker_faults: u64,
}

/// Process-wide dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    submissions: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    terminal_failures: AtomicU64,
}

impl DispatchMetrics {
    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal_failure(&self) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the dispatcher counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub submissions: u64,
    pub successes: u64,
    pub retries: u64,
    pub terminal_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let metrics = DispatchMetrics::default();
        metrics.record_submission();
        metrics.record_submission();
        metrics.record_retry();
        metrics.record_success();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submissions, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.terminal_failures, 0);
    }
}
