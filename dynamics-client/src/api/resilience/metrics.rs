//! Execution counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated by the execution engine
#[derive(Debug, Default)]
pub struct MetricsCollector {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    throttled_retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    lock_wait_micros: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Logical calls started
    pub calls: u64,
    /// Transport calls made
    pub attempts: u64,
    pub retries: u64,
    pub throttled_retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub total_lock_wait: Duration,
}

impl MetricsSnapshot {
    /// Average transport calls per logical call
    pub fn attempts_per_call(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.attempts as f64 / self.calls as f64
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self, lock_wait: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.lock_wait_micros
            .fetch_add(lock_wait.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self, throttled: bool) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        if throttled {
            self.throttled_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            throttled_retries: self.throttled_retries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            total_lock_wait: Duration::from_micros(self.lock_wait_micros.load(Ordering::Relaxed)),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.calls,
            &self.attempts,
            &self.retries,
            &self.throttled_retries,
            &self.successes,
            &self.failures,
            &self.cancellations,
            &self.lock_wait_micros,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot_and_reset() {
        let metrics = MetricsCollector::new();
        metrics.record_call();
        metrics.record_attempt(Duration::from_millis(3));
        metrics.record_retry(true);
        metrics.record_attempt(Duration::from_millis(2));
        metrics.record_success();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.throttled_retries, 1);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.total_lock_wait, Duration::from_millis(5));
        assert_eq!(snapshot.attempts_per_call(), 2.0);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
