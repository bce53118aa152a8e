//! In-memory counters updated by the lifecycle engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    total_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub average_duration_ms: f64,
    pub max_duration_ms: u64,
}

impl Metrics {
    pub fn record_processed(&self, count: u64) {
        self.jobs_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_success(&self, duration_ms: Option<i64>) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        let duration = duration_ms.unwrap_or(0).max(0) as u64;
        self.total_duration_ms.fetch_add(duration, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(duration, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let succeeded = self.jobs_succeeded.load(Ordering::Relaxed);
        let total = self.total_duration_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_succeeded: succeeded,
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            average_duration_ms: if succeeded == 0 {
                0.0
            } else {
                total as f64 / succeeded as f64
            },
            max_duration_ms: self.max_duration_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages_success_durations() {
        let metrics = Metrics::default();
        metrics.record_processed(3);
        metrics.record_success(Some(1000));
        metrics.record_success(Some(3000));
        metrics.record_failure();
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_processed, 3);
        assert_eq!(snapshot.jobs_succeeded, 2);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_retried, 1);
        assert_eq!(snapshot.average_duration_ms, 2000.0);
        assert_eq!(snapshot.max_duration_ms, 3000);
    }

    #[test]
    fn empty_snapshot_has_zero_average() {
        assert_eq!(Metrics::default().snapshot().average_duration_ms, 0.0);
    }
}
