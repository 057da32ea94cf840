//! Metrics and observability for ETL runs.
//!
//! Counters are kept in atomics for the job report and mirrored into the
//! `metrics` facade so an installed recorder can export them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics collector for one or more job runs.
#[derive(Debug, Default)]
pub struct EtlMetrics {
    /// Source pages fetched
    pub pages_fetched: AtomicU64,
    /// Raw records pulled from sources
    pub records_extracted: AtomicU64,
    /// Records that passed normalization
    pub records_normalized: AtomicU64,
    /// Field values nulled by normalization
    pub field_errors: AtomicU64,
    /// Batches committed to the warehouse
    pub batches_loaded: AtomicU64,
    /// Rows reported by the warehouse for committed batches
    pub records_loaded: AtomicU64,
    /// Retry count
    pub retries: AtomicU64,
}

impl EtlMetrics {
    /// Create new metrics collector.
    pub const fn new() -> Self {
        Self {
            pages_fetched: AtomicU64::new(0),
            records_extracted: AtomicU64::new(0),
            records_normalized: AtomicU64::new(0),
            field_errors: AtomicU64::new(0),
            batches_loaded: AtomicU64::new(0),
            records_loaded: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Record a fetched page with its record count.
    pub fn record_page(&self, records: u64) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.records_extracted.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("etl_pages_fetched_total").increment(1);
        metrics::counter!("etl_records_extracted_total").increment(records);
    }

    /// Record a normalized batch.
    pub fn record_normalized(&self, records: u64, field_errors: u64) {
        self.records_normalized.fetch_add(records, Ordering::Relaxed);
        self.field_errors.fetch_add(field_errors, Ordering::Relaxed);
        metrics::counter!("etl_records_normalized_total").increment(records);
        metrics::counter!("etl_field_errors_total").increment(field_errors);
    }

    /// Record a committed warehouse batch.
    pub fn record_load(&self, rows: u64) {
        self.batches_loaded.fetch_add(1, Ordering::Relaxed);
        self.records_loaded.fetch_add(rows, Ordering::Relaxed);
        metrics::counter!("etl_batches_loaded_total").increment(1);
        metrics::counter!("etl_records_loaded_total").increment(rows);
    }

    /// Record a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("etl_retries_total").increment(1);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            records_extracted: self.records_extracted.load(Ordering::Relaxed),
            records_normalized: self.records_normalized.load(Ordering::Relaxed),
            field_errors: self.field_errors.load(Ordering::Relaxed),
            batches_loaded: self.batches_loaded.load(Ordering::Relaxed),
            records_loaded: self.records_loaded.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Source pages fetched
    pub pages_fetched: u64,
    /// Raw records pulled from sources
    pub records_extracted: u64,
    /// Records that passed normalization
    pub records_normalized: u64,
    /// Field values nulled by normalization
    pub field_errors: u64,
    /// Batches committed to the warehouse
    pub batches_loaded: u64,
    /// Rows reported by the warehouse
    pub records_loaded: u64,
    /// Retry count
    pub retries: u64,
}

impl MetricsSnapshot {
    /// Calculate records per second over `duration`.
    pub fn records_per_second(&self, duration: Duration) -> f64 {
        let ms = duration.as_millis();
        if ms == 0 {
            0.0
        } else {
            (self.records_loaded as f64 * 1000.0) / ms as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            "{} completed in {}",
            self.label,
            humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64))
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = EtlMetrics::new();

        metrics.record_page(100);
        metrics.record_page(20);
        metrics.record_normalized(120, 3);
        metrics.record_load(120);
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pages_fetched, 2);
        assert_eq!(snapshot.records_extracted, 120);
        assert_eq!(snapshot.records_normalized, 120);
        assert_eq!(snapshot.field_errors, 3);
        assert_eq!(snapshot.batches_loaded, 1);
        assert_eq!(snapshot.records_loaded, 120);
        assert_eq!(snapshot.retries, 1);
    }

    #[test]
    fn test_records_per_second() {
        let snapshot = MetricsSnapshot {
            records_loaded: 1000,
            ..Default::default()
        };
        assert!((snapshot.records_per_second(Duration::from_secs(5)) - 200.0).abs() < 0.001);
        assert_eq!(snapshot.records_per_second(Duration::ZERO), 0.0);
    }
}
