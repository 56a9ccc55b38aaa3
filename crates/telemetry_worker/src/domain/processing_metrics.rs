use common::domain::ProcessingError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    records_processed: u64,
    records_failed: u64,
    total_batches: u64,
    total_batch_records: u64,
    total_processing_time: Duration,
    error_counts: BTreeMap<String, u64>,
}

/// Point-in-time view of the aggregated counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub records_processed: u64,
    pub records_failed: u64,
    pub total_batches: u64,
    pub avg_batch_size: f64,
    pub avg_processing_time_ms: f64,
    pub success_rate: f64,
    pub error_breakdown: BTreeMap<String, u64>,
}

/// Process-wide counters shared by every concurrent batch.
///
/// Updates are serialized through a mutex that is never held across an await.
#[derive(Debug, Default)]
pub struct ProcessingMetrics {
    counters: Mutex<Counters>,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_batch_processing(
        &self,
        batch_size: usize,
        elapsed: Duration,
        successful: usize,
        failed: usize,
        errors: &[ProcessingError],
    ) {
        let mut counters = self.lock();
        counters.records_processed += successful as u64;
        counters.records_failed += failed as u64;
        counters.total_batches += 1;
        counters.total_batch_records += batch_size as u64;
        counters.total_processing_time += elapsed;

        for error in errors {
            *counters.error_counts.entry(error.message.clone()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.lock();

        let batches = counters.total_batches as f64;
        let (avg_batch_size, avg_processing_time_ms) = if counters.total_batches == 0 {
            (0.0, 0.0)
        } else {
            (
                counters.total_batch_records as f64 / batches,
                counters.total_processing_time.as_secs_f64() * 1000.0 / batches,
            )
        };

        let attempted = counters.records_processed + counters.records_failed;
        let success_rate = if attempted == 0 {
            0.0
        } else {
            counters.records_processed as f64 / attempted as f64
        };

        MetricsSnapshot {
            records_processed: counters.records_processed,
            records_failed: counters.records_failed,
            total_batches: counters.total_batches,
            avg_batch_size,
            avg_processing_time_ms,
            success_rate,
            error_breakdown: counters.error_counts.clone(),
        }
    }

    pub fn reset(&self) {
        *self.lock() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_metrics() {
        let metrics = ProcessingMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_arithmetic_means() {
        let metrics = ProcessingMetrics::new();
        metrics.record_batch_processing(10, Duration::from_millis(100), 9, 1, &[]);
        metrics.record_batch_processing(20, Duration::from_millis(300), 20, 0, &[]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_batches, 2);
        assert_eq!(snapshot.records_processed, 29);
        assert_eq!(snapshot.records_failed, 1);
        assert!((snapshot.avg_batch_size - 15.0).abs() < f64::EPSILON);
        assert!((snapshot.avg_processing_time_ms - 200.0).abs() < 1e-9);
        assert!((snapshot.success_rate - 29.0 / 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_error_histogram() {
        let metrics = ProcessingMetrics::new();
        let errors = vec![
            ProcessingError::validation("Invalid JSON payload"),
            ProcessingError::validation("Invalid JSON payload"),
            ProcessingError::database("insert failed"),
        ];
        metrics.record_batch_processing(3, Duration::from_millis(5), 0, 3, &errors);

        let breakdown = metrics.snapshot().error_breakdown;
        assert_eq!(breakdown.get("Invalid JSON payload"), Some(&2));
        assert_eq!(breakdown.get("insert failed"), Some(&1));
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = ProcessingMetrics::new();
        metrics.record_batch_processing(
            1,
            Duration::from_millis(5),
            0,
            1,
            &[ProcessingError::unknown("boom")],
        );
        metrics.reset();

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(ProcessingMetrics::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.record_batch_processing(2, Duration::from_millis(1), 1, 1, &[]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_batches, 800);
        assert_eq!(snapshot.records_processed, 800);
        assert_eq!(snapshot.records_failed, 800);
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
