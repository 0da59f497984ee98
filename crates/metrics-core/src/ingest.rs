//! Sample ingest: validation, idempotent writes, cache invalidation
//!
//! Accepts raw measurement points from the sampling collaborator, rejects
//! malformed ones, and writes the rest to the time-series store. Repeated
//! delivery of the same (entity, metric, timestamp) key is safe: the store
//! overwrites and ingest reports `Deduplicated` rather than an error, which
//! is what makes an at-least-once sampling collaborator harmless.

use crate::error::{IngestError, IngestOutcome};
use crate::models::{MetricType, Reading, Sample};
use crate::store::{AppendResult, MetricStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default tolerated clock skew for future-dated samples (5 minutes)
pub const DEFAULT_MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Invalidation hook fired for every committed sample so cached buckets
/// covering its timestamp are dropped before the next aggregation pass.
/// Injected (not ambient) so tests can construct isolated instances.
pub trait CacheInvalidate: Send + Sync {
    fn invalidate(&self, entity_id: &str, metric: MetricType, timestamp: i64);
}

/// No-op invalidation for setups without an aggregation cache
pub struct NoopInvalidate;

impl CacheInvalidate for NoopInvalidate {
    fn invalidate(&self, _entity_id: &str, _metric: MetricType, _timestamp: i64) {}
}

/// Running ingest counters, exposed through the Prometheus surface
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    deduplicated: AtomicU64,
    rejected: AtomicU64,
}

impl IngestStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Per-reading ingest summary
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub deduplicated: usize,
    pub rejected: usize,
}

/// Validating front door to the time-series store
pub struct SampleIngest {
    store: Arc<MetricStore>,
    invalidation: Arc<dyn CacheInvalidate>,
    max_future_skew_secs: i64,
    stats: IngestStats,
    clock: fn() -> i64,
}

fn wall_clock() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SampleIngest {
    pub fn new(store: Arc<MetricStore>, invalidation: Arc<dyn CacheInvalidate>) -> Self {
        Self {
            store,
            invalidation,
            max_future_skew_secs: DEFAULT_MAX_FUTURE_SKEW_SECS,
            stats: IngestStats::default(),
            clock: wall_clock,
        }
    }

    pub fn with_max_future_skew(mut self, secs: i64) -> Self {
        self.max_future_skew_secs = secs;
        self
    }

    /// Replace the wall clock, for deterministic skew tests.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Validate and commit one sample.
    pub fn ingest(&self, sample: &Sample) -> Result<IngestOutcome, IngestError> {
        if !sample.value.is_finite() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::NonFiniteValue);
        }

        let now = (self.clock)();
        if sample.timestamp > now + self.max_future_skew_secs {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::FutureTimestamp {
                timestamp: sample.timestamp,
                max_skew_secs: self.max_future_skew_secs,
            });
        }

        let outcome = match self.store.append(sample) {
            AppendResult::Appended => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Accepted
            }
            AppendResult::Overwrote(prior) => {
                self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    entity_id = %sample.entity_id,
                    metric = %sample.metric_type,
                    timestamp = sample.timestamp,
                    prior,
                    value = sample.value,
                    "Duplicate sample key, overwrote"
                );
                IngestOutcome::Deduplicated
            }
        };

        // Drop cached buckets covering this timestamp so subsequent
        // aggregation reflects the committed value.
        self.invalidation
            .invalidate(&sample.entity_id, sample.metric_type, sample.timestamp);

        Ok(outcome)
    }

    /// Fan one collaborator reading out into per-metric samples. A failure
    /// on one metric is logged and does not abort the rest.
    pub fn ingest_reading(&self, reading: &Reading) -> IngestReport {
        let mut report = IngestReport::default();
        for (metric, value) in &reading.values {
            let sample = Sample::new(&reading.entity_id, *metric, reading.timestamp, *value);
            match self.ingest(&sample) {
                Ok(IngestOutcome::Accepted) => report.accepted += 1,
                Ok(IngestOutcome::Deduplicated) => report.deduplicated += 1,
                Err(e) => {
                    report.rejected += 1;
                    warn!(
                        entity_id = %reading.entity_id,
                        metric = %metric,
                        error = %e,
                        "Rejected sample from reading"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn fixed_clock() -> i64 {
        1_700_000_000
    }

    fn ingest_with_noop() -> (Arc<MetricStore>, SampleIngest) {
        let store = Arc::new(MetricStore::new());
        let ingest =
            SampleIngest::new(store.clone(), Arc::new(NoopInvalidate)).with_clock(fixed_clock);
        (store, ingest)
    }

    #[test]
    fn test_ingest_accepts_valid_sample() {
        let (store, ingest) = ingest_with_noop();
        let sample = Sample::new("n1", MetricType::CpuPercent, fixed_clock(), 42.0);

        let outcome = ingest.ingest(&sample).unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);
        assert_eq!(store.sample_count(), 1);
        assert_eq!(ingest.stats().accepted(), 1);
    }

    #[test]
    fn test_ingest_idempotent() {
        let (store, ingest) = ingest_with_noop();
        let sample = Sample::new("n1", MetricType::CpuPercent, fixed_clock(), 42.0);

        assert_eq!(ingest.ingest(&sample).unwrap(), IngestOutcome::Accepted);
        assert_eq!(ingest.ingest(&sample).unwrap(), IngestOutcome::Deduplicated);
        assert_eq!(store.sample_count(), 1);
        assert_eq!(ingest.stats().deduplicated(), 1);
    }

    #[test]
    fn test_ingest_overwrites_value() {
        let (store, ingest) = ingest_with_noop();
        let ts = fixed_clock();
        ingest
            .ingest(&Sample::new("n1", MetricType::CpuPercent, ts, 10.0))
            .unwrap();
        ingest
            .ingest(&Sample::new("n1", MetricType::CpuPercent, ts, 20.0))
            .unwrap();

        let samples = store.range("n1", MetricType::CpuPercent, ts, ts + 1);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 20.0);
    }

    #[test]
    fn test_ingest_rejects_non_finite() {
        let (_, ingest) = ingest_with_noop();
        let nan = Sample::new("n1", MetricType::CpuPercent, fixed_clock(), f64::NAN);
        let inf = Sample::new("n1", MetricType::CpuPercent, fixed_clock(), f64::INFINITY);

        assert!(matches!(
            ingest.ingest(&nan),
            Err(IngestError::NonFiniteValue)
        ));
        assert!(matches!(
            ingest.ingest(&inf),
            Err(IngestError::NonFiniteValue)
        ));
        assert_eq!(ingest.stats().rejected(), 2);
    }

    #[test]
    fn test_ingest_rejects_far_future() {
        let (_, ingest) = ingest_with_noop();
        let sample = Sample::new("n1", MetricType::CpuPercent, fixed_clock() + 301, 1.0);

        assert!(matches!(
            ingest.ingest(&sample),
            Err(IngestError::FutureTimestamp { .. })
        ));

        // Exactly at the skew limit is accepted
        let edge = Sample::new("n1", MetricType::CpuPercent, fixed_clock() + 300, 1.0);
        assert!(ingest.ingest(&edge).is_ok());
    }

    struct RecordingInvalidate {
        calls: Mutex<Vec<(String, MetricType, i64)>>,
    }

    impl CacheInvalidate for RecordingInvalidate {
        fn invalidate(&self, entity_id: &str, metric: MetricType, timestamp: i64) {
            self.calls
                .lock()
                .unwrap()
                .push((entity_id.to_string(), metric, timestamp));
        }
    }

    #[test]
    fn test_ingest_fires_invalidation() {
        let store = Arc::new(MetricStore::new());
        let hook = Arc::new(RecordingInvalidate {
            calls: Mutex::new(Vec::new()),
        });
        let ingest = SampleIngest::new(store, hook.clone()).with_clock(fixed_clock);

        let sample = Sample::new("n1", MetricType::CpuPercent, fixed_clock(), 1.0);
        ingest.ingest(&sample).unwrap();
        ingest.ingest(&sample).unwrap();

        // Both the append and the overwrite invalidate
        let calls = hook.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "n1");
    }

    #[test]
    fn test_ingest_reading_isolates_bad_values() {
        let (store, ingest) = ingest_with_noop();
        let reading = Reading {
            entity_id: "n1".to_string(),
            timestamp: fixed_clock(),
            values: vec![
                (MetricType::CpuPercent, 50.0),
                (MetricType::MemoryPercent, f64::NAN),
                (MetricType::HealthScore, 1.0),
            ],
        };

        let report = ingest.ingest_reading(&reading);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(store.sample_count(), 2);
    }
}
