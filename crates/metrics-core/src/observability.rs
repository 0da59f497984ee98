//! Prometheus metrics and structured event logging for the metrics core

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for query and aggregation latency (seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once per process)
static GLOBAL_METRICS: OnceLock<CoreMetricsInner> = OnceLock::new();

struct CoreMetricsInner {
    samples_ingested: IntCounterVec,
    samples_stored: IntGauge,
    entities_registered: IntGauge,
    aggregation_latency_seconds: Histogram,
    query_latency_seconds: Histogram,
    query_errors: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    compaction_deleted_total: IntCounter,
    anomalies_flagged_total: IntCounter,
}

impl CoreMetricsInner {
    fn new() -> Self {
        Self {
            samples_ingested: register_int_counter_vec!(
                "metricsd_samples_ingested_total",
                "Samples processed by ingest, by outcome",
                &["outcome"]
            )
            .expect("Failed to register samples_ingested_total"),

            samples_stored: register_int_gauge!(
                "metricsd_samples_stored",
                "Raw samples currently held in the time-series store"
            )
            .expect("Failed to register samples_stored"),

            entities_registered: register_int_gauge!(
                "metricsd_entities_registered",
                "Entities known to the registry"
            )
            .expect("Failed to register entities_registered"),

            aggregation_latency_seconds: register_histogram!(
                "metricsd_aggregation_latency_seconds",
                "Time spent computing bucket aggregations",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register aggregation_latency_seconds"),

            query_latency_seconds: register_histogram!(
                "metricsd_query_latency_seconds",
                "End-to-end query execution time",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_latency_seconds"),

            query_errors: register_int_counter!(
                "metricsd_query_errors_total",
                "Queries rejected or failed"
            )
            .expect("Failed to register query_errors_total"),

            cache_hits: register_int_counter!(
                "metricsd_bucket_cache_hits_total",
                "Aggregation results served from cache"
            )
            .expect("Failed to register bucket_cache_hits_total"),

            cache_misses: register_int_counter!(
                "metricsd_bucket_cache_misses_total",
                "Aggregation results computed from the store"
            )
            .expect("Failed to register bucket_cache_misses_total"),

            compaction_deleted_total: register_int_counter!(
                "metricsd_compaction_deleted_total",
                "Raw samples deleted by retention compaction"
            )
            .expect("Failed to register compaction_deleted_total"),

            anomalies_flagged_total: register_int_counter!(
                "metricsd_anomalies_flagged_total",
                "Trend analyses whose latest bucket was flagged anomalous"
            )
            .expect("Failed to register anomalies_flagged_total"),
        }
    }
}

/// Lightweight handle to the global Prometheus metrics. Clones share the
/// same underlying registry entries.
#[derive(Clone)]
pub struct CoreMetrics {
    _private: (),
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CoreMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CoreMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Publish the absolute per-outcome counts kept by ingest stats,
    /// advancing each counter by its delta.
    pub fn record_ingest_counters(&self, accepted: u64, deduplicated: u64, rejected: u64) {
        let inner = self.inner();
        for (outcome, count) in [
            ("accepted", accepted),
            ("deduplicated", deduplicated),
            ("rejected", rejected),
        ] {
            let counter = inner.samples_ingested.with_label_values(&[outcome]);
            counter.inc_by(count.saturating_sub(counter.get()));
        }
    }

    pub fn set_samples_stored(&self, count: i64) {
        self.inner().samples_stored.set(count);
    }

    pub fn set_entities_registered(&self, count: i64) {
        self.inner().entities_registered.set(count);
    }

    pub fn observe_aggregation_latency(&self, duration_secs: f64) {
        self.inner()
            .aggregation_latency_seconds
            .observe(duration_secs);
    }

    pub fn observe_query_latency(&self, duration_secs: f64) {
        self.inner().query_latency_seconds.observe(duration_secs);
    }

    pub fn inc_query_errors(&self) {
        self.inner().query_errors.inc();
    }

    pub fn record_cache_counters(&self, hits: u64, misses: u64) {
        // The cache keeps absolute counts; export the deltas
        let inner = self.inner();
        let seen_hits = inner.cache_hits.get();
        let seen_misses = inner.cache_misses.get();
        inner.cache_hits.inc_by(hits.saturating_sub(seen_hits));
        inner
            .cache_misses
            .inc_by(misses.saturating_sub(seen_misses));
    }

    pub fn inc_compaction_deleted(&self, count: u64) {
        self.inner().compaction_deleted_total.inc_by(count);
    }

    pub fn inc_anomalies_flagged(&self) {
        self.inner().anomalies_flagged_total.inc();
    }
}

/// Structured logger for significant daemon events. Every event carries an
/// `event` field so downstream log pipelines can route without parsing the
/// message text.
#[derive(Clone, Default)]
pub struct StructuredLogger {
    _private: (),
}

impl StructuredLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_startup(&self, version: &str, api_port: u16) {
        info!(
            event = "daemon_started",
            daemon_version = %version,
            api_port = api_port,
            "Metrics daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            reason = %reason,
            "Metrics daemon shutting down"
        );
    }

    pub fn log_compaction(&self, series: usize, rollups: usize, deleted: usize) {
        info!(
            event = "compaction_pass",
            series = series,
            rollup_buckets = rollups,
            samples_deleted = deleted,
            "Retention compaction complete"
        );
    }

    pub fn log_anomaly(&self, entity_id: &str, metric_type: &str, slope: f64, confidence: f64) {
        warn!(
            event = "anomaly_detected",
            entity_id = %entity_id,
            metric = %metric_type,
            slope = slope,
            confidence = confidence,
            "Latest bucket deviates from fitted trend"
        );
    }

    pub fn log_query_rejected(&self, reason: &str) {
        info!(
            event = "query_rejected",
            reason = %reason,
            "Query rejected"
        );
    }

    pub fn log_snapshot(&self, path: &str, samples: usize, success: bool) {
        if success {
            info!(
                event = "snapshot_written",
                path = %path,
                samples = samples,
                "Store snapshot written"
            );
        } else {
            warn!(
                event = "snapshot_failed",
                path = %path,
                "Store snapshot failed, raw data remains in memory only"
            );
        }
    }
}
