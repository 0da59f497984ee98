//! Background scheduling: the sampling tick and the compaction pass
//!
//! Two periodic loops own all background work. The sampling loop pulls a
//! reading per registered entity each tick and feeds it through ingest;
//! one entity being unreachable never blocks the others. The compaction
//! pass summarizes raw samples past the retention horizon into hourly
//! rollups before deleting them, so long-term trends survive raw data
//! expiry.

use crate::aggregate::Aggregator;
use crate::error::Unavailable;
use crate::ingest::SampleIngest;
use crate::models::{Granularity, Reading};
use crate::observability::{CoreMetrics, StructuredLogger};
use crate::registry::EntityRegistry;
use crate::store::MetricStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

/// Pulls a point-in-time reading for one entity. The daemon wires an HTTP
/// implementation against the sampling collaborator; tests use mocks.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn pull(&self, entity_id: &str) -> Result<Reading, Unavailable>;
}

/// Scheduler timing configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base sampling interval (default: 30 seconds)
    pub sampling_interval: Duration,
    /// Maximum jitter added to each interval (default: 2 seconds)
    pub jitter: Duration,
    /// How often the compaction pass runs (default: 1 hour)
    pub compaction_interval: Duration,
    /// Raw samples older than this are summarized and deleted
    /// (default: 7 days)
    pub retention: Duration,
    /// Attempts for the rollup write before giving up the pass
    pub rollup_write_attempts: u32,
    /// Base backoff between rollup write attempts, doubled per retry
    pub rollup_write_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(30),
            jitter: Duration::from_secs(2),
            compaction_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            rollup_write_attempts: 3,
            rollup_write_backoff: Duration::from_millis(250),
        }
    }
}

/// Per-tick sampling summary
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickResults {
    pub entities_sampled: usize,
    pub entities_unavailable: usize,
    pub samples_accepted: usize,
    pub samples_rejected: usize,
}

/// Periodic per-entity sampling driven by the registry
pub struct SamplingLoop {
    sampler: Arc<dyn Sampler>,
    registry: Arc<EntityRegistry>,
    ingest: Arc<SampleIngest>,
    config: SchedulerConfig,
}

impl SamplingLoop {
    pub fn new(
        sampler: Arc<dyn Sampler>,
        registry: Arc<EntityRegistry>,
        ingest: Arc<SampleIngest>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            sampler,
            registry,
            ingest,
            config,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.sampling_interval.as_secs(),
            "Starting sampling loop"
        );

        let mut tick_count = 0u64;

        loop {
            // A fresh sleep each iteration re-rolls the jitter; the first
            // pull happens one interval after startup.
            tokio::select! {
                _ = sleep(self.tick_interval()) => {
                    let results = self.sample_all().await;
                    tick_count += 1;

                    if tick_count % 10 == 0 {
                        debug!(
                            sampled = results.entities_sampled,
                            unavailable = results.entities_unavailable,
                            accepted = results.samples_accepted,
                            rejected = results.samples_rejected,
                            "Sampling tick complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down sampling loop");
                    break;
                }
            }
        }
    }

    fn tick_interval(&self) -> Duration {
        self.config.sampling_interval
            + Duration::from_millis(rand_jitter(self.config.jitter.as_millis() as u64))
    }

    /// Pull every registered entity once. An unavailable entity is logged
    /// and skipped; its samples for this tick are simply absent.
    async fn sample_all(&self) -> TickResults {
        let mut results = TickResults::default();

        for entity in self.registry.list() {
            match self.sampler.pull(&entity.entity_id).await {
                Ok(reading) => {
                    results.entities_sampled += 1;
                    let report = self.ingest.ingest_reading(&reading);
                    results.samples_accepted += report.accepted + report.deduplicated;
                    results.samples_rejected += report.rejected;
                }
                Err(e) => {
                    results.entities_unavailable += 1;
                    warn!(
                        entity_id = %entity.entity_id,
                        error = %e,
                        "Entity unavailable this tick"
                    );
                }
            }
        }

        results
    }
}

/// Summary of one compaction pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompactionResults {
    pub series_compacted: usize,
    pub rollup_buckets: usize,
    pub samples_deleted: usize,
}

/// Periodic retention enforcement: summarize then delete.
///
/// For each series with samples older than the retention horizon, the
/// expired range is aggregated at one-hour granularity and appended to
/// the rollup file before the raw samples are deleted. Deletion only
/// happens once the rollup append has fsynced: when no rollup path is
/// configured, or the write fails, the raw samples stay in the store.
pub struct CompactionLoop {
    store: Arc<MetricStore>,
    aggregator: Arc<Aggregator>,
    config: SchedulerConfig,
    /// JSONL file receiving hourly rollups of expired data; `None`
    /// disables retention deletion entirely
    rollup_path: Option<PathBuf>,
    metrics: Option<CoreMetrics>,
    logger: StructuredLogger,
    clock: fn() -> i64,
}

impl CompactionLoop {
    pub fn new(store: Arc<MetricStore>, aggregator: Arc<Aggregator>, config: SchedulerConfig) -> Self {
        Self {
            store,
            aggregator,
            config,
            rollup_path: None,
            metrics: None,
            logger: StructuredLogger::new(),
            clock: || chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_rollup_path(mut self, path: PathBuf) -> Self {
        self.rollup_path = Some(path);
        self
    }

    pub fn with_metrics(mut self, metrics: CoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the wall clock, for deterministic retention tests.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.compaction_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Starting compaction loop"
        );

        let mut ticker = interval(self.config.compaction_interval);
        // The first tick fires immediately; skip it so a restart does not
        // compact before the store has loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_pass().await {
                        Ok(results) if results.series_compacted == 0 => {
                            debug!("Compaction pass found nothing to expire");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Compaction pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down compaction loop");
                    break;
                }
            }
        }
    }

    /// One pass over every series. The cutoff is aligned down to an hour
    /// boundary so only fully-bucketed hours are ever summarized and
    /// deleted.
    pub async fn run_pass(&self) -> Result<CompactionResults> {
        let now = (self.clock)();
        let cut = Granularity::OneHour.align(now - self.config.retention.as_secs() as i64);
        let mut results = CompactionResults::default();

        // Raw samples may only be deleted once a covering rollup is on
        // disk; without a rollup target the pass keeps everything.
        let Some(rollup_path) = &self.rollup_path else {
            debug!("No rollup path configured; expired raw samples are retained");
            return Ok(results);
        };

        for key in self.store.series_keys() {
            let oldest = match self.store.oldest_timestamp(&key.entity_id, key.metric_type) {
                Some(ts) if ts < cut => ts,
                _ => continue,
            };

            // Summarize the expired range first; the buckets land in the
            // aggregation cache and, when configured, the rollup file.
            let buckets = self.aggregator.aggregate(
                &key.entity_id,
                key.metric_type,
                Granularity::OneHour.align(oldest),
                cut,
                Granularity::OneHour,
            );

            self.append_rollups(rollup_path, &buckets).await?;

            let deleted = self.store.delete_older_than(&key.entity_id, key.metric_type, cut);
            results.series_compacted += 1;
            results.rollup_buckets += buckets.len();
            results.samples_deleted += deleted;

            debug!(
                entity_id = %key.entity_id,
                metric = %key.metric_type,
                cutoff = cut,
                buckets = buckets.len(),
                deleted,
                "Compacted series"
            );
        }

        if results.series_compacted > 0 {
            self.logger.log_compaction(
                results.series_compacted,
                results.rollup_buckets,
                results.samples_deleted,
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_compaction_deleted(results.samples_deleted as u64);
            }
        }

        Ok(results)
    }

    /// Append hourly rollups as JSON lines, retrying with doubling
    /// backoff before surfacing the error (which skips deletion for the
    /// series).
    async fn append_rollups(
        &self,
        path: &PathBuf,
        buckets: &[crate::models::Bucket],
    ) -> Result<()> {
        let mut backoff = self.config.rollup_write_backoff;
        let mut last_err = None;

        for attempt in 1..=self.config.rollup_write_attempts {
            match write_rollup_lines(path, buckets) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        path = %path.display(),
                        "Rollup write failed"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("rollup write failed")))
            .with_context(|| format!("appending rollups to {}", path.display()))
    }
}

fn write_rollup_lines(path: &PathBuf, buckets: &[crate::models::Bucket]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    for bucket in buckets {
        serde_json::to_writer(&mut file, bucket)?;
        file.write_all(b"\n")?;
    }
    file.sync_all()?;
    Ok(())
}

/// Jitter derived from the clock, bounded by `max_ms`
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    now % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::BucketCache;
    use crate::ingest::NoopInvalidate;
    use crate::models::{EntityRef, MetricType, Sample};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockSampler {
        call_count: AtomicUsize,
        fail_entity: Option<String>,
    }

    impl MockSampler {
        fn new() -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                fail_entity: None,
            }
        }

        fn failing_for(entity_id: &str) -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                fail_entity: Some(entity_id.to_string()),
            }
        }
    }

    #[async_trait]
    impl Sampler for MockSampler {
        async fn pull(&self, entity_id: &str) -> Result<Reading, Unavailable> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_entity.as_deref() == Some(entity_id) {
                return Err(Unavailable::new(entity_id, "connection refused"));
            }
            Ok(Reading {
                entity_id: entity_id.to_string(),
                timestamp: 1_700_000_000,
                values: vec![
                    (MetricType::CpuPercent, 42.0),
                    (MetricType::MemoryPercent, 63.0),
                ],
            })
        }
    }

    fn sampling_fixture(sampler: MockSampler) -> (Arc<MetricStore>, Arc<MockSampler>, SamplingLoop) {
        let store = Arc::new(MetricStore::new());
        let registry = Arc::new(EntityRegistry::new());
        registry.register(EntityRef::node("n1"));
        registry.register(EntityRef::node("n2"));

        let ingest = Arc::new(
            SampleIngest::new(store.clone(), Arc::new(NoopInvalidate))
                .with_clock(|| 1_700_000_000),
        );
        let sampler = Arc::new(sampler);
        let sampling = SamplingLoop::new(
            sampler.clone(),
            registry,
            ingest,
            SchedulerConfig::default(),
        );
        (store, sampler, sampling)
    }

    #[tokio::test]
    async fn test_tick_samples_every_entity() {
        let (store, sampler, sampling) = sampling_fixture(MockSampler::new());

        let results = sampling.sample_all().await;
        assert_eq!(results.entities_sampled, 2);
        assert_eq!(results.samples_accepted, 4);
        assert_eq!(sampler.call_count.load(Ordering::SeqCst), 2);
        assert_eq!(store.sample_count(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_entity_does_not_block_others() {
        let (store, _, sampling) = sampling_fixture(MockSampler::failing_for("n1"));

        let results = sampling.sample_all().await;
        assert_eq!(results.entities_unavailable, 1);
        assert_eq!(results.entities_sampled, 1);
        // n2's samples landed despite n1 being down
        assert_eq!(store.sample_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_tick_deduplicates() {
        let (store, _, sampling) = sampling_fixture(MockSampler::new());

        sampling.sample_all().await;
        let second = sampling.sample_all().await;
        // Same timestamps redelivered: counted as accepted, store unchanged
        assert_eq!(second.samples_accepted, 4);
        assert_eq!(store.sample_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_loop_paces_pulls() {
        let (_, sampler, mut sampling) = sampling_fixture(MockSampler::new());
        sampling.config.sampling_interval = Duration::from_millis(200);
        sampling.config.jitter = Duration::ZERO;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(sampling.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(1050)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Five 200ms ticks over two entities; an unpaced loop would pull
        // thousands of times in the same window
        assert_eq!(sampler.call_count.load(Ordering::SeqCst), 10);
    }

    fn compaction_fixture() -> (Arc<MetricStore>, Arc<Aggregator>) {
        let store = Arc::new(MetricStore::new());
        let aggregator = Arc::new(Aggregator::new(store.clone(), Arc::new(BucketCache::new())));
        (store, aggregator)
    }

    const NOW: i64 = 1_000 * 3600;

    fn retention_config() -> SchedulerConfig {
        SchedulerConfig {
            retention: Duration::from_secs(100 * 3600),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_compaction_deletes_only_expired() {
        let (store, aggregator) = compaction_fixture();
        // Samples at hours 800..1000; retention keeps the trailing 100 hours
        for hour in 800..1000 {
            store.append(&Sample::new(
                "n1",
                MetricType::CpuPercent,
                hour * 3600,
                hour as f64,
            ));
        }

        let dir = tempfile::tempdir().unwrap();
        let compaction = CompactionLoop::new(store.clone(), aggregator, retention_config())
            .with_rollup_path(dir.path().join("rollups.jsonl"))
            .with_clock(|| NOW);
        let results = compaction.run_pass().await.unwrap();

        assert_eq!(results.series_compacted, 1);
        assert_eq!(results.samples_deleted, 100);
        // Cutoff is NOW - retention = hour 900; older samples are gone
        assert_eq!(
            store.oldest_timestamp("n1", MetricType::CpuPercent),
            Some(900 * 3600)
        );
    }

    #[tokio::test]
    async fn test_compaction_noop_when_nothing_expired() {
        let (store, aggregator) = compaction_fixture();
        store.append(&Sample::new("n1", MetricType::CpuPercent, NOW - 60, 1.0));

        let dir = tempfile::tempdir().unwrap();
        let compaction = CompactionLoop::new(store.clone(), aggregator, retention_config())
            .with_rollup_path(dir.path().join("rollups.jsonl"))
            .with_clock(|| NOW);
        let results = compaction.run_pass().await.unwrap();

        assert_eq!(results, CompactionResults::default());
        assert_eq!(store.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_no_rollup_path_skips_deletion() {
        let (store, aggregator) = compaction_fixture();
        // Long expired, but there is nowhere durable to summarize it to
        store.append(&Sample::new("n1", MetricType::CpuPercent, 0, 10.0));

        let compaction = CompactionLoop::new(store.clone(), aggregator, retention_config())
            .with_clock(|| NOW);
        let results = compaction.run_pass().await.unwrap();

        assert_eq!(results, CompactionResults::default());
        assert_eq!(store.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_compaction_records_deleted_samples() {
        let (store, aggregator) = compaction_fixture();
        store.append(&Sample::new("n1", MetricType::CpuPercent, 0, 10.0));
        store.append(&Sample::new("n1", MetricType::CpuPercent, 1800, 30.0));

        let dir = tempfile::tempdir().unwrap();
        let compaction = CompactionLoop::new(store.clone(), aggregator, retention_config())
            .with_rollup_path(dir.path().join("rollups.jsonl"))
            .with_metrics(CoreMetrics::new())
            .with_clock(|| NOW);

        let before = counter_value("metricsd_compaction_deleted_total");
        let results = compaction.run_pass().await.unwrap();
        assert_eq!(results.samples_deleted, 2);
        assert_eq!(counter_value("metricsd_compaction_deleted_total") - before, 2);
    }

    fn counter_value(name: &str) -> u64 {
        prometheus::gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_counter().get_value() as u64)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_compaction_writes_rollups_before_delete() {
        let (store, aggregator) = compaction_fixture();
        // Two samples inside one expired hour
        store.append(&Sample::new("n1", MetricType::CpuPercent, 0, 10.0));
        store.append(&Sample::new("n1", MetricType::CpuPercent, 1800, 30.0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollups.jsonl");
        let compaction = CompactionLoop::new(store.clone(), aggregator, retention_config())
            .with_rollup_path(path.clone())
            .with_clock(|| NOW);

        let results = compaction.run_pass().await.unwrap();
        assert_eq!(results.rollup_buckets, 1);
        assert_eq!(store.sample_count(), 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        let bucket: crate::models::Bucket =
            serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(bucket.sample_count, 2);
        assert!((bucket.mean - 20.0).abs() < 1e-9);
        assert_eq!(bucket.granularity, Granularity::OneHour);
    }

    #[tokio::test]
    async fn test_failed_rollup_write_preserves_raw_data() {
        let (store, aggregator) = compaction_fixture();
        store.append(&Sample::new("n1", MetricType::CpuPercent, 0, 10.0));

        // A directory path makes the append open fail every attempt
        let dir = tempfile::tempdir().unwrap();
        let mut config = retention_config();
        config.rollup_write_attempts = 2;
        config.rollup_write_backoff = Duration::from_millis(1);
        let compaction = CompactionLoop::new(store.clone(), aggregator, config)
            .with_rollup_path(dir.path().to_path_buf())
            .with_clock(|| NOW);

        assert!(compaction.run_pass().await.is_err());
        // Nothing deleted: the pass aborts before touching the store
        assert_eq!(store.sample_count(), 1);
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.sampling_interval, Duration::from_secs(30));
        assert_eq!(config.compaction_interval, Duration::from_secs(3600));
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_rand_jitter_bounds() {
        assert!(rand_jitter(1000) < 1000);
        assert_eq!(rand_jitter(0), 0);
    }
}
