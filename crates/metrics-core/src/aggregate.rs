//! Bucketed aggregation over the time-series store
//!
//! Bucket boundaries come from integer division of the sample timestamp by
//! the granularity width, so the same raw series always aggregates to the
//! same buckets no matter when aggregation runs. That determinism is what
//! makes the result cache sound: a cached entry is byte-identical to a
//! recomputation, and ingest invalidates any entry whose range covers a
//! newly committed sample.

use crate::ingest::CacheInvalidate;
use crate::models::{Bucket, Granularity, MetricType};
use crate::observability::CoreMetrics;
use crate::store::MetricStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Default entry bound for the aggregation cache
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Full request tuple identifying one cached aggregation result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    entity_id: String,
    metric: MetricType,
    from: i64,
    to: i64,
    granularity: Granularity,
}

/// One cached result and the touch stamp eviction orders by
struct CacheSlot {
    buckets: Arc<Vec<Bucket>>,
    stamp: u64,
}

/// Cache of last-computed bucket sequences, keyed by the full request.
///
/// This is process-wide mutable state, so it is an explicit component with
/// the invalidation hook injected into ingest rather than ambient global
/// state; tests construct isolated instances. Now-anchored dashboards mint
/// a distinct key per poll, so the cache is capped: at capacity the least
/// recently touched entry is evicted.
pub struct BucketCache {
    entries: DashMap<CacheKey, CacheSlot>,
    hits: AtomicU64,
    misses: AtomicU64,
    stamp: AtomicU64,
    capacity: usize,
}

impl Default for BucketCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl BucketCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stamp: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<Bucket>>> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.stamp = self.stamp.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.buckets.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&self, key: CacheKey, buckets: Arc<Vec<Bucket>>) {
        if self.entries.len() >= self.capacity {
            self.evict_least_recent();
        }
        let stamp = self.stamp.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, CacheSlot { buckets, stamp });
    }

    /// Coarse LRU: a full scan for the minimum stamp is fine at the
    /// capacities involved.
    fn evict_least_recent(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stamp)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl CacheInvalidate for BucketCache {
    /// Drop every cached result for this series whose range covers the
    /// committed timestamp. Runs synchronously with ingest, so a cache hit
    /// never returns data older than the most recent sample in range.
    fn invalidate(&self, entity_id: &str, metric: MetricType, timestamp: i64) {
        self.entries.retain(|key, _| {
            !(key.entity_id == entity_id
                && key.metric == metric
                && key.from <= timestamp
                && timestamp < key.to)
        });
    }
}

/// Computes bucketed min/max/mean/count summaries over store ranges
pub struct Aggregator {
    store: Arc<MetricStore>,
    cache: Arc<BucketCache>,
    metrics: Option<CoreMetrics>,
}

impl Aggregator {
    pub fn new(store: Arc<MetricStore>, cache: Arc<BucketCache>) -> Self {
        Self {
            store,
            cache,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: CoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<BucketCache> {
        &self.cache
    }

    /// Aggregate `[from, to)` at the requested granularity. Buckets with no
    /// samples are omitted; callers treat gaps as "no data", not zero.
    pub fn aggregate(
        &self,
        entity_id: &str,
        metric: MetricType,
        from: i64,
        to: i64,
        granularity: Granularity,
    ) -> Arc<Vec<Bucket>> {
        let key = CacheKey {
            entity_id: entity_id.to_string(),
            metric,
            from,
            to,
            granularity,
        };

        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let started = Instant::now();
        let buckets = Arc::new(self.compute(entity_id, metric, from, to, granularity));
        if let Some(metrics) = &self.metrics {
            metrics.observe_aggregation_latency(started.elapsed().as_secs_f64());
        }
        self.cache.insert(key, buckets.clone());
        buckets
    }

    /// The bounded "latest N buckets" poll interface live charts repeat on
    /// a short interval. Includes the current partial bucket.
    pub fn latest_buckets(
        &self,
        entity_id: &str,
        metric: MetricType,
        granularity: Granularity,
        n: usize,
        now: i64,
    ) -> Arc<Vec<Bucket>> {
        let secs = granularity.secs();
        let current = granularity.align(now);
        let from = current - secs * (n.saturating_sub(1) as i64);
        self.aggregate(entity_id, metric, from, current + secs, granularity)
    }

    fn compute(
        &self,
        entity_id: &str,
        metric: MetricType,
        from: i64,
        to: i64,
        granularity: Granularity,
    ) -> Vec<Bucket> {
        let samples = self.store.range(entity_id, metric, from, to);
        let mut buckets: Vec<Bucket> = Vec::new();

        for sample in &samples {
            let start = granularity.align(sample.timestamp);
            match buckets.last_mut() {
                Some(bucket) if bucket.bucket_start == start => {
                    bucket.min = bucket.min.min(sample.value);
                    bucket.max = bucket.max.max(sample.value);
                    // Running mean keeps one pass over the ordered scan
                    let count = bucket.sample_count as f64;
                    bucket.mean = (bucket.mean * count + sample.value) / (count + 1.0);
                    bucket.sample_count += 1;
                }
                _ => buckets.push(Bucket {
                    entity_id: entity_id.to_string(),
                    metric_type: metric,
                    bucket_start: start,
                    granularity,
                    min: sample.value,
                    max: sample.value,
                    mean: sample.value,
                    sample_count: 1,
                }),
            }
        }

        debug!(
            entity_id,
            metric = %metric,
            from,
            to,
            granularity = %granularity,
            samples = samples.len(),
            buckets = buckets.len(),
            "Aggregated range"
        );
        buckets
    }
}
