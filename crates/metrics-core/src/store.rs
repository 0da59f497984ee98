//! Time-series store for raw samples
//!
//! Samples are keyed by (entity_id, metric_type, timestamp). Each series
//! lives in its own ordered map behind its own lock: appends to different
//! series run concurrently, while appends, overwrites and retention deletes
//! for the same series are serialized. Range scans are the dominant access
//! pattern and come straight off the ordered map.
//!
//! The store also supports JSON snapshot persistence so raw history
//! survives a process restart (atomic temp-file write, then rename).

use crate::models::{MetricType, Sample};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

/// Identity of one stored series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub entity_id: String,
    pub metric_type: MetricType,
}

impl SeriesKey {
    pub fn new(entity_id: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_type,
        }
    }
}

/// Result of an append: whether the sample key already existed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendResult {
    Appended,
    /// Key existed; carries the value that was replaced
    Overwrote(f64),
}

/// In-memory time-series store with per-series write serialization
pub struct MetricStore {
    series: DashMap<SeriesKey, RwLock<BTreeMap<i64, f64>>>,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
        }
    }

    /// Append one sample. A sample matching an existing
    /// (entity_id, metric_type, timestamp) key overwrites in place.
    pub fn append(&self, sample: &Sample) -> AppendResult {
        let key = SeriesKey::new(&sample.entity_id, sample.metric_type);
        let entry = self.series.entry(key).or_default();
        let mut map = write_lock(entry.value());
        match map.insert(sample.timestamp, sample.value) {
            Some(prior) => AppendResult::Overwrote(prior),
            None => AppendResult::Appended,
        }
    }

    /// Ordered range scan, ascending by timestamp: `from` inclusive,
    /// `to` exclusive.
    pub fn range(&self, entity_id: &str, metric: MetricType, from: i64, to: i64) -> Vec<Sample> {
        self.range_chunk(entity_id, metric, from, to, None, usize::MAX)
    }

    /// Restartable range scan: at most `limit` samples, starting strictly
    /// after `after` when given (otherwise at `from`). This is the cursor
    /// primitive streaming exports pull batches through.
    pub fn range_chunk(
        &self,
        entity_id: &str,
        metric: MetricType,
        from: i64,
        to: i64,
        after: Option<i64>,
        limit: usize,
    ) -> Vec<Sample> {
        let key = SeriesKey::new(entity_id, metric);
        let Some(entry) = self.series.get(&key) else {
            return Vec::new();
        };
        let map = read_lock(entry.value());
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.max(from.saturating_sub(1))),
            None => Bound::Included(from),
        };
        map.range((lower, Bound::Excluded(to)))
            .take(limit)
            .map(|(ts, value)| Sample::new(entity_id, metric, *ts, *value))
            .collect()
    }

    /// Number of samples in `[from, to)` without materializing them.
    pub fn count_range(&self, entity_id: &str, metric: MetricType, from: i64, to: i64) -> usize {
        let key = SeriesKey::new(entity_id, metric);
        let Some(entry) = self.series.get(&key) else {
            return 0;
        };
        let map = read_lock(entry.value());
        map.range(from..to).count()
    }

    /// Timestamp of the most recent sample in a series
    pub fn latest_timestamp(&self, entity_id: &str, metric: MetricType) -> Option<i64> {
        let key = SeriesKey::new(entity_id, metric);
        let entry = self.series.get(&key)?;
        let map = read_lock(entry.value());
        map.keys().next_back().copied()
    }

    /// Timestamp of the oldest sample in a series
    pub fn oldest_timestamp(&self, entity_id: &str, metric: MetricType) -> Option<i64> {
        let key = SeriesKey::new(entity_id, metric);
        let entry = self.series.get(&key)?;
        let map = read_lock(entry.value());
        map.keys().next().copied()
    }

    /// All series currently holding samples
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        self.series.iter().map(|e| e.key().clone()).collect()
    }

    /// Total number of stored samples across all series
    pub fn sample_count(&self) -> usize {
        self.series
            .iter()
            .map(|e| read_lock(e.value()).len())
            .sum()
    }

    /// Delete all samples strictly older than `cutoff` for one series.
    ///
    /// This is the only deletion path. It is invoked solely by the
    /// compaction pass, after a covering coarse bucket set has been
    /// computed, and takes the same per-series lock as appends so it
    /// never races an in-flight write.
    pub fn delete_older_than(&self, entity_id: &str, metric: MetricType, cutoff: i64) -> usize {
        let key = SeriesKey::new(entity_id, metric);
        let Some(entry) = self.series.get(&key) else {
            return 0;
        };
        let mut map = write_lock(entry.value());
        let before = map.len();
        let kept = map.split_off(&cutoff);
        *map = kept;
        let removed = before - map.len();
        if removed > 0 {
            debug!(
                entity_id,
                metric = %metric,
                cutoff,
                removed,
                "Deleted raw samples past retention"
            );
        }
        removed
    }

    /// Write all samples to `path` as JSON, atomically (temp file + rename).
    pub fn snapshot_to(&self, path: &Path) -> Result<usize> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let mut samples = Vec::new();
        for entry in self.series.iter() {
            let key = entry.key().clone();
            let map = read_lock(entry.value());
            for (ts, value) in map.iter() {
                samples.push(Sample::new(&key.entity_id, key.metric_type, *ts, *value));
            }
        }

        let json = serde_json::to_vec(&samples).context("Failed to serialize samples")?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write snapshot")?;
        file.sync_all().context("Failed to sync snapshot file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        debug!(path = %path.display(), samples = samples.len(), "Store snapshot written");
        Ok(samples.len())
    }

    /// Load samples from a snapshot written by [`snapshot_to`].
    ///
    /// [`snapshot_to`]: MetricStore::snapshot_to
    pub fn load_from(&self, path: &Path) -> Result<usize> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open snapshot {:?}", path))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .context("Failed to read snapshot file")?;

        let samples: Vec<Sample> =
            serde_json::from_slice(&data).context("Failed to deserialize snapshot")?;
        let count = samples.len();
        for sample in &samples {
            self.append(sample);
        }

        info!(path = %path.display(), samples = count, "Loaded store snapshot");
        Ok(count)
    }
}

fn read_lock(lock: &RwLock<BTreeMap<i64, f64>>) -> std::sync::RwLockReadGuard<'_, BTreeMap<i64, f64>> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock(
    lock: &RwLock<BTreeMap<i64, f64>>,
) -> std::sync::RwLockWriteGuard<'_, BTreeMap<i64, f64>> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
