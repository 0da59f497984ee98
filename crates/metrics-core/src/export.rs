//! Flat-row and columnar export formats
//!
//! The presentation collaborator's download feature pulls results as one
//! row per point or bucket, in JSON or CSV with the same column set.
//! `RowStream` is a lazy, finite, restartable iterator built on the
//! store's cursor primitive: a multi-day raw export never holds the full
//! result in memory, and dropping the stream stops the underlying scan
//! within one batch.

use crate::aggregate::Aggregator;
use crate::models::{Granularity, MetricType};
use crate::store::MetricStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Rows fetched from the store per pull
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// One exported row. Raw rows carry `timestamp` and `value`; aggregated
/// rows carry `bucket_start` and the bucket statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub entity_id: String,
    pub metric_type: MetricType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u64>,
}

/// Shape of an export: raw points or aggregated buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportShape {
    Raw,
    Aggregated,
}

impl ExportRow {
    pub fn raw(entity_id: &str, metric: MetricType, timestamp: i64, value: f64) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            metric_type: metric,
            timestamp: Some(timestamp),
            bucket_start: None,
            value: Some(value),
            min: None,
            max: None,
            mean: None,
            sample_count: None,
        }
    }

    pub fn aggregated(bucket: &crate::models::Bucket) -> Self {
        Self {
            entity_id: bucket.entity_id.clone(),
            metric_type: bucket.metric_type,
            timestamp: None,
            bucket_start: Some(bucket.bucket_start),
            value: None,
            min: Some(bucket.min),
            max: Some(bucket.max),
            mean: Some(bucket.mean),
            sample_count: Some(bucket.sample_count),
        }
    }

    /// CSV header for a given shape; column set mirrors the JSON keys.
    pub fn csv_header(shape: ExportShape) -> &'static str {
        match shape {
            ExportShape::Raw => "entity_id,metric_type,timestamp,value",
            ExportShape::Aggregated => {
                "entity_id,metric_type,bucket_start,min,max,mean,sample_count"
            }
        }
    }

    /// One CSV line, columns matching [`csv_header`] for the row's shape.
    ///
    /// [`csv_header`]: ExportRow::csv_header
    pub fn to_csv_line(&self) -> String {
        match self.timestamp {
            Some(ts) => format!(
                "{},{},{},{}",
                self.entity_id,
                self.metric_type,
                ts,
                fmt_f64(self.value)
            ),
            None => format!(
                "{},{},{},{},{},{},{}",
                self.entity_id,
                self.metric_type,
                self.bucket_start.unwrap_or_default(),
                fmt_f64(self.min),
                fmt_f64(self.max),
                fmt_f64(self.mean),
                self.sample_count.unwrap_or_default()
            ),
        }
    }
}

fn fmt_f64(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => String::new(),
    }
}

/// Columnar form of one entity's series: parallel arrays, the shape the
/// presentation collaborator's chart feed consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnarSeries {
    pub entity_id: String,
    pub metric_type: MetricType,
    pub timestamps: Vec<i64>,
    /// Raw values, or bucket means for aggregated series
    pub values: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mins: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxs: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_counts: Option<Vec<u64>>,
}

impl ColumnarSeries {
    /// Pivot a run of rows (one entity, ascending time) into columns.
    pub fn from_rows(entity_id: &str, metric: MetricType, rows: &[ExportRow]) -> Self {
        let mut series = Self {
            entity_id: entity_id.to_string(),
            metric_type: metric,
            timestamps: Vec::with_capacity(rows.len()),
            values: Vec::with_capacity(rows.len()),
            mins: None,
            maxs: None,
            sample_counts: None,
        };

        for row in rows {
            if let Some(ts) = row.timestamp {
                series.timestamps.push(ts);
                series.values.push(row.value.unwrap_or(f64::NAN));
            } else if let Some(start) = row.bucket_start {
                series.timestamps.push(start);
                series.values.push(row.mean.unwrap_or(f64::NAN));
                series.mins.get_or_insert_with(Vec::new).push(row.min.unwrap_or(f64::NAN));
                series.maxs.get_or_insert_with(Vec::new).push(row.max.unwrap_or(f64::NAN));
                series
                    .sample_counts
                    .get_or_insert_with(Vec::new)
                    .push(row.sample_count.unwrap_or(0));
            }
        }
        series
    }
}

enum StreamSource {
    Raw {
        store: Arc<MetricStore>,
        cursor: Option<i64>,
        batch_size: usize,
    },
    Aggregated {
        aggregator: Arc<Aggregator>,
        granularity: Granularity,
    },
}

/// Lazy, restartable row sequence over one metric for a set of entities.
///
/// Entities are drained in order; for raw exports each `next()` beyond the
/// buffered batch pulls at most one batch from the store, so an aborted
/// consumer stops the scan within one batch.
pub struct RowStream {
    source: StreamSource,
    metric: MetricType,
    from: i64,
    to: i64,
    entities: VecDeque<String>,
    current: Option<String>,
    buffer: VecDeque<ExportRow>,
}

impl RowStream {
    pub fn raw(
        store: Arc<MetricStore>,
        metric: MetricType,
        from: i64,
        to: i64,
        entities: Vec<String>,
    ) -> Self {
        Self {
            source: StreamSource::Raw {
                store,
                cursor: None,
                batch_size: DEFAULT_BATCH_SIZE,
            },
            metric,
            from,
            to,
            entities: entities.into(),
            current: None,
            buffer: VecDeque::new(),
        }
    }

    pub fn aggregated(
        aggregator: Arc<Aggregator>,
        metric: MetricType,
        from: i64,
        to: i64,
        granularity: Granularity,
        entities: Vec<String>,
    ) -> Self {
        Self {
            source: StreamSource::Aggregated {
                aggregator,
                granularity,
            },
            metric,
            from,
            to,
            entities: entities.into(),
            current: None,
            buffer: VecDeque::new(),
        }
    }

    pub fn shape(&self) -> ExportShape {
        match self.source {
            StreamSource::Raw { .. } => ExportShape::Raw,
            StreamSource::Aggregated { .. } => ExportShape::Aggregated,
        }
    }

    fn refill(&mut self) -> bool {
        loop {
            if self.current.is_none() {
                match self.entities.pop_front() {
                    Some(entity) => {
                        self.current = Some(entity);
                        if let StreamSource::Raw { cursor, .. } = &mut self.source {
                            *cursor = None;
                        }
                    }
                    None => return false,
                }
            }

            let entity = self
                .current
                .clone()
                .unwrap_or_default();

            match &mut self.source {
                StreamSource::Raw {
                    store,
                    cursor,
                    batch_size,
                } => {
                    let chunk = store.range_chunk(
                        &entity,
                        self.metric,
                        self.from,
                        self.to,
                        *cursor,
                        *batch_size,
                    );
                    if chunk.is_empty() {
                        self.current = None;
                        continue;
                    }
                    *cursor = chunk.last().map(|s| s.timestamp);
                    let exhausted = chunk.len() < *batch_size;
                    for sample in &chunk {
                        self.buffer.push_back(ExportRow::raw(
                            &entity,
                            self.metric,
                            sample.timestamp,
                            sample.value,
                        ));
                    }
                    if exhausted {
                        self.current = None;
                    }
                    return true;
                }
                StreamSource::Aggregated {
                    aggregator,
                    granularity,
                } => {
                    let buckets =
                        aggregator.aggregate(&entity, self.metric, self.from, self.to, *granularity);
                    self.current = None;
                    if buckets.is_empty() {
                        continue;
                    }
                    for bucket in buckets.iter() {
                        self.buffer.push_back(ExportRow::aggregated(bucket));
                    }
                    return true;
                }
            }
        }
    }
}

impl Iterator for RowStream {
    type Item = ExportRow;

    fn next(&mut self) -> Option<ExportRow> {
        if self.buffer.is_empty() && !self.refill() {
            return None;
        }
        self.buffer.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::BucketCache;
    use crate::models::Sample;

    fn seeded_store() -> Arc<MetricStore> {
        let store = Arc::new(MetricStore::new());
        for entity in ["n1", "n2"] {
            for ts in (0..1200).step_by(60) {
                store.append(&Sample::new(entity, MetricType::CpuPercent, ts, ts as f64));
            }
        }
        store
    }

    #[test]
    fn test_raw_stream_yields_all_rows_in_order() {
        let store = seeded_store();
        let stream = RowStream::raw(
            store,
            MetricType::CpuPercent,
            0,
            1200,
            vec!["n1".to_string(), "n2".to_string()],
        );
        let rows: Vec<ExportRow> = stream.collect();
        assert_eq!(rows.len(), 40);
        assert_eq!(rows[0].entity_id, "n1");
        assert_eq!(rows[20].entity_id, "n2");
        // Ascending within each entity
        let n1_ts: Vec<i64> = rows[..20].iter().map(|r| r.timestamp.unwrap()).collect();
        assert!(n1_ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_raw_stream_batches_lazily() {
        let store = seeded_store();
        let mut stream = RowStream::raw(
            store,
            MetricType::CpuPercent,
            0,
            1200,
            vec!["n1".to_string()],
        );
        if let StreamSource::Raw { batch_size, .. } = &mut stream.source {
            *batch_size = 4;
        }

        // Pull a handful of rows, then abandon the stream; only the
        // consumed batches were ever fetched.
        assert!(stream.next().is_some());
        assert_eq!(stream.buffer.len(), 3);
        drop(stream);
    }

    #[test]
    fn test_aggregated_stream_rows() {
        let store = seeded_store();
        let aggregator = Arc::new(Aggregator::new(store, Arc::new(BucketCache::new())));
        let stream = RowStream::aggregated(
            aggregator,
            MetricType::CpuPercent,
            0,
            1200,
            Granularity::FiveMinutes,
            vec!["n1".to_string()],
        );
        let rows: Vec<ExportRow> = stream.collect();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.bucket_start.is_some()));
        assert_eq!(rows[0].sample_count, Some(5));
    }

    #[test]
    fn test_csv_and_json_rows_agree() {
        let row = ExportRow::raw("n1", MetricType::CpuPercent, 60, 12.5);
        assert_eq!(row.to_csv_line(), "n1,cpu_percent,60,12.5");

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["entity_id"], "n1");
        assert_eq!(json["timestamp"], 60);
        // Aggregated-only columns are absent from raw rows
        assert!(json.get("bucket_start").is_none());
        assert!(json.get("mean").is_none());
    }

    #[test]
    fn test_csv_header_matches_shape() {
        assert!(ExportRow::csv_header(ExportShape::Raw).starts_with("entity_id,metric_type"));
        assert!(ExportRow::csv_header(ExportShape::Aggregated).contains("sample_count"));
    }

    #[test]
    fn test_export_deterministic_across_runs() {
        let store = seeded_store();
        let entities = vec!["n1".to_string(), "n2".to_string()];
        let collect = |store: &Arc<MetricStore>| -> Vec<String> {
            RowStream::raw(store.clone(), MetricType::CpuPercent, 0, 1200, entities.clone())
                .map(|r| r.to_csv_line())
                .collect()
        };
        assert_eq!(collect(&store), collect(&store));
    }

    #[test]
    fn test_columnar_pivot() {
        let store = seeded_store();
        let aggregator = Arc::new(Aggregator::new(store, Arc::new(BucketCache::new())));
        let rows: Vec<ExportRow> = RowStream::aggregated(
            aggregator,
            MetricType::CpuPercent,
            0,
            1200,
            Granularity::FiveMinutes,
            vec!["n1".to_string()],
        )
        .collect();

        let series = ColumnarSeries::from_rows("n1", MetricType::CpuPercent, &rows);
        assert_eq!(series.timestamps, vec![0, 300, 600, 900]);
        assert_eq!(series.values.len(), 4);
        assert_eq!(series.sample_counts.as_ref().unwrap().len(), 4);
    }
}
