//! Core data model for the cluster metrics engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of addressable entity being measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Node,
    Service,
}

/// Reference to a monitored entity. Entities are owned by the orchestration
/// layer; this core only references them by id as supplied by samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl EntityRef {
    pub fn node(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: EntityKind::Node,
            labels: BTreeMap::new(),
        }
    }

    pub fn service(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: EntityKind::Service,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// True when every provided label matches this entity exactly.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|have| have == v).unwrap_or(false))
    }
}

/// Supported measurement types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuPercent,
    MemoryPercent,
    MemoryBytes,
    NetworkRx,
    NetworkTx,
    DiskPercent,
    HealthScore,
}

impl MetricType {
    /// All supported metric types, in fan-out order for per-entity readings.
    pub const ALL: [MetricType; 7] = [
        MetricType::CpuPercent,
        MetricType::MemoryPercent,
        MetricType::MemoryBytes,
        MetricType::NetworkRx,
        MetricType::NetworkTx,
        MetricType::DiskPercent,
        MetricType::HealthScore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::CpuPercent => "cpu_percent",
            MetricType::MemoryPercent => "memory_percent",
            MetricType::MemoryBytes => "memory_bytes",
            MetricType::NetworkRx => "network_rx",
            MetricType::NetworkTx => "network_tx",
            MetricType::DiskPercent => "disk_percent",
            MetricType::HealthScore => "health_score",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Error for unrecognized metric type names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric type: {0}")]
pub struct UnknownMetric(pub String);

/// One raw measurement. The (entity_id, metric_type, timestamp) triple is
/// unique; a later ingest of the same triple overwrites the stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub entity_id: String,
    pub metric_type: MetricType,
    /// UTC seconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(
        entity_id: impl Into<String>,
        metric_type: MetricType,
        timestamp: i64,
        value: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_type,
            timestamp,
            value,
        }
    }
}

/// One pull result from the sampling collaborator: a point-in-time reading
/// carrying one value per supported metric for a single entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub entity_id: String,
    /// UTC seconds since the Unix epoch
    pub timestamp: i64,
    pub values: Vec<(MetricType, f64)>,
}

/// Aggregation interval. Bucket starts are aligned to a multiple of the
/// granularity from the Unix epoch, so re-aggregation is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    FiveMinutes,
    OneHour,
    SixHours,
    OneDay,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::FiveMinutes,
        Granularity::OneHour,
        Granularity::SixHours,
        Granularity::OneDay,
    ];

    /// Bucket width in seconds
    pub fn secs(&self) -> i64 {
        match self {
            Granularity::FiveMinutes => 300,
            Granularity::OneHour => 3600,
            Granularity::SixHours => 6 * 3600,
            Granularity::OneDay => 24 * 3600,
        }
    }

    /// Align a timestamp down to the start of its bucket.
    pub fn align(&self, timestamp: i64) -> i64 {
        let secs = self.secs();
        timestamp.div_euclid(secs) * secs
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::FiveMinutes => "5m",
            Granularity::OneHour => "1h",
            Granularity::SixHours => "6h",
            Granularity::OneDay => "1d",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .iter()
            .copied()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| UnknownGranularity(s.to_string()))
    }
}

/// Error for unrecognized granularity names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown granularity: {0}")]
pub struct UnknownGranularity(pub String);

/// Time-aligned statistical summary of samples at a given granularity.
/// Derived from raw samples, never the source of truth; buckets with zero
/// samples are omitted rather than emitted with null statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub entity_id: String,
    pub metric_type: MetricType,
    pub bucket_start: i64,
    pub granularity: Granularity,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sample_count: u64,
}

/// Direction of a fitted trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Rising => f.write_str("rising"),
            TrendDirection::Falling => f.write_str("falling"),
            TrendDirection::Stable => f.write_str("stable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_type_round_trip() {
        for metric in MetricType::ALL {
            let parsed: MetricType = metric.as_str().parse().unwrap();
            assert_eq!(parsed, metric);
        }
    }

    #[test]
    fn test_metric_type_unknown() {
        let err = "gpu_percent".parse::<MetricType>().unwrap_err();
        assert_eq!(err.0, "gpu_percent");
    }

    #[test]
    fn test_granularity_round_trip() {
        for gran in Granularity::ALL {
            let parsed: Granularity = gran.as_str().parse().unwrap();
            assert_eq!(parsed, gran);
        }
    }

    #[test]
    fn test_granularity_align() {
        let gran = Granularity::FiveMinutes;
        assert_eq!(gran.align(0), 0);
        assert_eq!(gran.align(299), 0);
        assert_eq!(gran.align(300), 300);
        assert_eq!(gran.align(301), 300);
        // Alignment rounds toward negative infinity for pre-epoch times
        assert_eq!(gran.align(-1), -300);
    }

    #[test]
    fn test_granularity_align_deterministic() {
        let ts = 1_700_000_123;
        for gran in Granularity::ALL {
            let a = gran.align(ts);
            assert_eq!(a % gran.secs(), 0);
            assert!(a <= ts && ts < a + gran.secs());
            assert_eq!(gran.align(ts), a);
        }
    }

    #[test]
    fn test_entity_label_matching() {
        let entity = EntityRef::service("web-1")
            .with_label("role", "frontend")
            .with_label("stack", "shop");

        let mut selector = BTreeMap::new();
        selector.insert("role".to_string(), "frontend".to_string());
        assert!(entity.matches_labels(&selector));

        selector.insert("stack".to_string(), "billing".to_string());
        assert!(!entity.matches_labels(&selector));

        // Empty selector matches everything
        assert!(entity.matches_labels(&BTreeMap::new()));
    }
}
