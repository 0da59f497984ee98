//! Tunable parameters for the core engine
//!
//! Every field has a default so an empty configuration source yields a
//! working engine. The daemon layers environment overrides on top.

use crate::models::Granularity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_sampling_interval_secs() -> u64 {
    30
}

fn default_compaction_interval_secs() -> u64 {
    3600
}

fn default_raw_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_granularities() -> Vec<Granularity> {
    Granularity::ALL.to_vec()
}

fn default_anomaly_std_devs() -> f64 {
    2.0
}

fn default_low_confidence_floor() -> f64 {
    0.3
}

fn default_forecast_horizon_factor() -> f64 {
    2.0
}

fn default_raw_row_cap() -> u64 {
    10_000
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_max_future_skew_secs() -> i64 {
    300
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Seconds between sampling ticks
    #[serde(default = "default_sampling_interval_secs")]
    pub sampling_interval_secs: u64,

    /// Seconds between retention compaction passes
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Raw samples older than this are summarized and deleted
    #[serde(default = "default_raw_retention_secs")]
    pub raw_retention_secs: u64,

    /// Granularities accepted by queries
    #[serde(default = "default_granularities")]
    pub granularities: Vec<Granularity>,

    /// Residual standard deviations before the latest bucket is anomalous
    #[serde(default = "default_anomaly_std_devs")]
    pub anomaly_std_devs: f64,

    /// R-squared below this is flagged low-confidence
    #[serde(default = "default_low_confidence_floor")]
    pub low_confidence_floor: f64,

    /// Forecasts may extend this many window-durations past the data
    #[serde(default = "default_forecast_horizon_factor")]
    pub forecast_horizon_factor: f64,

    /// Raw queries returning more rows than this are rejected
    #[serde(default = "default_raw_row_cap")]
    pub raw_row_cap: u64,

    /// Per-query deadline
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Tolerated clock skew for future-dated samples
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: i64,

    /// Where the store snapshot is written; `None` disables persistence
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Seconds between snapshot flushes
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sampling_interval_secs: default_sampling_interval_secs(),
            compaction_interval_secs: default_compaction_interval_secs(),
            raw_retention_secs: default_raw_retention_secs(),
            granularities: default_granularities(),
            anomaly_std_devs: default_anomaly_std_devs(),
            low_confidence_floor: default_low_confidence_floor(),
            forecast_horizon_factor: default_forecast_horizon_factor(),
            raw_row_cap: default_raw_row_cap(),
            query_timeout_secs: default_query_timeout_secs(),
            max_future_skew_secs: default_max_future_skew_secs(),
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

impl CoreConfig {
    pub fn trend_analyzer(&self) -> crate::trend::TrendAnalyzer {
        crate::trend::TrendAnalyzer {
            anomaly_std_devs: self.anomaly_std_devs,
            low_confidence_floor: self.low_confidence_floor,
            forecast_horizon_factor: self.forecast_horizon_factor,
            ..crate::trend::TrendAnalyzer::default()
        }
    }

    pub fn scheduler(&self) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            sampling_interval: std::time::Duration::from_secs(self.sampling_interval_secs),
            compaction_interval: std::time::Duration::from_secs(self.compaction_interval_secs),
            retention: std::time::Duration::from_secs(self.raw_retention_secs),
            ..crate::scheduler::SchedulerConfig::default()
        }
    }
}
