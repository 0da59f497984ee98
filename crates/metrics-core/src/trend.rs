//! Trend fitting and forward prediction over bucketed series
//!
//! Fits an ordinary least-squares line to bucket means against bucket
//! index, classifies the direction against a relative slope threshold,
//! reports R-squared as the confidence score, and flags the most recent
//! bucket as anomalous when it sits further from the fitted line than a
//! configured number of residual standard deviations. This is a simple,
//! explainable signal, not a learned model.

use crate::error::AnalyzeError;
use crate::models::{Bucket, Granularity, MetricType, TrendDirection};
use serde::{Deserialize, Serialize};

/// Default lookback window, in buckets at the requested granularity
pub const DEFAULT_LOOKBACK_BUCKETS: usize = 24;

/// Minimum buckets required for a fit
pub const MIN_BUCKETS_FOR_FIT: usize = 3;

/// Trend analyzer configuration. Thresholds are deliberately configurable
/// rather than load-bearing constants.
#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    /// Slope threshold for rising/falling, as a fraction of the series'
    /// value range per bucket (default 1%)
    pub direction_threshold: f64,
    /// Confidence below this floor is flagged low-confidence, never
    /// suppressed; callers decide whether to display it
    pub low_confidence_floor: f64,
    /// Residual standard deviations before the latest bucket is anomalous
    pub anomaly_std_devs: f64,
    /// Forecasts are allowed this many window-durations past the last
    /// observed bucket
    pub forecast_horizon_factor: f64,
    /// Number of trailing buckets fitted
    pub lookback: usize,
}

impl Default for TrendAnalyzer {
    fn default() -> Self {
        Self {
            direction_threshold: 0.01,
            low_confidence_floor: 0.3,
            anomaly_std_devs: 2.0,
            forecast_horizon_factor: 2.0,
            lookback: DEFAULT_LOOKBACK_BUCKETS,
        }
    }
}

/// Result of one trend fit. Ephemeral: computed on demand and never
/// persisted; callers may cache it with a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendResult {
    pub entity_id: String,
    pub metric_type: MetricType,
    pub direction: TrendDirection,
    /// Regression coefficient, in value units per bucket
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination of the fit, clamped to [0, 1]
    pub confidence: f64,
    pub low_confidence: bool,
    pub anomaly: bool,
    pub residual_std_dev: f64,
    first_bucket_start: i64,
    granularity: Granularity,
    bucket_count: usize,
    forecast_horizon_factor: f64,
}

impl TrendResult {
    /// Timestamp past which forecasts fail rather than extrapolating
    /// indefinitely.
    pub fn forecast_limit(&self) -> i64 {
        let window_secs = self.granularity.secs() * self.bucket_count as i64;
        let last_start = self.first_bucket_start
            + self.granularity.secs() * (self.bucket_count as i64 - 1);
        last_start + (self.forecast_horizon_factor * window_secs as f64) as i64
    }

    /// Linearly extrapolate the fitted line to a future timestamp.
    pub fn forecast_value_at(&self, t: i64) -> Result<f64, AnalyzeError> {
        let limit = self.forecast_limit();
        if t > limit {
            return Err(AnalyzeError::ForecastOutOfRange {
                requested: t,
                limit,
            });
        }
        let index = (t - self.first_bucket_start) as f64 / self.granularity.secs() as f64;
        Ok(self.intercept + self.slope * index)
    }
}

impl TrendAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit the trailing lookback window of a bucket sequence for one
    /// entity/metric series. The sequence must be ascending by
    /// `bucket_start` (as produced by the aggregator).
    pub fn analyze(&self, buckets: &[Bucket]) -> Result<TrendResult, AnalyzeError> {
        let window = if buckets.len() > self.lookback {
            &buckets[buckets.len() - self.lookback..]
        } else {
            buckets
        };

        let n = window.len();
        if n < MIN_BUCKETS_FOR_FIT {
            return Err(AnalyzeError::InsufficientData {
                have: n,
                need: MIN_BUCKETS_FOR_FIT,
            });
        }

        let means: Vec<f64> = window.iter().map(|b| b.mean).collect();
        let (slope, intercept) = ols_fit(&means);

        // Residual diagnostics for confidence and the anomaly flag
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        let mean_y = means.iter().sum::<f64>() / n as f64;
        for (i, y) in means.iter().enumerate() {
            let predicted = intercept + slope * i as f64;
            ss_res += (y - predicted).powi(2);
            ss_tot += (y - mean_y).powi(2);
        }

        let confidence = if ss_tot.abs() < f64::EPSILON {
            // Flat series: the fit is exact when residuals vanish
            if ss_res.abs() < f64::EPSILON {
                1.0
            } else {
                0.0
            }
        } else {
            (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
        };

        let residual_std_dev = (ss_res / (n as f64 - 2.0).max(1.0)).sqrt();

        let value_range = means.iter().cloned().fold(f64::MIN, f64::max)
            - means.iter().cloned().fold(f64::MAX, f64::min);
        let threshold = self.direction_threshold * value_range;
        let direction = if value_range < f64::EPSILON {
            TrendDirection::Stable
        } else if slope > threshold {
            TrendDirection::Rising
        } else if slope < -threshold {
            TrendDirection::Falling
        } else {
            TrendDirection::Stable
        };

        let last_index = (n - 1) as f64;
        let last_predicted = intercept + slope * last_index;
        let last_deviation = (means[n - 1] - last_predicted).abs();
        // Rounding noise on an exact fit must not read as an anomaly
        let noise_floor = f64::EPSILON * ss_tot.max(1.0);
        let anomaly = ss_res > noise_floor
            && last_deviation > self.anomaly_std_devs * residual_std_dev;

        let first = &window[0];
        Ok(TrendResult {
            entity_id: first.entity_id.clone(),
            metric_type: first.metric_type,
            direction,
            slope,
            intercept,
            confidence,
            low_confidence: confidence < self.low_confidence_floor,
            anomaly,
            residual_std_dev,
            first_bucket_start: first.bucket_start,
            granularity: first.granularity,
            bucket_count: n,
            forecast_horizon_factor: self.forecast_horizon_factor,
        })
    }
}

/// Least-squares slope and intercept of y against index 0..n
fn ols_fit(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;

    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return (0.0, sum_y / n);
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    (slope, intercept)
}
