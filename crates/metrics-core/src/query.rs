//! Query service: the read path for the presentation collaborator
//!
//! Validates requests, resolves entity selectors through the registry,
//! applies viewer-scope filtering, and dispatches to the raw, aggregated,
//! or predicted read path. Heavy scans run on the blocking pool under a
//! deadline so one slow query cannot wedge the runtime.

use crate::aggregate::Aggregator;
use crate::error::QueryError;
use crate::export::RowStream;
use crate::models::{Bucket, Granularity, MetricType, TrendDirection};
use crate::observability::{CoreMetrics, StructuredLogger};
use crate::registry::EntityRegistry;
use crate::store::MetricStore;
use crate::trend::{TrendAnalyzer, DEFAULT_LOOKBACK_BUCKETS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default cap on raw rows a single query may return
pub const DEFAULT_RAW_ROW_CAP: u64 = 10_000;

/// Default per-query deadline
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

/// Decides which entities a viewer-scope token may read. The daemon wires
/// a real implementation; `AllowAll` suits single-tenant deployments and
/// tests.
pub trait ScopeAuthorizer: Send + Sync {
    fn authorized(&self, scope_token: Option<&str>, entity_id: &str) -> bool;
}

/// Grants every token (including none) access to every entity
pub struct AllowAll;

impl ScopeAuthorizer for AllowAll {
    fn authorized(&self, _scope_token: Option<&str>, _entity_id: &str) -> bool {
        true
    }
}

/// How the caller names the entities of interest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySelector {
    /// Explicit entity ids, returned in the order given
    Ids(Vec<String>),
    /// All registered entities whose labels match every pair exactly
    Labels(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Raw,
    Aggregated,
    Predicted,
}

fn default_granularity() -> Granularity {
    Granularity::FiveMinutes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub selector: EntitySelector,
    pub metric_type: MetricType,
    /// Inclusive range start, UTC seconds
    pub from: i64,
    /// Exclusive range end, UTC seconds
    pub to: i64,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    pub mode: QueryMode,
    /// Viewer-scope token; entities it does not authorize are silently
    /// dropped from the result
    #[serde(default)]
    pub scope_token: Option<String>,
    /// Predicted mode only: also extrapolate the fitted line to this
    /// timestamp
    #[serde(default)]
    pub forecast_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPoint {
    pub timestamp: i64,
    pub value: f64,
}

/// Trend fields exposed to callers. Forecast fields are present only when
/// the request asked for one and it was inside the extrapolation limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendOutput {
    pub direction: TrendDirection,
    pub slope: f64,
    pub confidence: f64,
    pub low_confidence: bool,
    pub anomaly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_value: Option<f64>,
}

/// Per-entity payload, tagged by the read path that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesData {
    Raw {
        points: Vec<RawPoint>,
    },
    Aggregated {
        buckets: Vec<Bucket>,
    },
    Predicted {
        buckets: Vec<Bucket>,
        /// Absent when analysis failed for this entity; see
        /// `analysis_error`
        #[serde(skip_serializing_if = "Option::is_none")]
        trend: Option<TrendOutput>,
        #[serde(skip_serializing_if = "Option::is_none")]
        analysis_error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySeries {
    pub entity_id: String,
    #[serde(flatten)]
    pub data: SeriesData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub mode: QueryMode,
    pub metric_type: MetricType,
    pub from: i64,
    pub to: i64,
    pub granularity: Granularity,
    pub series: Vec<EntitySeries>,
}

/// Read-path facade over store, aggregator, registry, and trend analyzer
pub struct QueryService {
    store: Arc<MetricStore>,
    aggregator: Arc<Aggregator>,
    registry: Arc<EntityRegistry>,
    analyzer: TrendAnalyzer,
    authorizer: Arc<dyn ScopeAuthorizer>,
    raw_row_cap: u64,
    timeout: Duration,
    metrics: Option<CoreMetrics>,
    logger: StructuredLogger,
}

impl QueryService {
    pub fn new(
        store: Arc<MetricStore>,
        aggregator: Arc<Aggregator>,
        registry: Arc<EntityRegistry>,
        analyzer: TrendAnalyzer,
        authorizer: Arc<dyn ScopeAuthorizer>,
    ) -> Self {
        Self {
            store,
            aggregator,
            registry,
            analyzer,
            authorizer,
            raw_row_cap: DEFAULT_RAW_ROW_CAP,
            timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            metrics: None,
            logger: StructuredLogger::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: CoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_raw_row_cap(mut self, cap: u64) -> Self {
        self.raw_row_cap = cap;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a query under the service deadline. The scan itself is
    /// synchronous, so it moves to the blocking pool.
    pub async fn query(self: &Arc<Self>, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        let service = self.clone();
        let timeout_secs = self.timeout.as_secs();
        let handle =
            tokio::task::spawn_blocking(move || service.execute(&request));

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(QueryError::Store(join_err.to_string())),
            Err(_) => {
                warn!(timeout_secs, "Query exceeded deadline");
                Err(QueryError::Timeout { timeout_secs })
            }
        }
    }

    /// Synchronous query body; also used directly by tests.
    pub fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        if request.from >= request.to {
            return Err(QueryError::invalid_range("from must be earlier than to"));
        }

        let entities = self.resolve_entities(request)?;
        debug!(
            metric = %request.metric_type,
            mode = ?request.mode,
            entities = entities.len(),
            from = request.from,
            to = request.to,
            "Executing query"
        );

        let series = match request.mode {
            QueryMode::Raw => self.raw_series(request, &entities)?,
            QueryMode::Aggregated => self.aggregated_series(request, &entities),
            QueryMode::Predicted => self.predicted_series(request, &entities),
        };

        Ok(QueryResponse {
            mode: request.mode,
            metric_type: request.metric_type,
            from: request.from,
            to: request.to,
            granularity: request.granularity,
            series,
        })
    }

    /// Lazy row stream for exports. Unlike `query`, no row cap applies:
    /// the stream never materializes the full result.
    pub fn export_rows(
        &self,
        request: &QueryRequest,
    ) -> Result<RowStream, QueryError> {
        if request.from >= request.to {
            return Err(QueryError::invalid_range("from must be earlier than to"));
        }
        let entities = self.resolve_entities(request)?;

        let stream = match request.mode {
            QueryMode::Raw => RowStream::raw(
                self.store.clone(),
                request.metric_type,
                request.from,
                request.to,
                entities,
            ),
            _ => RowStream::aggregated(
                self.aggregator.clone(),
                request.metric_type,
                request.from,
                request.to,
                request.granularity,
                entities,
            ),
        };
        Ok(stream)
    }

    /// Resolve the selector to a scope-filtered entity id list. A label
    /// selector matching no registered entity is `NotFound`; a selector
    /// that resolves but is entirely filtered by scope yields an empty
    /// list, indistinguishable from entities that do not exist.
    fn resolve_entities(&self, request: &QueryRequest) -> Result<Vec<String>, QueryError> {
        let resolved = match &request.selector {
            EntitySelector::Ids(ids) => ids.clone(),
            EntitySelector::Labels(selector) => {
                let ids = self.registry.ids_matching_labels(selector);
                if ids.is_empty() {
                    return Err(QueryError::NotFound(format!(
                        "no registered entities match labels {:?}",
                        selector
                    )));
                }
                ids
            }
        };

        let token = request.scope_token.as_deref();
        Ok(resolved
            .into_iter()
            .filter(|id| self.authorizer.authorized(token, id))
            .collect())
    }

    fn raw_series(
        &self,
        request: &QueryRequest,
        entities: &[String],
    ) -> Result<Vec<EntitySeries>, QueryError> {
        // Reject oversized raw results before materializing anything
        let total: u64 = entities
            .iter()
            .map(|e| {
                self.store
                    .count_range(e, request.metric_type, request.from, request.to) as u64
            })
            .sum();
        if total > self.raw_row_cap {
            return Err(QueryError::invalid_range(format!(
                "raw result would be {} rows, over the {} row cap; use aggregated mode or a narrower range",
                total, self.raw_row_cap
            )));
        }

        Ok(entities
            .iter()
            .map(|entity_id| {
                let points = self
                    .store
                    .range(entity_id, request.metric_type, request.from, request.to)
                    .into_iter()
                    .map(|s| RawPoint {
                        timestamp: s.timestamp,
                        value: s.value,
                    })
                    .collect();
                EntitySeries {
                    entity_id: entity_id.clone(),
                    data: SeriesData::Raw { points },
                }
            })
            .collect())
    }

    fn aggregated_series(&self, request: &QueryRequest, entities: &[String]) -> Vec<EntitySeries> {
        entities
            .iter()
            .map(|entity_id| {
                let buckets = self.aggregator.aggregate(
                    entity_id,
                    request.metric_type,
                    request.from,
                    request.to,
                    request.granularity,
                );
                EntitySeries {
                    entity_id: entity_id.clone(),
                    data: SeriesData::Aggregated {
                        buckets: buckets.as_ref().clone(),
                    },
                }
            })
            .collect()
    }

    /// Aggregate, then fit the trailing lookback window per entity. A fit
    /// failure (too little data, forecast out of range) is carried in
    /// that entity's payload so one sparse series does not fail the
    /// request for the rest.
    fn predicted_series(&self, request: &QueryRequest, entities: &[String]) -> Vec<EntitySeries> {
        entities
            .iter()
            .map(|entity_id| {
                let buckets = self.aggregator.aggregate(
                    entity_id,
                    request.metric_type,
                    request.from,
                    request.to,
                    request.granularity,
                );

                let (trend, analysis_error) = match self.analyzer.analyze(&buckets) {
                    Ok(result) => {
                        if result.anomaly {
                            self.logger.log_anomaly(
                                entity_id,
                                request.metric_type.as_str(),
                                result.slope,
                                result.confidence,
                            );
                            if let Some(metrics) = &self.metrics {
                                metrics.inc_anomalies_flagged();
                            }
                        }

                        let (forecast_at, forecast_value) = match request.forecast_at {
                            Some(t) => match result.forecast_value_at(t) {
                                Ok(v) => (Some(t), Some(v)),
                                Err(e) => {
                                    return EntitySeries {
                                        entity_id: entity_id.clone(),
                                        data: SeriesData::Predicted {
                                            buckets: buckets.as_ref().clone(),
                                            trend: None,
                                            analysis_error: Some(e.to_string()),
                                        },
                                    }
                                }
                            },
                            None => (None, None),
                        };
                        (
                            Some(TrendOutput {
                                direction: result.direction,
                                slope: result.slope,
                                confidence: result.confidence,
                                low_confidence: result.low_confidence,
                                anomaly: result.anomaly,
                                forecast_at,
                                forecast_value,
                            }),
                            None,
                        )
                    }
                    Err(e) => (None, Some(e.to_string())),
                };

                EntitySeries {
                    entity_id: entity_id.clone(),
                    data: SeriesData::Predicted {
                        buckets: buckets.as_ref().clone(),
                        trend,
                        analysis_error,
                    },
                }
            })
            .collect()
    }
}

/// Convenience for predicted-mode charts: the default window is the
/// analyzer's lookback at the requested granularity, ending now.
pub fn default_predicted_range(granularity: Granularity, now: i64) -> (i64, i64) {
    let secs = granularity.secs();
    let current = granularity.align(now);
    (
        current - secs * (DEFAULT_LOOKBACK_BUCKETS as i64 - 1),
        current + secs,
    )
}
