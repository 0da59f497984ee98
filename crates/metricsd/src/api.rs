//! HTTP API: queries, exports, entity registration, health, metrics

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_core::export::ExportRow;
use metrics_core::models::{EntityRef, Granularity, MetricType};
use metrics_core::query::{EntitySelector, QueryMode, QueryRequest, QueryService, ScopeAuthorizer};
use metrics_core::registry::EntityRegistry;
use metrics_core::{CoreMetrics, HealthRegistry, QueryError, StructuredLogger};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

/// Header carrying the viewer-scope token
pub const SCOPE_HEADER: &str = "x-viewer-scope";

/// Scope authorization from a configured token list. With no tokens
/// configured every request is authorized; otherwise the token must be in
/// the list (entity-level scoping is left to deployments that need it).
pub struct TokenScope {
    tokens: Option<HashSet<String>>,
}

impl TokenScope {
    pub fn new(tokens: Option<HashSet<String>>) -> Self {
        Self { tokens }
    }

    pub fn from_csv(csv: Option<&str>) -> Self {
        let tokens = csv.map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        });
        Self { tokens }
    }
}

impl ScopeAuthorizer for TokenScope {
    fn authorized(&self, scope_token: Option<&str>, _entity_id: &str) -> bool {
        match &self.tokens {
            None => true,
            Some(tokens) => scope_token.map(|t| tokens.contains(t)).unwrap_or(false),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: CoreMetrics,
    pub logger: StructuredLogger,
    pub query_service: Arc<QueryService>,
    pub registry: Arc<EntityRegistry>,
}

fn error_response(err: QueryError) -> Response {
    let status = match &err {
        QueryError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
        QueryError::NotFound(_) => StatusCode::NOT_FOUND,
        QueryError::Timeout { .. } | QueryError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::json!({
        "error": err.to_string(),
        "retryable": err.is_retryable(),
    });
    (status, Json(body)).into_response()
}

fn scope_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SCOPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// POST /api/query
///
/// The scope token comes from the `X-Viewer-Scope` header when present,
/// overriding any token in the body.
async fn query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut request): Json<QueryRequest>,
) -> Response {
    if let Some(token) = scope_from_headers(&headers) {
        request.scope_token = Some(token);
    }

    let start = Instant::now();
    match state.query_service.query(request).await {
        Ok(response) => {
            state
                .metrics
                .observe_query_latency(start.elapsed().as_secs_f64());
            Json(response).into_response()
        }
        Err(err) => {
            state.metrics.inc_query_errors();
            state.logger.log_query_rejected(&err.to_string());
            error_response(err)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    /// Comma-separated entity ids
    pub entities: String,
    pub metric_type: MetricType,
    pub from: i64,
    pub to: i64,
    #[serde(default = "default_export_mode")]
    pub mode: QueryMode,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_format")]
    pub format: ExportFormat,
}

fn default_export_mode() -> QueryMode {
    QueryMode::Raw
}

fn default_granularity() -> Granularity {
    Granularity::FiveMinutes
}

fn default_format() -> ExportFormat {
    ExportFormat::Csv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    /// One JSON object per line
    Json,
}

/// GET /api/export
///
/// Streams rows as they are pulled from the store: a multi-day export
/// never materializes in daemon memory, and a client that disconnects
/// stops the scan within one batch.
async fn export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ExportParams>,
) -> Response {
    let request = QueryRequest {
        selector: EntitySelector::Ids(
            params
                .entities
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        metric_type: params.metric_type,
        from: params.from,
        to: params.to,
        granularity: params.granularity,
        mode: params.mode,
        scope_token: scope_from_headers(&headers),
        forecast_at: None,
    };

    let rows = match state.query_service.export_rows(&request) {
        Ok(rows) => rows,
        Err(err) => {
            state.metrics.inc_query_errors();
            return error_response(err);
        }
    };

    let shape = rows.shape();
    let format = params.format;
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, std::io::Error>>(64);

    // The row iterator does blocking store reads, so it runs on the
    // blocking pool and feeds the response body through a channel. A
    // dropped body closes the channel, ending the scan.
    tokio::task::spawn_blocking(move || {
        if format == ExportFormat::Csv {
            let header = format!("{}\n", ExportRow::csv_header(shape));
            if tx.blocking_send(Ok(header)).is_err() {
                return;
            }
        }
        for row in rows {
            let line = match format {
                ExportFormat::Csv => format!("{}\n", row.to_csv_line()),
                ExportFormat::Json => match serde_json::to_string(&row) {
                    Ok(json) => format!("{}\n", json),
                    Err(_) => continue,
                },
            };
            if tx.blocking_send(Ok(line)).is_err() {
                return;
            }
        }
    });

    let content_type = match format {
        ExportFormat::Csv => "text/csv; charset=utf-8",
        ExportFormat::Json => "application/x-ndjson",
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn list_entities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn register_entity(
    State(state): State<Arc<AppState>>,
    Json(entity): Json<EntityRef>,
) -> impl IntoResponse {
    state.registry.register(entity);
    state
        .metrics
        .set_entities_registered(state.registry.len() as i64);
    StatusCode::CREATED
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/query", post(query))
        .route("/api/export", get(export))
        .route("/api/entities", get(list_entities).post(register_entity))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_scope_unconfigured_allows_all() {
        let scope = TokenScope::from_csv(None);
        assert!(scope.authorized(None, "n1"));
        assert!(scope.authorized(Some("anything"), "n1"));
    }

    #[test]
    fn test_token_scope_enforces_list() {
        let scope = TokenScope::from_csv(Some("ops, dashboards"));
        assert!(scope.authorized(Some("ops"), "n1"));
        assert!(scope.authorized(Some("dashboards"), "n1"));
        assert!(!scope.authorized(Some("intruder"), "n1"));
        assert!(!scope.authorized(None, "n1"));
    }
}
