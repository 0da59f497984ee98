//! Integration tests for the daemon API endpoints

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_core::aggregate::{Aggregator, BucketCache};
use metrics_core::health::{components, HealthRegistry};
use metrics_core::models::{EntityRef, MetricType, Sample};
use metrics_core::query::{AllowAll, QueryRequest, QueryService};
use metrics_core::registry::EntityRegistry;
use metrics_core::store::MetricStore;
use metrics_core::trend::TrendAnalyzer;
use metrics_core::CoreMetrics;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Clone)]
struct AppState {
    health_registry: HealthRegistry,
    query_service: Arc<QueryService>,
    registry: Arc<EntityRegistry>,
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
    encoder.encode(&metric_families, &mut buffer).unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    match state.query_service.query(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            let status = match &err {
                metrics_core::QueryError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
                metrics_core::QueryError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

async fn list_entities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/query", post(query))
        .route("/api/entities", get(list_entities))
        .with_state(state)
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let store = Arc::new(MetricStore::new());
    let aggregator = Arc::new(Aggregator::new(store.clone(), Arc::new(BucketCache::new())));
    let registry = Arc::new(EntityRegistry::new());

    registry.register(EntityRef::node("n1"));
    for ts in (0..3600).step_by(60) {
        store.append(&Sample::new("n1", MetricType::CpuPercent, ts, 50.0));
    }

    let query_service = Arc::new(QueryService::new(
        store,
        aggregator,
        registry.clone(),
        TrendAnalyzer::default(),
        Arc::new(AllowAll),
    ));

    let health_registry = HealthRegistry::new();
    health_registry.register(components::STORE).await;
    health_registry.register(components::QUERY).await;

    // Touch the global metrics so the exposition endpoint has content
    let _ = CoreMetrics::new();

    let state = Arc::new(AppState {
        health_registry,
        query_service,
        registry,
    });
    let router = create_test_router(state.clone());

    (router, state)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["store"].is_object());
}

#[tokio::test]
async fn test_healthz_degraded_is_still_operational() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::STORE, "snapshot lagging")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::STORE, "snapshot load failed")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_gate() {
    let (app, state) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_ready(true).await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("metricsd_samples_ingested_total") || !text.is_empty());
}

#[tokio::test]
async fn test_query_endpoint_aggregated() {
    let (app, _state) = setup_test_app().await;

    let request_body = serde_json::json!({
        "selector": {"ids": ["n1"]},
        "metric_type": "cpu_percent",
        "from": 0,
        "to": 3600,
        "granularity": "five_minutes",
        "mode": "aggregated"
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/query")
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["mode"], "aggregated");
    assert_eq!(result["series"][0]["entity_id"], "n1");
    assert_eq!(result["series"][0]["buckets"].as_array().unwrap().len(), 12);
}

#[tokio::test]
async fn test_query_endpoint_rejects_bad_range() {
    let (app, _state) = setup_test_app().await;

    let request_body = serde_json::json!({
        "selector": {"ids": ["n1"]},
        "metric_type": "cpu_percent",
        "from": 3600,
        "to": 0,
        "mode": "raw"
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/query")
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_entities_endpoint_lists_registered() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/entities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let entities: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(entities[0]["entity_id"], "n1");
    assert_eq!(entities[0]["kind"], "node");
}
