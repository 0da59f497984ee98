//! Core engine for the cluster metrics dashboard
//!
//! This crate provides:
//! - Validated sample ingest with idempotent writes
//! - An in-memory time-series store with snapshot persistence
//! - Deterministic bucketed aggregation with result caching
//! - Linear trend fitting, anomaly flagging, and bounded forecasts
//! - A query service for raw, aggregated, and predicted reads
//! - Background sampling and retention compaction loops
//! - Health checks and observability

pub mod aggregate;
pub mod config;
pub mod error;
pub mod export;
pub mod health;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod trend;

pub use config::CoreConfig;
pub use error::{AnalyzeError, IngestError, IngestOutcome, QueryError, Unavailable};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CoreMetrics, StructuredLogger};
