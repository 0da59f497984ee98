//! Error taxonomy for the metrics core
//!
//! Validation failures are terminal and logged, never retried here.
//! Sampling failures are isolated per entity. Analysis preconditions are
//! surfaced as typed results. Query failures name the violated constraint.

use thiserror::Error;

/// Outcome of a successful sample ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Sample stored for the first time
    Accepted,
    /// Sample key already existed; stored value was overwritten
    Deduplicated,
}

/// Validation failures for incoming samples
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("sample timestamp {timestamp} is more than {max_skew_secs}s in the future")]
    FutureTimestamp { timestamp: i64, max_skew_secs: i64 },

    #[error("sample value is not finite")]
    NonFiniteValue,
}

/// Trend analysis precondition failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyzeError {
    #[error("insufficient data: {have} buckets, need at least {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("forecast target {requested} is beyond the extrapolation limit {limit}")]
    ForecastOutOfRange { requested: i64, limit: i64 },
}

/// Query failures surfaced to the presentation collaborator.
///
/// There is deliberately no scope-denied variant: entities the viewer-scope
/// token does not authorize are silently filtered from the selector so their
/// existence is never leaked.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid range: {constraint}")]
    InvalidRange { constraint: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Retryable: the request exceeded its deadline.
    #[error("query timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Store-level failures are surfaced immediately to query callers
    /// (reads fail fast; retry with backoff happens only at the ingest
    /// and scheduler boundaries).
    #[error("store error: {0}")]
    Store(String),
}

impl QueryError {
    pub fn invalid_range(constraint: impl Into<String>) -> Self {
        QueryError::InvalidRange {
            constraint: constraint.into(),
        }
    }

    /// Whether the caller may safely retry the request as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Timeout { .. })
    }
}

/// Sampling collaborator failure for one entity. Does not abort the tick
/// for other entities.
#[derive(Debug, Clone, Error)]
#[error("sampling collaborator unavailable for {entity_id}: {reason}")]
pub struct Unavailable {
    pub entity_id: String,
    pub reason: String,
}

impl Unavailable {
    pub fn new(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }
}
