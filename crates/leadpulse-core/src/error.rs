use thiserror::Error;

/// Errors surfaced by the aggregation engine.
///
/// Validation variants are raised before any query is dispatched. Execution
/// variants carry the fan-out slot that failed first.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("period spans {days} days (max {max})")]
    SpanTooLong { days: i64, max: i64 },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("query {slot} failed: {source}")]
    Query {
        slot: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("query {slot} timed out after {seconds}s")]
    Timeout { slot: String, seconds: u64 },

    #[error("aggregate task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// `true` for errors caused by the request itself rather than by the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidPeriod(_)
                | EngineError::SpanTooLong { .. }
                | EngineError::InvalidFilter(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
