//! Engine error taxonomy.
//!
//! One enum for the whole learning loop. Handlers map these onto HTTP
//! statuses; the retry wrapper in `generator` consults `is_retriable`.

use thiserror::Error;

use crate::domain::SessionStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Input fails schema or state-machine rule; surfaced to caller, not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Session event disallowed from the current state.
    #[error("invalid transition: cannot {event} a {from} session")]
    InvalidTransition {
        from: SessionStatus,
        event: &'static str,
    },

    /// Deadline elapsed on an external call.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// External generator returned malformed data; not retried, not persisted.
    #[error("generator returned invalid output: {0}")]
    GenerationInvalid(String),

    /// Unique constraint or optimistic lock lost.
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Other transient I/O.
    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Whether the generator retry budget may be spent on this failure.
    /// Schema violations are final; timeouts and transient I/O are not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Timeout { .. } | EngineError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriability_follows_the_taxonomy() {
        assert!(EngineError::Timeout { secs: 60 }.is_retriable());
        assert!(EngineError::Transient("conn reset".into()).is_retriable());
        assert!(!EngineError::GenerationInvalid("bad json".into()).is_retriable());
        assert!(!EngineError::Validation("empty answers".into()).is_retriable());
    }
}
