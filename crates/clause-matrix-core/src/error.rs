//! Failure taxonomy for the analysis workflow.
//!
//! Only index unreachability and persistence failures are fatal system
//! errors. Data-quality problems degrade into low-confidence or placeholder
//! cells and never surface here.

use thiserror::Error;

use crate::models::AnalysisOutcome;

/// Request-level failure returned by the orchestrator.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Empty or oversized prompt.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Query processing produced no usable field.
    #[error("no fields could be derived from the prompt: {reason}")]
    NoFieldsDerived { reason: String },

    /// The chunk index could not be reached.
    #[error("retrieval failed: {0}")]
    RetrievalFailure(#[source] StoreError),

    /// The result store rejected the write. The computed outcome is kept so
    /// the caller still receives it.
    #[error("failed to persist results: {source}")]
    PersistenceFailure {
        #[source]
        source: StoreError,
        outcome: Box<AnalysisOutcome>,
    },

    #[error("caller identity is missing")]
    Unauthenticated,

    /// The request-scoped cancellation signal fired.
    #[error("analysis cancelled")]
    Cancelled,

    /// The overall time budget elapsed.
    #[error("analysis exceeded its time budget of {secs}s")]
    Timeout { secs: u64 },
}

impl AnalysisError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        AnalysisError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Machine-readable code used by the HTTP error contract.
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::InvalidRequest { .. } => "invalid_request",
            AnalysisError::NoFieldsDerived { .. } => "no_fields_derived",
            AnalysisError::RetrievalFailure(_) => "retrieval_failure",
            AnalysisError::PersistenceFailure { .. } => "persistence_failure",
            AnalysisError::Unauthenticated => "unauthenticated",
            AnalysisError::Cancelled => "cancelled",
            AnalysisError::Timeout { .. } => "timeout",
        }
    }

    /// The outcome computed before the failure, if any.
    pub fn partial_outcome(&self) -> Option<&AnalysisOutcome> {
        match self {
            AnalysisError::PersistenceFailure { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// Failure reported by a Chunk Store or Result Store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Failure of a model or embedding capability call.
///
/// At the extraction stage this is the per-cell failure kind: it is
/// recovered locally into a "Not specified" cell.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability disabled: {0}")]
    Disabled(String),

    #[error("capability call failed: {0}")]
    Call(String),

    #[error("capability call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("malformed capability response: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AnalysisError::invalid_request("x").code(), "invalid_request");
        assert_eq!(AnalysisError::Unauthenticated.code(), "unauthenticated");
        assert_eq!(
            AnalysisError::RetrievalFailure(StoreError::Unavailable("down".into())).code(),
            "retrieval_failure"
        );
        assert_eq!(AnalysisError::Timeout { secs: 300 }.code(), "timeout");
    }

    #[test]
    fn display_includes_reason() {
        let err = AnalysisError::invalid_request("prompt must not be empty");
        assert_eq!(err.to_string(), "invalid request: prompt must not be empty");
        assert!(err.partial_outcome().is_none());
    }
}
