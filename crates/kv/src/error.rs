use thiserror::Error;

/// Store-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// Key absent from the bucket (or the bucket was never written).
    #[error("key not found")]
    NotFound,
    /// Backend-specific failure surfaced through the contract.
    #[error("backend error: {0}")]
    Backend(String),
}
