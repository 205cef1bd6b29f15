//! Error types for the keyed store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("no codec registered for: {0}")]
    UnsupportedType(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("timed out waiting for lock: {0}")]
    LockTimeout(String),
}

impl StoreError {
    /// Whether this error means "nothing there", which read paths treat as
    /// absent data rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::UnsupportedType(_))
    }
}
