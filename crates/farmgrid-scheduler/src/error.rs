//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid node identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid frame range: {first}..={last}")]
    InvalidRange { first: i64, last: i64 },

    #[error("file reference has no path identifier: {0:?}")]
    InvalidFileRef(String),

    #[error("store error: {0}")]
    Store(#[from] farmgrid_store::StoreError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
