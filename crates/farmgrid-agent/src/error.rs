//! Agent error types.

use thiserror::Error;

/// Failure to exchange a batch with the coordinator. Always retried with
/// backoff by the node loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid coordinator URL {0:?}")]
    InvalidUrl(String),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("cannot build request: {0}")]
    Request(#[from] http::Error),

    #[error("coordinator answered {0}")]
    Status(http::StatusCode),

    #[error("malformed batch: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,
}

/// Failure to start a render for an assigned task.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("bad file reference {0:?}")]
    BadFileRef(String),

    #[error("no local mount for path identifier {0:?}")]
    UnknownPath(String),

    #[error("renderer failed to start: {0}")]
    Spawn(#[from] std::io::Error),
}
