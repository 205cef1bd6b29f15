//! Node protocol errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use farmgrid_scheduler::SchedulerError;
use thiserror::Error;
use tracing::{error, warn};

/// Why a protocol request was refused.
///
/// Misuse of the protocol is answered with `418 I'm a teapot`, which nodes
/// treat as "fix your request" rather than "try again later".
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("{0} before identity")]
    IdentityRequired(&'static str),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("request handler failed: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::Malformed(_)
            | ProtocolError::IdentityRequired(_)
            | ProtocolError::Scheduler(SchedulerError::InvalidIdentity(_)) => {
                StatusCode::IM_A_TEAPOT
            }
            ProtocolError::Scheduler(_) | ProtocolError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<tokio::task::JoinError> for ProtocolError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProtocolError::Internal(e.to_string())
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::IM_A_TEAPOT {
            warn!(error = %self, "protocol request refused");
        } else {
            error!(error = %self, "protocol request failed");
        }
        (status, self.to_string()).into_response()
    }
}
