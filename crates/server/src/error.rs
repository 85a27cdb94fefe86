//! Typed session errors and their HTTP mapping.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ntsc_protocol::{ErrorBody, ErrorKind};
use thiserror::Error;

/// Failure of a single request against a supervisor or worker.
///
/// None of these take down the entity that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is not running yet")]
    NotReady(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("no response within {0:?}")]
    DispatchTimeout(Duration),

    #[error("supervisor for {0} is shutting down")]
    ShuttingDown(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::ProvisioningFailed(_) => ErrorKind::ProvisioningFailed,
            Self::DispatchTimeout(_) => ErrorKind::DispatchTimeout,
            Self::ShuttingDown(_) => ErrorKind::ShuttingDown,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotReady(_) => StatusCode::CONFLICT,
            Self::ProvisioningFailed(_) => StatusCode::BAD_GATEWAY,
            Self::DispatchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ShuttingDown(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
