//! Server → Client response bodies

use serde::{Deserialize, Serialize};

/// Machine-readable error kind carried in every error body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSpec,
    NotFound,
    NotReady,
    ProvisioningFailed,
    DispatchTimeout,
    ShuttingDown,
}

/// JSON body returned with every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

/// Body of a successful stop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub id: String,
    pub stopped: bool,
}

/// Buffered output of a running session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub id: String,
    pub lines: Vec<String>,
    /// Lines dropped from the front of the buffer so far
    pub truncated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub cluster_id: String,
    pub version: String,
}
