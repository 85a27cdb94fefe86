//! ntsc protocol
//!
//! Shared types for the interactive session manager's HTTP surface.
//! These types are serialized as JSON request and response bodies.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::{InputRequest, SessionSpec};
pub use server::{ErrorBody, ErrorKind, HealthResponse, LogsResponse, StopResponse};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
