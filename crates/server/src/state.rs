//! Application state

use std::sync::Arc;

use crate::dispatch::Dispatcher;

/// Shared, read-only state handed to every HTTP handler.
///
/// Nothing here is mutated after startup; all session state lives inside
/// the supervisor and worker tasks.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub cluster_id: String,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, cluster_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            cluster_id: cluster_id.into(),
        }
    }
}
