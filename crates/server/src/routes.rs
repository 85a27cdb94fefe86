//! HTTP surface.
//!
//! Every session kind is mounted at its path segment; the router knows
//! nothing about individual operations and hands the method, remaining path
//! and JSON body to the dispatch bridge.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::Method,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use ntsc_protocol::HealthResponse;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::dispatch::{EntityReply, EntityRequest};
use crate::error::{SessionError, SessionResult};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/{kind}", any(dispatch_root))
        .route("/{kind}/{*rest}", any(dispatch_nested))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        cluster_id: state.cluster_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn dispatch_root(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    method: Method,
    body: Bytes,
) -> Response {
    into_response(forward(&state, &kind, "", method, &body).await)
}

async fn dispatch_nested(
    State(state): State<Arc<AppState>>,
    Path((kind, rest)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    into_response(forward(&state, &kind, &rest, method, &body).await)
}

async fn forward(
    state: &AppState,
    kind: &str,
    rest: &str,
    method: Method,
    body: &[u8],
) -> SessionResult<EntityReply> {
    if state.dispatcher.resolve(kind).is_none() {
        return Err(SessionError::NotFound(format!("/{kind}")));
    }
    let body = parse_body(body)?;
    debug!(component = "http", method = %method, kind = %kind, path = %rest, "Dispatching request");
    state
        .dispatcher
        .dispatch(kind, EntityRequest::new(method, rest, body))
        .await
}

fn parse_body(raw: &[u8]) -> SessionResult<Value> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(raw).map_err(|e| SessionError::InvalidSpec(format!("invalid JSON body: {e}")))
}

fn into_response(result: SessionResult<EntityReply>) -> Response {
    match result {
        Ok(reply) => (reply.status, Json(reply.body)).into_response(),
        Err(e) => e.into_response(),
    }
}
