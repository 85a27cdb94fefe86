//! Generic dispatch bridge.
//!
//! Turns an HTTP request rooted at a supervisor's path segment into an
//! `EntityRequest` addressed to that supervisor, waits (bounded) for the
//! reply and hands it back. The bridge keeps no session state; which entity
//! answers is decided by the supervisor from the remaining path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::{Method, StatusCode};
use ntsc_protocol::SessionKind;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::ClusterContext;
use crate::error::{SessionError, SessionResult};
use crate::persistence::PersistCommand;
use crate::provisioner::Provisioner;
use crate::proxy::ProxyClient;
use crate::supervisor::SupervisorHandle;

/// A request addressed to a supervisor or one of its workers.
#[derive(Debug, Clone)]
pub struct EntityRequest {
    pub method: Method,
    /// Segments after the addressed entity, e.g. `["<id>", "logs"]` at a
    /// supervisor or `["logs"]` at a worker
    pub path: Vec<String>,
    pub body: Value,
}

impl EntityRequest {
    pub fn new(method: Method, path: &str, body: Value) -> Self {
        Self {
            method,
            path: split_path(path),
            body,
        }
    }
}

/// Response produced by the addressed entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReply {
    pub status: StatusCode,
    pub body: Value,
}

impl EntityReply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn created(body: Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            body,
        }
    }
}

pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Addressing table from path segment to supervisor, built once at startup.
pub struct Dispatcher {
    supervisors: HashMap<SessionKind, SupervisorHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(handles: impl IntoIterator<Item = SupervisorHandle>) -> Self {
        let supervisors = handles
            .into_iter()
            .map(|handle| (handle.kind(), handle))
            .collect();
        Self {
            supervisors,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one supervisor per session kind.
    pub fn start(
        ctx: Arc<ClusterContext>,
        persist_tx: mpsc::Sender<PersistCommand>,
        proxy: ProxyClient,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        let mut handles = Vec::with_capacity(SessionKind::ALL.len());
        let mut tasks = Vec::with_capacity(SessionKind::ALL.len());
        for kind in SessionKind::ALL {
            let (handle, task) = SupervisorHandle::spawn(
                ctx.descriptor(kind),
                persist_tx.clone(),
                proxy.clone(),
                provisioner.clone(),
            );
            info!(
                component = "dispatch",
                event = "supervisor.registered",
                kind = %kind,
                path = %kind.path_segment(),
            );
            handles.push(handle);
            tasks.push(task);
        }
        Self {
            tasks: Mutex::new(tasks),
            ..Self::new(handles)
        }
    }

    pub fn resolve(&self, segment: &str) -> Option<&SupervisorHandle> {
        SessionKind::from_path_segment(segment).and_then(|kind| self.supervisors.get(&kind))
    }

    /// Forward `request` to the supervisor mounted at `segment`.
    ///
    /// On timeout the wait is abandoned; the target may still finish the
    /// work and its late reply is dropped.
    pub async fn dispatch(&self, segment: &str, request: EntityRequest) -> SessionResult<EntityReply> {
        let Some(supervisor) = self.resolve(segment) else {
            // Every kind registers at startup, so this is a wiring fault
            error!(
                component = "dispatch",
                event = "dispatch.unresolved",
                segment = %segment,
            );
            return Err(SessionError::NotFound(format!("/{segment}")));
        };

        let timeout = supervisor.dispatch_timeout();
        match tokio::time::timeout(timeout, supervisor.route(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    component = "dispatch",
                    event = "dispatch.timeout",
                    segment = %segment,
                    timeout_ms = timeout.as_millis() as u64,
                );
                Err(SessionError::DispatchTimeout(timeout))
            }
        }
    }

    /// Drain every supervisor: stop all sessions and wait for them to end.
    pub async fn shutdown(&self) {
        let drains = self
            .supervisors
            .values()
            .map(|supervisor| supervisor.shutdown());
        futures::future::join_all(drains).await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        info!(component = "dispatch", event = "dispatch.drained");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ntsc_protocol::SessionState;
    use serde_json::json;

    use super::*;
    use crate::provisioner::testing::{FakeCompute, FakeProvisioner};

    // Persistence and proxy receivers are dropped: workers only log when
    // those intents cannot be delivered.
    fn start(ctx: ClusterContext) -> (Dispatcher, mpsc::UnboundedReceiver<FakeCompute>) {
        let (provisioner, launched) = FakeProvisioner::new();
        let (persist_tx, _) = mpsc::channel(16);
        let (proxy, _) = ProxyClient::channel(16);
        let dispatcher = Dispatcher::start(Arc::new(ctx), persist_tx, proxy, provisioner);
        (dispatcher, launched)
    }

    #[test]
    fn split_path_drops_empty_segments() {
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
        assert!(split_path("").is_empty());
    }

    #[tokio::test]
    async fn every_kind_is_addressable() {
        let (dispatcher, _launched) = start(ClusterContext::new("test"));
        for kind in SessionKind::ALL {
            let reply = dispatcher
                .dispatch(kind.path_segment(), EntityRequest::new(Method::GET, "", Value::Null))
                .await
                .unwrap();
            assert_eq!(reply.body, json!([]));
        }
    }

    #[tokio::test]
    async fn unknown_segment_is_not_found() {
        let (dispatcher, _launched) = start(ClusterContext::new("test"));
        let err = dispatcher
            .dispatch("experiments", EntityRequest::new(Method::GET, "", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn dashboard_long_poll_times_out_without_cancelling() {
        let mut ctx = ClusterContext::new("test");
        ctx.dashboard_timeout = Duration::from_millis(50);
        let (dispatcher, mut launched) = start(ctx);

        let created = dispatcher
            .dispatch("tensorboard", EntityRequest::new(Method::POST, "", Value::Null))
            .await
            .unwrap();
        let id = created.body["id"].as_str().unwrap().to_string();
        let compute = launched.recv().await.unwrap();

        // Never ready, so the wait outlives the bridge timeout
        let err = dispatcher
            .dispatch(
                "tensorboard",
                EntityRequest::new(Method::GET, &format!("{id}/wait"), Value::Null),
            )
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::DispatchTimeout(Duration::from_millis(50)));

        // The session itself is untouched and still progresses
        compute.ready().await;
        let supervisor = dispatcher.resolve("tensorboard").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(summary) = supervisor.get(&id).await {
                    if summary.state == SessionState::Running {
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session never reached running");
    }

    #[tokio::test]
    async fn shutdown_drains_all_supervisors() {
        let (dispatcher, mut launched) = start(ClusterContext::new("test"));
        for segment in ["commands", "shells"] {
            dispatcher
                .dispatch(segment, EntityRequest::new(Method::POST, "", Value::Null))
                .await
                .unwrap();
        }
        let first = launched.recv().await.unwrap();
        first.ready().await;

        tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown())
            .await
            .expect("shutdown did not drain");
    }
}
