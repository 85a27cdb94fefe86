//! Session-type supervisor: one task per session kind.
//!
//! A supervisor owns the id → worker mapping for its kind and processes its
//! commands strictly one at a time, so mapping mutations need no locks.
//! Entries are removed only when a worker's task has actually finished
//! (`ChildTerminated`), which fires for clean exits and panics alike.
//! Summaries come from each worker's lock-free snapshot, and a Terminated
//! snapshot is never reported, so an id that still sits in the mapping for
//! a moment after its worker ended is already invisible from outside.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use chrono::Utc;
use ntsc_protocol::{SessionKind, SessionSpec, SessionState, SessionSummary, StopResponse};
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{merge_spec, KindDescriptor};
use crate::dispatch::{EntityReply, EntityRequest};
use crate::error::{SessionError, SessionResult};
use crate::persistence::{PersistCommand, SessionRecord};
use crate::provisioner::Provisioner;
use crate::proxy::ProxyClient;
use crate::worker::{self, StopReason, WorkerCommand, WorkerHandle, WorkerParams};

/// A command that can be sent to a supervisor.
pub enum SupervisorCommand {
    List {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    Create {
        spec: SessionSpec,
        reply: oneshot::Sender<SessionResult<SessionSummary>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<SessionResult<SessionSummary>>,
    },
    /// Idempotent; `reply` fires once the session is gone (or was never there).
    Stop {
        id: String,
        reply: oneshot::Sender<()>,
    },
    /// Generic request from the dispatch bridge
    Route {
        request: EntityRequest,
        reply: oneshot::Sender<SessionResult<EntityReply>>,
    },
    /// A worker task finished; `crashed` when it panicked
    ChildTerminated {
        id: String,
        crashed: bool,
    },
    /// Stop every child and exit once all of them have terminated.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running supervisor (cheap to Clone).
#[derive(Clone)]
pub struct SupervisorHandle {
    kind: SessionKind,
    dispatch_timeout: Duration,
    command_tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub fn spawn(
        descriptor: KindDescriptor,
        persist_tx: mpsc::Sender<PersistCommand>,
        proxy: ProxyClient,
        provisioner: Arc<dyn Provisioner>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let handle = SupervisorHandle {
            kind: descriptor.kind,
            dispatch_timeout: descriptor.dispatch_timeout,
            command_tx: command_tx.clone(),
        };

        let supervisor = Supervisor {
            descriptor,
            children: HashMap::new(),
            issued: HashSet::new(),
            next_seq: 0,
            persist_tx,
            proxy,
            provisioner,
            self_tx: command_tx.downgrade(),
            drain_waiters: None,
        };
        let task = tokio::spawn(supervisor.run(command_rx));
        (handle, task)
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> SessionResult<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::ShuttingDown(self.kind.to_string()))?;
        rx.await
            .map_err(|_| SessionError::ShuttingDown(self.kind.to_string()))
    }

    pub async fn list(&self) -> SessionResult<Vec<SessionSummary>> {
        self.request(|reply| SupervisorCommand::List { reply }).await
    }

    pub async fn create(&self, spec: SessionSpec) -> SessionResult<SessionSummary> {
        self.request(|reply| SupervisorCommand::Create { spec, reply })
            .await?
    }

    pub async fn get(&self, id: &str) -> SessionResult<SessionSummary> {
        let id = id.to_string();
        self.request(|reply| SupervisorCommand::Get { id, reply })
            .await?
    }

    pub async fn stop(&self, id: &str) -> SessionResult<()> {
        let id = id.to_string();
        self.request(|reply| SupervisorCommand::Stop { id, reply })
            .await
    }

    pub async fn route(&self, request: EntityRequest) -> SessionResult<EntityReply> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::Route { request, reply })
            .await
            .map_err(|_| SessionError::ShuttingDown(self.kind.to_string()))?;
        match rx.await {
            Ok(result) => result,
            Err(_) if self.command_tx.is_closed() => {
                Err(SessionError::ShuttingDown(self.kind.to_string()))
            }
            // The addressed entity went away without answering
            Err(_) => Err(SessionError::NotFound(format!(
                "{} entity stopped before replying",
                self.kind
            ))),
        }
    }

    /// Returns once every session of this kind has terminated. A
    /// supervisor that already exited counts as drained.
    pub async fn shutdown(&self) {
        let _ = self
            .request(|reply| SupervisorCommand::Shutdown { reply })
            .await;
    }
}

struct Supervisor {
    descriptor: KindDescriptor,
    children: HashMap<String, WorkerHandle>,
    /// Every id this supervisor ever handed out
    issued: HashSet<String>,
    next_seq: u64,
    persist_tx: mpsc::Sender<PersistCommand>,
    proxy: ProxyClient,
    provisioner: Arc<dyn Provisioner>,
    /// Weak so that the supervisor does not keep its own mailbox open
    self_tx: mpsc::WeakSender<SupervisorCommand>,
    drain_waiters: Option<Vec<oneshot::Sender<()>>>,
}

impl Supervisor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SupervisorCommand>) {
        let kind = self.descriptor.kind;
        info!(component = "supervisor", event = "supervisor.started", kind = %kind);

        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                SupervisorCommand::List { reply } => {
                    let _ = reply.send(self.list());
                }
                SupervisorCommand::Create { spec, reply } => {
                    self.create(spec, reply);
                }
                SupervisorCommand::Get { id, reply } => {
                    let _ = reply.send(self.get(&id));
                }
                SupervisorCommand::Stop { id, reply } => {
                    self.stop(&id, reply);
                }
                SupervisorCommand::Route { request, reply } => {
                    self.route(request, reply);
                }
                SupervisorCommand::ChildTerminated { id, crashed } => {
                    self.child_terminated(&id, crashed).await;
                    if self.drained() {
                        break;
                    }
                }
                SupervisorCommand::Shutdown { reply } => {
                    self.begin_shutdown(reply);
                    if self.drained() {
                        break;
                    }
                }
            }
        }

        // Mailbox closed without a drain: no one can address these children any more
        for child in self.children.values() {
            deliver_stop(child, StopReason::Shutdown, None);
        }

        if let Some(waiters) = self.drain_waiters.take() {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        info!(component = "supervisor", event = "supervisor.stopped", kind = %kind);
    }

    fn list(&self) -> Vec<SessionSummary> {
        let mut live: Vec<(u64, Arc<SessionSummary>)> = self
            .children
            .values()
            .map(|child| (child.seq, child.summary()))
            .filter(|(_, summary)| summary.state.is_live())
            .collect();
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter()
            .map(|(_, summary)| (*summary).clone())
            .collect()
    }

    fn get(&self, id: &str) -> SessionResult<SessionSummary> {
        self.children
            .get(id)
            .map(|child| child.summary())
            .filter(|summary| summary.state.is_live())
            .map(|summary| (*summary).clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn allocate_id(&mut self) -> String {
        loop {
            let id = ntsc_protocol::new_id();
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }

    fn create(&mut self, spec: SessionSpec, reply: oneshot::Sender<SessionResult<SessionSummary>>) {
        let kind = self.descriptor.kind;
        if self.drain_waiters.is_some() {
            let _ = reply.send(Err(SessionError::ShuttingDown(kind.to_string())));
            return;
        }

        let merged = match merge_spec(&self.descriptor.defaults, &spec) {
            Ok(merged) => merged,
            Err(e) => {
                debug!(component = "supervisor", kind = %kind, error = %e, "Rejected create");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let id = self.allocate_id();
        let seq = self.next_seq;
        self.next_seq += 1;

        // The worker may die before reporting; never leave the caller hanging
        let (created_tx, created_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = created_rx.await.unwrap_or_else(|_| {
                Err(SessionError::ProvisioningFailed(
                    "worker exited before reporting".to_string(),
                ))
            });
            let _ = reply.send(result);
        });

        let (handle, join) = worker::spawn(
            WorkerParams {
                id: id.clone(),
                seq,
                kind,
                proxied: self.descriptor.proxied,
                spec: merged,
                persist_tx: self.persist_tx.clone(),
                proxy: self.proxy.clone(),
                provisioner: self.provisioner.clone(),
            },
            created_tx,
        );
        self.children.insert(id.clone(), handle);
        self.watch(id.clone(), join);

        info!(
            component = "supervisor",
            event = "session.created",
            kind = %kind,
            session_id = %id,
        );
    }

    /// Report the worker's end back to this supervisor, panic included.
    fn watch(&self, id: String, join: JoinHandle<()>) {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let crashed = match join.await {
                Ok(()) => false,
                Err(e) => {
                    error!(component = "supervisor", session_id = %id, error = %e, "Worker task failed");
                    true
                }
            };
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(SupervisorCommand::ChildTerminated { id, crashed }).await;
            }
        });
    }

    fn stop(&self, id: &str, reply: oneshot::Sender<()>) {
        match self.children.get(id) {
            Some(child) => deliver_stop(child, StopReason::Requested, Some(reply)),
            // Unknown or already removed: stop is idempotent
            None => {
                let _ = reply.send(());
            }
        }
    }

    fn route(
        &mut self,
        request: EntityRequest,
        reply: oneshot::Sender<SessionResult<EntityReply>>,
    ) {
        let segments: Vec<&str> = request.path.iter().map(String::as_str).collect();
        match (&request.method, segments.as_slice()) {
            (&Method::GET, []) => {
                let _ = reply.send(Ok(EntityReply::ok(json!(self.list()))));
            }
            (&Method::POST, []) => {
                let spec = match parse_spec(request.body) {
                    Ok(spec) => spec,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let kind = self.descriptor.kind;
                let (created_tx, created_rx) = oneshot::channel();
                self.create(spec, created_tx);
                tokio::spawn(async move {
                    let result = match created_rx.await {
                        Ok(result) => result.map(|summary| EntityReply::created(json!(summary))),
                        Err(_) => Err(SessionError::ShuttingDown(kind.to_string())),
                    };
                    let _ = reply.send(result);
                });
            }
            (&Method::GET, [id]) => {
                let result = self.get(id).map(|summary| EntityReply::ok(json!(summary)));
                let _ = reply.send(result);
            }
            (&Method::DELETE, [id]) | (&Method::POST, [id, "stop"]) => {
                let id = id.to_string();
                let (stopped_tx, stopped_rx) = oneshot::channel();
                self.stop(&id, stopped_tx);
                tokio::spawn(async move {
                    let _ = stopped_rx.await;
                    let body = StopResponse { id, stopped: true };
                    let _ = reply.send(Ok(EntityReply::ok(json!(body))));
                });
            }
            (_, [id, ..]) => {
                let id = id.to_string();
                match self.children.get(&id) {
                    Some(child) => {
                        let forwarded = EntityRequest {
                            method: request.method.clone(),
                            path: request.path[1..].to_vec(),
                            body: request.body,
                        };
                        let cmd = WorkerCommand::Action {
                            request: forwarded,
                            reply,
                        };
                        // A backed-up worker must not stall the whole kind
                        match child.try_send(cmd) {
                            Ok(()) => {}
                            Err(TrySendError::Full(WorkerCommand::Action { reply, .. })) => {
                                let _ = reply.send(Err(SessionError::NotReady(id)));
                            }
                            Err(TrySendError::Closed(WorkerCommand::Action { reply, .. })) => {
                                let _ = reply.send(Err(SessionError::NotFound(id)));
                            }
                            Err(_) => {}
                        }
                    }
                    None => {
                        let _ = reply.send(Err(SessionError::NotFound(id)));
                    }
                }
            }
            _ => {
                let _ = reply.send(Err(SessionError::NotFound(format!(
                    "{} /{}/{}",
                    request.method,
                    self.descriptor.kind.path_segment(),
                    request.path.join("/")
                ))));
            }
        }
    }

    async fn child_terminated(&mut self, id: &str, crashed: bool) {
        let Some(child) = self.children.remove(id) else {
            return;
        };
        let kind = self.descriptor.kind;

        if crashed {
            let last = child.summary();
            // The worker could not clean up after itself
            if let Some(prefix) = &last.route_prefix {
                if let Err(e) = self.proxy.deregister(prefix) {
                    warn!(component = "supervisor", session_id = %id, error = %e, "Failed to deregister route of crashed worker");
                }
            }
            let record = SessionRecord {
                id: id.to_string(),
                kind,
                state: SessionState::Terminated,
                created_at: last.created_at,
                updated_at: Utc::now(),
                spec: (*child.spec).clone(),
                route_prefix: None,
                exit_code: last.exit_code,
                end_reason: Some("crashed".to_string()),
            };
            let _ = self
                .persist_tx
                .send(PersistCommand::SaveSession {
                    record: Box::new(record),
                })
                .await;
        }

        info!(
            component = "supervisor",
            event = "session.removed",
            kind = %kind,
            session_id = %id,
            crashed = crashed,
            remaining = self.children.len(),
        );
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        info!(
            component = "supervisor",
            event = "supervisor.draining",
            kind = %self.descriptor.kind,
            children = self.children.len(),
        );
        let first = self.drain_waiters.is_none();
        self.drain_waiters.get_or_insert_with(Vec::new).push(reply);
        if !first {
            return;
        }
        for child in self.children.values() {
            deliver_stop(child, StopReason::Shutdown, None);
        }
    }

    fn drained(&self) -> bool {
        self.drain_waiters.is_some() && self.children.is_empty()
    }
}

/// Queue a stop on a child without waiting on its mailbox. A full mailbox
/// gets the stop from a side task so it is never lost.
fn deliver_stop(child: &WorkerHandle, reason: StopReason, reply: Option<oneshot::Sender<()>>) {
    match child.try_send(WorkerCommand::Stop { reason, reply }) {
        Ok(()) => {}
        Err(TrySendError::Full(cmd)) => {
            debug!(component = "supervisor", session_id = %child.id, "Worker mailbox full, stop deferred");
            let child = child.clone();
            tokio::spawn(async move {
                if let Err(WorkerCommand::Stop {
                    reply: Some(reply), ..
                }) = child.send(cmd).await
                {
                    let _ = reply.send(());
                }
            });
        }
        // Already gone, which is what the caller asked for
        Err(TrySendError::Closed(WorkerCommand::Stop {
            reply: Some(reply), ..
        })) => {
            let _ = reply.send(());
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

fn parse_spec(body: Value) -> SessionResult<SessionSpec> {
    if body.is_null() {
        return Ok(SessionSpec::default());
    }
    serde_json::from_value(body).map_err(|e| SessionError::InvalidSpec(e.to_string()))
}
