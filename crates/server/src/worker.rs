//! Session worker: one task per live session.
//!
//! The worker owns its session's state machine (Pending → Running →
//! Terminated, or Pending → Terminated) and its compute handle. Commands
//! arrive over an mpsc channel and are handled one at a time; the current
//! summary is published through an `ArcSwap` so the supervisor can answer
//! list/get without a round trip.
//!
//! The task returns once the session is Terminated. The supervisor learns
//! about it by awaiting the task's `JoinHandle`, which also covers panics.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use ntsc_protocol::{InputRequest, LogsResponse, SessionKind, SessionState, SessionSummary};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::EffectiveSpec;
use crate::dispatch::{EntityReply, EntityRequest};
use crate::error::{SessionError, SessionResult};
use crate::persistence::{PersistCommand, SessionRecord};
use crate::provisioner::{ComputeControl, ComputeEvent, Provisioner};
use crate::proxy::{route_prefix_for, ProxyClient, RouteTarget};

const OUTPUT_BUFFER_LINES: usize = 1000;

/// Why a worker is leaving Running/Pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Shutdown,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::Requested => "stopped",
            StopReason::Shutdown => "supervisor_shutdown",
        }
    }
}

/// A command that can be sent to a worker.
pub enum WorkerCommand {
    /// Terminate the session; `reply` fires once it is Terminated.
    Stop {
        reason: StopReason,
        reply: Option<oneshot::Sender<()>>,
    },

    /// Item-level request forwarded by the dispatch bridge. `request.path`
    /// is relative to the session (e.g. `["logs"]`).
    Action {
        request: EntityRequest,
        reply: oneshot::Sender<SessionResult<EntityReply>>,
    },
}

/// Handle to a running worker (cheap to Clone).
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: String,
    /// Creation order within the owning supervisor
    pub seq: u64,
    pub spec: Arc<EffectiveSpec>,
    command_tx: mpsc::Sender<WorkerCommand>,
    snapshot: Arc<ArcSwap<SessionSummary>>,
}

impl WorkerHandle {
    /// Lock-free summary read.
    pub fn summary(&self) -> Arc<SessionSummary> {
        self.snapshot.load_full()
    }

    pub fn is_live(&self) -> bool {
        self.snapshot.load().state.is_live()
    }

    /// Send a command; hands it back if the worker has already exited.
    pub async fn send(&self, cmd: WorkerCommand) -> Result<(), WorkerCommand> {
        self.command_tx.send(cmd).await.map_err(|err| err.0)
    }

    /// Non-waiting send for owners that must never block on this worker.
    pub fn try_send(&self, cmd: WorkerCommand) -> Result<(), TrySendError<WorkerCommand>> {
        self.command_tx.try_send(cmd)
    }
}

/// Everything a worker needs at spawn time.
pub struct WorkerParams {
    pub id: String,
    pub seq: u64,
    pub kind: SessionKind,
    pub proxied: bool,
    pub spec: EffectiveSpec,
    pub persist_tx: mpsc::Sender<PersistCommand>,
    pub proxy: ProxyClient,
    pub provisioner: Arc<dyn Provisioner>,
}

/// Spawn a worker task. `created` receives the Pending summary once the
/// compute process has been requested, `ProvisioningFailed`, or the
/// Terminated summary when a stop arrives first.
pub fn spawn(
    params: WorkerParams,
    created: oneshot::Sender<SessionResult<SessionSummary>>,
) -> (WorkerHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let created_at = Utc::now();
    let summary = SessionSummary {
        id: params.id.clone(),
        kind: params.kind,
        state: SessionState::Pending,
        created_at,
        description: params.spec.description.clone(),
        route_prefix: None,
        proxy_degraded: false,
        exit_code: None,
    };
    let snapshot = Arc::new(ArcSwap::from_pointee(summary));
    let spec = Arc::new(params.spec);

    let handle = WorkerHandle {
        id: params.id.clone(),
        seq: params.seq,
        spec: spec.clone(),
        command_tx,
        snapshot: snapshot.clone(),
    };

    let worker = Worker {
        id: params.id,
        kind: params.kind,
        proxied: params.proxied,
        spec,
        state: SessionState::Pending,
        created_at,
        route_prefix: None,
        proxy_degraded: false,
        exit_code: None,
        end_reason: None,
        snapshot,
        persist_tx: params.persist_tx,
        proxy: params.proxy,
        control: None,
        output: OutputBuffer::new(OUTPUT_BUFFER_LINES),
        waiters: Waiters::default(),
    };

    let join = tokio::spawn(worker.run(params.provisioner, command_rx, created));
    (handle, join)
}

/// Bounded tail of a session's output.
struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(128)),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }
}

/// Long-poll `wait` requests parked until the session leaves Pending.
#[derive(Default)]
struct Waiters {
    parked: Vec<oneshot::Sender<SessionResult<EntityReply>>>,
}

impl Waiters {
    fn park(&mut self, reply: oneshot::Sender<SessionResult<EntityReply>>) {
        // Callers that timed out at the bridge have dropped their receiver
        self.parked.retain(|waiter| !waiter.is_closed());
        self.parked.push(reply);
    }

    fn resolve(&mut self, result: SessionResult<EntityReply>) {
        for waiter in self.parked.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

struct Worker {
    id: String,
    kind: SessionKind,
    proxied: bool,
    spec: Arc<EffectiveSpec>,
    state: SessionState,
    created_at: DateTime<Utc>,
    route_prefix: Option<String>,
    proxy_degraded: bool,
    exit_code: Option<i32>,
    end_reason: Option<String>,
    snapshot: Arc<ArcSwap<SessionSummary>>,
    persist_tx: mpsc::Sender<PersistCommand>,
    proxy: ProxyClient,
    control: Option<mpsc::Sender<ComputeControl>>,
    output: OutputBuffer,
    waiters: Waiters,
}

impl Worker {
    async fn run(
        mut self,
        provisioner: Arc<dyn Provisioner>,
        mut command_rx: mpsc::Receiver<WorkerCommand>,
        created: oneshot::Sender<SessionResult<SessionSummary>>,
    ) {
        self.persist().await;

        if let Some(events) = self.provision(provisioner, &mut command_rx, created).await {
            self.serve(events, &mut command_rx).await;
        }

        // Anything still queued was addressed to a session that no longer exists
        command_rx.close();
        while let Ok(cmd) = command_rx.try_recv() {
            match cmd {
                WorkerCommand::Stop { reply, .. } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                WorkerCommand::Action { reply, .. } => {
                    let _ = reply.send(Err(SessionError::NotFound(self.id.clone())));
                }
            }
        }
    }

    /// Request compute while still answering the mailbox. Returns the event
    /// stream, or `None` once the session has terminated.
    async fn provision(
        &mut self,
        provisioner: Arc<dyn Provisioner>,
        command_rx: &mut mpsc::Receiver<WorkerCommand>,
        created: oneshot::Sender<SessionResult<SessionSummary>>,
    ) -> Option<mpsc::Receiver<ComputeEvent>> {
        let id = self.id.clone();
        let spec = self.spec.clone();
        let mut provisioning = provisioner.provision(self.kind, &id, &spec);

        let result = loop {
            tokio::select! {
                result = &mut provisioning => break result,
                cmd = command_rx.recv() => match cmd {
                    Some(WorkerCommand::Stop { reason, reply }) => {
                        // Dropping the future abandons the request
                        self.terminate(reason.as_str(), None).await;
                        let _ = created.send(Ok(self.summary()));
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        return None;
                    }
                    Some(WorkerCommand::Action { request, reply }) => {
                        self.handle_action(request, reply);
                    }
                    None => {
                        self.terminate("supervisor_gone", None).await;
                        let _ = created.send(Ok(self.summary()));
                        return None;
                    }
                },
            }
        };

        match result {
            Ok(handle) => {
                self.control = Some(handle.control);
                let _ = created.send(Ok(self.summary()));
                Some(handle.events)
            }
            Err(e) => {
                warn!(
                    component = "worker",
                    event = "worker.provisioning_failed",
                    session_id = %self.id,
                    kind = %self.kind,
                    error = %e,
                );
                self.state = SessionState::Terminated;
                self.end_reason = Some("provisioning_failed".to_string());
                self.publish();
                self.waiters
                    .resolve(Err(SessionError::NotFound(self.id.clone())));
                let _ = self
                    .persist_tx
                    .send(PersistCommand::DeleteSession {
                        kind: self.kind,
                        id: self.id.clone(),
                    })
                    .await;
                let _ = created.send(Err(SessionError::ProvisioningFailed(e.to_string())));
                None
            }
        }
    }

    async fn serve(
        &mut self,
        mut events: mpsc::Receiver<ComputeEvent>,
        command_rx: &mut mpsc::Receiver<WorkerCommand>,
    ) {
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(WorkerCommand::Stop { reason, reply }) => {
                        self.kill_compute().await;
                        self.terminate(reason.as_str(), None).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        return;
                    }
                    Some(WorkerCommand::Action { request, reply }) => {
                        self.handle_action(request, reply);
                    }
                    None => {
                        // Supervisor is gone; nobody can reach this session any more
                        self.kill_compute().await;
                        self.terminate("supervisor_gone", None).await;
                        return;
                    }
                },
                event = events.recv() => match event {
                    Some(ComputeEvent::Ready { endpoint }) => self.on_ready(endpoint).await,
                    Some(ComputeEvent::Output { line }) => self.output.push(line),
                    Some(ComputeEvent::Exited { code }) => {
                        self.terminate("exited", code).await;
                        return;
                    }
                    None => {
                        self.terminate("compute_lost", None).await;
                        return;
                    }
                },
            }
        }
    }

    async fn on_ready(&mut self, endpoint: Option<String>) {
        if self.state != SessionState::Pending {
            debug!(component = "worker", session_id = %self.id, "Duplicate ready signal ignored");
            return;
        }
        self.state = SessionState::Running;

        if self.proxied {
            let prefix = route_prefix_for(&self.id);
            let target = RouteTarget {
                session_id: self.id.clone(),
                address: format!("/{}/{}", self.kind.path_segment(), self.id),
                upstream: endpoint,
            };
            match self.proxy.register(&prefix, target) {
                Ok(()) => self.route_prefix = Some(prefix),
                Err(e) => {
                    // The session stays usable without its proxied UI
                    warn!(
                        component = "worker",
                        event = "worker.route_register_failed",
                        session_id = %self.id,
                        prefix = %prefix,
                        error = %e,
                    );
                    self.proxy_degraded = true;
                }
            }
        }

        info!(
            component = "worker",
            event = "worker.running",
            session_id = %self.id,
            kind = %self.kind,
            route_prefix = ?self.route_prefix,
        );
        self.publish();
        self.persist().await;

        let summary = self.summary_reply();
        self.waiters.resolve(Ok(summary));
    }

    async fn terminate(&mut self, reason: &str, exit_code: Option<i32>) {
        if let Some(prefix) = self.route_prefix.take() {
            if let Err(e) = self.proxy.deregister(&prefix) {
                warn!(
                    component = "worker",
                    event = "worker.route_deregister_failed",
                    session_id = %self.id,
                    prefix = %prefix,
                    error = %e,
                );
            }
        }

        self.state = SessionState::Terminated;
        self.exit_code = exit_code.or(self.exit_code);
        self.end_reason = Some(reason.to_string());
        self.control = None;
        self.publish();
        self.persist().await;

        self.waiters
            .resolve(Err(SessionError::NotFound(self.id.clone())));

        info!(
            component = "worker",
            event = "worker.terminated",
            session_id = %self.id,
            kind = %self.kind,
            reason = %reason,
            exit_code = ?self.exit_code,
        );
    }

    async fn kill_compute(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(ComputeControl::Kill).await;
        }
    }

    fn handle_action(
        &mut self,
        request: EntityRequest,
        reply: oneshot::Sender<SessionResult<EntityReply>>,
    ) {
        let action = request.path.first().map(String::as_str);

        if self.state == SessionState::Terminated {
            let _ = reply.send(Err(SessionError::NotFound(self.id.clone())));
            return;
        }

        match (&request.method, action, request.path.len()) {
            (&Method::GET, Some("wait"), 1) => {
                if self.state == SessionState::Running {
                    let _ = reply.send(Ok(self.summary_reply()));
                } else {
                    self.waiters.park(reply);
                }
            }
            (&Method::GET, Some("logs"), 1) => {
                let result = self.require_running().map(|()| {
                    EntityReply::ok(json!(LogsResponse {
                        id: self.id.clone(),
                        lines: self.output.lines.iter().cloned().collect(),
                        truncated: self.output.dropped,
                    }))
                });
                let _ = reply.send(result);
            }
            (&Method::POST, Some("input"), 1) => {
                let result = self
                    .require_running()
                    .and_then(|()| self.forward_input(request.body));
                let _ = reply.send(result);
            }
            _ => {
                let _ = reply.send(Err(SessionError::NotFound(format!(
                    "{}/{}",
                    self.id,
                    request.path.join("/")
                ))));
            }
        }
    }

    fn require_running(&self) -> SessionResult<()> {
        match self.state {
            SessionState::Running => Ok(()),
            SessionState::Pending => Err(SessionError::NotReady(self.id.clone())),
            SessionState::Terminated => Err(SessionError::NotFound(self.id.clone())),
        }
    }

    fn forward_input(&self, body: serde_json::Value) -> SessionResult<EntityReply> {
        let input: InputRequest = serde_json::from_value(body)
            .map_err(|e| SessionError::InvalidSpec(format!("invalid input body: {e}")))?;
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))?;
        control
            .try_send(ComputeControl::Input(input.data))
            .map_err(|_| SessionError::NotReady(self.id.clone()))?;
        Ok(EntityReply {
            status: StatusCode::ACCEPTED,
            body: json!({ "id": self.id, "accepted": true }),
        })
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            created_at: self.created_at,
            description: self.spec.description.clone(),
            route_prefix: self.route_prefix.clone(),
            proxy_degraded: self.proxy_degraded,
            exit_code: self.exit_code,
        }
    }

    fn summary_reply(&self) -> EntityReply {
        EntityReply::ok(json!(self.summary()))
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(self.summary()));
    }

    async fn persist(&self) {
        let record = SessionRecord {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            created_at: self.created_at,
            updated_at: Utc::now(),
            spec: (*self.spec).clone(),
            route_prefix: self.route_prefix.clone(),
            exit_code: self.exit_code,
            end_reason: self.end_reason.clone(),
        };
        if self
            .persist_tx
            .send(PersistCommand::SaveSession {
                record: Box::new(record),
            })
            .await
            .is_err()
        {
            warn!(component = "worker", session_id = %self.id, "Persistence channel closed, record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::ClusterContext;
    use crate::provisioner::testing::{FakeCompute, FakeProvisioner, StallingProvisioner};
    use crate::proxy::ProxyCommand;

    struct Harness {
        handle: WorkerHandle,
        join: JoinHandle<()>,
        compute: FakeCompute,
        created: SessionResult<SessionSummary>,
        persist_rx: mpsc::Receiver<PersistCommand>,
        proxy_rx: mpsc::Receiver<ProxyCommand>,
    }

    async fn start(kind: SessionKind) -> Harness {
        let (provisioner, mut launched) = FakeProvisioner::new();
        let (persist_tx, persist_rx) = mpsc::channel(64);
        let (proxy, proxy_rx) = ProxyClient::channel(16);
        let (created_tx, created_rx) = oneshot::channel();

        let (handle, join) = spawn(
            WorkerParams {
                id: "w1".to_string(),
                seq: 0,
                kind,
                proxied: kind == SessionKind::Dashboard,
                spec: ClusterContext::new("test").defaults_for(kind),
                persist_tx,
                proxy,
                provisioner,
            },
            created_tx,
        );

        let created = created_rx.await.unwrap();
        let compute = launched.recv().await.unwrap();
        Harness {
            handle,
            join,
            compute,
            created,
            persist_rx,
            proxy_rx,
        }
    }

    async fn action(handle: &WorkerHandle, method: Method, path: &str) -> SessionResult<EntityReply> {
        action_with_body(handle, method, path, serde_json::Value::Null).await
    }

    async fn action_with_body(
        handle: &WorkerHandle,
        method: Method,
        path: &str,
        body: serde_json::Value,
    ) -> SessionResult<EntityReply> {
        let (tx, rx) = oneshot::channel();
        let request = EntityRequest {
            method,
            path: vec![path.to_string()],
            body,
        };
        if handle
            .send(WorkerCommand::Action { request, reply: tx })
            .await
            .is_err()
        {
            return Err(SessionError::NotFound(handle.id.clone()));
        }
        rx.await
            .unwrap_or_else(|_| Err(SessionError::NotFound(handle.id.clone())))
    }

    async fn wait_for_state(handle: &WorkerHandle, state: SessionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.summary().state != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("state transition timeout");
    }

    async fn stop(handle: &WorkerHandle) {
        let (tx, rx) = oneshot::channel();
        handle
            .send(WorkerCommand::Stop {
                reason: StopReason::Requested,
                reply: Some(tx),
            })
            .await
            .ok()
            .unwrap();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn created_worker_is_pending_and_persisted() {
        let mut h = start(SessionKind::Command).await;
        let created = h.created.clone().unwrap();
        assert_eq!(created.state, SessionState::Pending);
        assert_eq!(created.id, "w1");

        match h.persist_rx.recv().await.unwrap() {
            PersistCommand::SaveSession { record } => {
                assert_eq!(record.state, SessionState::Pending);
                assert_eq!(record.kind, SessionKind::Command);
            }
            other => panic!("expected save, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn actions_are_gated_on_state() {
        let h = start(SessionKind::Command).await;

        let err = action(&h.handle, Method::GET, "logs").await.unwrap_err();
        assert_eq!(err, SessionError::NotReady("w1".to_string()));

        h.compute.output("hello").await;
        h.compute.ready().await;
        wait_for_state(&h.handle, SessionState::Running).await;

        let reply = action(&h.handle, Method::GET, "logs").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["lines"], json!(["hello"]));

        stop(&h.handle).await;
        let err = action(&h.handle, Method::GET, "logs").await.unwrap_err();
        assert_eq!(err, SessionError::NotFound("w1".to_string()));
        h.join.await.unwrap();
    }

    #[tokio::test]
    async fn input_is_forwarded_to_compute() {
        let mut h = start(SessionKind::Shell).await;
        h.compute.ready().await;
        wait_for_state(&h.handle, SessionState::Running).await;

        let reply = action_with_body(&h.handle, Method::POST, "input", json!({ "data": "ls\n" }))
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::ACCEPTED);
        assert_eq!(
            h.compute.control.recv().await,
            Some(ComputeControl::Input("ls\n".to_string()))
        );

        let err = action_with_body(&h.handle, Method::POST, "input", json!({ "nope": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let h = start(SessionKind::Notebook).await;
        h.compute.ready().await;
        wait_for_state(&h.handle, SessionState::Running).await;

        let err = action(&h.handle, Method::GET, "frobnicate").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn wait_parks_until_running() {
        let h = start(SessionKind::Dashboard).await;

        let handle = h.handle.clone();
        let waiter = tokio::spawn(async move { action(&handle, Method::GET, "wait").await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        h.compute.ready().await;
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.body["state"], "running");
    }

    #[tokio::test]
    async fn stop_kills_compute_and_terminates() {
        let mut h = start(SessionKind::Shell).await;
        h.compute.ready().await;
        wait_for_state(&h.handle, SessionState::Running).await;

        stop(&h.handle).await;
        assert_eq!(h.compute.control.recv().await, Some(ComputeControl::Kill));
        assert_eq!(h.handle.summary().state, SessionState::Terminated);
        assert!(!h.handle.is_live());
        h.join.await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_terminates_with_code() {
        let h = start(SessionKind::Command).await;
        h.compute.ready().await;
        h.compute.exit(3).await;
        h.join.await.unwrap();

        let summary = h.handle.summary();
        assert_eq!(summary.state, SessionState::Terminated);
        assert_eq!(summary.exit_code, Some(3));
    }

    #[tokio::test]
    async fn dashboard_registers_once_and_deregisters_once() {
        let mut h = start(SessionKind::Dashboard).await;
        h.compute.ready().await;
        // A second ready signal must not register again
        h.compute.ready().await;
        wait_for_state(&h.handle, SessionState::Running).await;

        match h.proxy_rx.recv().await.unwrap() {
            ProxyCommand::Register { prefix, target } => {
                assert_eq!(prefix, "/proxy/w1/");
                assert_eq!(target.address, "/tensorboard/w1");
                assert!(target.upstream.is_some());
            }
            other => panic!("expected register, got {other:?}"),
        }
        assert_eq!(
            h.handle.summary().route_prefix.as_deref(),
            Some("/proxy/w1/")
        );

        stop(&h.handle).await;
        h.join.await.unwrap();
        match h.proxy_rx.recv().await.unwrap() {
            ProxyCommand::Deregister { prefix } => assert_eq!(prefix, "/proxy/w1/"),
            other => panic!("expected deregister, got {other:?}"),
        }
        // Worker task is gone: no further intents can ever arrive
        assert!(h.proxy_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dashboard_without_registrar_runs_degraded() {
        let mut h = start(SessionKind::Dashboard).await;
        h.proxy_rx.close();

        h.compute.ready().await;
        wait_for_state(&h.handle, SessionState::Running).await;

        let summary = h.handle.summary();
        assert!(summary.proxy_degraded);
        assert_eq!(summary.route_prefix, None);

        // Still serves non-proxy actions
        assert!(action(&h.handle, Method::GET, "logs").await.is_ok());
    }

    #[tokio::test]
    async fn stop_while_pending_skips_running() {
        let mut h = start(SessionKind::Dashboard).await;
        stop(&h.handle).await;
        h.join.await.unwrap();

        assert_eq!(h.handle.summary().state, SessionState::Terminated);
        // Never ran, so never registered
        assert!(h.proxy_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn provisioning_failure_terminates_and_deletes_record() {
        let (provisioner, _launched) = FakeProvisioner::new();
        provisioner.fail_provisioning(true);
        let (persist_tx, mut persist_rx) = mpsc::channel(64);
        let (proxy, _proxy_rx) = ProxyClient::channel(16);
        let (created_tx, created_rx) = oneshot::channel();

        let (handle, join) = spawn(
            WorkerParams {
                id: "w2".to_string(),
                seq: 0,
                kind: SessionKind::Notebook,
                proxied: false,
                spec: ClusterContext::new("test").defaults_for(SessionKind::Notebook),
                persist_tx,
                proxy,
                provisioner,
            },
            created_tx,
        );

        let err = created_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ProvisioningFailed(_)));
        join.await.unwrap();
        assert_eq!(handle.summary().state, SessionState::Terminated);

        assert!(matches!(
            persist_rx.recv().await,
            Some(PersistCommand::SaveSession { .. })
        ));
        assert!(matches!(
            persist_rx.recv().await,
            Some(PersistCommand::DeleteSession { .. })
        ));
    }

    #[tokio::test]
    async fn mailbox_is_served_while_provisioning_stalls() {
        let (provisioner, mut requested) = StallingProvisioner::new();
        let (persist_tx, mut persist_rx) = mpsc::channel(64);
        let (proxy, _proxy_rx) = ProxyClient::channel(16);
        let (created_tx, created_rx) = oneshot::channel();

        let (handle, join) = spawn(
            WorkerParams {
                id: "w3".to_string(),
                seq: 0,
                kind: SessionKind::Dashboard,
                proxied: true,
                spec: ClusterContext::new("test").defaults_for(SessionKind::Dashboard),
                persist_tx,
                proxy,
                provisioner,
            },
            created_tx,
        );
        assert_eq!(requested.recv().await.as_deref(), Some("w3"));

        let bounded = Duration::from_secs(2);
        let err = tokio::time::timeout(bounded, action(&handle, Method::GET, "logs"))
            .await
            .expect("logs blocked behind provisioning")
            .unwrap_err();
        assert_eq!(err, SessionError::NotReady("w3".to_string()));

        let parked = handle.clone();
        let waiter = tokio::spawn(async move { action(&parked, Method::GET, "wait").await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tokio::time::timeout(bounded, stop(&handle))
            .await
            .expect("stop blocked behind provisioning");
        tokio::time::timeout(bounded, join)
            .await
            .expect("worker did not exit")
            .unwrap();

        assert_eq!(handle.summary().state, SessionState::Terminated);
        let created = created_rx.await.unwrap().unwrap();
        assert_eq!(created.state, SessionState::Terminated);
        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            SessionError::NotFound("w3".to_string())
        );

        let mut last = None;
        while let Ok(cmd) = persist_rx.try_recv() {
            if let PersistCommand::SaveSession { record } = cmd {
                last = Some(record);
            }
        }
        let last = last.expect("no record persisted");
        assert_eq!(last.state, SessionState::Terminated);
        assert_eq!(last.end_reason.as_deref(), Some("stopped"));
    }

    #[test]
    fn abandoned_waiters_are_pruned_when_parking() {
        let mut waiters = Waiters::default();
        for _ in 0..10 {
            let (tx, rx) = oneshot::channel();
            waiters.park(tx);
            drop(rx);
        }
        let (tx, mut live) = oneshot::channel();
        waiters.park(tx);
        assert_eq!(waiters.parked.len(), 1);

        waiters.resolve(Err(SessionError::NotFound("w4".to_string())));
        assert!(waiters.parked.is_empty());
        assert_eq!(
            live.try_recv().unwrap().unwrap_err(),
            SessionError::NotFound("w4".to_string())
        );
    }
}
