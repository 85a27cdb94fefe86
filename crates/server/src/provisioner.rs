//! Compute provisioning seam.
//!
//! A `Provisioner` turns an `EffectiveSpec` into a running compute process
//! and hands back a `ComputeHandle`: a stream of lifecycle events plus a
//! control channel. Workers own the handle for the session's lifetime.

use std::process::Stdio;

use async_trait::async_trait;
use ntsc_protocol::SessionKind;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::EffectiveSpec;

/// Events reported by a compute process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeEvent {
    /// The process is up; `endpoint` is where its own UI listens, if anywhere
    Ready { endpoint: Option<String> },
    Output { line: String },
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeControl {
    Input(String),
    Kill,
}

pub struct ComputeHandle {
    pub events: mpsc::Receiver<ComputeEvent>,
    pub control: mpsc::Sender<ComputeControl>,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        kind: SessionKind,
        session_id: &str,
        spec: &EffectiveSpec,
    ) -> Result<ComputeHandle, ProvisionError>;
}

/// Runs the entrypoint as a child process of the server.
///
/// The container image is recorded but not applied; resources are exported
/// as environment variables for the process to honour.
pub struct LocalProvisioner {
    cluster_id: String,
}

impl LocalProvisioner {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(
        &self,
        kind: SessionKind,
        session_id: &str,
        spec: &EffectiveSpec,
    ) -> Result<ComputeHandle, ProvisionError> {
        let Some((program, args)) = spec.entrypoint.split_first() else {
            return Err(ProvisionError::Rejected("empty entrypoint".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.environment)
            .env("NTSC_CLUSTER_ID", &self.cluster_id)
            .env("NTSC_SESSION_ID", session_id)
            .env("NTSC_SESSION_KIND", kind.as_str())
            .env("NTSC_SLOTS", spec.resources.slots.to_string())
            .env("NTSC_CPUS", spec.resources.cpus.to_string())
            .env("NTSC_MEMORY_MB", spec.resources.memory_mb.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            if let Some(uid) = spec.user.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = spec.user.gid {
                cmd.gid(gid);
            }
        }

        let mut child = cmd.spawn().map_err(|source| ProvisionError::Spawn {
            program: program.clone(),
            source,
        })?;

        info!(
            component = "provisioner",
            event = "compute.spawned",
            session_id = %session_id,
            kind = %kind,
            image = %spec.image,
            pid = ?child.id(),
        );

        let (events_tx, events_rx) = mpsc::channel(256);
        let (control_tx, mut control_rx) = mpsc::channel(64);
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let _ = events_tx.send(ComputeEvent::Ready { endpoint: None }).await;

            let mut stdin = child.stdin.take();
            let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
            let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
            let mut control_open = true;

            let code = loop {
                tokio::select! {
                    line = next_line(&mut stdout), if stdout.is_some() => match line {
                        Some(line) => {
                            let _ = events_tx.send(ComputeEvent::Output { line }).await;
                        }
                        None => stdout = None,
                    },
                    line = next_line(&mut stderr), if stderr.is_some() => match line {
                        Some(line) => {
                            let _ = events_tx.send(ComputeEvent::Output { line }).await;
                        }
                        None => stderr = None,
                    },
                    ctl = control_rx.recv(), if control_open => match ctl {
                        Some(ComputeControl::Input(data)) => {
                            if let Some(pipe) = stdin.as_mut() {
                                if let Err(e) = pipe.write_all(data.as_bytes()).await {
                                    debug!(component = "provisioner", session_id = %session_id, error = %e, "stdin closed");
                                    stdin = None;
                                }
                            }
                        }
                        Some(ComputeControl::Kill) | None => {
                            control_open = false;
                            stdin = None;
                            if let Err(e) = child.start_kill() {
                                warn!(component = "provisioner", session_id = %session_id, error = %e, "Failed to kill compute process");
                            }
                        }
                    },
                    status = child.wait() => {
                        break status.ok().and_then(|s| s.code());
                    }
                }
            };

            // Drain whatever the process wrote before exiting
            while let Some(line) = next_line(&mut stdout).await {
                let _ = events_tx.send(ComputeEvent::Output { line }).await;
            }
            while let Some(line) = next_line(&mut stderr).await {
                let _ = events_tx.send(ComputeEvent::Output { line }).await;
            }

            info!(
                component = "provisioner",
                event = "compute.exited",
                session_id = %session_id,
                code = ?code,
            );
            let _ = events_tx.send(ComputeEvent::Exited { code }).await;
        });

        Ok(ComputeHandle {
            events: events_rx,
            control: control_tx,
        })
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines.as_mut() {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

#[cfg(test)]
pub mod testing {
    //! Scriptable provisioner for supervisor, worker and router tests.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    /// One provisioned session, driven by the test.
    pub struct FakeCompute {
        pub session_id: String,
        pub kind: SessionKind,
        pub spec: EffectiveSpec,
        pub events: mpsc::Sender<ComputeEvent>,
        pub control: mpsc::Receiver<ComputeControl>,
    }

    impl FakeCompute {
        pub async fn ready(&self) {
            self.events
                .send(ComputeEvent::Ready {
                    endpoint: Some(format!("http://10.0.0.1:6006/{}", self.session_id)),
                })
                .await
                .unwrap();
        }

        pub async fn output(&self, line: &str) {
            self.events
                .send(ComputeEvent::Output {
                    line: line.to_string(),
                })
                .await
                .unwrap();
        }

        pub async fn exit(&self, code: i32) {
            let _ = self.events.send(ComputeEvent::Exited { code: Some(code) }).await;
        }
    }

    pub struct FakeProvisioner {
        fail: AtomicBool,
        launched: mpsc::UnboundedSender<FakeCompute>,
    }

    impl FakeProvisioner {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeCompute>) {
            let (launched, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    fail: AtomicBool::new(false),
                    launched,
                }),
                rx,
            )
        }

        pub fn fail_provisioning(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn provision(
            &self,
            kind: SessionKind,
            session_id: &str,
            spec: &EffectiveSpec,
        ) -> Result<ComputeHandle, ProvisionError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProvisionError::Rejected("no capacity".to_string()));
            }
            let (events_tx, events_rx) = mpsc::channel(64);
            let (control_tx, control_rx) = mpsc::channel(64);
            let _ = self.launched.send(FakeCompute {
                session_id: session_id.to_string(),
                kind,
                spec: spec.clone(),
                events: events_tx,
                control: control_rx,
            });
            Ok(ComputeHandle {
                events: events_rx,
                control: control_tx,
            })
        }
    }

    /// Accepts the request and never answers, like a scheduler with no
    /// capacity. Reports each session id it was asked for.
    pub struct StallingProvisioner {
        requested: mpsc::UnboundedSender<String>,
    }

    impl StallingProvisioner {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (requested, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { requested }), rx)
        }
    }

    #[async_trait]
    impl Provisioner for StallingProvisioner {
        async fn provision(
            &self,
            _kind: SessionKind,
            session_id: &str,
            _spec: &EffectiveSpec,
        ) -> Result<ComputeHandle, ProvisionError> {
            let _ = self.requested.send(session_id.to_string());
            std::future::pending().await
        }
    }
}
