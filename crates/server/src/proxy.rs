//! Reverse-proxy route registration.
//!
//! Workers only emit intents through a `ProxyClient`; the `ProxyRegistrar`
//! task owns the route table and is the single source of truth for which
//! prefix points at which worker. Intents are best effort: `try_send` never
//! waits, so a slow or absent registrar cannot stall a worker.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Where a registered prefix forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub session_id: String,
    /// Dispatch address of the owning worker, e.g. `/tensorboard/<id>`
    pub address: String,
    /// Endpoint reported by the compute process, if it exposed one
    pub upstream: Option<String>,
}

#[derive(Debug)]
pub enum ProxyCommand {
    Register {
        prefix: String,
        target: RouteTarget,
    },
    Deregister {
        prefix: String,
    },
    Lookup {
        prefix: String,
        reply: oneshot::Sender<Option<RouteTarget>>,
    },
    Routes {
        reply: oneshot::Sender<Vec<(String, RouteTarget)>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("proxy registrar is not running")]
    Closed,
    #[error("proxy registrar queue is full")]
    Full,
}

impl<T> From<mpsc::error::TrySendError<T>> for ProxyError {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => ProxyError::Full,
            mpsc::error::TrySendError::Closed(_) => ProxyError::Closed,
        }
    }
}

/// Prefix a dashboard session is exposed under.
pub fn route_prefix_for(session_id: &str) -> String {
    format!("/proxy/{session_id}/")
}

/// Cheap-to-clone sender of registration intents.
#[derive(Clone)]
pub struct ProxyClient {
    tx: mpsc::Sender<ProxyCommand>,
}

impl ProxyClient {
    /// Client plus the raw intent stream, for wiring an external registrar.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProxyCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn register(&self, prefix: &str, target: RouteTarget) -> Result<(), ProxyError> {
        self.tx.try_send(ProxyCommand::Register {
            prefix: prefix.to_string(),
            target,
        })?;
        Ok(())
    }

    pub fn deregister(&self, prefix: &str) -> Result<(), ProxyError> {
        self.tx.try_send(ProxyCommand::Deregister {
            prefix: prefix.to_string(),
        })?;
        Ok(())
    }

    pub async fn lookup(&self, prefix: &str) -> Result<Option<RouteTarget>, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProxyCommand::Lookup {
                prefix: prefix.to_string(),
                reply,
            })
            .await
            .map_err(|_| ProxyError::Closed)?;
        rx.await.map_err(|_| ProxyError::Closed)
    }

    pub async fn routes(&self) -> Result<Vec<(String, RouteTarget)>, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProxyCommand::Routes { reply })
            .await
            .map_err(|_| ProxyError::Closed)?;
        rx.await.map_err(|_| ProxyError::Closed)
    }
}

/// In-process owner of the route table.
pub struct ProxyRegistrar {
    routes: HashMap<String, RouteTarget>,
    rx: mpsc::Receiver<ProxyCommand>,
}

impl ProxyRegistrar {
    /// Spawn the registrar task and return a client connected to it.
    pub fn spawn() -> ProxyClient {
        let (client, rx) = ProxyClient::channel(256);
        let registrar = ProxyRegistrar {
            routes: HashMap::new(),
            rx,
        };
        tokio::spawn(registrar.run());
        client
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ProxyCommand::Register { prefix, target } => {
                    info!(
                        component = "proxy",
                        event = "proxy.route_registered",
                        prefix = %prefix,
                        session_id = %target.session_id,
                        address = %target.address,
                    );
                    // Same prefix again replaces the stale entry
                    self.routes.insert(prefix, target);
                }
                ProxyCommand::Deregister { prefix } => {
                    if self.routes.remove(&prefix).is_some() {
                        info!(
                            component = "proxy",
                            event = "proxy.route_deregistered",
                            prefix = %prefix,
                        );
                    } else {
                        debug!(component = "proxy", prefix = %prefix, "Deregister for unknown prefix");
                    }
                }
                ProxyCommand::Lookup { prefix, reply } => {
                    let _ = reply.send(self.routes.get(&prefix).cloned());
                }
                ProxyCommand::Routes { reply } => {
                    let mut routes: Vec<_> = self
                        .routes
                        .iter()
                        .map(|(prefix, target)| (prefix.clone(), target.clone()))
                        .collect();
                    routes.sort_by(|a, b| a.0.cmp(&b.0));
                    let _ = reply.send(routes);
                }
            }
        }
    }
}
