//! ntsc server
//!
//! Supervisor-managed interactive sessions (commands, notebooks, shells and
//! TensorBoard dashboards) behind a generic HTTP dispatch bridge.

mod cluster;
mod config;
mod dispatch;
mod error;
mod logging;
mod migration_runner;
mod paths;
mod persistence;
mod provisioner;
mod proxy;
mod routes;
mod state;
mod supervisor;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::config::FileConfig;
use crate::dispatch::Dispatcher;
use crate::paths::DataPaths;
use crate::persistence::{create_persistence_channel, PersistenceWriter};
use crate::provisioner::LocalProvisioner;
use crate::proxy::ProxyRegistrar;
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "ntsc-server", version, about = "Run the ntsc session server")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "NTSC_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Data directory (default: $NTSC_DATA_DIR or ~/.ntsc)
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Identifier exported to every compute process
    #[arg(long, env = "NTSC_CLUSTER_ID", default_value = "default")]
    cluster_id: String,

    /// TOML file with cluster defaults
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    paths
        .ensure_dirs()
        .with_context(|| format!("creating data dir {}", paths.root().display()))?;
    let logging = logging::init_logging(&paths.log_dir())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        bind = %cli.bind,
        cluster_id = %cli.cluster_id,
    );

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let ctx = Arc::new(file_config.into_cluster_context(cli.cluster_id.clone()));

    let db_path = paths.db_path();
    let reaped = tokio::task::spawn_blocking({
        let db_path = db_path.clone();
        move || -> anyhow::Result<usize> {
            let mut conn = Connection::open(&db_path)
                .with_context(|| format!("opening {}", db_path.display()))?;
            migration_runner::run_migrations(&mut conn)?;
            persistence::reap_stale_sessions(&db_path)
        }
    })
    .await??;
    info!(
        component = "server",
        event = "server.database_ready",
        db_path = %db_path.display(),
        reaped = reaped,
    );

    let (persist_tx, persist_rx) = create_persistence_channel();
    let writer = tokio::spawn(PersistenceWriter::new(persist_rx, db_path).run());

    let proxy = ProxyRegistrar::spawn();
    let provisioner = Arc::new(LocalProvisioner::new(ctx.cluster_id.clone()));
    let dispatcher = Arc::new(Dispatcher::start(ctx.clone(), persist_tx, proxy, provisioner));

    let state = Arc::new(AppState::new(dispatcher.clone(), ctx.cluster_id.clone()));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(component = "server", event = "server.listening", addr = %cli.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!(component = "server", event = "server.draining");
    dispatcher.shutdown().await;
    drop(dispatcher);

    // Every persistence sender lived in a supervisor or worker, so the
    // writer sees its channel close and flushes the tail
    if let Err(e) = writer.await {
        error!(component = "server", error = %e, "Persistence writer failed");
    }

    info!(component = "server", event = "server.stopped");
    drop(logging);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(component = "server", error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(component = "server", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(component = "server", event = "server.shutdown_signal");
}
