//! Persistence layer - batched SQLite writes
//!
//! Workers never touch SQLite directly: they send `PersistCommand`s to a
//! single `PersistenceWriter` task which batches them onto a blocking thread.
//! Reads (`load_session`, `load_sessions`) are synchronous and meant to be
//! called from `spawn_blocking` or at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ntsc_protocol::{SessionKind, SessionState};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cluster::EffectiveSpec;

/// Crash-recoverable record of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub spec: EffectiveSpec,
    #[serde(default)]
    pub route_prefix: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub end_reason: Option<String>,
}

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Insert or replace the record for `(kind, id)`
    SaveSession { record: Box<SessionRecord> },

    /// Remove the record for `(kind, id)`
    DeleteSession { kind: SessionKind, id: String },
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run until every sender is dropped, then flush what is left.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.batch.push(cmd);

                    if self.batch.len() >= self.batch_size {
                        self.flush().await;
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.flush().await;
        info!(component = "persistence", event = "persistence.stopped");
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(component = "persistence", count = count, "Persisted commands");
            }
            Ok(Err(e)) => {
                error!(component = "persistence", error = %e, "Persistence flush failed");
            }
            Err(e) => {
                error!(component = "persistence", error = %e, "spawn_blocking panicked");
            }
        }
    }
}

/// Create a sender for the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Flush a batch of commands to SQLite (runs in blocking thread)
fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open(db_path)?;
    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(component = "persistence", error = %e, "Failed to execute command");
        }
    }

    tx.commit()?;
    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::SaveSession { record } => save_record(conn, &record),
        PersistCommand::DeleteSession { kind, id } => {
            conn.execute(
                "DELETE FROM sessions WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
            )?;
            Ok(())
        }
    }
}

fn save_record(conn: &Connection, record: &SessionRecord) -> Result<(), rusqlite::Error> {
    let json = serde_json::to_string(record)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO sessions (kind, id, state, record, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(kind, id) DO UPDATE SET
           state = excluded.state,
           record = excluded.record,
           updated_at = excluded.updated_at",
        params![
            record.kind.as_str(),
            record.id,
            record.state.as_str(),
            json,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn decode_record(json: String) -> Result<SessionRecord, rusqlite::Error> {
    serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Load one record, `None` if it was never saved or has been deleted.
pub fn load_session(
    db_path: &Path,
    kind: SessionKind,
    id: &str,
) -> anyhow::Result<Option<SessionRecord>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = open(db_path)?;
    let json: Option<String> = conn
        .query_row(
            "SELECT record FROM sessions WHERE kind = ?1 AND id = ?2",
            params![kind.as_str(), id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(json.map(decode_record).transpose()?)
}

/// Load every record of one kind, oldest first.
pub fn load_sessions(db_path: &Path, kind: SessionKind) -> anyhow::Result<Vec<SessionRecord>> {
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let conn = open(db_path)?;
    let mut stmt =
        conn.prepare("SELECT record FROM sessions WHERE kind = ?1 ORDER BY created_at, id")?;
    let records = stmt
        .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?
        .map(|row| row.and_then(decode_record))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Mark records a previous process left Pending or Running as Terminated.
///
/// Their workers died with that process; nothing reattaches to them.
pub fn reap_stale_sessions(db_path: &Path) -> anyhow::Result<usize> {
    let mut reaped = 0;
    for kind in SessionKind::ALL {
        let stale: Vec<SessionRecord> = load_sessions(db_path, kind)?
            .into_iter()
            .filter(|record| record.state.is_live())
            .collect();
        if stale.is_empty() {
            continue;
        }

        let conn = open(db_path)?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now();
        for mut record in stale {
            record.state = SessionState::Terminated;
            record.updated_at = now;
            record.route_prefix = None;
            record.end_reason = Some("server_restart".to_string());
            save_record(&tx, &record)?;
            reaped += 1;
        }
        tx.commit()?;
    }

    if reaped > 0 {
        info!(
            component = "persistence",
            event = "persistence.reaped",
            count = reaped,
            "Marked sessions from a previous run as terminated"
        );
    }
    Ok(reaped)
}
