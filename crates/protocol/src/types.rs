//! Core types shared across the protocol

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Command,
    Notebook,
    Shell,
    Dashboard,
}

impl SessionKind {
    pub const ALL: [SessionKind; 4] = [
        SessionKind::Command,
        SessionKind::Notebook,
        SessionKind::Shell,
        SessionKind::Dashboard,
    ];

    /// URL segment the kind's supervisor is mounted under.
    pub fn path_segment(self) -> &'static str {
        match self {
            SessionKind::Command => "commands",
            SessionKind::Notebook => "notebooks",
            SessionKind::Shell => "shells",
            SessionKind::Dashboard => "tensorboard",
        }
    }

    /// Resolve a URL segment back to its kind.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.path_segment() == segment)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Command => "command",
            SessionKind::Notebook => "notebook",
            SessionKind::Shell => "shell",
            SessionKind::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Terminated => "terminated",
        }
    }

    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a session for list and detail views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Externally visible proxy prefix (dashboards only, while registered)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,
    /// Set when the session runs but its proxy route could not be registered
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub proxy_degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}
