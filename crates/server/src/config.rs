//! Optional TOML file carrying cluster defaults.
//!
//! Every key is optional; a missing file section falls back to the built-in
//! defaults of `ClusterContext::new`.
//!
//! ```toml
//! request_timeout_secs = 30
//! dashboard_timeout_secs = 60
//!
//! [agent_user_group]
//! user = "ntsc"
//! uid = 1000
//! group = "ntsc"
//! gid = 1000
//!
//! [container_defaults]
//! image = "ntsc/environment:cpu"
//! work_dir = "/srv/work"
//!
//! [container_defaults.resources]
//! cpus = 2.0
//! memory_mb = 8192
//!
//! [entrypoints]
//! shell = ["bash", "-i"]
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::cluster::{AgentUserGroup, ClusterContext, ContainerDefaults, KindEntrypoints};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub agent_user_group: Option<AgentUserGroup>,
    pub container_defaults: Option<ContainerDefaults>,
    pub entrypoints: Option<KindEntrypoints>,
    pub request_timeout_secs: Option<u64>,
    pub dashboard_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid cluster config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw)
    }

    /// Build the immutable context handed to every supervisor.
    pub fn into_cluster_context(self, cluster_id: impl Into<String>) -> ClusterContext {
        let mut ctx = ClusterContext::new(cluster_id);
        if let Some(group) = self.agent_user_group {
            ctx.agent_user_group = group;
        }
        if let Some(defaults) = self.container_defaults {
            ctx.container_defaults = defaults;
        }
        if let Some(entrypoints) = self.entrypoints {
            ctx.entrypoints = entrypoints;
        }
        if let Some(secs) = self.request_timeout_secs {
            ctx.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.dashboard_timeout_secs {
            ctx.dashboard_timeout = Duration::from_secs(secs);
        }
        ctx
    }
}
