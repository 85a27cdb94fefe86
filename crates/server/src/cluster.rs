//! Cluster-wide defaults and the per-kind descriptor every supervisor is
//! parameterised by.
//!
//! `ClusterContext` is built once at startup and shared read-only behind an
//! `Arc`. `merge_spec` layers a client's `SessionSpec` over the defaults of a
//! kind, field by field.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use ntsc_protocol::{SessionKind, SessionSpec};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// OS identity spawned workers run as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUserGroup {
    pub user: String,
    #[serde(default)]
    pub uid: Option<u32>,
    pub group: String,
    #[serde(default)]
    pub gid: Option<u32>,
}

impl Default for AgentUserGroup {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            uid: None,
            group: "root".to_string(),
            gid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub slots: u32,
    pub cpus: f64,
    pub memory_mb: u64,
    pub shm_size_mb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            slots: 0,
            cpus: 1.0,
            memory_mb: 4096,
            shm_size_mb: 64,
        }
    }
}

/// Container settings applied to every session unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDefaults {
    pub image: String,
    pub environment: BTreeMap<String, String>,
    pub resources: Resources,
    pub work_dir: Option<String>,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            image: "ntsc/environment:cpu".to_string(),
            environment: BTreeMap::new(),
            resources: Resources::default(),
            work_dir: None,
        }
    }
}

/// Default entrypoint for each session kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindEntrypoints {
    pub command: Vec<String>,
    pub notebook: Vec<String>,
    pub shell: Vec<String>,
    pub dashboard: Vec<String>,
}

impl Default for KindEntrypoints {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(|a| a.to_string()).collect();
        Self {
            command: argv(&["sh", "-c", "cat"]),
            notebook: argv(&["jupyter", "lab", "--no-browser", "--ip=0.0.0.0"]),
            shell: argv(&["sh", "-i"]),
            dashboard: argv(&["tensorboard", "--logdir", "/tmp/tensorboard", "--bind_all"]),
        }
    }
}

impl KindEntrypoints {
    pub fn for_kind(&self, kind: SessionKind) -> &[String] {
        match kind {
            SessionKind::Command => &self.command,
            SessionKind::Notebook => &self.notebook,
            SessionKind::Shell => &self.shell,
            SessionKind::Dashboard => &self.dashboard,
        }
    }
}

/// Immutable cluster settings shared by all supervisors.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub cluster_id: String,
    pub agent_user_group: AgentUserGroup,
    pub container_defaults: ContainerDefaults,
    pub entrypoints: KindEntrypoints,
    /// Bridge wait for every kind except dashboards
    pub request_timeout: Duration,
    /// Bridge wait for dashboard requests (long-poll style)
    pub dashboard_timeout: Duration,
}

impl ClusterContext {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            agent_user_group: AgentUserGroup::default(),
            container_defaults: ContainerDefaults::default(),
            entrypoints: KindEntrypoints::default(),
            request_timeout: Duration::from_secs(30),
            dashboard_timeout: Duration::from_secs(60),
        }
    }

    /// Effective settings of a session of `kind` created with an empty spec.
    pub fn defaults_for(&self, kind: SessionKind) -> EffectiveSpec {
        let container = &self.container_defaults;
        EffectiveSpec {
            image: container.image.clone(),
            entrypoint: self.entrypoints.for_kind(kind).to_vec(),
            environment: container.environment.clone(),
            resources: container.resources.clone(),
            work_dir: container.work_dir.clone(),
            description: None,
            user: self.agent_user_group.clone(),
        }
    }

    pub fn descriptor(&self, kind: SessionKind) -> KindDescriptor {
        KindDescriptor {
            kind,
            proxied: kind == SessionKind::Dashboard,
            dispatch_timeout: match kind {
                SessionKind::Dashboard => self.dashboard_timeout,
                _ => self.request_timeout,
            },
            defaults: self.defaults_for(kind),
        }
    }
}

/// Everything that distinguishes one supervisor from another.
#[derive(Debug, Clone)]
pub struct KindDescriptor {
    pub kind: SessionKind,
    /// Whether running sessions register a reverse-proxy route
    pub proxied: bool,
    pub dispatch_timeout: Duration,
    pub defaults: EffectiveSpec,
}

/// Settings a worker is actually provisioned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSpec {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub resources: Resources,
    pub work_dir: Option<String>,
    pub description: Option<String>,
    pub user: AgentUserGroup,
}

/// Layer `spec` over `defaults`. Present fields win; environment merges
/// key by key. The result is validated before it is returned.
pub fn merge_spec(defaults: &EffectiveSpec, spec: &SessionSpec) -> SessionResult<EffectiveSpec> {
    let mut merged = defaults.clone();

    if let Some(image) = &spec.image {
        merged.image = image.clone();
    }
    if let Some(entrypoint) = &spec.entrypoint {
        merged.entrypoint = entrypoint.clone();
    }
    if let Some(environment) = &spec.environment {
        for (key, value) in environment {
            merged.environment.insert(key.clone(), value.clone());
        }
    }
    if let Some(slots) = spec.slots {
        merged.resources.slots = slots;
    }
    if let Some(cpus) = spec.cpus {
        merged.resources.cpus = cpus;
    }
    if let Some(memory_mb) = spec.memory_mb {
        merged.resources.memory_mb = memory_mb;
    }
    if let Some(shm_size_mb) = spec.shm_size_mb {
        merged.resources.shm_size_mb = shm_size_mb;
    }
    if let Some(work_dir) = &spec.work_dir {
        merged.work_dir = Some(work_dir.clone());
    }
    if let Some(description) = &spec.description {
        merged.description = Some(description.clone());
    }

    validate(&merged)?;
    Ok(merged)
}

fn validate(spec: &EffectiveSpec) -> SessionResult<()> {
    if spec.image.trim().is_empty() {
        return Err(invalid("image must not be empty"));
    }
    match spec.entrypoint.first() {
        Some(program) if !program.trim().is_empty() => {}
        _ => return Err(invalid("entrypoint must name a program")),
    }
    for key in spec.environment.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(invalid(format!("invalid environment variable name {key:?}")));
        }
    }
    let resources = &spec.resources;
    if !resources.cpus.is_finite() || resources.cpus <= 0.0 {
        return Err(invalid("cpus must be a positive number"));
    }
    if resources.memory_mb == 0 {
        return Err(invalid("memory_mb must be positive"));
    }
    if resources.shm_size_mb > resources.memory_mb {
        return Err(invalid("shm_size_mb cannot exceed memory_mb"));
    }
    if let Some(dir) = &spec.work_dir {
        if !Path::new(dir).is_absolute() {
            return Err(invalid(format!("work_dir must be absolute, got {dir:?}")));
        }
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::InvalidSpec(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ClusterContext {
        ClusterContext::new("test-cluster")
    }

    #[test]
    fn empty_spec_yields_defaults_exactly() {
        let ctx = context();
        for kind in SessionKind::ALL {
            let defaults = ctx.defaults_for(kind);
            let merged = merge_spec(&defaults, &SessionSpec::default()).unwrap();
            assert_eq!(merged, defaults, "{kind}");
        }
    }

    #[test]
    fn single_override_changes_only_that_field() {
        let defaults = context().defaults_for(SessionKind::Notebook);
        let spec = SessionSpec {
            image: Some("custom/image:1".to_string()),
            ..Default::default()
        };

        let merged = merge_spec(&defaults, &spec).unwrap();
        assert_eq!(merged.image, "custom/image:1");

        let mut expected = defaults.clone();
        expected.image = "custom/image:1".to_string();
        assert_eq!(merged, expected);
    }

    #[test]
    fn environment_merges_key_by_key() {
        let mut ctx = context();
        ctx.container_defaults
            .environment
            .insert("A".to_string(), "1".to_string());
        ctx.container_defaults
            .environment
            .insert("B".to_string(), "2".to_string());
        let defaults = ctx.defaults_for(SessionKind::Shell);

        let spec = SessionSpec {
            environment: Some(BTreeMap::from([
                ("B".to_string(), "override".to_string()),
                ("C".to_string(), "3".to_string()),
            ])),
            ..Default::default()
        };

        let merged = merge_spec(&defaults, &spec).unwrap();
        assert_eq!(merged.environment["A"], "1");
        assert_eq!(merged.environment["B"], "override");
        assert_eq!(merged.environment["C"], "3");
    }

    #[test]
    fn malformed_resources_are_rejected() {
        let defaults = context().defaults_for(SessionKind::Command);
        let bad_specs = [
            SessionSpec {
                cpus: Some(0.0),
                ..Default::default()
            },
            SessionSpec {
                cpus: Some(f64::NAN),
                ..Default::default()
            },
            SessionSpec {
                memory_mb: Some(0),
                ..Default::default()
            },
            SessionSpec {
                memory_mb: Some(128),
                shm_size_mb: Some(256),
                ..Default::default()
            },
            SessionSpec {
                image: Some("  ".to_string()),
                ..Default::default()
            },
            SessionSpec {
                entrypoint: Some(vec![]),
                ..Default::default()
            },
            SessionSpec {
                work_dir: Some("relative/dir".to_string()),
                ..Default::default()
            },
            SessionSpec {
                environment: Some(BTreeMap::from([("A=B".to_string(), "x".to_string())])),
                ..Default::default()
            },
        ];

        for spec in bad_specs {
            let err = merge_spec(&defaults, &spec).unwrap_err();
            assert!(matches!(err, SessionError::InvalidSpec(_)), "{spec:?}");
        }
    }

    #[test]
    fn only_dashboards_are_proxied_and_use_the_dashboard_timeout() {
        let mut ctx = context();
        ctx.dashboard_timeout = Duration::from_secs(7);
        ctx.request_timeout = Duration::from_secs(3);

        let dashboard = ctx.descriptor(SessionKind::Dashboard);
        assert!(dashboard.proxied);
        assert_eq!(dashboard.dispatch_timeout, Duration::from_secs(7));

        for kind in [SessionKind::Command, SessionKind::Notebook, SessionKind::Shell] {
            let descriptor = ctx.descriptor(kind);
            assert!(!descriptor.proxied);
            assert_eq!(descriptor.dispatch_timeout, Duration::from_secs(3));
        }
    }
}
