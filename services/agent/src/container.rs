//! Declared container configuration.
//!
//! A [`Container`] is what callers hand to Create/Update. The supervisor never
//! keeps its own copy: it is serialized onto the runtime's container record as
//! the `current` extension, and the previous version is kept as `previous`
//! for Rollback.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::runtime::{MountSpec, ProcessSpec, ResourceSpec, RuntimeSpec};

/// Default open-file limit applied when none is declared.
pub const DEFAULT_NO_FILE: u64 = 1024;

/// Declared configuration of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub process: Process,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub configs: Vec<ConfigFile>,
    #[serde(default)]
    pub networks: Vec<NetworkDecl>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub cwd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub masked_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    #[default]
    Bind,
    Tmpfs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(default)]
    pub kind: MountKind,
    #[serde(default)]
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// A named file rendered on the host and bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_config_mode")]
    pub mode: u32,
}

fn default_config_mode() -> u32 {
    0o444
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    None,
    Host,
    Managed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDecl {
    #[serde(default)]
    pub kind: NetworkKind,
    /// Plugin network name for managed networks.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    "eth0".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_shares: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub oom_score: i32,
    #[serde(default)]
    pub no_file: u64,
}

impl Container {
    /// Minimal container running `image` under `id`.
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            process: Process::default(),
            security: Security::default(),
            mounts: Vec::new(),
            configs: Vec::new(),
            networks: Vec::new(),
            resources: Resources::default(),
            labels: BTreeMap::new(),
        }
    }

    /// Reject configs that cannot be acted on. Performs no I/O.
    pub fn validate(&self) -> AgentResult<()> {
        if self.id.is_empty() {
            return Err(AgentError::NoId);
        }
        if self.image.is_empty() {
            return Err(AgentError::NoRef);
        }
        for mount in &self.mounts {
            if mount.destination.is_empty() {
                return Err(AgentError::InvalidConfig(
                    "mount destination must not be empty".to_string(),
                ));
            }
            if mount.kind == MountKind::Bind && mount.source.is_empty() {
                return Err(AgentError::InvalidConfig(format!(
                    "bind mount {} has no source",
                    mount.destination
                )));
            }
        }
        for config in &self.configs {
            if config.name.is_empty() || config.name.contains('/') {
                return Err(AgentError::InvalidConfig(format!(
                    "invalid config file name '{}'",
                    config.name
                )));
            }
        }
        Ok(())
    }

    /// Fill unset process and resource fields with their defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.process.cwd.is_empty() {
            self.process.cwd = "/".to_string();
        }
        if self.resources.no_file == 0 {
            self.resources.no_file = DEFAULT_NO_FILE;
        }
        for network in &mut self.networks {
            if network.interface.is_empty() {
                network.interface = default_interface();
            }
        }
        self
    }

    /// The network declaration that decides how this container is attached.
    pub fn primary_network(&self) -> Option<&NetworkDecl> {
        self.networks.first()
    }

    /// Host sources of bind mounts.
    pub fn bind_sources(&self) -> impl Iterator<Item = &str> {
        self.mounts
            .iter()
            .filter(|m| m.kind == MountKind::Bind)
            .map(|m| m.source.as_str())
    }

    pub fn to_json(&self) -> AgentResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AgentError::InvalidConfig(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> AgentResult<Self> {
        serde_json::from_slice(data).map_err(|e| AgentError::InvalidConfig(e.to_string()))
    }
}

/// Host path a config file is rendered to.
pub fn config_file_path(config_dir: &Path, config: &ConfigFile) -> PathBuf {
    config_dir.join(&config.name)
}

/// Render the runtime spec for a container.
///
/// `config_dir` is where this container's config files are rendered on the
/// host; `netns` is the network namespace path, absent for host networking.
pub fn render_spec(container: &Container, config_dir: &Path, netns: Option<String>) -> RuntimeSpec {
    let mut capabilities = container.security.capabilities.clone();
    capabilities.sort();
    capabilities.dedup();

    let mut mounts: Vec<MountSpec> = container
        .mounts
        .iter()
        .map(|m| {
            let mut options = m.options.clone();
            if m.kind == MountKind::Bind && !options.iter().any(|o| o == "rbind") {
                options.push("rbind".to_string());
            }
            options.push(if m.read_only { "ro" } else { "rw" }.to_string());
            MountSpec {
                kind: match m.kind {
                    MountKind::Bind => "bind",
                    MountKind::Tmpfs => "tmpfs",
                }
                .to_string(),
                source: match m.kind {
                    MountKind::Bind => m.source.clone(),
                    MountKind::Tmpfs => "tmpfs".to_string(),
                },
                destination: m.destination.clone(),
                options,
            }
        })
        .collect();

    mounts.extend(container.configs.iter().map(|c| MountSpec {
        kind: "bind".to_string(),
        source: config_file_path(config_dir, c).display().to_string(),
        destination: c.path.clone(),
        options: vec!["rbind".to_string(), "ro".to_string()],
    }));

    RuntimeSpec {
        hostname: container.id.clone(),
        process: ProcessSpec {
            args: container.process.args.clone(),
            env: container.process.env.clone(),
            uid: container.process.uid,
            gid: container.process.gid,
            terminal: container.process.pty,
            cwd: container.process.cwd.clone(),
            capabilities,
            no_file: container.resources.no_file,
        },
        privileged: container.security.privileged,
        masked_paths: container.security.masked_paths.clone(),
        mounts,
        resources: ResourceSpec {
            cpu_shares: container.resources.cpu_shares,
            memory_limit: container.resources.memory_bytes,
            oom_score_adj: container.resources.oom_score,
        },
        netns,
    }
}
