//! Container supervisor.
//!
//! The supervisor turns agent RPCs into runtime calls:
//!
//! - `lifecycle`: Create, Start, Stop, Delete, Kill, Update, Rollback, Push
//! - `checkpoint`: Checkpoint and Restore
//! - `info`: Get and List
//! - `guard`: the pause-guarded mutation helper
//!
//! It keeps no container state of its own. Every operation re-reads the
//! runtime's container record, which carries the declared configuration as
//! an extension. Desired status lives in the [`DesiredStateStore`].

mod changes;
mod checkpoint;
mod guard;
mod info;
mod lifecycle;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_reconcile::DesiredStatus;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{Config, RegistryPolicy};
use crate::container::{render_spec, Container};
use crate::error::{AgentError, AgentResult, StageExt};
use crate::migrate::{HttpPeerConnector, PeerConnector};
use crate::network::{CommandPluginRunner, NetworkBinder, PluginRunner};
use crate::runtime::{ContainerRecord, Image, Runtime, TaskStatus};
use crate::state::DesiredStateStore;

pub use changes::Change;
pub use checkpoint::CheckpointedContainer;
pub use info::{ContainerInfo, ContainerMetrics, SnapshotSummary};

/// Extension holding the active declared configuration.
pub const EXT_CURRENT: &str = "io.berth.container.current";

/// Extension holding the configuration replaced by the last Update.
pub const EXT_PREVIOUS: &str = "io.berth.container.previous";

/// Extension pointing at the runtime checkpoint the next task resumes from.
pub const EXT_RESTORE: &str = "io.berth.checkpoint.restore";

/// Label holding the address assigned at the last Start.
pub const LABEL_ADDRESS: &str = "io.berth.network.address";

/// Label holding the current snapshot revision.
pub const LABEL_REVISION: &str = "io.berth.snapshot.revision";

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Name of this node, recorded in checkpoint annotations.
    pub node_name: String,

    /// Config files are rendered under `{data_dir}/configs/{id}`.
    pub data_dir: PathBuf,

    /// Network namespaces live at `{netns_dir}/{id}`.
    pub netns_dir: PathBuf,

    /// Bounded wait for task exit in Update and Rollback.
    pub update_timeout: Duration,

    /// Bounded wait for graceful exit in Stop.
    pub stop_timeout: Duration,

    pub registry_policy: RegistryPolicy,
}

impl SupervisorConfig {
    pub fn new(node_name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            node_name: node_name.into(),
            netns_dir: data_dir.join("netns"),
            data_dir,
            update_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            registry_policy: RegistryPolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            node_name: config.node_name.clone(),
            data_dir: config.data_dir.clone(),
            netns_dir: config.netns_dir.clone(),
            update_timeout: config.update_timeout(),
            stop_timeout: config.stop_timeout(),
            registry_policy: config.registry_policy.clone(),
        }
    }

    pub fn with_registry_policy(mut self, policy: RegistryPolicy) -> Self {
        self.registry_policy = policy;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn config_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join("configs").join(id)
    }
}

/// Node-local container supervisor.
pub struct Supervisor {
    runtime: Arc<dyn Runtime>,
    desired: Arc<DesiredStateStore>,
    plugins: Arc<dyn PluginRunner>,
    peers: Arc<dyn PeerConnector>,
    config: SupervisorConfig,
    /// Serializes reconciliation ticks.
    reconcile_lock: Mutex<()>,
}

impl Supervisor {
    /// Create a supervisor that runs network plugins from `plugin_dir` and
    /// reaches migration targets over HTTP.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        desired: Arc<DesiredStateStore>,
        config: SupervisorConfig,
        plugin_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            desired,
            plugins: Arc::new(CommandPluginRunner::new(plugin_dir)),
            peers: Arc::new(HttpPeerConnector::new()),
            config,
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn with_plugin_runner(mut self, plugins: Arc<dyn PluginRunner>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_peer_connector(mut self, peers: Arc<dyn PeerConnector>) -> Self {
        self.peers = peers;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn desired_state(&self) -> &Arc<DesiredStateStore> {
        &self.desired
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub(crate) fn peers(&self) -> &Arc<dyn PeerConnector> {
        &self.peers
    }

    pub(crate) fn reconcile_lock(&self) -> &Mutex<()> {
        &self.reconcile_lock
    }

    /// Load a container record and its declared configuration.
    async fn load(&self, id: &str) -> AgentResult<(ContainerRecord, Container)> {
        if id.is_empty() {
            return Err(AgentError::NoId);
        }

        let record = match self.runtime.load_container(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(AgentError::NotFound(id.to_string())),
            Err(e) => return Err(AgentError::stage("load container", e)),
        };

        let container = declared_config(&record)?;
        Ok((record, container))
    }

    async fn exists(&self, id: &str) -> AgentResult<bool> {
        match self.runtime.load_container(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(AgentError::stage("load container", e)),
        }
    }

    /// Task status, `None` when the container has no task.
    pub(crate) async fn task_status(&self, id: &str) -> AgentResult<Option<TaskStatus>> {
        match self.runtime.task_status(id).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(AgentError::stage("load task", e)),
        }
    }

    /// Pull an image through the registry policy.
    async fn pull(&self, reference: &str) -> AgentResult<Image> {
        let opts = self.config.registry_policy.options_for(reference);
        debug!(reference = %reference, plain_http = opts.plain_http, "Pulling image");
        self.runtime.pull(reference, opts).await.stage("pull image")
    }

    /// Use a local image if present, otherwise pull it.
    async fn ensure_image(&self, reference: &str) -> AgentResult<Image> {
        match self.runtime.get_image(reference).await {
            Ok(image) => Ok(image),
            Err(e) if e.is_not_found() => self.pull(reference).await,
            Err(e) => Err(AgentError::stage("load image", e)),
        }
    }

    /// Create a container record on a fresh snapshot of its image.
    ///
    /// The image must already be pulled. `extensions` are added next to the
    /// declared configuration.
    async fn create_record(
        &self,
        container: &Container,
        extensions: BTreeMap<String, Vec<u8>>,
    ) -> AgentResult<ContainerRecord> {
        let snapshot_key = snapshot_key(&container.id, 0);
        self.runtime
            .prepare_snapshot(&snapshot_key, &container.image)
            .await
            .stage("prepare snapshot")?;

        let binder = NetworkBinder::resolve(container, &self.plugins);
        let netns = binder.netns_path(&self.config.netns_dir, &container.id);

        let mut record = ContainerRecord {
            id: container.id.clone(),
            image: container.image.clone(),
            snapshot_key,
            spec: render_spec(container, &self.config.config_dir(&container.id), netns),
            labels: BTreeMap::from([(LABEL_REVISION.to_string(), "0".to_string())]),
            extensions,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        record
            .extensions
            .insert(EXT_CURRENT.to_string(), container.to_json()?);

        let record = self
            .runtime
            .create_container(record)
            .await
            .stage("create container")?;

        info!(container_id = %container.id, image = %container.image, "Created container");
        Ok(record)
    }

    fn set_desired(&self, id: &str, status: DesiredStatus) -> AgentResult<()> {
        self.desired.set(id, status).stage("record desired state")
    }
}

/// The declared configuration stored on a record.
pub(crate) fn declared_config(record: &ContainerRecord) -> AgentResult<Container> {
    let data = record.extensions.get(EXT_CURRENT).ok_or_else(|| {
        AgentError::InvalidConfig(format!("container {} has no declared configuration", record.id))
    })?;
    Container::from_json(data)
}

fn snapshot_key(id: &str, revision: u64) -> String {
    format!("{id}-r{revision}")
}

/// Revision recorded on a container record.
fn revision(record: &ContainerRecord) -> u64 {
    record
        .labels
        .get(LABEL_REVISION)
        .and_then(|r| r.parse().ok())
        .unwrap_or(0)
}
