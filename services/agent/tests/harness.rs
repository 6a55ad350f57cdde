//! Test harness for agent integration tests.
//!
//! Builds agents over the in-memory runtime. Agents built from the same
//! [`MemoryRegistry`] push and pull through it, which is how migration
//! tests move checkpoints between two "nodes" in one process.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use berth_agent::api::{self, AppState};
use berth_agent::container::{Mount, MountKind, NetworkDecl, NetworkKind};
use berth_agent::migrate::{HttpPeerConnector, PeerMap};
use berth_agent::network::{NetworkError, PluginRequest, PluginResult, PluginRunner};
use berth_agent::runtime::{Runtime, TaskStatus};
use berth_agent::{
    Container, DesiredStateStore, MemoryRegistry, MemoryRuntime, Supervisor, SupervisorConfig,
};
use berth_reconcile::DesiredStatus;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const IMAGE: &str = "registry.local/app:v1";
pub const IMAGE_V2: &str = "registry.local/app:v2";

/// A registry holding two versions of the test image.
pub fn registry() -> Arc<MemoryRegistry> {
    let registry = MemoryRegistry::new();
    registry
        .publish_image(
            IMAGE,
            &[
                ("/etc/os-release", b"ID=berth\nVERSION=1\n"),
                ("/bin/app", b"\x7fELF-v1"),
                ("/srv/motd", b"hello"),
            ],
        )
        .unwrap();
    registry
        .publish_image(
            IMAGE_V2,
            &[
                ("/etc/os-release", b"ID=berth\nVERSION=2\n"),
                ("/bin/app", b"\x7fELF-v2"),
            ],
        )
        .unwrap();
    registry
}

/// One agent: a supervisor, its runtime and its on-disk state.
pub struct TestAgent {
    pub node: String,
    pub runtime: Arc<MemoryRuntime>,
    pub desired: Arc<DesiredStateStore>,
    pub supervisor: Arc<Supervisor>,
    pub data_dir: TempDir,
}

impl TestAgent {
    pub fn new(registry: &Arc<MemoryRegistry>, node: &str) -> Self {
        Self::build(registry, node, |config| config, |supervisor| supervisor)
    }

    /// An agent that can migrate to the given peers.
    pub fn with_peers(registry: &Arc<MemoryRegistry>, node: &str, peers: PeerMap) -> Self {
        Self::build(registry, node, |config| config, |supervisor| {
            supervisor.with_peer_connector(Arc::new(peers))
        })
    }

    /// An agent that reaches migration targets over HTTP.
    pub fn with_http_peers(registry: &Arc<MemoryRegistry>, node: &str) -> Self {
        Self::build(registry, node, |config| config, |supervisor| {
            supervisor.with_peer_connector(Arc::new(HttpPeerConnector::new()))
        })
    }

    /// An agent whose managed networks go through `plugins`.
    pub fn with_plugins(
        registry: &Arc<MemoryRegistry>,
        node: &str,
        plugins: Arc<dyn PluginRunner>,
    ) -> Self {
        Self::build(registry, node, |config| config, |supervisor| {
            supervisor.with_plugin_runner(plugins)
        })
    }

    pub fn with_config(
        registry: &Arc<MemoryRegistry>,
        node: &str,
        configure: impl FnOnce(SupervisorConfig) -> SupervisorConfig,
    ) -> Self {
        Self::build(registry, node, configure, |supervisor| supervisor)
    }

    fn build(
        registry: &Arc<MemoryRegistry>,
        node: &str,
        configure: impl FnOnce(SupervisorConfig) -> SupervisorConfig,
        wire: impl FnOnce(Supervisor) -> Supervisor,
    ) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::new(Arc::clone(registry)));
        let desired = Arc::new(DesiredStateStore::open_in_memory().unwrap());
        let config = configure(SupervisorConfig::new(node, data_dir.path()));

        let supervisor = Supervisor::new(
            Arc::clone(&runtime) as Arc<dyn Runtime>,
            Arc::clone(&desired),
            config,
            data_dir.path().join("plugins"),
        )
        .with_peer_connector(Arc::new(PeerMap::new()));

        Self {
            node: node.to_string(),
            runtime,
            desired,
            supervisor: Arc::new(wire(supervisor)),
            data_dir,
        }
    }

    /// Task status, `None` when the container has no task.
    pub async fn task(&self, id: &str) -> Option<TaskStatus> {
        self.runtime.task_status(id).await.ok()
    }

    pub fn desired(&self, id: &str) -> Option<DesiredStatus> {
        self.desired.get(id).unwrap()
    }

    /// The declared configuration stored on the container record.
    pub async fn declared(&self, id: &str) -> Container {
        let record = self.runtime.load_container(id).await.unwrap();
        let data = record
            .extensions
            .get(berth_agent::supervisor::EXT_CURRENT)
            .expect("record has a declared configuration");
        Container::from_json(data).unwrap()
    }

    /// Serve the agent's HTTP surface on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = api::create_router(AppState::new(Arc::clone(&self.supervisor)));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

/// A container with a bind mount, resource limits and a config file.
pub fn web_container(id: &str, bind_source: &std::path::Path) -> Container {
    let mut container = Container::new(id, IMAGE);
    container.process.args = vec!["/bin/app".to_string(), "--serve".to_string()];
    container.process.env = vec!["PORT=8080".to_string()];
    container.mounts.push(Mount {
        kind: MountKind::Bind,
        source: bind_source.display().to_string(),
        destination: "/data".to_string(),
        options: vec!["rbind".to_string()],
        read_only: false,
    });
    container.resources.memory_bytes = 256 * 1024 * 1024;
    container.resources.cpu_shares = 512;
    container
}

/// Records plugin calls and hands out a fixed address.
#[derive(Default)]
pub struct RecordingPlugins {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingPlugins {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginRunner for RecordingPlugins {
    async fn add(&self, request: &PluginRequest) -> Result<PluginResult, NetworkError> {
        self.calls.lock().unwrap().push(format!("ADD {}", request.container_id));
        Ok(PluginResult {
            address: "10.88.0.7".to_string(),
        })
    }

    async fn del(&self, request: &PluginRequest) -> Result<(), NetworkError> {
        self.calls.lock().unwrap().push(format!("DEL {}", request.container_id));
        Ok(())
    }
}

/// A container on the managed network `bridge`.
pub fn managed_container(id: &str) -> Container {
    let mut container = Container::new(id, IMAGE);
    container.networks.push(NetworkDecl {
        kind: NetworkKind::Managed,
        name: "bridge".to_string(),
        interface: "eth0".to_string(),
    });
    container
}
