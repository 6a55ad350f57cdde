//! Live migration between agents.
//!
//! Migration is run by the source agent:
//!
//! 1. connect to the target and refuse if it already has the container
//! 2. checkpoint locally, stopping the source if it will be stopped or deleted
//! 3. push the checkpoint to its registry
//! 4. ask the target to restore from that reference
//! 5. delete the source if requested
//!
//! The local checkpoint image is removed afterwards whether or not the move
//! succeeded.
//!
//! Migration is not atomic. If the push or the remote restore fails, the
//! source stays as the checkpoint left it (stopped, if requested) and is not
//! deleted; the caller retries or recovers by starting it again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::AgentClient;
use crate::error::{AgentError, AgentResult, StageError};
use crate::supervisor::Supervisor;

/// The operations migration needs from a target agent.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Whether the target already has a container with this ID.
    async fn exists(&self, id: &str) -> AgentResult<bool>;

    /// Restore a checkpoint on the target.
    async fn restore(&self, reference: &str, live: bool) -> AgentResult<()>;
}

/// Resolves a target address to a [`Peer`].
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, address: &str) -> AgentResult<Arc<dyn Peer>>;
}

/// Reaches peers over their HTTP RPC surface.
#[derive(Debug, Default)]
pub struct HttpPeerConnector;

impl HttpPeerConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for HttpPeerConnector {
    async fn connect(&self, address: &str) -> AgentResult<Arc<dyn Peer>> {
        let base_url = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let client = AgentClient::new(base_url);
        client
            .health()
            .await
            .map_err(|e| remote("connect to migration target", e))?;
        Ok(Arc::new(client))
    }
}

/// Peers known by address, for agents wired together in one process.
#[derive(Default)]
pub struct PeerMap {
    peers: HashMap<String, Arc<dyn Peer>>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, address: impl Into<String>, peer: Arc<dyn Peer>) -> Self {
        self.peers.insert(address.into(), peer);
        self
    }
}

#[async_trait]
impl PeerConnector for PeerMap {
    async fn connect(&self, address: &str) -> AgentResult<Arc<dyn Peer>> {
        self.peers.get(address).cloned().ok_or_else(|| {
            AgentError::stage(
                "connect to migration target",
                StageError::Remote(format!("unknown agent {address}")),
            )
        })
    }
}

#[async_trait]
impl Peer for AgentClient {
    async fn exists(&self, id: &str) -> AgentResult<bool> {
        self.get(id)
            .await
            .map(|info| info.is_some())
            .map_err(|e| remote("query migration target", e))
    }

    async fn restore(&self, reference: &str, live: bool) -> AgentResult<()> {
        AgentClient::restore(self, reference, live)
            .await
            .map_err(|e| remote("restore on migration target", e))
    }
}

#[async_trait]
impl Peer for Supervisor {
    async fn exists(&self, id: &str) -> AgentResult<bool> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(AgentError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn restore(&self, reference: &str, live: bool) -> AgentResult<()> {
        Supervisor::restore(self, reference, live).await
    }
}

fn remote(stage: &'static str, err: anyhow::Error) -> AgentError {
    AgentError::stage(stage, StageError::Remote(format!("{err:#}")))
}

/// Options for [`Supervisor::migrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateRequest {
    pub id: String,
    /// Address of the target agent.
    pub to: String,
    /// Registry reference the checkpoint travels through.
    pub reference: String,
    pub live: bool,
    /// Stop the source once checkpointed.
    pub stop: bool,
    /// Delete the source once the target has restored it.
    pub delete: bool,
}

impl Supervisor {
    /// Move a container to another agent.
    pub async fn migrate(&self, request: &MigrateRequest) -> AgentResult<()> {
        let id = request.id.as_str();
        let reference = request.reference.as_str();
        if id.is_empty() {
            return Err(AgentError::NoId);
        }
        if reference.is_empty() {
            return Err(AgentError::NoRef);
        }
        if request.to.is_empty() {
            return Err(AgentError::InvalidConfig(
                "migration target must not be empty".to_string(),
            ));
        }

        let peer = self.peers().connect(&request.to).await?;
        if peer.exists(id).await? {
            return Err(AgentError::ServiceExistsOnTarget(id.to_string()));
        }

        let exit = request.stop || request.delete;
        self.checkpoint(id, reference, request.live, exit).await?;

        let moved = self.hand_over(peer.as_ref(), request).await;

        if let Err(e) = self.runtime().delete_image(reference).await {
            if !e.is_not_found() {
                warn!(reference = %reference, error = %e, "Failed to remove local checkpoint image");
            }
        }

        match &moved {
            Ok(()) => info!(
                container_id = %id,
                to = %request.to,
                reference = %reference,
                live = request.live,
                "Migrated container"
            ),
            Err(e) => warn!(
                container_id = %id,
                to = %request.to,
                error = %e,
                source_stopped = exit,
                "Migration failed, source left as checkpointed"
            ),
        }
        moved
    }

    async fn hand_over(&self, peer: &dyn Peer, request: &MigrateRequest) -> AgentResult<()> {
        self.push(&request.reference).await?;
        peer.restore(&request.reference, request.live).await?;
        if request.delete {
            self.delete(&request.id).await?;
        }
        Ok(())
    }
}
