//! Network attachment for containers.
//!
//! Each container is attached according to its first network declaration:
//!
//! - `none`: a private, unconfigured network namespace; no address
//! - `host`: the host network namespace; no address
//! - `managed`: a private namespace configured by a network plugin, which
//!   assigns the address
//!
//! The set of kinds is closed, so the binder is an enum resolved once per
//! Start and dispatched on directly.

mod plugin;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::container::{Container, NetworkKind};

pub use plugin::{CommandPluginRunner, PluginRequest, PluginResult, PluginRunner};

/// Errors from network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network plugin {0} not found")]
    PluginNotFound(String),

    #[error("network plugin {plugin} failed (code {code}): {message}")]
    Plugin {
        plugin: String,
        code: i64,
        message: String,
    },

    #[error("invalid plugin result: {0}")]
    InvalidResult(String),

    #[error("managed network declared without a name")]
    MissingName,

    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How a container's network is set up and torn down.
pub enum NetworkBinder {
    None,
    Host,
    Managed(ManagedNetwork),
}

/// A plugin-managed network attachment.
pub struct ManagedNetwork {
    network: String,
    interface: String,
    runner: Arc<dyn PluginRunner>,
}

impl NetworkBinder {
    /// Pick the binder for a container's first network declaration.
    pub fn resolve(container: &Container, runner: &Arc<dyn PluginRunner>) -> Self {
        match container.primary_network() {
            None => Self::None,
            Some(decl) => match decl.kind {
                NetworkKind::None => Self::None,
                NetworkKind::Host => Self::Host,
                NetworkKind::Managed => Self::Managed(ManagedNetwork {
                    network: decl.name.clone(),
                    interface: decl.interface.clone(),
                    runner: Arc::clone(runner),
                }),
            },
        }
    }

    pub fn kind(&self) -> NetworkKind {
        match self {
            Self::None => NetworkKind::None,
            Self::Host => NetworkKind::Host,
            Self::Managed(_) => NetworkKind::Managed,
        }
    }

    /// Network namespace path for a container. Host networking has none.
    pub fn netns_path(&self, netns_dir: &Path, container_id: &str) -> Option<String> {
        match self {
            Self::Host => None,
            Self::None | Self::Managed(_) => {
                Some(netns_dir.join(container_id).display().to_string())
            }
        }
    }

    /// Attach the container, returning its address (empty if none is assigned).
    pub async fn create(
        &self,
        container_id: &str,
        netns: Option<&str>,
    ) -> Result<String, NetworkError> {
        match self {
            Self::None | Self::Host => {
                debug!(container_id = %container_id, kind = ?self.kind(), "No network to configure");
                Ok(String::new())
            }
            Self::Managed(managed) => {
                let request = managed.request(container_id, netns)?;
                let result = managed.runner.add(&request).await?;
                info!(
                    container_id = %container_id,
                    network = %managed.network,
                    address = %result.address,
                    "Attached container to network"
                );
                Ok(result.address)
            }
        }
    }

    /// Detach the container. Detaching twice is not an error.
    pub async fn remove(&self, container_id: &str, netns: Option<&str>) -> Result<(), NetworkError> {
        match self {
            Self::None | Self::Host => Ok(()),
            Self::Managed(managed) => {
                let request = managed.request(container_id, netns)?;
                managed.runner.del(&request).await?;
                info!(
                    container_id = %container_id,
                    network = %managed.network,
                    "Detached container from network"
                );
                Ok(())
            }
        }
    }
}

impl ManagedNetwork {
    fn request(&self, container_id: &str, netns: Option<&str>) -> Result<PluginRequest, NetworkError> {
        if self.network.is_empty() {
            return Err(NetworkError::MissingName);
        }
        Ok(PluginRequest {
            container_id: container_id.to_string(),
            netns: netns.unwrap_or_default().to_string(),
            interface: self.interface.clone(),
            network: self.network.clone(),
        })
    }
}
