//! Network plugin execution.
//!
//! Managed networks are configured by an external plugin binary following the
//! CNI calling convention: the command, container id, netns path and
//! interface name travel in environment variables, the network config as JSON
//! on stdin, and the result (or error) as JSON on stdout.
//!
//! The plugin binary is looked up by network name in the plugin directory.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::NetworkError;

const CNI_VERSION: &str = "1.0.0";

/// Inputs for one plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRequest {
    pub container_id: String,
    pub netns: String,
    pub interface: String,
    pub network: String,
}

/// Result of a successful ADD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginResult {
    pub address: String,
}

/// Something that can attach and detach containers on a managed network.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    async fn add(&self, request: &PluginRequest) -> Result<PluginResult, NetworkError>;

    async fn del(&self, request: &PluginRequest) -> Result<(), NetworkError>;
}

/// Runs plugin binaries from a directory.
#[derive(Debug, Clone)]
pub struct CommandPluginRunner {
    plugin_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct AddResult {
    #[serde(default)]
    ips: Vec<IpConfig>,
}

#[derive(Debug, Deserialize)]
struct IpConfig {
    address: String,
}

#[derive(Debug, Deserialize)]
struct PluginFailure {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl CommandPluginRunner {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }

    async fn exec(&self, command: &str, request: &PluginRequest) -> Result<Vec<u8>, NetworkError> {
        let plugin = self.plugin_dir.join(&request.network);
        if !plugin.exists() {
            return Err(NetworkError::PluginNotFound(plugin.display().to_string()));
        }

        let config = serde_json::to_vec(&json!({
            "cniVersion": CNI_VERSION,
            "name": request.network,
            "type": request.network,
        }))
        .map_err(|e| NetworkError::InvalidResult(e.to_string()))?;

        debug!(
            plugin = %plugin.display(),
            command = %command,
            container_id = %request.container_id,
            "Executing network plugin"
        );

        let mut child = Command::new(&plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &request.container_id)
            .env("CNI_NETNS", &request.netns)
            .env("CNI_IFNAME", &request.interface)
            .env("CNI_PATH", &self.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&config).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let failure: PluginFailure =
                serde_json::from_slice(&output.stdout).unwrap_or(PluginFailure {
                    code: i64::from(output.status.code().unwrap_or(-1)),
                    msg: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            warn!(
                plugin = %plugin.display(),
                command = %command,
                code = failure.code,
                "Network plugin failed"
            );
            return Err(NetworkError::Plugin {
                plugin: request.network.clone(),
                code: failure.code,
                message: failure.msg,
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl PluginRunner for CommandPluginRunner {
    async fn add(&self, request: &PluginRequest) -> Result<PluginResult, NetworkError> {
        let stdout = self.exec("ADD", request).await?;
        parse_add_result(&stdout)
    }

    async fn del(&self, request: &PluginRequest) -> Result<(), NetworkError> {
        self.exec("DEL", request).await.map(|_| ())
    }
}

/// First assigned address without its prefix length; empty if none.
fn parse_add_result(stdout: &[u8]) -> Result<PluginResult, NetworkError> {
    let result: AddResult =
        serde_json::from_slice(stdout).map_err(|e| NetworkError::InvalidResult(e.to_string()))?;

    let address = result
        .ips
        .first()
        .map(|ip| ip.address.split('/').next().unwrap_or_default().to_string())
        .unwrap_or_default();

    Ok(PluginResult { address })
}
