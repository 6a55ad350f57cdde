//! Configuration for the agent.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::runtime::{registry_host, RegistryOptions};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of this node, used in logs and checkpoint annotations.
    pub node_name: String,

    /// Address the agent RPC surface listens on.
    pub listen_addr: SocketAddr,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Reconciliation tick in seconds.
    pub reconcile_interval_secs: u64,

    /// Bounded wait for task exit during Update and Rollback, in seconds.
    pub update_timeout_secs: u64,

    /// Bounded wait for graceful exit during Stop, in seconds.
    pub stop_timeout_secs: u64,

    /// Registries contacted over plain HTTP.
    pub registry_policy: RegistryPolicy,

    /// Directory holding managed-network plugin binaries.
    pub network_plugin_dir: PathBuf,

    /// Directory for per-container network namespace paths.
    pub netns_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var("BERTH_NODE_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "berth-node".to_string());

        let listen_addr = std::env::var("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9100".to_string())
            .parse()
            .context("BERTH_LISTEN_ADDR is not a socket address")?;

        let data_dir = std::env::var("BERTH_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/berth".to_string())
            .into();

        let reconcile_interval_secs = env_secs("BERTH_RECONCILE_INTERVAL", 10);
        let update_timeout_secs = env_secs("BERTH_UPDATE_TIMEOUT", 10);
        let stop_timeout_secs = env_secs("BERTH_STOP_TIMEOUT", 10);

        let registry_policy = std::env::var("BERTH_PLAIN_HTTP_REGISTRIES")
            .map(|hosts| RegistryPolicy::from_list(&hosts))
            .unwrap_or_default();

        let network_plugin_dir = std::env::var("BERTH_NETWORK_PLUGIN_DIR")
            .unwrap_or_else(|_| "/opt/cni/bin".to_string())
            .into();

        let netns_dir = std::env::var("BERTH_NETNS_DIR")
            .unwrap_or_else(|_| "/run/berth/netns".to_string())
            .into();

        let log_level = std::env::var("BERTH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_name,
            listen_addr,
            data_dir,
            reconcile_interval_secs,
            update_timeout_secs,
            stop_timeout_secs,
            registry_policy,
            network_plugin_dir,
            netns_dir,
            log_level,
        })
    }

    /// Path of the desired-state database.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Which registries are reached over plain HTTP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryPolicy {
    plain_http_hosts: BTreeSet<String>,
}

impl RegistryPolicy {
    /// Parse a comma-separated host list. Blank entries are ignored.
    pub fn from_list(hosts: &str) -> Self {
        Self::new(hosts.split(','))
    }

    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            plain_http_hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Transport options for talking to the registry of `reference`.
    pub fn options_for(&self, reference: &str) -> RegistryOptions {
        RegistryOptions {
            plain_http: self.plain_http_hosts.contains(registry_host(reference)),
        }
    }
}
