//! Container runtime interface.
//!
//! The runtime is the only component that starts OS processes. The supervisor
//! drives it through this trait and keeps no state of its own between calls:
//! every operation re-reads the container record and task from here.
//!
//! The surface mirrors what a containerd-style runtime exposes:
//! - images: pull/push/fetch by reference, local image registration
//! - content: content-addressed blobs with GC labels
//! - containers: records carrying labels and opaque extensions
//! - snapshots: writable layers, usage, lineage, diff/apply
//! - tasks: the live process group of a container
//!
//! An in-memory implementation is provided for development and tests.

mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use berth_checkpoint_format::{Descriptor, FormatError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryRegistry, MemoryRuntime};

/// Errors reported by the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

// =============================================================================
// Images and registries
// =============================================================================

/// A locally registered image: a name pointing at a root descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
    pub created_at: DateTime<Utc>,
}

/// Per-call registry transport options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Talk to the registry over plain HTTP instead of HTTPS.
    pub plain_http: bool,
}

// =============================================================================
// Containers
// =============================================================================

/// The runtime's record of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub snapshot_key: String,
    pub spec: RuntimeSpec,
    pub labels: BTreeMap<String, String>,
    /// Opaque, versioned blobs owned by the supervisor.
    pub extensions: BTreeMap<String, Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Low-level spec handed to the runtime when a task is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub hostname: String,
    pub process: ProcessSpec,
    pub privileged: bool,
    pub masked_paths: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub resources: ResourceSpec,
    /// Network namespace path. `None` joins the host namespace.
    pub netns: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub terminal: bool,
    pub cwd: String,
    pub capabilities: Vec<String>,
    pub no_file: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub kind: String,
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_shares: u64,
    pub memory_limit: u64,
    pub oom_score_adj: i32,
}

// =============================================================================
// Snapshots
// =============================================================================

/// One layer in a snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

// =============================================================================
// Tasks
// =============================================================================

/// Runtime status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the process group is alive.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals the supervisor sends to tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM: ask the process to exit.
    Terminate,
    /// SIGKILL: force the process to exit.
    Kill,
}

impl Signal {
    pub fn number(&self) -> u32 {
        match self {
            Self::Terminate => 15,
            Self::Kill => 9,
        }
    }
}

/// How a task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    pub exited_at: DateTime<Utc>,
}

/// Resource usage of a live task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub cpu_total_ns: u64,
    pub memory_usage: u64,
    pub memory_cache: u64,
    pub memory_limit: u64,
    pub pids_current: u64,
    pub pids_limit: u64,
}

/// Options for task creation.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    /// Resume from this runtime checkpoint instead of cold-starting.
    pub checkpoint: Option<Descriptor>,
}

// =============================================================================
// Runtime trait
// =============================================================================

/// Container runtime client.
#[async_trait]
pub trait Runtime: Send + Sync {
    // --- images ---

    /// Pull an image from its registry, register it and unpack its layers.
    async fn pull(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<Image>;

    /// Push a local image and every blob it references to its registry.
    async fn push(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<()>;

    /// Copy an artifact's content into the local store without registering
    /// or unpacking it.
    async fn fetch(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<Image>;

    async fn get_image(&self, name: &str) -> RuntimeResult<Image>;

    async fn create_image(&self, image: Image) -> RuntimeResult<Image>;

    async fn delete_image(&self, name: &str) -> RuntimeResult<()>;

    // --- content ---

    async fn write_blob(
        &self,
        media_type: &str,
        data: Bytes,
        labels: BTreeMap<String, String>,
    ) -> RuntimeResult<Descriptor>;

    async fn read_blob(&self, digest: &str) -> RuntimeResult<Bytes>;

    // --- containers ---

    async fn create_container(&self, record: ContainerRecord) -> RuntimeResult<ContainerRecord>;

    async fn load_container(&self, id: &str) -> RuntimeResult<ContainerRecord>;

    async fn update_container(&self, record: ContainerRecord) -> RuntimeResult<ContainerRecord>;

    /// Delete a record; with `gc_snapshots` every snapshot revision the
    /// container ever owned is removed too.
    async fn delete_container(&self, id: &str, gc_snapshots: bool) -> RuntimeResult<()>;

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerRecord>>;

    // --- snapshots ---

    /// Create a writable snapshot on top of an unpacked image.
    async fn prepare_snapshot(&self, key: &str, image: &str) -> RuntimeResult<()>;

    /// Bytes used by the writable layer itself.
    async fn snapshot_usage(&self, key: &str) -> RuntimeResult<u64>;

    /// The chain from `key` down to the image's bottom layer.
    async fn walk_snapshots(&self, key: &str) -> RuntimeResult<Vec<SnapshotInfo>>;

    /// Write the writable layer's changes as a layer blob.
    async fn diff_snapshot(&self, key: &str) -> RuntimeResult<Descriptor>;

    /// Apply a layer blob on top of a writable snapshot.
    async fn apply_diff(&self, key: &str, layer: &Descriptor) -> RuntimeResult<()>;

    // --- tasks ---

    async fn create_task(&self, id: &str, opts: CreateTaskOptions) -> RuntimeResult<()>;

    async fn start_task(&self, id: &str) -> RuntimeResult<()>;

    async fn task_status(&self, id: &str) -> RuntimeResult<TaskStatus>;

    async fn pause_task(&self, id: &str) -> RuntimeResult<()>;

    async fn resume_task(&self, id: &str) -> RuntimeResult<()>;

    /// Signal a task. Signalling an exited task is a no-op.
    async fn kill_task(&self, id: &str, signal: Signal) -> RuntimeResult<()>;

    /// Wait until the task exits.
    async fn wait_task(&self, id: &str) -> RuntimeResult<ExitStatus>;

    /// Remove an exited task.
    async fn delete_task(&self, id: &str) -> RuntimeResult<ExitStatus>;

    async fn task_metrics(&self, id: &str) -> RuntimeResult<TaskMetrics>;

    /// Capture the live process state. The result includes the runtime's
    /// own config blob alongside the process checkpoint.
    async fn checkpoint_task(&self, id: &str) -> RuntimeResult<Vec<Descriptor>>;
}

/// Registry host of an image reference.
///
/// The first path component names a registry only if it looks like a host
/// (contains `.` or `:`, or is `localhost`); otherwise the image lives on
/// Docker Hub.
pub fn registry_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => "docker.io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("registry.local:5000/app:v1", "registry.local:5000")]
    #[case("ghcr.io/org/app@sha256:abc", "ghcr.io")]
    #[case("localhost/app", "localhost")]
    #[case("library/alpine:3", "docker.io")]
    #[case("alpine", "docker.io")]
    fn test_registry_host(#[case] reference: &str, #[case] host: &str) {
        assert_eq!(registry_host(reference), host);
    }

    #[test]
    fn test_task_status_liveness() {
        assert!(TaskStatus::Running.is_live());
        assert!(TaskStatus::Paused.is_live());
        assert!(!TaskStatus::Created.is_live());
        assert!(!TaskStatus::Stopped.is_live());
    }
}
