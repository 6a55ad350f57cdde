//! Get and List.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use super::{declared_config, Supervisor, LABEL_ADDRESS};
use crate::error::{AgentResult, StageExt};
use crate::runtime::{ContainerRecord, TaskStatus};

/// Observed state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    /// Task status, `stopped` when there is no task.
    pub status: String,
    /// Snapshot chain from the writable layer down.
    pub snapshots: Vec<SnapshotSummary>,
    /// Writable layer usage plus the size of existing bind-mount sources.
    pub fs_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ContainerMetrics>,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub parent: Option<String>,
    pub size: u64,
}

/// Live resource usage, reported only while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub cpu_total_ns: u64,
    /// Usage excluding page cache.
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub pids_current: u64,
    pub pids_limit: u64,
}

impl Supervisor {
    /// Observed state of a container.
    pub async fn get(&self, id: &str) -> AgentResult<ContainerInfo> {
        let (record, _) = self.load(id).await?;
        self.describe(record).await
    }

    /// Observed state of every container, ordered by ID.
    pub async fn list(&self) -> AgentResult<Vec<ContainerInfo>> {
        let mut records = self
            .runtime
            .list_containers()
            .await
            .stage("list containers")?;
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            match self.describe(record).await {
                Ok(info) => infos.push(info),
                // Deleted while listing.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to describe container");
                    return Err(e);
                }
            }
        }
        Ok(infos)
    }

    async fn describe(&self, record: ContainerRecord) -> AgentResult<ContainerInfo> {
        let id = record.id.clone();
        let container = declared_config(&record)?;
        let status = self.task_status(&id).await?;

        let snapshots = self
            .runtime
            .walk_snapshots(&record.snapshot_key)
            .await
            .stage("walk snapshots")?
            .into_iter()
            .map(|s| SnapshotSummary {
                id: s.key,
                created_at: s.created_at,
                parent: s.parent,
                size: s.size,
            })
            .collect();

        let usage = self
            .runtime
            .snapshot_usage(&record.snapshot_key)
            .await
            .stage("snapshot usage")?;
        let sources: Vec<PathBuf> = container.bind_sources().map(PathBuf::from).collect();
        let bind_size = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            sources.iter().map(|p| dir_size(p)).sum()
        })
        .await
        .stage("measure bind mounts")?
        .stage("measure bind mounts")?;

        let metrics = match status {
            Some(TaskStatus::Running) => {
                let m = self
                    .runtime
                    .task_metrics(&id)
                    .await
                    .stage("task metrics")?;
                Some(ContainerMetrics {
                    cpu_total_ns: m.cpu_total_ns,
                    memory_usage: m.memory_usage.saturating_sub(m.memory_cache),
                    memory_limit: m.memory_limit,
                    pids_current: m.pids_current,
                    pids_limit: m.pids_limit,
                })
            }
            _ => None,
        };

        Ok(ContainerInfo {
            id,
            image: record.image,
            status: status
                .map_or(TaskStatus::Stopped.as_str(), |s| s.as_str())
                .to_string(),
            snapshots,
            fs_size: usage + bind_size,
            metrics,
            address: record.labels.get(LABEL_ADDRESS).cloned().unwrap_or_default(),
        })
    }
}

/// Recursive size of a file or directory. Missing paths count as zero.
fn dir_size(path: &Path) -> io::Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}
