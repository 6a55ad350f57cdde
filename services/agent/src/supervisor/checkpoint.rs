//! Checkpoint and Restore.
//!
//! A checkpoint is an image index holding:
//!
//! - the container-info blob: the declared configuration and record labels
//! - a gzip tar diff of the writable layer against its image
//! - for live checkpoints, the runtime's process-state blobs
//!
//! The index is registered as a local image under the caller's reference, so
//! it can be pushed and fetched like any other image. Restore needs nothing
//! but that index, the blobs it references and the base image.

use std::collections::BTreeMap;

use berth_checkpoint_format::{
    gc_labels, CheckpointIndex, Descriptor, Platform, ANNOTATION_CONTAINER_ID, ANNOTATION_CREATED,
    ANNOTATION_IMAGE, ANNOTATION_LIVE, ANNOTATION_NODE, MEDIA_TYPE_CHECKPOINT_CONFIG,
    MEDIA_TYPE_CONTAINER_INFO, MEDIA_TYPE_IMAGE_INDEX,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Supervisor, EXT_RESTORE};
use crate::container::Container;
use crate::error::{AgentError, AgentResult, StageExt};
use crate::runtime::Image;

/// The container-info blob stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointedContainer {
    pub container: Container,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Supervisor {
    /// Checkpoint a container into a local image named `reference`.
    ///
    /// The filesystem diff is always taken. With `live` the process state is
    /// captured too. With `exit` the container is stopped afterwards.
    pub async fn checkpoint(
        &self,
        id: &str,
        reference: &str,
        live: bool,
        exit: bool,
    ) -> AgentResult<Descriptor> {
        if id.is_empty() {
            return Err(AgentError::NoId);
        }
        if reference.is_empty() {
            return Err(AgentError::NoRef);
        }
        self.load(id).await?;

        let (index, _) = self
            .with_paused(id, || async move {
                let (record, container) = self.load(id).await?;
                let platform = Platform::current();

                let diff = self
                    .runtime
                    .diff_snapshot(&record.snapshot_key)
                    .await
                    .stage("compute filesystem diff")?;

                let info = serde_json::to_vec(&CheckpointedContainer {
                    container: container.clone(),
                    labels: record.labels.clone(),
                })
                .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
                let info = self
                    .runtime
                    .write_blob(MEDIA_TYPE_CONTAINER_INFO, Bytes::from(info), BTreeMap::new())
                    .await
                    .stage("write container info")?;

                let mut index = CheckpointIndex::new();
                index.push(info.with_platform(platform.clone()));
                index.push(diff.with_platform(platform.clone()));

                if live {
                    let state = self
                        .runtime
                        .checkpoint_task(id)
                        .await
                        .stage("checkpoint task")?;
                    // The container-info blob replaces the runtime's own config.
                    for descriptor in state
                        .into_iter()
                        .filter(|d| d.media_type != MEDIA_TYPE_CHECKPOINT_CONFIG)
                    {
                        index.push(descriptor.with_platform(platform.clone()));
                    }
                }

                index.annotate(ANNOTATION_CONTAINER_ID, id);
                index.annotate(ANNOTATION_IMAGE, &container.image);
                index.annotate(ANNOTATION_LIVE, live.to_string());
                index.annotate(ANNOTATION_NODE, &self.config.node_name);
                index.annotate(ANNOTATION_CREATED, Utc::now().to_rfc3339());

                self.register_checkpoint(reference, &index).await
            })
            .await?;

        info!(
            container_id = %id,
            reference = %reference,
            digest = %index.digest,
            live,
            "Checkpointed container"
        );

        if exit {
            self.stop(id).await?;
        }
        Ok(index)
    }

    /// Write the index blob and point `reference` at it, replacing any
    /// image already registered under that name.
    async fn register_checkpoint(
        &self,
        reference: &str,
        index: &CheckpointIndex,
    ) -> AgentResult<Descriptor> {
        let (descriptor, data) = index.descriptor().stage("encode checkpoint index")?;
        self.runtime
            .write_blob(
                MEDIA_TYPE_IMAGE_INDEX,
                Bytes::from(data),
                gc_labels(index.manifests.iter()),
            )
            .await
            .stage("write checkpoint index")?;

        match self.runtime.get_image(reference).await {
            Ok(existing) if existing.target.digest == descriptor.digest => {
                return Ok(descriptor);
            }
            Ok(_) => self
                .runtime
                .delete_image(reference)
                .await
                .stage("replace checkpoint image")?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(AgentError::stage("load image", e)),
        }

        self.runtime
            .create_image(Image {
                name: reference.to_string(),
                target: descriptor.clone(),
                created_at: Utc::now(),
            })
            .await
            .stage("create checkpoint image")?;
        Ok(descriptor)
    }

    /// Recreate a container from the checkpoint named `reference` and start
    /// it. With `live` the task resumes from the captured process state.
    pub async fn restore(&self, reference: &str, live: bool) -> AgentResult<()> {
        if reference.is_empty() {
            return Err(AgentError::NoRef);
        }

        let image = match self.runtime.get_image(reference).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                let opts = self.config.registry_policy.options_for(reference);
                debug!(reference = %reference, "Checkpoint not registered locally, fetching");
                self.runtime
                    .fetch(reference, opts)
                    .await
                    .stage("fetch checkpoint")?
            }
            Err(e) => return Err(AgentError::stage("load image", e)),
        };

        let data = self
            .runtime
            .read_blob(&image.target.digest)
            .await
            .stage("read checkpoint index")?;
        image
            .target
            .verify(&data)
            .stage("read checkpoint index")?;
        let index = CheckpointIndex::checkpoint_from_slice(&data).stage("decode checkpoint index")?;

        let info_descriptor = index
            .container_info()
            .ok_or(berth_checkpoint_format::FormatError::MissingContainerInfo)
            .stage("decode checkpoint index")?;
        let info = self
            .runtime
            .read_blob(&info_descriptor.digest)
            .await
            .stage("read container info")?;
        let CheckpointedContainer { container, .. } = serde_json::from_slice(&info)
            .map_err(|e| AgentError::InvalidConfig(format!("bad container info: {e}")))?;
        container.validate()?;
        let id = container.id.clone();

        if self.exists(&id).await? {
            return Err(AgentError::AlreadyExists(id));
        }

        let mut extensions = BTreeMap::new();
        if live {
            let state = index.runtime_checkpoints().next().ok_or_else(|| {
                AgentError::InvalidConfig(format!("{reference} holds no process state"))
            })?;
            let pointer =
                serde_json::to_vec(state).map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
            extensions.insert(EXT_RESTORE.to_string(), pointer);
        }

        self.pull(&container.image).await?;
        let record = self.create_record(&container, extensions).await?;

        if let Some(diff) = index.diff_layer() {
            self.runtime
                .apply_diff(&record.snapshot_key, diff)
                .await
                .stage("apply filesystem diff")?;
        }

        info!(container_id = %id, reference = %reference, live, "Restored container");
        self.start(&id).await
    }
}
