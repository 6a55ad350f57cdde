//! Changes applied by Update.

use berth_reconcile::SpecHash;
use tracing::info;

use super::{revision, snapshot_key, Supervisor, EXT_CURRENT, EXT_PREVIOUS, LABEL_REVISION};
use crate::container::Container;
use crate::error::{AgentError, AgentResult, StageExt};

/// One step of an Update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Move the container onto a fresh snapshot of a new image.
    ImageUpdate { image: String },
    /// Save the current configuration as previous and write the new one.
    ConfigChange { container: Box<Container> },
}

impl Change {
    /// Changes that take `current` to `next`, image first.
    pub fn plan(current: &Container, next: &Container) -> AgentResult<Vec<Change>> {
        let mut changes = Vec::new();

        if current.image != next.image {
            changes.push(Change::ImageUpdate {
                image: next.image.clone(),
            });
        }

        let hash = |c: &Container| {
            SpecHash::of(c).map_err(|e| AgentError::InvalidConfig(e.to_string()))
        };
        if hash(current)? != hash(next)? {
            changes.push(Change::ConfigChange {
                container: Box::new(next.clone()),
            });
        }

        Ok(changes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ImageUpdate { .. } => "image update",
            Self::ConfigChange { .. } => "config change",
        }
    }
}

impl Supervisor {
    /// Apply one change to the container record.
    ///
    /// Each change re-reads the record, so applying the same change twice
    /// converges to the same state.
    pub(crate) async fn apply_change(&self, id: &str, change: &Change) -> AgentResult<()> {
        let (mut record, current) = self.load(id).await?;

        match change {
            Change::ImageUpdate { image } => {
                if record.image == *image {
                    return Ok(());
                }
                let next = revision(&record) + 1;
                let key = snapshot_key(id, next);
                self.runtime
                    .prepare_snapshot(&key, image)
                    .await
                    .stage("prepare snapshot")?;
                record.image = image.clone();
                record.snapshot_key = key;
                record
                    .labels
                    .insert(LABEL_REVISION.to_string(), next.to_string());
            }
            Change::ConfigChange { container } => {
                if current == **container {
                    return Ok(());
                }
                record
                    .extensions
                    .insert(EXT_PREVIOUS.to_string(), current.to_json()?);
                record
                    .extensions
                    .insert(EXT_CURRENT.to_string(), container.to_json()?);
            }
        }

        self.runtime
            .update_container(record)
            .await
            .stage("update container")?;
        info!(container_id = %id, change = change.name(), "Applied change");
        Ok(())
    }
}
