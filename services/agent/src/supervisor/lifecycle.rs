//! Container lifecycle operations.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use berth_checkpoint_format::Descriptor;
use berth_reconcile::DesiredStatus;
use tracing::{debug, info, warn};

use super::guard::Detached;
use super::{Change, Supervisor, EXT_CURRENT, EXT_PREVIOUS, EXT_RESTORE, LABEL_ADDRESS, LABEL_REVISION};
use crate::container::{config_file_path, render_spec, Container};
use crate::error::{AgentError, AgentResult, StageExt};
use crate::network::NetworkBinder;
use crate::runtime::{ContainerRecord, CreateTaskOptions, Signal};

impl Supervisor {
    /// Create a container and start it.
    ///
    /// With `update` set, an existing container with the same ID is updated
    /// instead of rejected.
    pub async fn create(&self, container: Container, update: bool) -> AgentResult<()> {
        container.validate()?;
        let container = container.with_defaults();

        if self.exists(&container.id).await? {
            if !update {
                return Err(AgentError::AlreadyExists(container.id));
            }
            return self.update(container).await;
        }

        self.pull(&container.image).await?;
        self.create_record(&container, BTreeMap::new()).await?;
        self.start(&container.id).await
    }

    /// Start a container, replacing any task it already has.
    pub async fn start(&self, id: &str) -> AgentResult<()> {
        let (record, container) = self.load(id).await?;

        self.clear_task(id).await;
        self.ensure_image(&container.image).await?;
        self.render_configs(&container).await?;

        let binder = NetworkBinder::resolve(&container, &self.plugins);
        let netns = binder.netns_path(&self.config.netns_dir, id);
        let address = binder
            .create(id, netns.as_deref())
            .await
            .stage("create network")?;

        match self.launch(id, record, &container, netns.clone(), &address).await {
            Ok(resuming) => {
                info!(
                    container_id = %id,
                    address = %address,
                    restored = resuming,
                    "Started container"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = binder.remove(id, netns.as_deref()).await {
                    warn!(container_id = %id, error = %cleanup, "Failed to detach network after failed start");
                }
                Err(e)
            }
        }
    }

    /// Create and start the task on an attached network. Returns whether
    /// the task resumed from a checkpoint.
    async fn launch(
        &self,
        id: &str,
        mut record: ContainerRecord,
        container: &Container,
        netns: Option<String>,
        address: &str,
    ) -> AgentResult<bool> {
        let checkpoint = record
            .extensions
            .remove(EXT_RESTORE)
            .map(|data| serde_json::from_slice::<Descriptor>(&data))
            .transpose()
            .map_err(|e| AgentError::InvalidConfig(format!("bad restore pointer: {e}")))?;
        let resuming = checkpoint.is_some();

        // The record only changes once the task exists, so a failed task
        // creation keeps the restore pointer for the next attempt.
        self.runtime
            .create_task(id, CreateTaskOptions { checkpoint })
            .await
            .stage("create new container task")?;

        record.labels.insert(LABEL_ADDRESS.to_string(), address.to_string());
        record.spec = render_spec(container, &self.config.config_dir(id), netns);
        if let Err(e) = self.runtime.update_container(record).await {
            if let Err(cleanup) = self.runtime.delete_task(id).await {
                warn!(container_id = %id, error = %cleanup, "Failed to remove task after record update failed");
            }
            return Err(AgentError::stage("update container", e));
        }
        self.set_desired(id, DesiredStatus::Running)?;

        self.runtime.start_task(id).await.stage("start task")?;
        Ok(resuming)
    }

    /// Stop a container and remove its task.
    ///
    /// Desired status is recorded first so reconciliation does not bring the
    /// container back while it is shutting down.
    pub async fn stop(&self, id: &str) -> AgentResult<()> {
        if id.is_empty() {
            return Err(AgentError::NoId);
        }
        if !self.exists(id).await? {
            return Err(AgentError::NotFound(id.to_string()));
        }
        self.set_desired(id, DesiredStatus::Stopped)?;
        self.stop_task(id).await?;
        info!(container_id = %id, "Stopped container");
        Ok(())
    }

    /// Stop a container, detach its network and remove it with every
    /// snapshot revision it owned.
    pub async fn delete(&self, id: &str) -> AgentResult<()> {
        let (_, container) = self.load(id).await?;
        self.stop(id).await?;

        let binder = NetworkBinder::resolve(&container, &self.plugins);
        let netns = binder.netns_path(&self.config.netns_dir, id);
        binder
            .remove(id, netns.as_deref())
            .await
            .stage("remove network")?;

        self.runtime
            .delete_container(id, true)
            .await
            .stage("delete container")?;
        self.desired.remove(id).stage("forget desired state")?;

        match tokio::fs::remove_dir_all(self.config.config_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(container_id = %id, error = %e, "Failed to remove config files"),
        }

        info!(container_id = %id, "Deleted container");
        Ok(())
    }

    /// Send SIGTERM to a container's task without touching desired state.
    pub async fn kill(&self, id: &str) -> AgentResult<()> {
        if id.is_empty() {
            return Err(AgentError::NoId);
        }
        self.runtime
            .kill_task(id, Signal::Terminate)
            .await
            .stage("kill task")?;
        info!(container_id = %id, "Signalled container");
        Ok(())
    }

    /// Apply a new configuration to an existing container.
    ///
    /// A running task is paused while the changes are written, then
    /// signalled to exit; reconciliation starts it again on the new
    /// configuration.
    pub async fn update(&self, container: Container) -> AgentResult<()> {
        container.validate()?;
        let container = container.with_defaults();
        let id = container.id.clone();

        let (_, current) = self.load(&id).await?;
        let changes = Change::plan(&current, &container)?;
        if changes.is_empty() {
            debug!(container_id = %id, "Update has no changes");
            return Ok(());
        }

        // Pull before pausing to keep the pause window short.
        if changes
            .iter()
            .any(|c| matches!(c, Change::ImageUpdate { .. }))
        {
            self.pull(&container.image).await?;
        }

        let (changes_ref, id_ref) = (&changes, id.as_str());
        let ((), live) = self
            .with_paused(id_ref, || async move {
                for change in changes_ref {
                    self.apply_change(id_ref, change).await?;
                }
                Ok(())
            })
            .await?;

        if live {
            self.restart_task(&id, self.config.update_timeout).await?;
        }
        info!(container_id = %id, changes = changes.len(), "Updated container");
        Ok(())
    }

    /// Put the previous configuration back and restart the task.
    ///
    /// Without a saved previous configuration nothing is written but the task
    /// is still restarted. Repeating a rollback is a no-op.
    pub async fn rollback(&self, id: &str) -> AgentResult<()> {
        self.load(id).await?;

        let (rolled_back, live) = self
            .with_paused(id, || async move {
                let (mut record, current) = self.load(id).await?;
                let Some(data) = record.extensions.get(EXT_PREVIOUS).cloned() else {
                    return Ok(false);
                };
                let previous = Container::from_json(&data)?;

                if previous.image != current.image {
                    self.ensure_image(&previous.image).await?;
                    let next = super::revision(&record) + 1;
                    let key = super::snapshot_key(id, next);
                    self.runtime
                        .prepare_snapshot(&key, &previous.image)
                        .await
                        .stage("prepare snapshot")?;
                    record.image = previous.image.clone();
                    record.snapshot_key = key;
                    record
                        .labels
                        .insert(LABEL_REVISION.to_string(), next.to_string());
                }

                record.extensions.insert(EXT_CURRENT.to_string(), data);
                self.runtime
                    .update_container(record)
                    .await
                    .stage("update container")?;
                Ok(previous != current)
            })
            .await?;

        if live {
            self.restart_task(id, self.config.update_timeout).await?;
        }
        info!(container_id = %id, rolled_back, "Rolled back container");
        Ok(())
    }

    /// Push a local image to its registry.
    pub async fn push(&self, reference: &str) -> AgentResult<()> {
        if reference.is_empty() {
            return Err(AgentError::NoRef);
        }
        let opts = self.config.registry_policy.options_for(reference);
        self.runtime
            .push(reference, opts)
            .await
            .stage("push image")?;
        info!(reference = %reference, plain_http = opts.plain_http, "Pushed image");
        Ok(())
    }

    /// Signal the task to exit and wait up to `timeout`, then force-kill.
    ///
    /// Dropping the returned future while waiting force-kills the task.
    async fn restart_task(&self, id: &str, timeout: Duration) -> AgentResult<()> {
        match self.runtime.kill_task(id, Signal::Terminate).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(AgentError::stage("kill task", e)),
        }

        let escalate = Detached::kill(&self.runtime, id);
        match tokio::time::timeout(timeout, self.runtime.wait_task(id)).await {
            Ok(exit) => {
                escalate.disarm();
                exit.stage("wait for task exit")?;
            }
            Err(_) => {
                warn!(
                    container_id = %id,
                    timeout_secs = timeout.as_secs(),
                    "Task did not exit in time, killing"
                );
                escalate.run().await?;
                self.runtime
                    .wait_task(id)
                    .await
                    .stage("wait for task exit")?;
            }
        }

        debug!(container_id = %id, "Task exited for restart");
        Ok(())
    }

    /// Gracefully stop the task and delete it. A missing task is success.
    async fn stop_task(&self, id: &str) -> AgentResult<()> {
        let Some(status) = self.task_status(id).await? else {
            return Ok(());
        };

        if status.is_live() {
            let timeout = self.config.stop_timeout;
            let graceful = match self.runtime.kill_task(id, Signal::Terminate).await {
                Ok(()) => matches!(
                    tokio::time::timeout(timeout, self.runtime.wait_task(id)).await,
                    Ok(Ok(_))
                ),
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to signal task");
                    false
                }
            };

            if !graceful {
                warn!(container_id = %id, "Task did not exit gracefully, killing");
                if let Err(e) = self.runtime.kill_task(id, Signal::Kill).await {
                    warn!(container_id = %id, error = %e, "Failed to kill task");
                }
                if let Err(e) = tokio::time::timeout(timeout, self.runtime.wait_task(id)).await {
                    warn!(container_id = %id, error = %e, "Timed out waiting for killed task");
                }
            }
        }

        match self.runtime.delete_task(id).await {
            Ok(exit) => {
                debug!(container_id = %id, exit_code = exit.code, "Deleted task");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(AgentError::stage("stop container", e)),
        }
    }

    /// Kill and delete any existing task, logging failures.
    async fn clear_task(&self, id: &str) {
        let status = match self.runtime.task_status(id).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to look up previous task");
                return;
            }
        };

        if status.is_live() {
            if let Err(e) = self.runtime.kill_task(id, Signal::Kill).await {
                warn!(container_id = %id, error = %e, "Failed to kill previous task");
            } else if let Err(e) = self.runtime.wait_task(id).await {
                warn!(container_id = %id, error = %e, "Failed to wait for previous task");
            }
        }

        match self.runtime.delete_task(id).await {
            Ok(_) => debug!(container_id = %id, "Removed previous task"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container_id = %id, error = %e, "Failed to delete previous task"),
        }
    }

    /// Write declared config files to the container's config directory.
    async fn render_configs(&self, container: &Container) -> AgentResult<()> {
        if container.configs.is_empty() {
            return Ok(());
        }

        let dir = self.config.config_dir(&container.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .stage("render config files")?;

        for config in &container.configs {
            let path = config_file_path(&dir, config);
            write_config_file(&path, config.content.as_bytes(), config.mode)
                .await
                .stage("render config files")?;
        }

        debug!(container_id = %container.id, count = container.configs.len(), "Rendered config files");
        Ok(())
    }
}

async fn write_config_file(path: &Path, content: &[u8], mode: u32) -> io::Result<()> {
    // Files are read-only once rendered; replace rather than overwrite.
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
