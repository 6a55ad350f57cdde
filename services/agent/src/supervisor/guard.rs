//! Pause-guarded mutation.
//!
//! Update, Rollback and Checkpoint mutate a container's configuration or
//! read its writable layer while the process group is frozen, so they see a
//! consistent filesystem and the process cannot observe a half-written
//! config. This is not a transaction: a mutation that fails half way leaves
//! its partial effects in place, so each mutation must be safe to repeat.
//!
//! The resume is always issued, even if the caller's future is dropped while
//! the mutation runs. It is spawned onto the runtime rather than awaited
//! inline, so cancelling the request never leaves a task frozen.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Supervisor;
use crate::error::{AgentResult, StageExt};
use crate::runtime::{Runtime, RuntimeResult, Signal, TaskStatus};

type DetachedFuture = Pin<Box<dyn Future<Output = RuntimeResult<()>> + Send + 'static>>;

/// A runtime call that must happen even if its caller goes away.
///
/// Dropping an armed `Detached` spawns the call in the background.
pub(crate) struct Detached {
    stage: &'static str,
    pending: Option<DetachedFuture>,
}

impl Detached {
    pub(crate) fn new<F>(stage: &'static str, call: F) -> Self
    where
        F: Future<Output = RuntimeResult<()>> + Send + 'static,
    {
        Self {
            stage,
            pending: Some(Box::pin(call)),
        }
    }

    /// Resume the task of `id` when run or dropped.
    pub(crate) fn resume(runtime: &Arc<dyn Runtime>, id: &str) -> Self {
        let runtime = Arc::clone(runtime);
        let id = id.to_string();
        Self::new("resume task", async move { runtime.resume_task(&id).await })
    }

    /// Force-kill the task of `id` when run or dropped.
    pub(crate) fn kill(runtime: &Arc<dyn Runtime>, id: &str) -> Self {
        let runtime = Arc::clone(runtime);
        let id = id.to_string();
        Self::new("kill task", async move {
            runtime.kill_task(&id, Signal::Kill).await
        })
    }

    /// Run the call to completion on its own task and wait for it.
    pub(crate) async fn run(mut self) -> AgentResult<()> {
        let stage = self.stage;
        match self.pending.take() {
            Some(call) => tokio::spawn(call).await.stage(stage)?.stage(stage),
            None => Ok(()),
        }
    }

    /// Drop without running.
    pub(crate) fn disarm(mut self) {
        self.pending = None;
    }
}

impl Drop for Detached {
    fn drop(&mut self) {
        let Some(call) = self.pending.take() else {
            return;
        };
        let stage = self.stage;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(stage, "Caller dropped, finishing call in background");
                handle.spawn(async move {
                    if let Err(e) = call.await {
                        warn!(stage, error = %e, "Background call failed");
                    }
                });
            }
            Err(_) => warn!(stage, "No runtime to finish call on"),
        }
    }
}

impl Supervisor {
    /// Run `mutation` with the container's task paused.
    ///
    /// Returns the mutation's result and whether the container had a live
    /// task. Without a running task the mutation runs directly. A task that
    /// is already paused is left for whoever paused it to resume.
    pub(crate) async fn with_paused<T, F, Fut>(&self, id: &str, mutation: F) -> AgentResult<(T, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AgentResult<T>>,
    {
        let status = self.task_status(id).await?;
        let live = status.is_some_and(|s| s.is_live());

        if status != Some(TaskStatus::Running) {
            return Ok((mutation().await?, live));
        }

        self.runtime.pause_task(id).await.stage("pause task")?;
        debug!(container_id = %id, "Paused task");
        let resume = Detached::resume(&self.runtime, id);

        let result = mutation().await;
        let resumed = resume.run().await;
        debug!(container_id = %id, "Resumed task");

        match (result, resumed) {
            (Ok(value), Ok(())) => Ok((value, true)),
            (Err(e), Err(resume_err)) => {
                warn!(container_id = %id, error = %resume_err, "Failed to resume task after failed mutation");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::container::Container;
    use crate::error::AgentError;
    use crate::runtime::{MemoryRegistry, MemoryRuntime};
    use crate::state::DesiredStateStore;
    use crate::supervisor::SupervisorConfig;

    const IMAGE: &str = "registry.local/app:v1";

    struct Fixture {
        supervisor: Arc<Supervisor>,
        runtime: Arc<MemoryRuntime>,
        _dir: tempfile::TempDir,
    }

    async fn running(id: &str) -> Fixture {
        let registry = MemoryRegistry::new();
        registry.publish_image(IMAGE, &[("/bin/app", b"\x7fELF")]).unwrap();
        let runtime = Arc::new(MemoryRuntime::new(registry));
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            Arc::clone(&runtime) as Arc<dyn Runtime>,
            Arc::new(DesiredStateStore::open_in_memory().unwrap()),
            SupervisorConfig::new("node-a", dir.path()),
            dir.path().join("plugins"),
        );
        supervisor
            .create(Container::new(id, IMAGE), false)
            .await
            .unwrap();

        Fixture {
            supervisor: Arc::new(supervisor),
            runtime,
            _dir: dir,
        }
    }

    async fn wait_for(runtime: &MemoryRuntime, id: &str, status: TaskStatus) -> bool {
        for _ in 0..100 {
            if runtime.task_status(id).await.ok() == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_failed_mutation_still_resumes() {
        let fixture = running("web").await;
        let runtime = Arc::clone(&fixture.runtime);

        let err = fixture
            .supervisor
            .with_paused("web", || async move {
                assert_eq!(runtime.task_status("web").await.unwrap(), TaskStatus::Paused);
                Err::<(), _>(AgentError::InvalidConfig("rejected".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InvalidConfig(_)));
        assert_eq!(
            fixture.runtime.task_status("web").await.unwrap(),
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_dropped_caller_still_resumes() {
        let fixture = running("web").await;
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let supervisor = Arc::clone(&fixture.supervisor);
        let call = tokio::spawn(async move {
            supervisor
                .with_paused("web", || async move {
                    let _ = entered_tx.send(());
                    std::future::pending::<AgentResult<()>>().await
                })
                .await
        });

        entered_rx.await.unwrap();
        assert_eq!(
            fixture.runtime.task_status("web").await.unwrap(),
            TaskStatus::Paused
        );

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert!(wait_for(&fixture.runtime, "web", TaskStatus::Running).await);
    }

    #[tokio::test]
    async fn test_without_task_runs_directly() {
        let fixture = running("web").await;
        fixture.supervisor.stop("web").await.unwrap();

        let (value, live) = fixture
            .supervisor
            .with_paused("web", || async { Ok(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(!live);
    }
}
