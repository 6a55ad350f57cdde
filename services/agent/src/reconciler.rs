//! Reconciliation loop for converging container state.
//!
//! Every tick the reconciler:
//! - Lists the containers that have a desired status
//! - Observes their tasks through the runtime
//! - Starts or stops the ones that drifted
//!
//! Per-container failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use berth_reconcile::{plan, Diff, ObservedStatus, StateChange, DEFAULT_RECONCILE_INTERVAL};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AgentResult, StageExt};
use crate::runtime::TaskStatus;
use crate::supervisor::Supervisor;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between ticks.
    pub reconcile_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub checked: usize,
    pub started: usize,
    pub stopped: usize,
    pub failed: usize,
}

/// Reconciler for converging observed container state toward desired state.
pub struct Reconciler {
    supervisor: Arc<Supervisor>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(supervisor: Arc<Supervisor>, config: ReconcilerConfig) -> Self {
        Self { supervisor, config }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile_once().await {
                        Ok(stats) if stats.started + stats.stopped + stats.failed > 0 => {
                            info!(
                                checked = stats.checked,
                                started = stats.started,
                                stopped = stats.stopped,
                                failed = stats.failed,
                                "Reconciliation tick applied changes"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    ///
    /// Only listing the desired state can fail the pass. Errors observing or
    /// correcting one container are counted and logged.
    pub async fn reconcile_once(&self) -> AgentResult<ReconcileStats> {
        let _tick = self.supervisor.reconcile_lock().lock().await;
        let mut stats = ReconcileStats::default();

        let desired = self
            .supervisor
            .desired_state()
            .list()
            .stage("list desired state")?;

        let mut observations = Vec::with_capacity(desired.len());
        for row in desired {
            let observed = match self.supervisor.task_status(&row.container_id).await {
                Ok(status) => observe(status),
                Err(e) => {
                    warn!(container_id = %row.container_id, error = %e, "Failed to observe task");
                    stats.failed += 1;
                    continue;
                }
            };
            observations.push((row.container_id, row.status, observed));
        }

        let diffs = plan(observations);
        stats.checked = diffs.len();
        debug!(containers = diffs.len(), "Computed reconciliation plan");

        for diff in diffs {
            match self.apply(&diff).await {
                Ok(()) => match diff.change {
                    StateChange::Start => stats.started += 1,
                    StateChange::Stop => stats.stopped += 1,
                    StateChange::NoOp => {}
                },
                Err(e) => {
                    warn!(
                        container_id = %diff.container_id,
                        change = %diff.change,
                        error = %e,
                        "Failed to apply state change"
                    );
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn apply(&self, diff: &Diff) -> AgentResult<()> {
        match diff.change {
            StateChange::Start => {
                debug!(container_id = %diff.container_id, "Starting drifted container");
                self.supervisor.start(&diff.container_id).await
            }
            StateChange::Stop => {
                debug!(container_id = %diff.container_id, "Stopping drifted container");
                self.supervisor.stop(&diff.container_id).await
            }
            StateChange::NoOp => Ok(()),
        }
    }
}

/// Map a task status onto the two states the loop corrects between.
fn observe(status: Option<TaskStatus>) -> ObservedStatus {
    match status {
        Some(status) if status.is_live() => ObservedStatus::Running,
        _ => ObservedStatus::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
    }

    #[rstest]
    #[case(None, ObservedStatus::Stopped)]
    #[case(Some(TaskStatus::Created), ObservedStatus::Stopped)]
    #[case(Some(TaskStatus::Stopped), ObservedStatus::Stopped)]
    #[case(Some(TaskStatus::Running), ObservedStatus::Running)]
    #[case(Some(TaskStatus::Paused), ObservedStatus::Running)]
    fn test_observe(#[case] status: Option<TaskStatus>, #[case] expected: ObservedStatus) {
        assert_eq!(observe(status), expected);
    }
}
