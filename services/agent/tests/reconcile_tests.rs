//! Reconciliation loop integration tests.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use berth_agent::runtime::TaskStatus;
use berth_agent::{Container, ReconcileStats, Reconciler, ReconcilerConfig};
use berth_reconcile::DesiredStatus;
use harness::{registry, TestAgent, IMAGE};
use tokio::sync::watch;

fn reconciler(agent: &TestAgent) -> Reconciler {
    Reconciler::new(Arc::clone(&agent.supervisor), ReconcilerConfig::default())
}

async fn running(agent: &TestAgent, id: &str) {
    agent
        .supervisor
        .create(Container::new(id, IMAGE), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_tick_starts_exited_task() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    agent.supervisor.kill("web").await.unwrap();

    let stats = reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(
        stats,
        ReconcileStats {
            checked: 1,
            started: 1,
            stopped: 0,
            failed: 0
        }
    );
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_tick_starts_container_without_task() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    agent.supervisor.stop("web").await.unwrap();
    agent.desired.set("web", DesiredStatus::Running).unwrap();

    reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_tick_stops_unwanted_task() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    agent.desired.set("web", DesiredStatus::Stopped).unwrap();

    let stats = reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(stats.stopped, 1);
    assert_eq!(agent.task("web").await, None);
    assert_eq!(agent.desired("web"), Some(DesiredStatus::Stopped));
}

#[tokio::test]
async fn test_converged_tick_makes_no_runtime_calls() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    running(&agent, "db").await;
    agent.supervisor.stop("db").await.unwrap();
    let calls = agent.runtime.task_calls();

    let stats = reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(
        stats,
        ReconcileStats {
            checked: 2,
            ..Default::default()
        }
    );
    assert_eq!(agent.runtime.task_calls(), calls);
}

#[tokio::test]
async fn test_paused_task_counts_as_running() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    berth_agent::Runtime::pause_task(agent.runtime.as_ref(), "web")
        .await
        .unwrap();

    let stats = reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(stats.started + stats.stopped, 0);
    assert_eq!(agent.task("web").await, Some(TaskStatus::Paused));
}

#[tokio::test]
async fn test_failure_does_not_block_other_containers() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    agent.supervisor.kill("web").await.unwrap();
    // Desired state for a container the runtime no longer has.
    agent.desired.set("ghost", DesiredStatus::Running).unwrap();

    let stats = reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.started, 1);
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_unmanaged_container_is_ignored() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    agent.supervisor.kill("web").await.unwrap();
    agent.desired.remove("web").unwrap();

    let stats = reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(stats, ReconcileStats::default());
    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));
}

#[tokio::test]
async fn test_update_restart_converges() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;

    let mut next = Container::new("web", IMAGE);
    next.process.env = vec!["LOG=debug".to_string()];
    agent.supervisor.update(next).await.unwrap();
    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));

    reconciler(&agent).reconcile_once().await.unwrap();

    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
    assert_eq!(agent.declared("web").await.process.env, vec!["LOG=debug"]);
}

#[tokio::test]
async fn test_run_loop_converges_and_shuts_down() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    running(&agent, "web").await;
    agent.supervisor.kill("web").await.unwrap();

    let reconciler = Reconciler::new(
        Arc::clone(&agent.supervisor),
        ReconcilerConfig {
            reconcile_interval: Duration::from_millis(20),
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while agent.task("web").await != Some(TaskStatus::Running) {
        assert!(tokio::time::Instant::now() < deadline, "loop never restarted task");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
