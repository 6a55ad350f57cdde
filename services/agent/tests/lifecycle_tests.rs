//! Lifecycle integration tests: Create, Start, Stop, Delete, Kill, Update,
//! Rollback and Push against the in-memory runtime.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use berth_agent::config::RegistryPolicy;
use berth_agent::container::ConfigFile;
use berth_agent::runtime::TaskStatus;
use berth_agent::{AgentError, Container};
use berth_reconcile::DesiredStatus;
use harness::{
    managed_container, registry, web_container, RecordingPlugins, TestAgent, IMAGE, IMAGE_V2,
};

#[tokio::test]
async fn test_create_starts_container() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");

    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    let info = agent.supervisor.get("web").await.unwrap();
    assert_eq!(info.status, "running");
    assert_eq!(info.image, IMAGE);
    assert!(info.metrics.is_some());
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
    assert_eq!(agent.desired("web"), Some(DesiredStatus::Running));
}

#[tokio::test]
async fn test_create_fills_defaults() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");

    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    let declared = agent.declared("web").await;
    assert_eq!(declared.process.cwd, "/");
    assert_eq!(declared.resources.no_file, berth_agent::container::DEFAULT_NO_FILE);
}

#[tokio::test]
async fn test_create_rejects_missing_id_and_image() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");

    let err = agent
        .supervisor
        .create(Container::new("", IMAGE), false)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NoId));

    let err = agent
        .supervisor
        .create(Container::new("web", ""), false)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NoRef));
    assert_eq!(agent.runtime.task_calls(), 0);
}

#[tokio::test]
async fn test_create_existing_without_update_fails_without_mutation() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    let calls = agent.runtime.task_calls();
    let before = agent.declared("web").await;

    for _ in 0..2 {
        let err = agent
            .supervisor
            .create(Container::new("web", IMAGE_V2), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AlreadyExists(ref id) if id == "web"));
    }

    assert_eq!(agent.runtime.task_calls(), calls);
    assert_eq!(agent.declared("web").await, before);
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_create_existing_with_update_applies_update() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    agent
        .supervisor
        .create(Container::new("web", IMAGE_V2), true)
        .await
        .unwrap();

    assert_eq!(agent.declared("web").await.image, IMAGE_V2);
}

#[tokio::test]
async fn test_stop_removes_task() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    agent.supervisor.stop("web").await.unwrap();

    let info = agent.supervisor.get("web").await.unwrap();
    assert_eq!(info.status, "stopped");
    assert!(info.metrics.is_none());
    assert_eq!(agent.task("web").await, None);
    assert_eq!(agent.desired("web"), Some(DesiredStatus::Stopped));

    // Stopping again is a no-op.
    agent.supervisor.stop("web").await.unwrap();
}

#[tokio::test]
async fn test_stop_missing_container() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");

    let err = agent.supervisor.stop("ghost").await.unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
    assert_eq!(agent.desired("ghost"), None);
}

#[tokio::test]
async fn test_start_replaces_previous_task() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    agent.supervisor.start("web").await.unwrap();
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));

    agent.supervisor.kill("web").await.unwrap();
    agent.supervisor.start("web").await.unwrap();
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_start_failure_names_stage() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent.runtime.fail_task_create(true);

    let err = agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap_err();

    assert_eq!(err.stage_name(), Some("create new container task"));
    assert!(err.to_string().contains("create new container task"));
    // The record exists, so a later Start can retry.
    agent.runtime.fail_task_create(false);
    agent.supervisor.start("web").await.unwrap();
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_failed_start_detaches_network() {
    let registry = registry();
    let plugins = Arc::new(RecordingPlugins::default());
    let agent = TestAgent::with_plugins(&registry, "node-a", plugins.clone());
    agent.runtime.fail_task_create(true);

    let err = agent
        .supervisor
        .create(managed_container("web"), false)
        .await
        .unwrap_err();
    assert_eq!(err.stage_name(), Some("create new container task"));
    assert_eq!(plugins.calls(), vec!["ADD web", "DEL web"]);

    // Each retry attaches and detaches again instead of piling up addresses.
    assert!(agent.supervisor.start("web").await.is_err());
    assert_eq!(plugins.calls(), vec!["ADD web", "DEL web", "ADD web", "DEL web"]);

    agent.runtime.fail_task_create(false);
    agent.supervisor.start("web").await.unwrap();
    assert_eq!(plugins.calls().last().map(String::as_str), Some("ADD web"));
    assert_eq!(agent.supervisor.get("web").await.unwrap().address, "10.88.0.7");
}

#[tokio::test]
async fn test_kill_keeps_desired_state() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    agent.supervisor.kill("web").await.unwrap();

    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));
    assert_eq!(agent.desired("web"), Some(DesiredStatus::Running));
}

#[tokio::test]
async fn test_delete_without_task() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    agent
        .supervisor
        .create(Container::new("db", IMAGE), false)
        .await
        .unwrap();
    agent.supervisor.stop("web").await.unwrap();

    agent.supervisor.delete("web").await.unwrap();

    let ids: Vec<String> = agent
        .supervisor
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.id)
        .collect();
    assert_eq!(ids, vec!["db".to_string()]);
    assert_eq!(agent.desired("web"), None);
    assert!(!agent.runtime.has_snapshot("web-r0"));

    let err = agent.supervisor.delete("web").await.unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_running_container() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    agent.supervisor.delete("web").await.unwrap();

    assert!(agent.supervisor.list().await.unwrap().is_empty());
    assert_eq!(agent.task("web").await, None);
}

#[tokio::test]
async fn test_get_reports_fs_size_and_snapshots() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    let bind = tempfile::tempdir().unwrap();
    std::fs::write(bind.path().join("blob"), vec![0u8; 1000]).unwrap();

    agent
        .supervisor
        .create(web_container("web", bind.path()), false)
        .await
        .unwrap();
    agent
        .runtime
        .write_file("web", "/var/log/app.log", b"started")
        .unwrap();

    let info = agent.supervisor.get("web").await.unwrap();
    assert!(info.fs_size >= 1000 + 7);
    assert_eq!(info.snapshots[0].id, "web-r0");

    let metrics = info.metrics.unwrap();
    assert_eq!(metrics.memory_usage, 48 * 1024 * 1024);
    assert_eq!(metrics.memory_limit, 256 * 1024 * 1024);
}

#[tokio::test]
async fn test_start_renders_config_files() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    let mut container = Container::new("web", IMAGE);
    container.configs.push(ConfigFile {
        name: "app.toml".to_string(),
        path: "/etc/app/app.toml".to_string(),
        content: "port = 8080\n".to_string(),
        mode: 0o444,
    });

    agent.supervisor.create(container, false).await.unwrap();
    // Rendering again replaces the read-only file.
    agent.supervisor.start("web").await.unwrap();

    let path = agent.data_dir.path().join("configs/web/app.toml");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "port = 8080\n");

    agent.supervisor.delete("web").await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_update_image_swaps_layer() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();

    agent
        .supervisor
        .update(Container::new("web", IMAGE_V2))
        .await
        .unwrap();

    assert_eq!(agent.declared("web").await.image, IMAGE_V2);
    assert_eq!(
        agent.runtime.read_file("web", "/bin/app").unwrap(),
        Some(b"\x7fELF-v2".to_vec())
    );
    // The task exited for the restart; reconciliation brings it back.
    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));
    assert_eq!(agent.desired("web"), Some(DesiredStatus::Running));
}

#[tokio::test]
async fn test_update_without_changes_is_noop() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    let calls = agent.runtime.task_calls();

    agent
        .supervisor
        .update(Container::new("web", IMAGE))
        .await
        .unwrap();

    assert_eq!(agent.runtime.task_calls(), calls);
    assert_eq!(agent.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_update_without_task_skips_pause() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    agent.supervisor.stop("web").await.unwrap();
    let calls = agent.runtime.task_calls();

    let mut next = Container::new("web", IMAGE);
    next.process.env = vec!["MODE=quiet".to_string()];
    agent.supervisor.update(next).await.unwrap();

    assert_eq!(agent.runtime.task_calls(), calls);
    assert_eq!(agent.declared("web").await.process.env, vec!["MODE=quiet"]);
    assert_eq!(agent.task("web").await, None);
}

#[tokio::test]
async fn test_update_missing_container() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");

    let err = agent
        .supervisor
        .update(Container::new("ghost", IMAGE))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_update_escalates_to_kill_after_timeout() {
    let registry = registry();
    let agent = TestAgent::with_config(&registry, "node-a", |config| {
        config.with_update_timeout(Duration::from_secs(10))
    });
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    agent.runtime.ignore_terminate("web", true);

    let mut next = Container::new("web", IMAGE);
    next.process.args = vec!["/bin/app".to_string(), "--verbose".to_string()];

    let started = tokio::time::Instant::now();
    agent.supervisor.update(next).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));
    assert_eq!(
        agent.declared("web").await.process.args,
        vec!["/bin/app", "--verbose"]
    );
}

#[tokio::test]
async fn test_rollback_restores_previous_configuration() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    agent
        .supervisor
        .update(Container::new("web", IMAGE_V2))
        .await
        .unwrap();
    agent.supervisor.start("web").await.unwrap();

    agent.supervisor.rollback("web").await.unwrap();

    assert_eq!(agent.declared("web").await.image, IMAGE);
    assert_eq!(
        agent.runtime.read_file("web", "/bin/app").unwrap(),
        Some(b"\x7fELF-v1".to_vec())
    );
    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));

    // Rolling back again changes nothing.
    agent.supervisor.start("web").await.unwrap();
    agent.supervisor.rollback("web").await.unwrap();
    assert_eq!(agent.declared("web").await.image, IMAGE);
}

#[tokio::test]
async fn test_rollback_without_previous_still_restarts() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");
    agent
        .supervisor
        .create(Container::new("web", IMAGE), false)
        .await
        .unwrap();
    let before = agent.declared("web").await;

    agent.supervisor.rollback("web").await.unwrap();

    assert_eq!(agent.declared("web").await, before);
    assert_eq!(agent.task("web").await, Some(TaskStatus::Stopped));
    assert_eq!(agent.desired("web"), Some(DesiredStatus::Running));
}

#[tokio::test]
async fn test_plain_http_registry_requires_policy() {
    let registry = registry();
    registry
        .publish_image("insecure.local:5000/app:v1", &[("/bin/app", b"plain")])
        .unwrap();
    registry.serve_plain_http("insecure.local:5000");

    let strict = TestAgent::new(&registry, "node-a");
    let err = strict
        .supervisor
        .create(Container::new("web", "insecure.local:5000/app:v1"), false)
        .await
        .unwrap_err();
    assert_eq!(err.stage_name(), Some("pull image"));

    let relaxed = TestAgent::with_config(&registry, "node-b", |config| {
        config.with_registry_policy(RegistryPolicy::from_list("insecure.local:5000"))
    });
    relaxed
        .supervisor
        .create(Container::new("web", "insecure.local:5000/app:v1"), false)
        .await
        .unwrap();
    assert_eq!(relaxed.task("web").await, Some(TaskStatus::Running));
}

#[tokio::test]
async fn test_push_requires_reference() {
    let registry = registry();
    let agent = TestAgent::new(&registry, "node-a");

    let err = agent.supervisor.push("").await.unwrap_err();
    assert!(matches!(err, AgentError::NoRef));

    let err = agent
        .supervisor
        .push("registry.local/missing:v1")
        .await
        .unwrap_err();
    assert_eq!(err.stage_name(), Some("push image"));
}
