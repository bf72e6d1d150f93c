use async_trait::async_trait;
use blockforge::core::registry::{CreateSpec, InstanceRegistry, ServerKind};
use blockforge::core::scheduler::{
    ExecutionRecord, ExecutionRing, RING_CAPACITY, ScheduledTask, TaskExecutor, TaskKind,
    TaskScheduler, TaskSpec, validate_cron,
};
use blockforge::BlockforgeError;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

struct CountingExecutor {
    executions: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    async fn execute(&self, _task: &ScheduledTask) -> Result<String, BlockforgeError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok("done".to_string())
    }
}

fn fixture(dir: &TempDir) -> (TaskScheduler, Arc<InstanceRegistry>, String) {
    let registry = Arc::new(
        InstanceRegistry::open(
            dir.path().join("data/servers.json"),
            dir.path().join("servers"),
        )
        .unwrap(),
    );
    let instance = registry
        .create(
            CreateSpec {
                name: "sv".to_string(),
                kind: ServerKind::Paper,
                version: "1.20.4".to_string(),
                host: "0.0.0.0".to_string(),
                port: 25565,
                rcon_port: 25575,
                rcon_password: Some("x".to_string()),
                memory: "2G".to_string(),
            },
            None,
        )
        .unwrap();
    let scheduler = TaskScheduler::open(
        dir.path().join("data/tasks.json"),
        chrono_tz::Europe::Berlin,
        registry.clone(),
        Arc::new(CountingExecutor {
            executions: AtomicUsize::new(0),
        }),
    )
    .unwrap();
    (scheduler, registry, instance.id)
}

fn spec(server_id: &str, cron: &str) -> TaskSpec {
    TaskSpec {
        name: "nightly".to_string(),
        kind: TaskKind::Backup,
        server_id: server_id.to_string(),
        cron: cron.to_string(),
        command: None,
        enabled: true,
    }
}

#[tokio::test]
async fn test_cron_validation_requires_five_fields() {
    assert!(validate_cron("*/5 * * * *").is_ok());
    assert!(validate_cron("0 3 * * 1-5").is_ok());
    assert!(matches!(
        validate_cron("* * * *"),
        Err(BlockforgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        validate_cron("* * * * * *"),
        Err(BlockforgeError::InvalidArgument(_))
    ));
    assert!(validate_cron("99 * * * *").is_err());
}

#[tokio::test]
async fn test_create_persists_and_lists() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _registry, server_id) = fixture(&dir);

    let task = scheduler.create(spec(&server_id, "0 3 * * *")).unwrap();
    assert!(task.enabled);
    assert_eq!(scheduler.list().len(), 1);
    assert!(dir.path().join("data/tasks.json").is_file());

    // A fresh open sees the row.
    let reopened = TaskScheduler::open(
        dir.path().join("data/tasks.json"),
        chrono_tz::Europe::Berlin,
        Arc::new(
            InstanceRegistry::open(
                dir.path().join("data/servers2.json"),
                dir.path().join("servers"),
            )
            .unwrap(),
        ),
        Arc::new(CountingExecutor {
            executions: AtomicUsize::new(0),
        }),
    )
    .unwrap();
    assert_eq!(reopened.list().len(), 1);
    assert_eq!(reopened.get(&task.id).unwrap().cron, "0 3 * * *");
}

#[tokio::test]
async fn test_create_rejects_bad_cron_and_missing_command() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _registry, server_id) = fixture(&dir);

    assert!(matches!(
        scheduler.create(spec(&server_id, "not a cron")),
        Err(BlockforgeError::InvalidArgument(_))
    ));

    let mut command_task = spec(&server_id, "*/1 * * * *");
    command_task.kind = TaskKind::Command;
    command_task.command = None;
    assert!(matches!(
        scheduler.create(command_task),
        Err(BlockforgeError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_create_requires_existing_target() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _registry, _server_id) = fixture(&dir);
    assert!(matches!(
        scheduler.create(spec("ghost", "0 3 * * *")),
        Err(BlockforgeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_and_disable() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _registry, server_id) = fixture(&dir);
    let task = scheduler.create(spec(&server_id, "0 3 * * *")).unwrap();

    let mut changed = spec(&server_id, "30 4 * * *");
    changed.name = "later".to_string();
    let updated = scheduler.update(&task.id, changed).unwrap();
    assert_eq!(updated.cron, "30 4 * * *");
    assert_eq!(updated.name, "later");
    assert_eq!(updated.created_at, task.created_at);

    let disabled = scheduler.set_enabled(&task.id, false).unwrap();
    assert!(!disabled.enabled);
}

#[tokio::test]
async fn test_delete_task() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _registry, server_id) = fixture(&dir);
    let task = scheduler.create(spec(&server_id, "0 3 * * *")).unwrap();
    scheduler.delete(&task.id).unwrap();
    assert!(scheduler.list().is_empty());
    assert!(matches!(
        scheduler.delete(&task.id),
        Err(BlockforgeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_cron_rows_are_disabled_on_start() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(
        data.join("tasks.json"),
        format!(
            r#"[{{
                "id": "t1",
                "name": "broken",
                "kind": "restart",
                "server_id": "whatever",
                "cron": "* * *",
                "enabled": true,
                "created_at": "{}"
            }}]"#,
            Utc::now().to_rfc3339()
        ),
    )
    .unwrap();

    let registry = Arc::new(
        InstanceRegistry::open(data.join("servers.json"), dir.path().join("servers")).unwrap(),
    );
    let scheduler = TaskScheduler::open(
        data.join("tasks.json"),
        chrono_tz::Europe::Berlin,
        registry,
        Arc::new(CountingExecutor {
            executions: AtomicUsize::new(0),
        }),
    )
    .unwrap();
    scheduler.start().unwrap();

    let task = scheduler.get("t1").unwrap();
    assert!(!task.enabled, "invalid cron row must be retained but disabled");
}

#[tokio::test]
async fn test_ring_capacity_and_order() {
    let ring = ExecutionRing::new(RING_CAPACITY);
    for i in 0..150 {
        ring.push(ExecutionRecord {
            id: i.to_string(),
            task_id: "t".to_string(),
            task_name: "n".to_string(),
            kind: TaskKind::Command,
            server_id: "s".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 1,
            success: true,
            result: None,
            error: None,
        });
    }
    let records = ring.list();
    assert_eq!(records.len(), RING_CAPACITY);
    // Newest first.
    assert_eq!(records[0].id, "149");
    assert_eq!(records[RING_CAPACITY - 1].id, "50");
}
