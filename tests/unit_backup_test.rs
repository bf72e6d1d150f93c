use blockforge::config::Config;
use blockforge::core::backup::BackupManager;
use blockforge::core::events::EventBus;
use blockforge::core::monitor::ResourceSampler;
use blockforge::core::registry::{CreateSpec, InstanceRegistry, ServerKind};
use blockforge::core::supervisor::ProcessSupervisor;
use blockforge::BlockforgeError;
use std::sync::Arc;
use tempfile::TempDir;

fn fixture(dir: &TempDir) -> (Arc<InstanceRegistry>, BackupManager, String) {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data");
    config.servers_root = dir.path().join("servers");
    config.backups_dir = dir.path().join("backups");

    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(
        InstanceRegistry::open(config.data_dir.join("servers.json"), &config.servers_root)
            .unwrap(),
    );
    let sampler = Arc::new(ResourceSampler::new(bus.clone(), config.resource_interval));
    let supervisor =
        ProcessSupervisor::new(registry.clone(), bus.clone(), sampler, config.clone());
    let backup = BackupManager::new(
        registry.clone(),
        supervisor,
        bus,
        config.backups_dir.clone(),
    );

    let instance = registry
        .create(
            CreateSpec {
                name: "survival".to_string(),
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
    (registry, backup, instance.id)
}

fn populate_workspace(workspace: &std::path::Path) {
    std::fs::create_dir_all(workspace.join("world/region")).unwrap();
    std::fs::write(workspace.join("world/level.dat"), b"level data").unwrap();
    std::fs::write(workspace.join("world/region/r.0.0.mca"), b"chunk data").unwrap();
    std::fs::create_dir_all(workspace.join("logs")).unwrap();
    std::fs::write(workspace.join("logs/latest.log"), b"log noise").unwrap();
    std::fs::create_dir_all(workspace.join("crash-reports")).unwrap();
    std::fs::write(workspace.join("crash-reports/crash.txt"), b"boom").unwrap();
}

#[tokio::test]
async fn test_snapshot_skips_log_directories() {
    let dir = TempDir::new().unwrap();
    let (registry, backup, id) = fixture(&dir);
    populate_workspace(&registry.get(&id).unwrap().workspace);

    let record = backup.snapshot(&id, Some("pretest".to_string())).await.unwrap();
    assert!(record.id.starts_with("pretest-"));
    assert!(record.id.ends_with(".zip"));
    assert!(record.size_bytes > 0);

    let archive = backup.path_for(&id, &record.id).unwrap();
    let file = std::fs::File::open(archive).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect();

    assert!(names.iter().any(|n| n.contains("world/level.dat")));
    assert!(names.iter().all(|n| !n.starts_with("logs")));
    assert!(names.iter().all(|n| !n.starts_with("crash-reports")));
}

#[tokio::test]
async fn test_snapshot_then_restore_round_trips() {
    let dir = TempDir::new().unwrap();
    let (registry, backup, id) = fixture(&dir);
    let workspace = registry.get(&id).unwrap().workspace;
    populate_workspace(&workspace);

    let record = backup.snapshot(&id, None).await.unwrap();

    // Mutate and damage the workspace after the snapshot.
    std::fs::write(workspace.join("world/level.dat"), b"corrupted").unwrap();
    std::fs::remove_file(workspace.join("world/region/r.0.0.mca")).unwrap();
    std::fs::write(workspace.join("logs/latest.log"), b"newer logs").unwrap();

    backup.restore(&id, &record.id).await.unwrap();

    assert_eq!(
        std::fs::read(workspace.join("world/level.dat")).unwrap(),
        b"level data"
    );
    assert_eq!(
        std::fs::read(workspace.join("world/region/r.0.0.mca")).unwrap(),
        b"chunk data"
    );
    // Skip-list directories are untouched by restore.
    assert_eq!(
        std::fs::read(workspace.join("logs/latest.log")).unwrap(),
        b"newer logs"
    );
}

#[tokio::test]
async fn test_restore_failure_leaves_workspace_untouched() {
    let dir = TempDir::new().unwrap();
    let (registry, backup, id) = fixture(&dir);
    let workspace = registry.get(&id).unwrap().workspace;
    populate_workspace(&workspace);

    // Plant a corrupt archive.
    let backups = dir.path().join("backups").join(&id);
    std::fs::create_dir_all(&backups).unwrap();
    std::fs::write(backups.join("bad-1.zip"), b"this is not a zip").unwrap();

    let err = backup.restore(&id, "bad-1.zip").await.unwrap_err();
    assert!(matches!(err, BlockforgeError::Internal(_)));
    assert_eq!(
        std::fs::read(workspace.join("world/level.dat")).unwrap(),
        b"level data"
    );
    // Leftover staging directories are cleaned up.
    assert!(
        std::fs::read_dir(workspace.parent().unwrap())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().contains(".restore"))
    );
}

#[tokio::test]
async fn test_list_and_delete() {
    let dir = TempDir::new().unwrap();
    let (_registry, backup, id) = fixture(&dir);

    assert!(backup.list(&id).unwrap().is_empty());
    let record = backup.snapshot(&id, Some("keep".to_string())).await.unwrap();
    assert_eq!(backup.list(&id).unwrap().len(), 1);

    backup.delete(&id, &record.id).unwrap();
    assert!(backup.list(&id).unwrap().is_empty());
}

#[tokio::test]
async fn test_path_for_rejects_traversal() {
    let dir = TempDir::new().unwrap();
    let (_registry, backup, id) = fixture(&dir);
    assert!(matches!(
        backup.path_for(&id, "../escape.zip"),
        Err(BlockforgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        backup.path_for(&id, "missing.zip"),
        Err(BlockforgeError::NotFound(_))
    ));
}
