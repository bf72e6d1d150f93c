use blockforge::core::registry::{
    CreateSpec, InstanceRegistry, InstanceStatus, Principal, ServerKind, UpdatePatch,
    validate_port,
};
use blockforge::BlockforgeError;
use tempfile::TempDir;

fn spec(name: &str, port: u16, rcon_port: u16) -> CreateSpec {
    CreateSpec {
        name: name.to_string(),
        kind: ServerKind::Paper,
        version: "1.20.4".to_string(),
        host: "0.0.0.0".to_string(),
        port,
        rcon_port,
        rcon_password: Some("rcon123".to_string()),
        memory: "2G".to_string(),
    }
}

fn open_registry(dir: &TempDir) -> InstanceRegistry {
    InstanceRegistry::open(
        dir.path().join("data/servers.json"),
        dir.path().join("servers"),
    )
    .unwrap()
}

#[tokio::test]
async fn test_create_allocates_workspace_and_persists() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);

    let instance = registry
        .create(spec("survival", 25565, 25575), Some("alice".to_string()))
        .unwrap();

    assert!(instance.workspace.is_dir());
    assert!(instance.workspace.join("server.properties").is_file());
    assert!(instance.workspace.join("eula.txt").is_file());
    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert_eq!(instance.owner_id.as_deref(), Some("alice"));
    assert!(dir.path().join("data/servers.json").is_file());
}

#[tokio::test]
async fn test_create_rejects_declared_port_collisions() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    registry.create(spec("one", 25565, 25575), None).unwrap();

    let err = registry
        .create(spec("two", 25565, 25580), None)
        .unwrap_err();
    assert!(matches!(err, BlockforgeError::Conflict(_)));

    // RCON port colliding with another row's game port is also a conflict.
    let err = registry
        .create(spec("three", 25600, 25565), None)
        .unwrap_err();
    assert!(matches!(err, BlockforgeError::Conflict(_)));
}

#[tokio::test]
async fn test_create_rejects_duplicate_names() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    registry.create(spec("lobby", 25565, 25575), None).unwrap();
    let err = registry
        .create(spec("lobby", 25600, 25610), None)
        .unwrap_err();
    assert!(matches!(err, BlockforgeError::Conflict(_)));
}

#[tokio::test]
async fn test_generated_password_when_spec_omits_one() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let mut missing = spec("nopass", 25565, 25575);
    missing.rcon_password = None;
    let instance = registry.create(missing, None).unwrap();
    assert!(!instance.rcon_password.is_empty());
}

#[tokio::test]
async fn test_list_filters_by_owner() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    registry
        .create(spec("a", 25565, 25575), Some("alice".to_string()))
        .unwrap();
    registry
        .create(spec("b", 25566, 25576), Some("bob".to_string()))
        .unwrap();
    registry.create(spec("legacy", 25567, 25577), None).unwrap();

    let admin = registry.list(&Principal::admin("root"));
    assert_eq!(admin.len(), 3);

    let alice = registry.list(&Principal::user("alice"));
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].name, "a");

    // Legacy rows without an owner are invisible to plain users.
    let carol = registry.list(&Principal::user("carol"));
    assert!(carol.is_empty());
}

#[tokio::test]
async fn test_update_touches_only_mutable_fields() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let instance = registry.create(spec("sv", 25565, 25575), None).unwrap();

    let updated = registry
        .update(
            &instance.id,
            UpdatePatch {
                memory: Some("4G".to_string()),
                rcon_password: Some("newpass".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(updated.memory, "4G");
    assert_eq!(updated.rcon_password, "newpass");
    assert_eq!(updated.kind, ServerKind::Paper);
    assert_eq!(updated.version, "1.20.4");
    assert_eq!(updated.port, 25565);
}

#[tokio::test]
async fn test_remove_deletes_row_and_workspace() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let instance = registry.create(spec("gone", 25565, 25575), None).unwrap();
    let workspace = instance.workspace.clone();

    registry.remove(&instance.id).unwrap();
    assert!(!workspace.exists());
    assert!(matches!(
        registry.get(&instance.id),
        Err(BlockforgeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reload_normalizes_status_to_stopped() {
    let dir = TempDir::new().unwrap();
    let catalog = dir.path().join("data/servers.json");
    let id;
    {
        let registry = open_registry(&dir);
        let instance = registry.create(spec("sv", 25565, 25575), None).unwrap();
        id = instance.id.clone();
        registry.set_status(&id, InstanceStatus::Running).unwrap();
    }
    // The catalog on disk carries the running status...
    let raw = std::fs::read_to_string(&catalog).unwrap();
    assert!(raw.contains("running"));

    // ...but a fresh open resets every row.
    let reopened = InstanceRegistry::open(&catalog, dir.path().join("servers")).unwrap();
    assert_eq!(reopened.get(&id).unwrap().status, InstanceStatus::Stopped);
    assert_eq!(reopened.get(&id).unwrap().name, "sv");
}

#[tokio::test]
async fn test_legacy_rows_without_host_gain_default() {
    let dir = TempDir::new().unwrap();
    let catalog = dir.path().join("data/servers.json");
    std::fs::create_dir_all(catalog.parent().unwrap()).unwrap();
    std::fs::write(
        &catalog,
        r#"[{
            "id": "legacy-1",
            "name": "old",
            "kind": "vanilla",
            "version": "1.16.5",
            "port": 25565,
            "rcon_port": 25575,
            "rcon_password": "x",
            "memory": "1G",
            "workspace": "/tmp/legacy-1",
            "created_at": "2021-01-01T00:00:00Z",
            "status": "crashed"
        }]"#,
    )
    .unwrap();

    let registry = InstanceRegistry::open(&catalog, dir.path().join("servers")).unwrap();
    let row = registry.get("legacy-1").unwrap();
    assert_eq!(row.host, "0.0.0.0");
    assert_eq!(row.status, InstanceStatus::Stopped);
    assert_eq!(row.owner_id, None);
}

#[tokio::test]
async fn test_corrupt_catalog_is_fatal() {
    let dir = TempDir::new().unwrap();
    let catalog = dir.path().join("data/servers.json");
    std::fs::create_dir_all(catalog.parent().unwrap()).unwrap();
    std::fs::write(&catalog, "{ not json ]").unwrap();

    assert!(InstanceRegistry::open(&catalog, dir.path().join("servers")).is_err());
}

#[tokio::test]
async fn test_port_boundaries() {
    assert!(validate_port(1023).is_err());
    assert_eq!(validate_port(1024).unwrap(), 1024);
    assert_eq!(validate_port(65535).unwrap(), 65535);
    assert!(validate_port(65536).is_err());
}

#[tokio::test]
async fn test_find_by_port() {
    let dir = TempDir::new().unwrap();
    let registry = open_registry(&dir);
    let instance = registry.create(spec("sv", 25565, 25575), None).unwrap();
    assert_eq!(registry.find_by_port(25565).unwrap().id, instance.id);
    assert!(registry.find_by_port(30000).is_none());
}
