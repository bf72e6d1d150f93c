use blockforge::core::registry::{CreateSpec, InstanceRegistry, ServerKind};
use blockforge::core::topology::{BackendEdge, velocity};
use blockforge::BlockforgeError;
use tempfile::TempDir;

fn proxy_workspace(dir: &TempDir) -> std::path::PathBuf {
    let registry = InstanceRegistry::open(
        dir.path().join("data/servers.json"),
        dir.path().join("servers"),
    )
    .unwrap();
    registry
        .create(
            CreateSpec {
                name: "velocity-proxy".to_string(),
                kind: ServerKind::Velocity,
                version: "3.3.0".to_string(),
                host: "0.0.0.0".to_string(),
                port: 25577,
                rcon_port: 25587,
                rcon_password: Some("x".to_string()),
                memory: "1G".to_string(),
            },
            None,
        )
        .unwrap()
        .workspace
}

fn edge(name: &str, port: u16) -> BackendEdge {
    BackendEdge {
        name: name.to_string(),
        address: format!("0.0.0.0:{port}"),
        motd: None,
        restricted: false,
        default: false,
    }
}

fn parsed(workspace: &std::path::Path) -> toml::Value {
    toml::from_str(&std::fs::read_to_string(workspace.join("velocity.toml")).unwrap()).unwrap()
}

#[tokio::test]
async fn test_initial_config_shape() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);

    let doc = parsed(&workspace);
    assert_eq!(doc["config-version"].as_str(), Some("2.7"));
    assert_eq!(doc["bind"].as_str(), Some("0.0.0.0:25577"));
    assert_eq!(
        doc["player-info-forwarding-mode"].as_str(),
        Some("modern")
    );
    assert_eq!(
        doc["servers"]["lobby"].as_str(),
        Some("127.0.0.1:25565")
    );
    assert_eq!(doc["servers"]["try"].as_array().map(|a| a.len()), Some(0));
}

#[tokio::test]
async fn test_first_backend_replaces_placeholder() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);

    velocity::add_edge(&workspace, &edge("lobby", 25566)).unwrap();

    let doc = parsed(&workspace);
    assert_eq!(doc["servers"]["lobby"].as_str(), Some("0.0.0.0:25566"));
    let try_list = doc["servers"]["try"].as_array().unwrap();
    assert_eq!(try_list.len(), 1);
    assert_eq!(try_list[0].as_str(), Some("lobby"));
}

#[tokio::test]
async fn test_first_backend_with_other_name_still_swaps() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);

    velocity::add_edge(&workspace, &edge("survival", 25565)).unwrap();

    let doc = parsed(&workspace);
    // The placeholder entry is gone entirely.
    assert!(doc["servers"].get("lobby").is_none());
    assert_eq!(doc["servers"]["survival"].as_str(), Some("0.0.0.0:25565"));
    assert_eq!(
        doc["servers"]["try"].as_array().unwrap()[0].as_str(),
        Some("survival")
    );
}

#[tokio::test]
async fn test_second_backend_leaves_try_alone() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);
    velocity::add_edge(&workspace, &edge("survival", 25565)).unwrap();
    velocity::add_edge(&workspace, &edge("creative", 25566)).unwrap();

    let doc = parsed(&workspace);
    let try_list = doc["servers"]["try"].as_array().unwrap();
    assert_eq!(try_list.len(), 1);
    assert_eq!(try_list[0].as_str(), Some("survival"));

    let edges = velocity::list_edges(&workspace).unwrap();
    assert_eq!(edges.len(), 2);
    assert!(edges.iter().find(|e| e.name == "survival").unwrap().default);
    assert!(!edges.iter().find(|e| e.name == "creative").unwrap().default);
}

#[tokio::test]
async fn test_duplicate_backend_is_conflict() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);
    velocity::add_edge(&workspace, &edge("survival", 25565)).unwrap();
    assert!(matches!(
        velocity::add_edge(&workspace, &edge("survival", 25566)),
        Err(BlockforgeError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_remove_prunes_try_list() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);
    velocity::add_edge(&workspace, &edge("survival", 25565)).unwrap();
    velocity::add_edge(&workspace, &edge("creative", 25566)).unwrap();

    velocity::remove_edge(&workspace, "survival").unwrap();
    let doc = parsed(&workspace);
    assert!(doc["servers"].get("survival").is_none());
    assert_eq!(doc["servers"]["try"].as_array().map(|a| a.len()), Some(0));
}

#[tokio::test]
async fn test_set_default_promotes_in_try() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);
    velocity::add_edge(&workspace, &edge("survival", 25565)).unwrap();
    velocity::add_edge(&workspace, &edge("creative", 25566)).unwrap();

    velocity::set_default(&workspace, "creative").unwrap();
    let doc = parsed(&workspace);
    let try_list = doc["servers"]["try"].as_array().unwrap();
    assert_eq!(try_list[0].as_str(), Some("creative"));
}

#[tokio::test]
async fn test_ensure_config_valid_folds_secret_and_prunes() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);
    velocity::add_edge(&workspace, &edge("survival", 25565)).unwrap();

    // Simulate a dangling try entry and forced host left by a manual edit.
    let path = workspace.join("velocity.toml");
    let mut doc = parsed(&workspace);
    {
        let servers = doc["servers"].as_table_mut().unwrap();
        servers.insert(
            "try".to_string(),
            toml::Value::Array(vec![
                toml::Value::String("survival".to_string()),
                toml::Value::String("ghost".to_string()),
            ]),
        );
        let forced = doc["forced-hosts"].as_table_mut().unwrap();
        forced.insert(
            "play.example.com".to_string(),
            toml::Value::Array(vec![
                toml::Value::String("survival".to_string()),
                toml::Value::String("ghost".to_string()),
            ]),
        );
    }
    std::fs::write(&path, toml::to_string_pretty(&doc).unwrap()).unwrap();

    std::fs::write(workspace.join("forwarding.secret"), "abc123\n").unwrap();
    velocity::ensure_config_valid(&workspace).unwrap();

    let doc = parsed(&workspace);
    assert_eq!(doc["forwarding-secret"].as_str(), Some("abc123"));
    let try_list = doc["servers"]["try"].as_array().unwrap();
    assert_eq!(try_list.len(), 1);
    assert_eq!(try_list[0].as_str(), Some("survival"));
    let forced = doc["forced-hosts"]["play.example.com"].as_array().unwrap();
    assert_eq!(forced.len(), 1);
}

#[tokio::test]
async fn test_read_forwarding_secret_absent() {
    let dir = TempDir::new().unwrap();
    let workspace = proxy_workspace(&dir);
    assert_eq!(velocity::read_forwarding_secret(&workspace).unwrap(), None);
}
