use blockforge::config::Config;
use blockforge::core::events::{self, Event, EventBus};
use blockforge::core::monitor::ResourceSampler;
use blockforge::core::registry::{
    CreateSpec, InstanceRegistry, InstanceStatus, ServerKind,
};
use blockforge::core::supervisor::ProcessSupervisor;
use blockforge::BlockforgeError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    supervisor: ProcessSupervisor,
    id: String,
}

/// Builds a supervisor whose "java" is a small shell script that behaves
/// like a well-mannered server: prints a ready line and a TPS report, then
/// echoes stdin until it reads `stop`.
fn fixture(dir: &TempDir, script_body: &str) -> Fixture {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data");
    config.servers_root = dir.path().join("servers");
    config.backups_dir = dir.path().join("backups");
    config.resource_interval = Duration::from_millis(50);
    config.stop_grace = Duration::from_secs(5);
    config.restart_delay = Duration::from_millis(100);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.path().join("fake-java");
        std::fs::write(&script, script_body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        config.java_bin = script.to_string_lossy().to_string();
    }
    #[cfg(not(unix))]
    let _ = script_body;

    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(
        InstanceRegistry::open(config.data_dir.join("servers.json"), &config.servers_root)
            .unwrap(),
    );
    let sampler = Arc::new(ResourceSampler::new(bus.clone(), config.resource_interval));
    let supervisor =
        ProcessSupervisor::new(registry.clone(), bus.clone(), sampler, config.clone());

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

    Fixture {
        registry,
        bus,
        supervisor,
        id: instance.id,
    }
}

const WELL_BEHAVED: &str = r#"#!/bin/sh
echo '[12:00:00] Done (1.0s)! For help, type "help"'
echo '[12:00:00] TPS from last 1m, 5m, 15m: 20.0, 20.0, 20.0'
while read line; do
  if [ "$line" = "stop" ]; then
    echo 'Stopping server'
    exit 0
  fi
  echo "cmd: $line"
done
"#;

const CRASHER: &str = r#"#!/bin/sh
echo 'something went terribly wrong'
exit 3
"#;

fn touch_jar(registry: &InstanceRegistry, id: &str) {
    let instance = registry.get(id).unwrap();
    std::fs::write(instance.workspace.join("server.jar"), b"jar bytes").unwrap();
}

async fn await_status(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    wanted: InstanceStatus,
) -> Option<i32> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
        if let Event::StatusChange {
            status, exit_code, ..
        } = event
        {
            if status == wanted {
                return exit_code;
            }
        }
    }
}

#[tokio::test]
async fn test_start_rejects_missing_jar() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir, WELL_BEHAVED);
    assert!(matches!(
        fx.supervisor.start(&fx.id).await,
        Err(BlockforgeError::JarMissing(_))
    ));
}

#[tokio::test]
async fn test_stop_on_stopped_instance_is_noop() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir, WELL_BEHAVED);
    assert!(fx.supervisor.stop(&fx.id, false).await.is_ok());
}

#[tokio::test]
async fn test_send_command_requires_running_instance() {
    let dir = TempDir::new().unwrap();
    let fx = fixture(&dir, WELL_BEHAVED);
    assert!(matches!(
        fx.supervisor.send_command(&fx.id, "say hi").await,
        Err(BlockforgeError::Conflict(_))
    ));
}

#[cfg(unix)]
mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, WELL_BEHAVED);
        touch_jar(&fx.registry, &fx.id);

        let mut status_rx = fx.bus.subscribe(&events::status_topic(&fx.id));
        let mut console_rx = fx.bus.subscribe(&events::console_topic(&fx.id));

        fx.supervisor.start(&fx.id).await.unwrap();
        assert!(fx.supervisor.is_running(&fx.id));
        await_status(&mut status_rx, InstanceStatus::Starting).await;
        await_status(&mut status_rx, InstanceStatus::Running).await;
        assert_eq!(
            fx.registry.get(&fx.id).unwrap().status,
            InstanceStatus::Running
        );
        assert!(fx.registry.get(&fx.id).unwrap().last_started.is_some());

        // A second start while running is a conflict.
        assert!(matches!(
            fx.supervisor.start(&fx.id).await,
            Err(BlockforgeError::Conflict(_))
        ));

        // Console lines flow on the console topic in order.
        let first = tokio::time::timeout(Duration::from_secs(5), console_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            Event::ConsoleLine { line, .. } => assert!(line.contains("Done")),
            other => panic!("unexpected event {other:?}"),
        }

        fx.supervisor.stop(&fx.id, false).await.unwrap();
        let exit = await_status(&mut status_rx, InstanceStatus::Stopped).await;
        assert_eq!(exit, Some(0));
        assert!(!fx.supervisor.is_running(&fx.id));
        assert_eq!(
            fx.registry.get(&fx.id).unwrap().status,
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_send_command_reaches_stdin() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, WELL_BEHAVED);
        touch_jar(&fx.registry, &fx.id);

        let mut console_rx = fx.bus.subscribe(&events::console_topic(&fx.id));
        fx.supervisor.start(&fx.id).await.unwrap();

        fx.supervisor.send_command(&fx.id, "say hello").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, console_rx.recv())
                .await
                .expect("timed out waiting for echo")
                .unwrap();
            if let Event::ConsoleLine { line, .. } = event {
                if line == "cmd: say hello" {
                    break;
                }
            }
        }
        fx.supervisor.stop(&fx.id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_tps_line_feeds_resource_samples() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, WELL_BEHAVED);
        touch_jar(&fx.registry, &fx.id);

        let mut resource_rx = fx.bus.subscribe(&events::resource_topic(&fx.id));
        fx.supervisor.start(&fx.id).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let sample = loop {
            let event = tokio::time::timeout_at(deadline, resource_rx.recv())
                .await
                .expect("timed out waiting for resource sample")
                .unwrap();
            if let Event::Resource { sample, .. } = event {
                break sample;
            }
        };
        assert_eq!(sample.tps, 20.0);
        assert!(sample.cores >= 1);

        fx.supervisor.stop(&fx.id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_external_death_emits_crash_exit_code() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, CRASHER);
        touch_jar(&fx.registry, &fx.id);

        let mut status_rx = fx.bus.subscribe(&events::status_topic(&fx.id));
        fx.supervisor.start(&fx.id).await.unwrap();

        let exit = await_status(&mut status_rx, InstanceStatus::Stopped).await;
        assert_eq!(exit, Some(3));
        assert!(!fx.supervisor.is_running(&fx.id));
    }

    #[tokio::test]
    async fn test_stop_all_clears_process_table() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, WELL_BEHAVED);
        touch_jar(&fx.registry, &fx.id);

        fx.supervisor.start(&fx.id).await.unwrap();
        fx.supervisor.stop_all().await;

        assert!(!fx.supervisor.is_running(&fx.id));
        assert_eq!(
            fx.registry.get(&fx.id).unwrap().status,
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_delete_instance_stops_and_removes() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, WELL_BEHAVED);
        touch_jar(&fx.registry, &fx.id);
        let workspace = fx.registry.get(&fx.id).unwrap().workspace;

        fx.supervisor.start(&fx.id).await.unwrap();
        fx.supervisor.delete_instance(&fx.id).await.unwrap();

        assert!(!workspace.exists());
        assert!(matches!(
            fx.registry.get(&fx.id),
            Err(BlockforgeError::NotFound(_))
        ));
        assert!(!fx.supervisor.is_running(&fx.id));
    }

    #[tokio::test]
    async fn test_session_locks_cleared_on_start() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir, WELL_BEHAVED);
        touch_jar(&fx.registry, &fx.id);

        let workspace = fx.registry.get(&fx.id).unwrap().workspace;
        std::fs::create_dir_all(workspace.join("world")).unwrap();
        std::fs::write(workspace.join("world/session.lock"), b"stale").unwrap();

        fx.supervisor.start(&fx.id).await.unwrap();
        assert!(!workspace.join("world/session.lock").exists());
        fx.supervisor.stop(&fx.id, false).await.unwrap();
    }
}
