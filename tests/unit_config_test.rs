use blockforge::config::Config;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.java_bin, "java");
    assert_eq!(config.timezone, "Europe/Berlin");
    assert_eq!(config.resource_interval, Duration::from_secs(2));
    assert_eq!(config.tps_poll_interval, Duration::from_secs(10));
    assert_eq!(config.probe_interval, Duration::from_secs(30));
    assert_eq!(config.probe_timeout, Duration::from_secs(3));
    assert_eq!(config.rcon_timeout, Duration::from_secs(5));
    assert_eq!(config.stop_grace, Duration::from_secs(30));
    assert_eq!(config.restart_delay, Duration::from_secs(2));
    assert_eq!(config.cascade_stagger, Duration::from_millis(500));
    assert_eq!(config.cascade_settle, Duration::from_secs(5));
    assert!(config.scheduler_tz().is_ok());
}

#[tokio::test]
async fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_file(dir.path().join("nope.toml")).unwrap();
    assert_eq!(config.java_bin, "java");
}

#[tokio::test]
async fn test_file_overrides_and_humantime_durations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blockforge.toml");
    std::fs::write(
        &path,
        r#"
java_bin = "/opt/jdk17/bin/java"
timezone = "UTC"
stop_grace = "45s"
cascade_stagger = "250ms"
"#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.java_bin, "/opt/jdk17/bin/java");
    assert_eq!(config.timezone, "UTC");
    assert_eq!(config.stop_grace, Duration::from_secs(45));
    assert_eq!(config.cascade_stagger, Duration::from_millis(250));
    // Untouched fields keep their defaults.
    assert_eq!(config.probe_timeout, Duration::from_secs(3));
}

#[tokio::test]
async fn test_bad_timezone_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blockforge.toml");
    std::fs::write(&path, "timezone = \"Mars/Olympus\"\n").unwrap();
    assert!(Config::from_file(&path).is_err());
}

#[tokio::test]
async fn test_parse_error_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blockforge.toml");
    std::fs::write(&path, "not [valid toml").unwrap();
    assert!(Config::from_file(&path).is_err());
}
