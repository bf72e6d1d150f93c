// src/config.rs

//! Manages daemon configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// The daemon's runtime configuration, loaded from `blockforge.toml`.
///
/// Every field has a default so that a missing config file yields a fully
/// usable configuration rooted in the current working directory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Directory holding the persisted catalogs (`servers.json`, `tasks.json`, `webhooks.json`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root directory under which instance workspaces are allocated.
    #[serde(default = "default_servers_root")]
    pub servers_root: PathBuf,

    /// Directory under which backup archives are written, one subdirectory per instance.
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,

    /// The Java executable used to launch instances.
    #[serde(default = "default_java_bin")]
    pub java_bin: String,

    /// Default tracing filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// IANA timezone name in which scheduled task cron expressions are evaluated.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Interval between per-instance CPU/RSS samples.
    #[serde(with = "humantime_serde", default = "default_resource_interval")]
    pub resource_interval: Duration,

    /// Interval at which `tps` is written to a running instance's stdin.
    #[serde(with = "humantime_serde", default = "default_tps_poll_interval")]
    pub tps_poll_interval: Duration,

    /// Interval between proxy backend liveness sweeps.
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,

    /// Per-backend ceiling for a single liveness probe.
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,

    /// Per-call ceiling for RCON connect/auth/command round-trips.
    #[serde(with = "humantime_serde", default = "default_rcon_timeout")]
    pub rcon_timeout: Duration,

    /// Grace window between writing `stop` and escalating to a terminate signal.
    #[serde(with = "humantime_serde", default = "default_stop_grace")]
    pub stop_grace: Duration,

    /// Pause between the stop and start halves of a restart.
    #[serde(with = "humantime_serde", default = "default_restart_delay")]
    pub restart_delay: Duration,

    /// Stagger between consecutive backend lifecycle calls during a cascade.
    #[serde(with = "humantime_serde", default = "default_cascade_stagger")]
    pub cascade_stagger: Duration,

    /// Settle time after a cascaded start before the cascade is reported complete.
    #[serde(with = "humantime_serde", default = "default_cascade_settle")]
    pub cascade_settle: Duration,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_servers_root() -> PathBuf {
    PathBuf::from("minecraft_servers")
}
fn default_backups_dir() -> PathBuf {
    PathBuf::from("backups")
}
fn default_java_bin() -> String {
    "java".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}
fn default_resource_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_tps_poll_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_rcon_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_stop_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_restart_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_cascade_stagger() -> Duration {
    Duration::from_millis(500)
}
fn default_cascade_settle() -> Duration {
    Duration::from_secs(5)
}

impl Default for Config {
    fn default() -> Self {
        // Every field carries a serde default, so an empty document resolves.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    ///
    /// A missing file is not an error: the daemon starts with defaults so a
    /// fresh checkout works without setup. A file that exists but fails to
    /// parse is fatal.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Config file '{}' not found. Starting with defaults.",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow!(e))
                    .with_context(|| format!("failed to read config file '{}'", path.display()));
            }
        };

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the configured timezone name to a `chrono_tz::Tz`.
    pub fn scheduler_tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| anyhow!("unknown timezone '{}'", self.timezone))
    }

    /// Path of a catalog file under the data dir.
    pub fn catalog_path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    fn validate(&self) -> Result<()> {
        self.scheduler_tz()?;
        if self.java_bin.trim().is_empty() {
            return Err(anyhow!("java_bin must not be empty"));
        }
        Ok(())
    }
}
