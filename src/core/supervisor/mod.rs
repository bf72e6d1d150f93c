// src/core/supervisor/mod.rs

//! The process lifecycle manager.
//!
//! Owns the runtime process table and is the only component that spawns,
//! signals, or reaps instance processes. Lifecycle transitions for a given
//! instance are serialized through a per-instance async lock; stdout lines
//! flow through a single scanner per process and fan out on the event bus.

pub mod handle;
pub mod scanner;

pub use handle::{CONSOLE_WINDOW, RuntimeHandle};

use crate::config::Config;
use crate::core::errors::BlockforgeError;
use crate::core::events::{self, ConsoleStream, Event, EventBus};
use crate::core::monitor::Sampler;
use crate::core::registry::instance::{Instance, InstanceStatus, ServerKind};
use crate::core::registry::InstanceRegistry;
use crate::core::topology;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// World directories whose `session.lock` must be cleared before a start
/// that follows an unclean shutdown.
const WORLD_DIRS: [&str; 3] = ["world", "world_nether", "world_the_end"];

/// How long after the terminate signal before the process is killed outright.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// The proxy-cascade port. Implemented by the topology coordinator and wired
/// in after construction, which breaks the supervisor↔coordinator cycle.
#[async_trait]
pub trait CascadeDriver: Send + Sync {
    /// Starts every registered backend of the proxy. Failures are reported
    /// per-backend and never abort the proxy itself.
    async fn drive_cascade_start(&self, proxy_id: &str);
    /// Stops every running backend of the proxy.
    async fn drive_cascade_stop(&self, proxy_id: &str);
}

struct Shared {
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    sampler: Arc<dyn Sampler>,
    config: Config,
    processes: DashMap<String, Arc<RuntimeHandle>>,
    transitions: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cascade: OnceCell<Arc<dyn CascadeDriver>>,
}

/// The supervisor. Cheap to clone; all clones share one process table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        bus: Arc<EventBus>,
        sampler: Arc<dyn Sampler>,
        config: Config,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                bus,
                sampler,
                config,
                processes: DashMap::new(),
                transitions: DashMap::new(),
                cascade: OnceCell::new(),
            }),
        }
    }

    /// Wires the cascade port. Called once during daemon assembly.
    pub fn set_cascade(&self, driver: Arc<dyn CascadeDriver>) {
        if self.shared.cascade.set(driver).is_err() {
            warn!("Cascade driver was already wired; ignoring replacement.");
        }
    }

    fn transition_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.shared
            .transitions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Whether a runtime handle exists for the instance.
    pub fn is_running(&self, id: &str) -> bool {
        self.shared.processes.contains_key(id)
    }

    /// The retained console window of a running instance, oldest first.
    pub fn console_window(&self, id: &str) -> Result<Vec<String>, BlockforgeError> {
        self.shared
            .processes
            .get(id)
            .map(|handle| handle.console_window())
            .ok_or_else(|| BlockforgeError::Conflict(format!("instance '{id}' is not running")))
    }

    /// Spawns the instance process and registers its runtime handle.
    ///
    /// Validates the kind-specific jar, normalizes velocity config, clears
    /// stale session locks, then launches the JVM with the workspace as its
    /// working directory. For proxies the backend cascade is kicked off in
    /// the background once the proxy is up.
    pub async fn start(&self, id: &str) -> Result<(), BlockforgeError> {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        let instance = self.shared.registry.get(id)?;
        if self.shared.processes.contains_key(id) {
            return Err(BlockforgeError::Conflict(format!(
                "instance '{}' is already running",
                instance.name
            )));
        }

        let jar = instance.workspace.join(instance.kind.jar_name());
        if !jar.is_file() {
            return Err(BlockforgeError::JarMissing(format!(
                "expected '{}' in {}",
                instance.kind.jar_name(),
                instance.workspace.display()
            )));
        }

        if instance.kind == ServerKind::Velocity {
            topology::velocity::ensure_config_valid(&instance.workspace)?;
        }
        if !instance.kind.is_proxy() {
            clear_session_locks(&instance);
        }

        self.set_status(id, InstanceStatus::Starting, None)?;

        let mut command = Command::new(&self.shared.config.java_bin);
        command
            .arg(format!("-Xmx{}", instance.memory))
            .arg(format!("-Xms{}", instance.memory))
            .arg("-jar")
            .arg(&jar)
            .arg("nogui")
            .current_dir(&instance.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_status(id, InstanceStatus::Stopped, None)?;
                return Err(BlockforgeError::SpawnError(e.to_string()));
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| BlockforgeError::SpawnError("child exited before pid read".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BlockforgeError::SpawnError("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BlockforgeError::SpawnError("child stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BlockforgeError::SpawnError("child stderr not piped".into()))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let runtime = Arc::new(RuntimeHandle::new(pid, stdin, exit_rx));
        self.shared
            .processes
            .insert(id.to_string(), runtime.clone());

        info!(
            "Started instance '{}' ({}) with pid {}.",
            instance.name, id, pid
        );
        if let Err(e) = self.set_status(id, InstanceStatus::Running, None) {
            warn!("Failed to persist running status for '{}': {}", id, e);
        }
        self.shared.sampler.start_sampling(id, pid);

        // One reader per pipe keeps per-stream emission order intact.
        self.spawn_reader(id, runtime.clone(), stdout, ConsoleStream::Stdout);
        self.spawn_reader(id, runtime.clone(), stderr, ConsoleStream::Stderr);
        self.spawn_tps_ticker(id, runtime.clone());
        self.spawn_reaper(id, child, exit_tx);

        if instance.kind.is_proxy() {
            if let Some(driver) = self.shared.cascade.get() {
                let driver = driver.clone();
                let proxy_id = id.to_string();
                tokio::spawn(async move {
                    driver.drive_cascade_start(&proxy_id).await;
                });
            }
        }

        Ok(())
    }

    /// Requests a graceful stop, escalating to a terminate signal after the
    /// configured grace window. For proxies, registered backends are stopped
    /// first unless `skip_backends` is set (cascaded stops pass it to
    /// prevent recursion). Stopping a stopped instance is a no-op.
    pub async fn stop(&self, id: &str, skip_backends: bool) -> Result<(), BlockforgeError> {
        let instance = self.shared.registry.get(id)?;
        if !self.is_running(id) {
            debug!("Stop requested for '{}' but it is not running.", id);
            return Ok(());
        }

        if instance.kind.is_proxy() && !skip_backends {
            if let Some(driver) = self.shared.cascade.get() {
                driver.drive_cascade_stop(id).await;
            }
        }

        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        let Some(handle) = self.shared.processes.get(id).map(|h| h.clone()) else {
            debug!("Stop requested for '{}' but it is not running.", id);
            return Ok(());
        };

        self.set_status(id, InstanceStatus::Stopping, None)?;
        if let Err(e) = handle.write_line("stop").await {
            warn!("Failed to write stop command to '{}': {}", id, e);
        }

        let mut exit_rx = handle.exit_receiver();
        let graceful = tokio::time::timeout(
            self.shared.config.stop_grace,
            async { let _ = exit_rx.wait_for(|code| code.is_some()).await; },
        )
        .await;

        if graceful.is_err() {
            warn!(
                "Instance '{}' did not exit within {:?}; sending terminate signal.",
                id, self.shared.config.stop_grace
            );
            terminate_pid(handle.pid, false);

            let terminated = tokio::time::timeout(TERM_GRACE, async {
                let _ = exit_rx.wait_for(|code| code.is_some()).await;
            })
            .await;
            if terminated.is_err() {
                error!("Instance '{}' ignored SIGTERM; killing pid {}.", id, handle.pid);
                terminate_pid(handle.pid, true);
                let _ = tokio::time::timeout(Duration::from_secs(5), async {
                    let _ = exit_rx.wait_for(|code| code.is_some()).await;
                })
                .await;
            }
        }

        Ok(())
    }

    /// Stop, settle, start.
    pub async fn restart(&self, id: &str) -> Result<(), BlockforgeError> {
        self.stop(id, false).await?;
        tokio::time::sleep(self.shared.config.restart_delay).await;
        self.start(id).await
    }

    /// Writes one command line to the instance's stdin.
    pub async fn send_command(&self, id: &str, line: &str) -> Result<(), BlockforgeError> {
        let handle = self
            .shared
            .processes
            .get(id)
            .map(|h| h.clone())
            .ok_or_else(|| {
                BlockforgeError::Conflict(format!("instance '{id}' is not running"))
            })?;
        handle
            .write_line(line)
            .await
            .map_err(|e| BlockforgeError::Io(Arc::new(e)))
    }

    /// Parallel best-effort stop of every running instance. Used on
    /// shutdown; every status ends up persisted as stopped.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .shared
            .processes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} running instance(s).", ids.len());

        let stops = ids.iter().map(|id| {
            let supervisor = self.clone();
            let id = id.clone();
            async move {
                if let Err(e) = supervisor.stop(&id, true).await {
                    warn!("Failed to stop '{}' gracefully: {}", id, e);
                }
            }
        });
        futures::future::join_all(stops).await;

        // Anything still in the table ignored every signal; force-kill and
        // persist the terminal status ourselves.
        for entry in self.shared.processes.iter() {
            error!("Instance '{}' still running after stop_all; killing.", entry.key());
            terminate_pid(entry.value().pid, true);
        }
        for id in ids {
            self.shared.processes.remove(&id);
            if let Err(e) = self.shared.registry.set_status(&id, InstanceStatus::Stopped) {
                warn!("Failed to persist stopped status for '{}': {}", id, e);
            }
            self.shared.sampler.stop_sampling(&id);
        }
    }

    /// Composite delete: stops any running process, then removes the row
    /// and workspace. Scheduled tasks that target the id are retained but
    /// never fire again.
    pub async fn delete_instance(&self, id: &str) -> Result<Instance, BlockforgeError> {
        if self.is_running(id) {
            self.stop(id, false).await?;
        }
        self.shared.registry.remove(id)
    }

    fn set_status(
        &self,
        id: &str,
        status: InstanceStatus,
        exit_code: Option<i32>,
    ) -> Result<(), BlockforgeError> {
        self.shared.registry.set_status(id, status)?;
        self.shared.bus.publish(
            &events::status_topic(id),
            Event::StatusChange {
                server_id: id.to_string(),
                status,
                exit_code,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    fn spawn_reader(
        &self,
        id: &str,
        runtime: Arc<RuntimeHandle>,
        pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        stream: ConsoleStream,
    ) {
        let shared = self.shared.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                runtime.record_line(&line);
                shared.bus.publish(
                    &events::console_topic(&id),
                    Event::ConsoleLine {
                        server_id: id.clone(),
                        stream,
                        line: line.clone(),
                        timestamp: Utc::now(),
                    },
                );

                if stream != ConsoleStream::Stdout {
                    continue;
                }
                match scanner::scan(&line) {
                    Some(scanner::LineEvent::Tps(tps)) => {
                        shared.sampler.record_tps(&id, tps);
                    }
                    Some(scanner::LineEvent::PlayerJoined(player)) => {
                        shared.bus.publish(
                            &events::player_topic(&id),
                            Event::Player {
                                server_id: id.clone(),
                                player,
                                joined: true,
                                timestamp: Utc::now(),
                            },
                        );
                    }
                    Some(scanner::LineEvent::PlayerLeft(player)) => {
                        shared.bus.publish(
                            &events::player_topic(&id),
                            Event::Player {
                                server_id: id.clone(),
                                player,
                                joined: false,
                                timestamp: Utc::now(),
                            },
                        );
                    }
                    None => {}
                }
            }
            debug!("{:?} reader for '{}' finished.", stream, id);
        });
    }

    /// Writes `tps` to stdin on a fixed cadence so the stdout scanner can
    /// keep the TPS cache fresh. Ends when the process exits.
    fn spawn_tps_ticker(&self, id: &str, runtime: Arc<RuntimeHandle>) {
        let interval = self.shared.config.tps_poll_interval;
        let id = id.to_string();
        tokio::spawn(async move {
            let mut exit_rx = runtime.exit_receiver();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if runtime.write_line("tps").await.is_err() {
                            return;
                        }
                    }
                    _ = async { let _ = exit_rx.wait_for(|code| code.is_some()).await; } => {
                        debug!("TPS ticker for '{}' ending with process exit.", id);
                        return;
                    }
                }
            }
        });
    }

    /// Waits for the child to exit, then drops the handle, tears down
    /// sampling, persists the stopped status, and emits stop or crash.
    fn spawn_reaper(
        &self,
        id: &str,
        mut child: tokio::process::Child,
        exit_tx: watch::Sender<Option<i32>>,
    ) {
        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    error!("Failed waiting on instance '{}': {}", id, e);
                    -1
                }
            };

            supervisor.shared.processes.remove(&id);
            supervisor.shared.sampler.stop_sampling(&id);

            if exit_code == 0 {
                info!("Instance '{}' exited cleanly.", id);
            } else {
                warn!("Instance '{}' exited with code {}.", id, exit_code);
            }
            if let Err(e) = supervisor.set_status(&id, InstanceStatus::Stopped, Some(exit_code)) {
                warn!("Failed to persist exit of '{}': {}", id, e);
            }
            // Waiters unblock only once the terminal status is persisted.
            let _ = exit_tx.send(Some(exit_code));
        });
    }
}

/// Removes stale `session.lock` files left behind by an unclean shutdown.
/// Unconditional on start; missing files and directories are fine.
fn clear_session_locks(instance: &Instance) {
    for dir in WORLD_DIRS {
        let lock = instance.workspace.join(dir).join("session.lock");
        match std::fs::remove_file(&lock) {
            Ok(()) => debug!("Removed stale session lock {}.", lock.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", lock.display(), e),
        }
    }
}

/// Sends SIGTERM (or SIGKILL when `force`) to the instance's process group
/// leader. On non-unix targets this logs and does nothing; the reaper still
/// collects the child whenever it exits.
fn terminate_pid(pid: u32, force: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal) {
            warn!("Failed to send {:?} to pid {}: {}", signal, pid, e);
        }
    }
    #[cfg(not(unix))]
    {
        warn!("Signal escalation unsupported on this platform (pid {pid}, force {force}).");
    }
}
