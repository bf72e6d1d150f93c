// src/core/scheduler/mod.rs

//! The cron-driven task scheduler.
//!
//! Each enabled task runs its own timer loop that sleeps until the next
//! zone-aware fire time. Executions for one task id never overlap: a tick
//! that finds the previous execution still in flight is skipped and logged
//! as a miss. Mutating a task cancels and reschedules its loop atomically.

pub mod task;

pub use task::{ExecutionRecord, ExecutionRing, ScheduledTask, TaskKind, TaskSpec};

use crate::core::backup::BackupManager;
use crate::core::errors::BlockforgeError;
use crate::core::registry::InstanceRegistry;
use crate::core::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Capacity of the execution ring.
pub const RING_CAPACITY: usize = 100;

/// Validates a 5-field cron expression and compiles it. The `cron` crate
/// wants a seconds field, so a zero-seconds column is prepended after the
/// field count has been checked against the 5-field contract.
pub fn validate_cron(expr: &str) -> Result<Schedule, BlockforgeError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(BlockforgeError::InvalidArgument(format!(
            "cron expression must have 5 fields, got {fields}"
        )));
    }
    Ok(Schedule::from_str(&format!("0 {expr}"))?)
}

/// The execution port a firing task runs through. Keeps the scheduler
/// decoupled from the supervisor and backup concrete types in tests.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs the task to completion and returns a human-readable result.
    async fn execute(&self, task: &ScheduledTask) -> Result<String, BlockforgeError>;
}

/// The production executor: lifecycle and command tasks go to the
/// supervisor, backup tasks to the backup manager.
pub struct LifecycleExecutor {
    supervisor: ProcessSupervisor,
    backup: Arc<BackupManager>,
}

impl LifecycleExecutor {
    pub fn new(supervisor: ProcessSupervisor, backup: Arc<BackupManager>) -> Self {
        Self { supervisor, backup }
    }
}

#[async_trait]
impl TaskExecutor for LifecycleExecutor {
    async fn execute(&self, task: &ScheduledTask) -> Result<String, BlockforgeError> {
        match task.kind {
            TaskKind::Backup => {
                let record = self.backup.snapshot(&task.server_id, None).await?;
                Ok(format!("backup '{}' created", record.id))
            }
            TaskKind::Restart => {
                self.supervisor.restart(&task.server_id).await?;
                Ok("restarted".to_string())
            }
            TaskKind::Start => {
                self.supervisor.start(&task.server_id).await?;
                Ok("started".to_string())
            }
            TaskKind::Stop => {
                self.supervisor.stop(&task.server_id, false).await?;
                Ok("stopped".to_string())
            }
            TaskKind::Command => {
                let command = task.command.as_deref().ok_or_else(|| {
                    BlockforgeError::InvalidArgument("command task carries no command".into())
                })?;
                self.supervisor.send_command(&task.server_id, command).await?;
                Ok(format!("sent '{command}'"))
            }
        }
    }
}

struct SchedulerInner {
    store: Mutex<HashMap<String, ScheduledTask>>,
    path: PathBuf,
    tz: Tz,
    registry: Arc<InstanceRegistry>,
    executor: Arc<dyn TaskExecutor>,
    ring: ExecutionRing,
    in_flight: DashMap<String, ()>,
    cancels: DashMap<String, watch::Sender<bool>>,
}

/// The scheduler. Cheap to clone; all clones share the task table.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Opens the persisted task table. A corrupt table is fatal, like the
    /// instance catalog.
    pub fn open(
        path: impl Into<PathBuf>,
        tz: Tz,
        registry: Arc<InstanceRegistry>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, BlockforgeError> {
        let path = path.into();
        let mut store = HashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let tasks: Vec<ScheduledTask> = serde_json::from_str(&contents).map_err(|e| {
                    BlockforgeError::Internal(format!(
                        "corrupt task table '{}': {e}",
                        path.display()
                    ))
                })?;
                for task in tasks {
                    store.insert(task.id.clone(), task);
                }
                info!("Loaded {} scheduled tasks.", store.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Task table '{}' not found. Starting empty.", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                store: Mutex::new(store),
                path,
                tz,
                registry,
                executor,
                ring: ExecutionRing::new(RING_CAPACITY),
                in_flight: DashMap::new(),
                cancels: DashMap::new(),
            }),
        })
    }

    /// Schedules every enabled row. Rows whose cron expression no longer
    /// validates are kept but flipped to disabled.
    pub fn start(&self) -> Result<(), BlockforgeError> {
        let tasks: Vec<ScheduledTask> = self.inner.store.lock().values().cloned().collect();
        let mut disabled = Vec::new();
        for task in tasks {
            if !task.enabled {
                continue;
            }
            match validate_cron(&task.cron) {
                Ok(_) => self.spawn_loop(task),
                Err(e) => {
                    warn!(
                        "Task '{}' has an invalid cron expression ({}); disabling it.",
                        task.name, e
                    );
                    disabled.push(task.id);
                }
            }
        }
        if !disabled.is_empty() {
            let mut store = self.inner.store.lock();
            for id in disabled {
                if let Some(task) = store.get_mut(&id) {
                    task.enabled = false;
                }
            }
            drop(store);
            self.save()?;
        }
        Ok(())
    }

    /// Creates and (when enabled) schedules a task.
    pub fn create(&self, spec: TaskSpec) -> Result<ScheduledTask, BlockforgeError> {
        validate_cron(&spec.cron)?;
        if spec.kind == TaskKind::Command
            && spec.command.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(BlockforgeError::InvalidArgument(
                "command tasks require a command string".into(),
            ));
        }
        // The target must exist at creation time; it may be deleted later,
        // in which case the task is retained but never fires.
        self.inner.registry.get(&spec.server_id)?;

        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            kind: spec.kind,
            server_id: spec.server_id,
            cron: spec.cron,
            command: spec.command,
            enabled: spec.enabled,
            created_at: Utc::now(),
            last_run: None,
        };

        self.inner
            .store
            .lock()
            .insert(task.id.clone(), task.clone());
        if let Err(e) = self.save() {
            self.inner.store.lock().remove(&task.id);
            return Err(e);
        }
        if task.enabled {
            self.spawn_loop(task.clone());
        }
        Ok(task)
    }

    /// Replaces a task's definition, cancelling and rescheduling atomically.
    pub fn update(&self, id: &str, spec: TaskSpec) -> Result<ScheduledTask, BlockforgeError> {
        validate_cron(&spec.cron)?;
        let previous = self.get(id)?;
        self.cancel_loop(id);

        let updated = ScheduledTask {
            id: previous.id.clone(),
            name: spec.name,
            kind: spec.kind,
            server_id: spec.server_id,
            cron: spec.cron,
            command: spec.command,
            enabled: spec.enabled,
            created_at: previous.created_at,
            last_run: previous.last_run,
        };
        self.inner
            .store
            .lock()
            .insert(id.to_string(), updated.clone());
        if let Err(e) = self.save() {
            self.inner.store.lock().insert(id.to_string(), previous);
            return Err(e);
        }
        if updated.enabled {
            self.spawn_loop(updated.clone());
        }
        Ok(updated)
    }

    /// Enables or disables a task.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask, BlockforgeError> {
        let mut task = self.get(id)?;
        if task.enabled == enabled {
            return Ok(task);
        }
        self.cancel_loop(id);
        task.enabled = enabled;
        self.inner.store.lock().insert(id.to_string(), task.clone());
        self.save()?;
        if enabled {
            self.spawn_loop(task.clone());
        }
        Ok(task)
    }

    /// Removes a task outright.
    pub fn delete(&self, id: &str) -> Result<(), BlockforgeError> {
        self.cancel_loop(id);
        let previous = self.inner.store.lock().remove(id);
        if previous.is_none() {
            return Err(BlockforgeError::not_found(format!("task '{id}'")));
        }
        if let Err(e) = self.save() {
            if let Some(previous) = previous {
                self.inner.store.lock().insert(id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ScheduledTask, BlockforgeError> {
        self.inner
            .store
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BlockforgeError::not_found(format!("task '{id}'")))
    }

    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.inner.store.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// The retained execution records, newest first.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.inner.ring.list()
    }

    /// Cancels every cron subscription. The ring stays in memory.
    pub fn stop_all(&self) {
        for entry in self.inner.cancels.iter() {
            let _ = entry.value().send(true);
        }
        self.inner.cancels.clear();
        info!("All cron subscriptions cancelled.");
    }

    fn cancel_loop(&self, id: &str) {
        if let Some((_, cancel)) = self.inner.cancels.remove(id) {
            let _ = cancel.send(true);
        }
    }

    fn spawn_loop(&self, task: ScheduledTask) {
        let Ok(schedule) = validate_cron(&task.cron) else {
            return;
        };
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.inner.cancels.insert(task.id.clone(), cancel_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(inner.tz).next() else {
                    debug!("Task '{}' has no future fire times.", task.name);
                    return;
                };
                let wait = match (next.with_timezone(&Utc) - Utc::now()).to_std() {
                    Ok(wait) => wait,
                    Err(_) => continue,
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel_rx.changed() => {
                        debug!("Cron loop for task '{}' cancelled.", task.name);
                        return;
                    }
                }

                if inner.registry.get(&task.server_id).is_err() {
                    debug!(
                        "Task '{}' targets deleted instance '{}'; not firing.",
                        task.name, task.server_id
                    );
                    continue;
                }
                if inner.in_flight.contains_key(&task.id) {
                    warn!(
                        "Task '{}' is still executing at its next tick; skipping (miss).",
                        task.name
                    );
                    continue;
                }

                inner.in_flight.insert(task.id.clone(), ());
                let inner = inner.clone();
                let task = task.clone();
                tokio::spawn(async move {
                    run_one(inner, task).await;
                });
            }
        });
    }

    fn save(&self) -> Result<(), BlockforgeError> {
        let json = {
            let store = self.inner.store.lock();
            let mut tasks: Vec<&ScheduledTask> = store.values().collect();
            tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            serde_json::to_string_pretty(&tasks)?
        };
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.inner.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.inner.path)?;
        Ok(())
    }
}

/// Runs one task execution and appends the outcome to the ring.
async fn run_one(inner: Arc<SchedulerInner>, task: ScheduledTask) {
    let started_at = Utc::now();
    let stopwatch = Instant::now();
    let outcome = inner.executor.execute(&task).await;
    let finished_at = Utc::now();

    let record = match &outcome {
        Ok(result) => ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            kind: task.kind,
            server_id: task.server_id.clone(),
            started_at,
            finished_at,
            duration_ms: stopwatch.elapsed().as_millis() as u64,
            success: true,
            result: Some(result.clone()),
            error: None,
        },
        Err(e) => ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            kind: task.kind,
            server_id: task.server_id.clone(),
            started_at,
            finished_at,
            duration_ms: stopwatch.elapsed().as_millis() as u64,
            success: false,
            result: None,
            error: Some(e.to_string()),
        },
    };

    match &outcome {
        Ok(_) => debug!("Task '{}' executed in {}ms.", task.name, record.duration_ms),
        Err(e) => warn!("Task '{}' failed: {}", task.name, e),
    }

    inner.ring.push(record);
    inner.in_flight.remove(&task.id);

    // Stamp last_run; persistence failures only cost the timestamp.
    {
        let mut store = inner.store.lock();
        if let Some(row) = store.get_mut(&task.id) {
            row.last_run = Some(finished_at);
        }
    }
    let scheduler = TaskScheduler { inner };
    if let Err(e) = scheduler.save() {
        warn!("Failed to persist last_run for '{}': {}", task.name, e);
    }
}
