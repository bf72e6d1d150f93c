// src/core/scheduler/task.rs

//! Scheduled task rows and the in-memory execution ring.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum_macros::{Display, EnumString};

/// What a firing task does.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskKind {
    Backup,
    Restart,
    Command,
    Start,
    Stop,
}

/// A persisted scheduled task row. A task whose target instance has been
/// deleted is retained but never fires.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub server_id: String,
    /// 5-field cron expression, evaluated in the scheduler's timezone.
    pub cron: String,
    /// Required when `kind` is `command`.
    #[serde(default)]
    pub command: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

/// Caller-supplied portion of a new task.
#[derive(Deserialize, Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub server_id: String,
    pub cron: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One completed (or failed) task execution.
#[derive(Serialize, Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub kind: TaskKind,
    pub server_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Fixed-capacity ring of recent executions, newest first. In-memory only;
/// it does not survive a daemon restart.
#[derive(Debug)]
pub struct ExecutionRing {
    capacity: usize,
    entries: Mutex<VecDeque<ExecutionRecord>>,
}

impl ExecutionRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends a record, evicting the oldest once full.
    pub fn push(&self, record: ExecutionRecord) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(record);
    }

    /// All retained records, newest first.
    pub fn list(&self) -> Vec<ExecutionRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
