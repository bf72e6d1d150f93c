// src/daemon/context.rs

//! The daemon's runtime context: shared state, shutdown signalling, and the
//! set of long-running background tasks.

use crate::core::state::AppState;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

pub struct DaemonContext {
    pub state: Arc<AppState>,
    /// Fan-out shutdown signal; every background task holds a receiver.
    pub shutdown_tx: broadcast::Sender<()>,
    /// Long-running background tasks, reaped by the run loop.
    pub background_tasks: JoinSet<Result<()>>,
}

impl DaemonContext {
    pub fn new(state: Arc<AppState>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state,
            shutdown_tx,
            background_tasks: JoinSet::new(),
        }
    }
}
