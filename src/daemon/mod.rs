// src/daemon/mod.rs

use crate::config::Config;
use anyhow::Result;

mod context;
mod initialization;
mod run_loop;
mod spawner;

pub use context::DaemonContext;

/// The main daemon startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize shared state and load the persisted catalogs.
    let mut context = initialization::setup(config)?;

    // 2. Spawn all background tasks and schedule the task table.
    spawner::spawn_all(&mut context)?;

    // 3. Wait for shutdown and unwind. Runs until SIGINT/SIGTERM.
    run_loop::run(context).await;

    Ok(())
}
