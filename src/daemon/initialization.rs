// src/daemon/initialization.rs

//! First startup phase: build the shared application state.

use super::context::DaemonContext;
use crate::config::Config;
use crate::core::state::AppState;
use anyhow::{Context as _, Result};
use tracing::info;

pub fn setup(config: Config) -> Result<DaemonContext> {
    info!(
        "Blockforge {} starting (data: {}, servers: {}).",
        env!("CARGO_PKG_VERSION"),
        config.data_dir.display(),
        config.servers_root.display()
    );

    let state = AppState::initialize(config).context("failed to initialize application state")?;
    Ok(DaemonContext::new(state))
}
