// src/daemon/spawner.rs

//! Spawns all of the daemon's long-running background tasks.

use super::context::DaemonContext;
use crate::core::monitor::SystemStatsTask;
use anyhow::Result;
use std::time::Duration;
use tracing::info;

/// Cadence of host-wide stats publication.
const SYSTEM_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of empty-topic purging on the event bus.
const TOPIC_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn_all(ctx: &mut DaemonContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;

    // --- Webhook notifier (bus sink) ---
    let notifier = state.notifier();
    let shutdown_rx_notifier = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        notifier.run(shutdown_rx_notifier).await;
        Ok(())
    });

    // --- Proxy probe ---
    let probe = state.probe.clone();
    let shutdown_rx_probe = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        probe.run(shutdown_rx_probe).await;
        Ok(())
    });

    // --- Host-wide stats publisher ---
    let stats_task = SystemStatsTask::new(state.bus.clone(), SYSTEM_STATS_INTERVAL);
    let shutdown_rx_stats = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        stats_task.run(shutdown_rx_stats).await;
        Ok(())
    });

    // --- Event bus maintenance ---
    let bus = state.bus.clone();
    let mut shutdown_rx_purge = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        let mut ticker = tokio::time::interval(TOPIC_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => { bus.purge_empty_topics(); }
                _ = shutdown_rx_purge.recv() => return Ok(()),
            }
        }
    });

    // --- Scheduler ---
    state.scheduler.start()?;

    info!("All background tasks have been spawned.");
    Ok(())
}
