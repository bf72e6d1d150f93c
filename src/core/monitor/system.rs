// src/core/monitor/system.rs

//! Host-wide resource statistics.

use crate::core::events::{self, Event, EventBus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::broadcast;
use tracing::info;

/// Usage of one mounted filesystem.
#[derive(Serialize, Debug, Clone)]
pub struct DiskUsage {
    pub mount: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

/// A host-wide snapshot: CPU load, memory, and per-mount disk usage.
#[derive(Serialize, Debug, Clone)]
pub struct SystemStats {
    /// Aggregate CPU load, 0-100.
    pub cpu_percent: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_free_bytes: u64,
    pub disks: Vec<DiskUsage>,
    pub timestamp: DateTime<Utc>,
}

/// Computes a host-wide snapshot synchronously. Served on demand by the
/// outer layer's `/system/stats`.
pub fn system_stats() -> SystemStats {
    let mut sys = System::new_all();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let disks = Disks::new_with_refreshed_list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            DiskUsage {
                mount: disk.mount_point().to_string_lossy().to_string(),
                total_bytes: total,
                available_bytes: available,
                used_bytes: total.saturating_sub(available),
            }
        })
        .collect();

    SystemStats {
        cpu_percent: sys.global_cpu_usage() as f64,
        memory_total_bytes: sys.total_memory(),
        memory_used_bytes: sys.used_memory(),
        memory_free_bytes: sys.total_memory().saturating_sub(sys.used_memory()),
        disks,
        timestamp: Utc::now(),
    }
}

/// Publishes a host-wide snapshot on `system.stats` at a fixed cadence.
pub struct SystemStatsTask {
    bus: Arc<EventBus>,
    interval: Duration,
}

impl SystemStatsTask {
    pub fn new(bus: Arc<EventBus>, interval: Duration) -> Self {
        Self { bus, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = tokio::task::spawn_blocking(system_stats).await;
                    if let Ok(stats) = stats {
                        self.bus
                            .publish(events::SYSTEM_STATS_TOPIC, Event::SystemStats(stats));
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("System stats publisher shutting down.");
                    return;
                }
            }
        }
    }
}
