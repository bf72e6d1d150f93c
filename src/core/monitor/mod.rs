// src/core/monitor/mod.rs

//! Per-instance resource sampling and the TPS cache.
//!
//! The supervisor talks to the sampler through the [`Sampler`] trait so the
//! two components stay decoupled; the concrete [`ResourceSampler`] spawns one
//! sampling loop per running instance and publishes on the event bus.

pub mod system;

pub use system::{DiskUsage, SystemStats, SystemStatsTask, system_stats};

use crate::core::events::{self, Event, EventBus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::debug;

/// TPS assumed for an instance that has not reported one yet. A healthy
/// server idles at the tick cap.
pub const DEFAULT_TPS: f64 = 20.0;

/// One CPU/RSS/TPS observation for a running instance.
#[derive(Serialize, Debug, Clone)]
pub struct ResourceSample {
    /// Percent of one core; may exceed 100 on multi-core hosts.
    pub cpu_percent: f64,
    pub cores: usize,
    pub rss_bytes: u64,
    /// RSS as a percentage of total system RAM.
    pub rss_percent: f64,
    pub tps: f64,
    pub timestamp: DateTime<Utc>,
}

/// The supervisor-facing sampling port.
pub trait Sampler: Send + Sync {
    /// Begins the periodic sampling loop for a freshly spawned process.
    fn start_sampling(&self, server_id: &str, pid: u32);
    /// Tears the loop down. Idempotent; invoked on every observed exit.
    fn stop_sampling(&self, server_id: &str);
    /// Stores the TPS most recently scraped from the instance's stdout.
    fn record_tps(&self, server_id: &str, tps: f64);
    /// The cached TPS, or [`DEFAULT_TPS`] when none has been observed.
    fn latest_tps(&self, server_id: &str) -> f64;
}

/// Samples per-PID CPU and RSS every `interval` and combines each reading
/// with the latest observed TPS.
#[derive(Debug)]
pub struct ResourceSampler {
    bus: Arc<EventBus>,
    interval: Duration,
    tps: Arc<DashMap<String, f64>>,
    loops: DashMap<String, watch::Sender<bool>>,
}

impl ResourceSampler {
    pub fn new(bus: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            bus,
            interval,
            tps: Arc::new(DashMap::new()),
            loops: DashMap::new(),
        }
    }
}

impl Sampler for ResourceSampler {
    fn start_sampling(&self, server_id: &str, pid: u32) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        if self.loops.insert(server_id.to_string(), cancel_tx).is_some() {
            debug!("Replacing existing sampling loop for '{}'.", server_id);
        }

        let bus = self.bus.clone();
        let interval = self.interval;
        let server_id = server_id.to_string();
        let tps_cache = self.tps.clone();

        tokio::spawn(async move {
            let mut sys = System::new_all();
            let total_memory = sys.total_memory();
            let cores = sys.cpus().len().max(1);
            let pid = Pid::from_u32(pid);
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel_rx.changed() => {
                        debug!("Sampling loop for '{}' cancelled.", server_id);
                        return;
                    }
                }

                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_cpu().with_memory(),
                );
                let Some(process) = sys.process(pid) else {
                    // Process vanished between exit reaping and cancellation.
                    debug!("PID {} of '{}' no longer visible.", pid, server_id);
                    return;
                };

                let rss_bytes = process.memory();
                let sample = ResourceSample {
                    cpu_percent: process.cpu_usage() as f64,
                    cores,
                    rss_bytes,
                    rss_percent: if total_memory > 0 {
                        (rss_bytes as f64 / total_memory as f64) * 100.0
                    } else {
                        0.0
                    },
                    tps: tps_cache
                        .get(&server_id)
                        .map(|v| *v)
                        .unwrap_or(DEFAULT_TPS),
                    timestamp: Utc::now(),
                };

                bus.publish(
                    &events::resource_topic(&server_id),
                    Event::Resource {
                        server_id: server_id.clone(),
                        sample,
                    },
                );
            }
        });
    }

    fn stop_sampling(&self, server_id: &str) {
        if let Some((_, cancel)) = self.loops.remove(server_id) {
            let _ = cancel.send(true);
        }
        self.tps.remove(server_id);
    }

    fn record_tps(&self, server_id: &str, tps: f64) {
        self.tps.insert(server_id.to_string(), tps);
    }

    fn latest_tps(&self, server_id: &str) -> f64 {
        self.tps.get(server_id).map(|v| *v).unwrap_or(DEFAULT_TPS)
    }
}
