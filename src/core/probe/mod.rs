// src/core/probe/mod.rs

//! Periodic liveness and player-census polling of proxy backends.
//!
//! A per-proxy loop starts whenever a proxy transitions to running (the
//! probe watches the status topic rather than being called by the
//! supervisor) and stops on any other transition. Every sweep re-reads the
//! proxy's backend config from disk, so edges added or removed while the
//! proxy runs are picked up without coordination.

pub mod ping;

use crate::config::Config;
use crate::core::errors::BlockforgeError;
use crate::core::events::{self, Event, EventBus};
use crate::core::rcon::RconPool;
use crate::core::registry::instance::InstanceStatus;
use crate::core::registry::InstanceRegistry;
use crate::core::topology;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// The probed health of one backend edge.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BackendHealth {
    pub name: String,
    pub address: String,
    pub online: bool,
    /// Round-trip on success; elapsed wait on failure.
    pub latency_ms: u64,
    pub default: bool,
}

/// Per-backend slice of a player census.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BackendPlayers {
    pub name: String,
    pub count: usize,
    pub players: Vec<String>,
}

/// A point-in-time census derived from the proxy's `glist` output.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PlayerCensus {
    pub total: usize,
    pub backends: Vec<BackendPlayers>,
}

static GLIST_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\S+)\] \((\d+)\):\s*(.*)$").expect("glist regex must compile"));

static GLIST_TOTAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Total players online:\s*(\d+)").expect("glist total regex must compile")
});

/// Parses the reply of the proxy `glist` command into a census.
pub fn parse_glist(reply: &str) -> PlayerCensus {
    let mut backends = Vec::new();
    let mut total = 0;

    for line in reply.lines() {
        if let Some(caps) = GLIST_LINE_RE.captures(line.trim()) {
            let players: Vec<String> = caps[3]
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            backends.push(BackendPlayers {
                name: caps[1].to_string(),
                count: caps[2].parse().unwrap_or(players.len()),
                players,
            });
        } else if let Some(caps) = GLIST_TOTAL_RE.captures(line) {
            total = caps[1].parse().unwrap_or(0);
        }
    }

    if total == 0 {
        total = backends.iter().map(|b| b.count).sum();
    }
    PlayerCensus { total, backends }
}

/// Watches proxy status transitions and sweeps backend liveness.
pub struct ProxyProbe {
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    rcon: Arc<RconPool>,
    config: Config,
    cache: Arc<DashMap<String, Vec<BackendHealth>>>,
    loops: DashMap<String, watch::Sender<bool>>,
}

impl ProxyProbe {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        bus: Arc<EventBus>,
        rcon: Arc<RconPool>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            bus,
            rcon,
            config,
            cache: Arc::new(DashMap::new()),
            loops: DashMap::new(),
        }
    }

    /// The latest sweep results for a proxy, if a sweep has completed.
    pub fn cached(&self, proxy_id: &str) -> Option<Vec<BackendHealth>> {
        self.cache.get(proxy_id).map(|entry| entry.clone())
    }

    /// On-demand player census via the proxy's RCON `glist`.
    pub async fn census(&self, proxy_id: &str) -> Result<PlayerCensus, BlockforgeError> {
        let reply = self.rcon.execute(proxy_id, "glist").await?;
        Ok(parse_glist(&reply))
    }

    /// The main loop: reacts to status transitions by starting or stopping
    /// per-proxy sweep loops.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut status_rx = self.bus.subscribe_pattern("server.*.status");
        loop {
            tokio::select! {
                received = status_rx.recv() => {
                    match received {
                        Ok((_topic, Event::StatusChange { server_id, status, .. })) => {
                            self.on_transition(&server_id, status);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Probe lagged behind {} status events.", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Proxy probe shutting down.");
                    for entry in self.loops.iter() {
                        let _ = entry.value().send(true);
                    }
                    return;
                }
            }
        }
    }

    fn on_transition(&self, server_id: &str, status: InstanceStatus) {
        let Ok(instance) = self.registry.get(server_id) else {
            return;
        };
        if !instance.kind.is_proxy() {
            return;
        }

        if status == InstanceStatus::Running {
            self.start_sweeps(server_id);
        } else {
            self.stop_sweeps(server_id);
        }
    }

    fn start_sweeps(&self, proxy_id: &str) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        if self
            .loops
            .insert(proxy_id.to_string(), cancel_tx)
            .is_some()
        {
            debug!("Probe loop for '{}' already existed; replaced.", proxy_id);
        }

        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let cache = self.cache.clone();
        let interval = self.config.probe_interval;
        let timeout = self.config.probe_timeout;
        let proxy_id = proxy_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel_rx.changed() => {
                        debug!("Probe loop for '{}' cancelled.", proxy_id);
                        return;
                    }
                }

                let Ok(proxy) = registry.get(&proxy_id) else {
                    return;
                };
                let edges = match topology::read_edges(&proxy) {
                    Ok(edges) => edges,
                    Err(e) => {
                        warn!("Probe could not read edges of '{}': {}", proxy_id, e);
                        continue;
                    }
                };

                let mut healths = Vec::with_capacity(edges.len());
                for edge in edges {
                    let (host, port) = match split_address(&edge.address) {
                        Some(parts) => parts,
                        None => {
                            warn!(
                                "Backend '{}' of '{}' has unparseable address '{}'.",
                                edge.name, proxy_id, edge.address
                            );
                            continue;
                        }
                    };
                    let attempt = Instant::now();
                    let online = ping::status_ping(&host, port, timeout).await.is_ok();
                    healths.push(BackendHealth {
                        name: edge.name,
                        address: edge.address,
                        online,
                        latency_ms: attempt.elapsed().as_millis() as u64,
                        default: edge.default,
                    });
                }

                cache.insert(proxy_id.clone(), healths.clone());
                bus.publish(
                    &events::proxy_status_topic(&proxy_id),
                    Event::ProxyStatus {
                        proxy_id: proxy_id.clone(),
                        backends: healths,
                    },
                );
            }
        });
    }

    fn stop_sweeps(&self, proxy_id: &str) {
        if let Some((_, cancel)) = self.loops.remove(proxy_id) {
            let _ = cancel.send(true);
            self.cache.remove(proxy_id);
        }
    }
}

/// Splits "host:port" into its parts.
pub fn split_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}
