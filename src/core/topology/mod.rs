// src/core/topology/mod.rs

//! The proxy↔backend topology coordinator.
//!
//! Owns every composite operation spanning a proxy and its backends:
//! edge CRUD over the on-disk proxy config, adoption of freshly provisioned
//! backends (including forwarding-secret synchronization for velocity), and
//! cascaded start/stop. The edge set is reconstructed from disk on every
//! query and never cached across mutations; edits run under a per-proxy
//! lock.

pub mod bungee;
pub mod velocity;

use crate::config::Config;
use crate::core::artifacts::JarFetcher;
use crate::core::errors::BlockforgeError;
use crate::core::probe::split_address;
use crate::core::provision;
use crate::core::registry::instance::{CreateSpec, Instance, InstanceStatus, ServerKind};
use crate::core::registry::{self, InstanceRegistry};
use crate::core::supervisor::{CascadeDriver, ProcessSupervisor};
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Logical name seeded into freshly generated proxy configs.
pub const PLACEHOLDER_NAME: &str = "lobby";
/// Address the placeholder points at until a real backend is adopted.
pub const PLACEHOLDER_ADDRESS: &str = "127.0.0.1:25565";

/// Secret written into an adopted backend until the proxy has produced its
/// real forwarding secret.
const PENDING_SECRET: &str = "pending";

/// Time the proxy gets to re-initialize before its forwarding secret is
/// read back.
const SECRET_SETTLE: Duration = Duration::from_secs(3);

/// A logical reference inside a proxy's config to another instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendEdge {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub default: bool,
}

/// Parameters for [`TopologyCoordinator::create_and_adopt`].
#[derive(Deserialize, Debug, Clone)]
pub struct AdoptSpec {
    pub name: String,
    pub kind: ServerKind,
    pub version: String,
    pub port: u32,
}

/// Outcome of one backend within a cascade. Partial failures are reported
/// here and never abort the cascade.
#[derive(Serialize, Debug, Clone)]
pub struct CascadeOutcome {
    pub backend: String,
    pub instance_id: Option<String>,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Reads the backend edge set straight off a proxy's on-disk config.
pub fn read_edges(proxy: &Instance) -> Result<Vec<BackendEdge>, BlockforgeError> {
    if proxy.kind.is_bungee_family() {
        bungee::list_edges(&proxy.workspace)
    } else if proxy.kind == ServerKind::Velocity {
        velocity::list_edges(&proxy.workspace)
    } else {
        Err(BlockforgeError::InvalidArgument(format!(
            "instance '{}' is not a proxy",
            proxy.name
        )))
    }
}

pub struct TopologyCoordinator {
    registry: Arc<InstanceRegistry>,
    supervisor: ProcessSupervisor,
    fetcher: Arc<dyn JarFetcher>,
    config: Config,
    proxy_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TopologyCoordinator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        supervisor: ProcessSupervisor,
        fetcher: Arc<dyn JarFetcher>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            supervisor,
            fetcher,
            config,
            proxy_locks: DashMap::new(),
        }
    }

    fn proxy(&self, proxy_id: &str) -> Result<Instance, BlockforgeError> {
        let instance = self.registry.get(proxy_id)?;
        if !instance.kind.is_proxy() {
            return Err(BlockforgeError::InvalidArgument(format!(
                "instance '{}' is not a proxy",
                instance.name
            )));
        }
        Ok(instance)
    }

    fn lock_for(&self, proxy_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.proxy_locks
            .entry(proxy_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The current backend edge set, straight from disk.
    pub fn list_backends(&self, proxy_id: &str) -> Result<Vec<BackendEdge>, BlockforgeError> {
        read_edges(&self.proxy(proxy_id)?)
    }

    /// Registers an existing server as a backend edge of the proxy.
    pub async fn add_backend(
        &self,
        proxy_id: &str,
        edge: BackendEdge,
    ) -> Result<(), BlockforgeError> {
        if edge.name.trim().is_empty() {
            return Err(BlockforgeError::InvalidArgument(
                "backend name must not be empty".into(),
            ));
        }
        let proxy = self.proxy(proxy_id)?;
        let lock = self.lock_for(proxy_id);
        let _guard = lock.lock().await;

        if proxy.kind.is_bungee_family() {
            bungee::add_edge(&proxy.workspace, &edge)
        } else {
            velocity::add_edge(&proxy.workspace, &edge)
        }
    }

    /// Rewrites an existing edge.
    pub async fn update_backend(
        &self,
        proxy_id: &str,
        edge: BackendEdge,
    ) -> Result<(), BlockforgeError> {
        let proxy = self.proxy(proxy_id)?;
        let lock = self.lock_for(proxy_id);
        let _guard = lock.lock().await;

        if proxy.kind.is_bungee_family() {
            bungee::update_edge(&proxy.workspace, &edge)
        } else {
            velocity::update_edge(&proxy.workspace, &edge)
        }
    }

    /// Removes an edge by logical name.
    pub async fn remove_backend(
        &self,
        proxy_id: &str,
        name: &str,
    ) -> Result<(), BlockforgeError> {
        let proxy = self.proxy(proxy_id)?;
        let lock = self.lock_for(proxy_id);
        let _guard = lock.lock().await;

        if proxy.kind.is_bungee_family() {
            bungee::remove_edge(&proxy.workspace, name)
        } else {
            velocity::remove_edge(&proxy.workspace, name)
        }
    }

    /// Marks an edge as the default connection target.
    pub async fn set_default(&self, proxy_id: &str, name: &str) -> Result<(), BlockforgeError> {
        let proxy = self.proxy(proxy_id)?;
        let lock = self.lock_for(proxy_id);
        let _guard = lock.lock().await;

        if proxy.kind.is_bungee_family() {
            bungee::set_default(&proxy.workspace, name)
        } else {
            velocity::set_default(&proxy.workspace, name)
        }
    }

    /// Provisions a new backend instance and adopts it into the proxy in
    /// one composite operation: create the row, fetch the jar, switch the
    /// backend to proxied mode, register the edge, and — when the proxy is
    /// running — restart it and synchronize the velocity forwarding secret
    /// into the backend.
    pub async fn create_and_adopt(
        &self,
        proxy_id: &str,
        spec: AdoptSpec,
    ) -> Result<Instance, BlockforgeError> {
        let proxy = self.proxy(proxy_id)?;
        if spec.kind.is_proxy() {
            return Err(BlockforgeError::InvalidArgument(
                "a backend cannot itself be a proxy".into(),
            ));
        }
        let port = registry::validate_port(spec.port)?;
        if let Some(existing) = self.registry.find_by_port(port) {
            return Err(BlockforgeError::Conflict(format!(
                "port {port} already declared by instance '{}'",
                existing.name
            )));
        }

        let rcon_port = port.checked_add(10_000).unwrap_or(port - 10_000);
        let backend = self.registry.create(
            CreateSpec {
                name: spec.name.clone(),
                kind: spec.kind,
                version: spec.version.clone(),
                host: "0.0.0.0".to_string(),
                port,
                rcon_port,
                rcon_password: None,
                memory: "2G".to_string(),
            },
            proxy.owner_id.clone(),
        )?;

        if let Err(e) = self
            .fetcher
            .fetch(spec.kind, &spec.version, &backend.workspace)
            .await
        {
            // Leave no half-adopted row behind.
            let _ = self.registry.remove(&backend.id);
            return Err(e);
        }

        // A proxied backend must not authenticate players itself.
        let mut updates = IndexMap::new();
        updates.insert("online-mode".to_string(), "false".to_string());
        provision::update_properties(&backend.workspace.join("server.properties"), &updates)?;

        if proxy.kind.is_bungee_family() {
            provision::write_spigot_config(&backend.workspace)?;
        } else {
            provision::write_paper_global(&backend.workspace, PENDING_SECRET)?;
        }

        self.add_backend(
            proxy_id,
            BackendEdge {
                name: spec.name.clone(),
                address: backend.address(),
                motd: None,
                restricted: false,
                default: false,
            },
        )
        .await?;
        info!(
            "Adopted backend '{}' ({}) into proxy '{}'.",
            spec.name, backend.id, proxy.name
        );

        let proxy_running = self.registry.get(proxy_id)?.status == InstanceStatus::Running;
        if proxy_running {
            self.supervisor.restart(proxy_id).await?;

            if proxy.kind == ServerKind::Velocity {
                tokio::time::sleep(SECRET_SETTLE).await;
                match velocity::read_forwarding_secret(&proxy.workspace)? {
                    Some(secret) => {
                        provision::write_paper_global(&backend.workspace, &secret)?;
                        self.supervisor.restart(&backend.id).await?;
                    }
                    None => warn!(
                        "Proxy '{}' produced no forwarding secret; backend '{}' keeps the placeholder.",
                        proxy.name, spec.name
                    ),
                }
            }
        }

        self.registry.get(&backend.id)
    }

    /// Starts every backend edge that maps onto a registered instance,
    /// staggered, then lets the game ticks settle. Already-running backends
    /// are skipped, which makes the cascade idempotent.
    pub async fn cascade_start(
        &self,
        proxy_id: &str,
    ) -> Result<Vec<CascadeOutcome>, BlockforgeError> {
        let proxy = self.proxy(proxy_id)?;
        let edges = read_edges(&proxy)?;
        let mut outcomes = Vec::with_capacity(edges.len());

        for edge in edges {
            let outcome = match self.resolve_backend(&edge) {
                Some(instance) if instance.status == InstanceStatus::Running => CascadeOutcome {
                    backend: edge.name.clone(),
                    instance_id: Some(instance.id),
                    ok: true,
                    detail: Some("already running".into()),
                },
                Some(instance) => match self.supervisor.start(&instance.id).await {
                    Ok(()) => CascadeOutcome {
                        backend: edge.name.clone(),
                        instance_id: Some(instance.id),
                        ok: true,
                        detail: None,
                    },
                    Err(e) => {
                        warn!(
                            "Cascaded start of backend '{}' failed: {}",
                            edge.name, e
                        );
                        CascadeOutcome {
                            backend: edge.name.clone(),
                            instance_id: Some(instance.id),
                            ok: false,
                            detail: Some(e.to_string()),
                        }
                    }
                },
                None => CascadeOutcome {
                    backend: edge.name.clone(),
                    instance_id: None,
                    ok: true,
                    detail: Some("no registered instance".into()),
                },
            };
            outcomes.push(outcome);
            tokio::time::sleep(self.config.cascade_stagger).await;
        }

        tokio::time::sleep(self.config.cascade_settle).await;
        Ok(outcomes)
    }

    /// Stops every running backend edge, staggered. Each stop passes
    /// `skip_backends` so a backend that is itself misdeclared as a proxy
    /// cannot recurse.
    pub async fn cascade_stop(
        &self,
        proxy_id: &str,
    ) -> Result<Vec<CascadeOutcome>, BlockforgeError> {
        let proxy = self.proxy(proxy_id)?;
        let edges = read_edges(&proxy)?;
        let mut outcomes = Vec::with_capacity(edges.len());

        for edge in edges {
            let outcome = match self.resolve_backend(&edge) {
                Some(instance) if instance.status == InstanceStatus::Running => {
                    match self.supervisor.stop(&instance.id, true).await {
                        Ok(()) => CascadeOutcome {
                            backend: edge.name.clone(),
                            instance_id: Some(instance.id),
                            ok: true,
                            detail: None,
                        },
                        Err(e) => {
                            warn!(
                                "Cascaded stop of backend '{}' failed: {}",
                                edge.name, e
                            );
                            CascadeOutcome {
                                backend: edge.name.clone(),
                                instance_id: Some(instance.id),
                                ok: false,
                                detail: Some(e.to_string()),
                            }
                        }
                    }
                }
                Some(instance) => CascadeOutcome {
                    backend: edge.name.clone(),
                    instance_id: Some(instance.id),
                    ok: true,
                    detail: Some("not running".into()),
                },
                None => CascadeOutcome {
                    backend: edge.name.clone(),
                    instance_id: None,
                    ok: true,
                    detail: Some("no registered instance".into()),
                },
            };
            outcomes.push(outcome);
            tokio::time::sleep(self.config.cascade_stagger).await;
        }
        Ok(outcomes)
    }

    /// Edges are weak references; resolution goes through the declared game
    /// port and may come up empty.
    fn resolve_backend(&self, edge: &BackendEdge) -> Option<Instance> {
        let (_, port) = split_address(&edge.address)?;
        self.registry.find_by_port(port)
    }
}

#[async_trait]
impl CascadeDriver for TopologyCoordinator {
    async fn drive_cascade_start(&self, proxy_id: &str) {
        if let Err(e) = self.cascade_start(proxy_id).await {
            warn!("Cascade start for proxy '{}' failed: {}", proxy_id, e);
        }
    }

    async fn drive_cascade_stop(&self, proxy_id: &str) {
        if let Err(e) = self.cascade_stop(proxy_id).await {
            warn!("Cascade stop for proxy '{}' failed: {}", proxy_id, e);
        }
    }
}
