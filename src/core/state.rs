// src/core/state.rs

//! Assembles the daemon's components into one shared application state.
//!
//! Everything here is an explicit value constructed once and injected into
//! its dependents; the only piece passed around by bare reference is the
//! event bus. The supervisor↔coordinator cycle is broken by wiring the
//! coordinator into the supervisor's cascade port after construction.

use crate::config::Config;
use crate::core::artifacts::{HttpJarFetcher, JarFetcher};
use crate::core::backup::BackupManager;
use crate::core::errors::BlockforgeError;
use crate::core::events::EventBus;
use crate::core::monitor::ResourceSampler;
use crate::core::notifier::{WebhookNotifier, WebhookStore};
use crate::core::probe::ProxyProbe;
use crate::core::rcon::RconPool;
use crate::core::registry::InstanceRegistry;
use crate::core::scheduler::{LifecycleExecutor, TaskScheduler};
use crate::core::supervisor::ProcessSupervisor;
use crate::core::topology::TopologyCoordinator;
use std::sync::Arc;
use tracing::info;

/// The shared application state handed to every background task and to the
/// out-of-core HTTP layer.
pub struct AppState {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub registry: Arc<InstanceRegistry>,
    pub sampler: Arc<ResourceSampler>,
    pub supervisor: ProcessSupervisor,
    pub rcon: Arc<RconPool>,
    pub topology: Arc<TopologyCoordinator>,
    pub probe: Arc<ProxyProbe>,
    pub scheduler: TaskScheduler,
    pub backup: Arc<BackupManager>,
    pub webhooks: Arc<WebhookStore>,
}

impl AppState {
    /// Initializes every component in dependency order. Fatal on corrupt
    /// catalogs; the daemon refuses to start over bad persistent state.
    pub fn initialize(config: Config) -> Result<Arc<Self>, BlockforgeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.servers_root)?;
        std::fs::create_dir_all(&config.backups_dir)?;

        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(InstanceRegistry::open(
            config.catalog_path("servers.json"),
            &config.servers_root,
        )?);
        let sampler = Arc::new(ResourceSampler::new(
            bus.clone(),
            config.resource_interval,
        ));

        let supervisor = ProcessSupervisor::new(
            registry.clone(),
            bus.clone(),
            sampler.clone(),
            config.clone(),
        );

        let fetcher: Arc<dyn JarFetcher> = Arc::new(HttpJarFetcher::new());
        let topology = Arc::new(TopologyCoordinator::new(
            registry.clone(),
            supervisor.clone(),
            fetcher,
            config.clone(),
        ));
        supervisor.set_cascade(topology.clone());

        let rcon = Arc::new(RconPool::new(registry.clone(), config.rcon_timeout));
        let probe = Arc::new(ProxyProbe::new(
            registry.clone(),
            bus.clone(),
            rcon.clone(),
            config.clone(),
        ));

        let backup = Arc::new(BackupManager::new(
            registry.clone(),
            supervisor.clone(),
            bus.clone(),
            &config.backups_dir,
        ));

        let tz = config
            .scheduler_tz()
            .map_err(|e| BlockforgeError::InvalidArgument(e.to_string()))?;
        let scheduler = TaskScheduler::open(
            config.catalog_path("tasks.json"),
            tz,
            registry.clone(),
            Arc::new(LifecycleExecutor::new(supervisor.clone(), backup.clone())),
        )?;

        let webhooks = Arc::new(WebhookStore::open(config.catalog_path("webhooks.json"))?);

        info!("Application state initialized.");
        Ok(Arc::new(Self {
            config,
            bus,
            registry,
            sampler,
            supervisor,
            rcon,
            topology,
            probe,
            scheduler,
            backup,
            webhooks,
        }))
    }

    /// The notifier is constructed on demand because it is consumed by its
    /// own run loop.
    pub fn notifier(&self) -> WebhookNotifier {
        WebhookNotifier::new(self.webhooks.clone(), self.registry.clone(), self.bus.clone())
    }
}
