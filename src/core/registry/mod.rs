// src/core/registry/mod.rs

//! The durable catalog of managed instances.
//!
//! The registry is the single source of truth for instance rows. Every
//! mutation persists the whole catalog synchronously before returning; a
//! failed save rolls the in-memory change back so memory and disk never
//! diverge.

pub mod instance;

pub use instance::{
    CreateSpec, Instance, InstanceStatus, Principal, Role, ServerKind, UpdatePatch,
};

use crate::core::errors::BlockforgeError;
use crate::core::provision;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Validates a declared port. The privileged range is rejected; values above
/// the u16 ceiling arrive here when the outer layer hands through untyped
/// numbers.
pub fn validate_port(port: u32) -> Result<u16, BlockforgeError> {
    if !(1024..=65535).contains(&port) {
        return Err(BlockforgeError::InvalidArgument(format!(
            "port {port} out of range (1024-65535)"
        )));
    }
    Ok(port as u16)
}

/// Generates an RCON password when the provisioning spec omits one.
fn generate_password() -> Result<String, BlockforgeError> {
    let mut bytes = [0u8; 12];
    getrandom::fill(&mut bytes).map_err(|e| BlockforgeError::Internal(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// The durable instance catalog, persisted as a single JSON file.
#[derive(Debug)]
pub struct InstanceRegistry {
    rows: Mutex<HashMap<String, Instance>>,
    catalog_path: PathBuf,
    servers_root: PathBuf,
}

impl InstanceRegistry {
    /// Opens the catalog, applying the startup normalizations: every status
    /// resets to `stopped` (status is derived state) and legacy rows receive
    /// the default bind host via serde. A corrupt catalog is fatal.
    pub fn open(
        catalog_path: impl Into<PathBuf>,
        servers_root: impl Into<PathBuf>,
    ) -> Result<Self, BlockforgeError> {
        let catalog_path = catalog_path.into();
        let servers_root = servers_root.into();

        let mut rows = HashMap::new();
        match std::fs::read_to_string(&catalog_path) {
            Ok(contents) => {
                let loaded: Vec<Instance> = serde_json::from_str(&contents).map_err(|e| {
                    BlockforgeError::Internal(format!(
                        "corrupt catalog '{}': {e}",
                        catalog_path.display()
                    ))
                })?;
                for mut row in loaded {
                    row.status = InstanceStatus::Stopped;
                    rows.insert(row.id.clone(), row);
                }
                info!("Loaded {} instances from catalog.", rows.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Catalog '{}' not found. Starting empty.",
                    catalog_path.display()
                );
            }
            Err(e) => return Err(e.into()),
        }

        let registry = Self {
            rows: Mutex::new(rows),
            catalog_path,
            servers_root,
        };
        // Persist the normalized view so a crash before the first mutation
        // still leaves statuses consistent on disk.
        registry.save()?;
        Ok(registry)
    }

    /// Provisions a new instance: allocates an identifier and workspace,
    /// writes the kind-specific config files, persists, and returns the row.
    pub fn create(
        &self,
        spec: CreateSpec,
        owner_id: Option<String>,
    ) -> Result<Instance, BlockforgeError> {
        validate_port(spec.port as u32)?;
        validate_port(spec.rcon_port as u32)?;

        let rcon_password = match spec.rcon_password {
            Some(p) if !p.is_empty() => p,
            _ => generate_password()?,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let instance = Instance {
            id: id.clone(),
            name: spec.name,
            kind: spec.kind,
            version: spec.version,
            host: spec.host,
            port: spec.port,
            rcon_port: spec.rcon_port,
            rcon_password,
            memory: spec.memory,
            workspace: self.servers_root.join(&id),
            owner_id,
            created_at: Utc::now(),
            last_started: None,
            status: InstanceStatus::Stopped,
        };

        std::fs::create_dir_all(&instance.workspace)?;
        provision::write_initial_config(&instance)?;

        // Conflict check and insert happen under one lock so two concurrent
        // creates cannot both claim a port or name.
        let registered = {
            let mut rows = self.rows.lock();
            let conflict = rows.values().find_map(|other| {
                if other.name == instance.name {
                    Some(format!("an instance named '{}' already exists", other.name))
                } else if other.port == instance.port
                    || other.rcon_port == instance.rcon_port
                    || other.port == instance.rcon_port
                    || other.rcon_port == instance.port
                {
                    Some(format!(
                        "port {} or {} already declared by instance '{}'",
                        instance.port, instance.rcon_port, other.name
                    ))
                } else {
                    None
                }
            });
            match conflict {
                Some(reason) => Err(BlockforgeError::Conflict(reason)),
                None => {
                    rows.insert(id.clone(), instance.clone());
                    self.write_catalog(&rows)
                }
            }
        };

        if let Err(e) = registered {
            // Roll the mutation back so memory matches disk.
            self.rows.lock().remove(&id);
            let _ = std::fs::remove_dir_all(&instance.workspace);
            return Err(e);
        }
        info!(
            "Created instance '{}' ({}, {} {})",
            instance.name, instance.id, instance.kind, instance.version
        );
        Ok(instance)
    }

    /// Returns a clone of the row, or `NotFound`.
    pub fn get(&self, id: &str) -> Result<Instance, BlockforgeError> {
        self.rows
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BlockforgeError::not_found(format!("instance '{id}'")))
    }

    /// Lists rows visible to the principal: everything for admins, owned
    /// rows only for users.
    pub fn list(&self, principal: &Principal) -> Vec<Instance> {
        let mut visible: Vec<Instance> = self
            .rows
            .lock()
            .values()
            .filter(|row| principal.can_access(row))
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        visible
    }

    /// Whether the principal may act on the given instance.
    pub fn can_access(&self, id: &str, principal: &Principal) -> Result<bool, BlockforgeError> {
        Ok(principal.can_access(&self.get(id)?))
    }

    /// Applies the restricted mutable field set. Kind and version are
    /// immutable by construction: the patch cannot carry them.
    pub fn update(&self, id: &str, patch: UpdatePatch) -> Result<Instance, BlockforgeError> {
        let previous = self.get(id)?;
        let mut updated = previous.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(host) = patch.host {
            updated.host = host;
        }
        if let Some(memory) = patch.memory {
            updated.memory = memory;
        }
        if let Some(password) = patch.rcon_password {
            updated.rcon_password = password;
        }

        self.rows.lock().insert(id.to_string(), updated.clone());
        if let Err(e) = self.save() {
            self.rows.lock().insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(updated)
    }

    /// Records a status transition. Timestamps `last_started` on `Starting`.
    pub fn set_status(&self, id: &str, status: InstanceStatus) -> Result<(), BlockforgeError> {
        {
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| BlockforgeError::not_found(format!("instance '{id}'")))?;
            row.status = status;
            if status == InstanceStatus::Starting {
                row.last_started = Some(Utc::now());
            }
        }
        self.save()
    }

    /// Removes the row and its workspace. The caller is responsible for
    /// having stopped any running process first; the supervisor's composite
    /// delete does exactly that.
    pub fn remove(&self, id: &str) -> Result<Instance, BlockforgeError> {
        let instance = self.get(id)?;

        if instance.workspace.starts_with(&self.servers_root) && instance.workspace.exists() {
            std::fs::remove_dir_all(&instance.workspace)?;
        } else if instance.workspace.exists() {
            warn!(
                "Workspace '{}' of instance '{}' lies outside the servers root; not removing.",
                instance.workspace.display(),
                instance.id
            );
        }

        let previous = self.rows.lock().remove(id);
        if let Err(e) = self.save() {
            if let Some(previous) = previous {
                self.rows.lock().insert(id.to_string(), previous);
            }
            return Err(e);
        }
        info!("Deleted instance '{}' ({})", instance.name, instance.id);
        Ok(instance)
    }

    /// Every instance currently marked running, for cascades and shutdown.
    pub fn running(&self) -> Vec<Instance> {
        self.rows
            .lock()
            .values()
            .filter(|row| row.status == InstanceStatus::Running)
            .cloned()
            .collect()
    }

    /// Finds the instance declaring the given game port, if any.
    pub fn find_by_port(&self, port: u16) -> Option<Instance> {
        self.rows
            .lock()
            .values()
            .find(|row| row.port == port)
            .cloned()
    }

    /// Whole-file atomic write of the catalog.
    pub fn save(&self) -> Result<(), BlockforgeError> {
        let rows = self.rows.lock();
        self.write_catalog(&rows)
    }

    fn write_catalog(&self, rows: &HashMap<String, Instance>) -> Result<(), BlockforgeError> {
        let mut sorted: Vec<&Instance> = rows.values().collect();
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let json = serde_json::to_string_pretty(&sorted)?;

        if let Some(parent) = self.catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.catalog_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.catalog_path)?;
        Ok(())
    }
}
