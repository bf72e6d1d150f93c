// src/core/registry/instance.rs

//! The persisted instance row and its associated value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

/// The flavor of server software an instance runs.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServerKind {
    Vanilla,
    Paper,
    Spigot,
    Fabric,
    Forge,
    Bungeecord,
    Waterfall,
    Velocity,
}

impl ServerKind {
    /// Proxies front other servers and carry no world of their own.
    pub fn is_proxy(&self) -> bool {
        matches!(
            self,
            ServerKind::Bungeecord | ServerKind::Waterfall | ServerKind::Velocity
        )
    }

    /// BungeeCord and Waterfall share a YAML config dialect.
    pub fn is_bungee_family(&self) -> bool {
        matches!(self, ServerKind::Bungeecord | ServerKind::Waterfall)
    }

    /// The jar filename expected in the instance workspace.
    pub fn jar_name(&self) -> &'static str {
        match self {
            ServerKind::Velocity => "velocity.jar",
            ServerKind::Bungeecord => "bungeecord.jar",
            ServerKind::Waterfall => "waterfall.jar",
            _ => "server.jar",
        }
    }
}

/// The observed lifecycle state of an instance. Derived, never authoritative
/// across restarts: every persisted row is normalized to `Stopped` on load.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// A managed game-server or proxy-server row in the registry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub kind: ServerKind,
    pub version: String,
    /// Bind host. Legacy rows without one are migrated to `0.0.0.0` on load.
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub rcon_port: u16,
    pub rcon_password: String,
    /// JVM heap budget, e.g. "2G". Applied to both -Xms and -Xmx.
    pub memory: String,
    pub workspace: PathBuf,
    /// Absent on rows created before ownership tagging existed.
    #[serde(default)]
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl Instance {
    /// The address backends use to reach this instance.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The caller-supplied portion of a new instance.
#[derive(Deserialize, Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub kind: ServerKind,
    pub version: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub rcon_port: u16,
    /// Generated when omitted.
    #[serde(default)]
    pub rcon_password: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
}

fn default_memory() -> String {
    "2G".to_string()
}

/// The restricted set of fields mutable after creation.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UpdatePatch {
    pub name: Option<String>,
    pub host: Option<String>,
    pub memory: Option<String>,
    pub rcon_password: Option<String>,
}

/// The role attached to an authenticated principal by the outer layer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// An authenticated caller, as handed in by the out-of-core HTTP layer.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    /// Admins see every row; users only rows they own. Legacy rows without
    /// an owner are visible to admins only.
    pub fn can_access(&self, instance: &Instance) -> bool {
        match self.role {
            Role::Admin => true,
            Role::User => instance.owner_id.as_deref() == Some(self.id.as_str()),
        }
    }
}
