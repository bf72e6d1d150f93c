// src/core/topology/velocity.rs

//! Reads and rewrites `velocity.toml`.
//!
//! Velocity refuses to boot when its `try` list is empty, so generated
//! configs seed a placeholder `lobby` entry which is atomically swapped for
//! the first real backend (delete placeholder, insert the new name, point
//! `try` at it). All edits are read-modify-write over the parsed TOML
//! document; unmanaged keys survive untouched.

use crate::core::errors::BlockforgeError;
use crate::core::registry::instance::Instance;
use crate::core::topology::{BackendEdge, PLACEHOLDER_ADDRESS, PLACEHOLDER_NAME};
use std::path::{Path, PathBuf};
use toml::Value;
use toml::map::Map;

/// Name of the secret file velocity writes into its workspace on first boot.
pub const FORWARDING_SECRET_FILE: &str = "forwarding.secret";

fn config_path(workspace: &Path) -> PathBuf {
    workspace.join("velocity.toml")
}

/// Generates the initial `velocity.toml`: modern forwarding, a placeholder
/// backend, an empty `try` list, and the advanced-tuning defaults.
pub fn write_initial(instance: &Instance) -> Result<(), BlockforgeError> {
    let doc = format!(
        r#"# Config version. Do not change this
config-version = "2.7"

# What port should the proxy be bound to?
bind = "{bind}"

motd = "{motd}"
show-max-players = 500
online-mode = true
force-key-authentication = true
prevent-client-proxy-connections = false
player-info-forwarding-mode = "modern"
forwarding-secret-file = "{secret_file}"
announce-forge = false
kick-existing-players = false
ping-passthrough = "DISABLED"

[servers]
{placeholder} = "{placeholder_address}"
try = []

[forced-hosts]

[advanced]
compression-threshold = 256
compression-level = -1
login-ratelimit = 3000
connection-timeout = 5000
read-timeout = 30000
haproxy-protocol = false
tcp-fast-open = false
bungee-plugin-message-channel = true
show-ping-requests = false
failover-on-unexpected-server-disconnect = true
announce-proxy-commands = true
log-command-executions = false
"#,
        bind = instance.address(),
        motd = instance.name,
        secret_file = FORWARDING_SECRET_FILE,
        placeholder = PLACEHOLDER_NAME,
        placeholder_address = PLACEHOLDER_ADDRESS,
    );
    std::fs::write(config_path(&instance.workspace), doc)?;
    Ok(())
}

fn load(path: &Path) -> Result<Value, BlockforgeError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

fn save(path: &Path, doc: &Value) -> Result<(), BlockforgeError> {
    std::fs::write(path, toml::to_string_pretty(doc)?)?;
    Ok(())
}

fn servers_table(doc: &Value) -> Option<&Map<String, Value>> {
    doc.get("servers")?.as_table()
}

fn servers_table_mut(doc: &mut Value) -> Result<&mut Map<String, Value>, BlockforgeError> {
    doc.get_mut("servers")
        .and_then(|v| v.as_table_mut())
        .ok_or_else(|| BlockforgeError::Internal("velocity.toml has no [servers] table".into()))
}

/// Names in the `try` connection order.
fn try_list(doc: &Value) -> Vec<String> {
    servers_table(doc)
        .and_then(|t| t.get("try"))
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn set_try_list(doc: &mut Value, names: Vec<String>) -> Result<(), BlockforgeError> {
    let servers = servers_table_mut(doc)?;
    servers.insert(
        "try".to_string(),
        Value::Array(names.into_iter().map(Value::String).collect()),
    );
    Ok(())
}

/// Reconstructs the backend edge set from `velocity.toml`. Velocity has no
/// per-edge MOTD or restricted flag; the default marker is the head of the
/// `try` list.
pub fn list_edges(workspace: &Path) -> Result<Vec<BackendEdge>, BlockforgeError> {
    let doc = load(&config_path(workspace))?;
    let try_order = try_list(&doc);
    let default = try_order.first().cloned();

    let mut edges = Vec::new();
    if let Some(servers) = servers_table(&doc) {
        for (name, value) in servers {
            if name == "try" {
                continue;
            }
            edges.push(BackendEdge {
                name: name.clone(),
                address: value.as_str().unwrap_or_default().to_string(),
                motd: None,
                restricted: false,
                default: default.as_deref() == Some(name.as_str()),
            });
        }
    }
    Ok(edges)
}

/// Whether the config still only carries the generated placeholder.
fn is_placeholder_only(servers: &Map<String, Value>) -> bool {
    let real: Vec<(&String, &Value)> = servers.iter().filter(|(k, _)| *k != "try").collect();
    real.len() == 1
        && real[0].0 == PLACEHOLDER_NAME
        && real[0].1.as_str() == Some(PLACEHOLDER_ADDRESS)
}

/// Inserts a backend. The first real backend replaces the placeholder
/// atomically and becomes the sole `try` entry; later additions leave the
/// connection order alone unless the edge carries the default flag.
pub fn add_edge(workspace: &Path, edge: &BackendEdge) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;

    let replacing_placeholder = {
        let servers = servers_table_mut(&mut doc)?;
        if servers.contains_key(&edge.name) && !is_placeholder_only(servers) {
            return Err(BlockforgeError::Conflict(format!(
                "backend '{}' already exists",
                edge.name
            )));
        }
        let placeholder = is_placeholder_only(servers);
        if placeholder {
            servers.remove(PLACEHOLDER_NAME);
        }
        servers.insert(edge.name.clone(), Value::String(edge.address.clone()));
        placeholder
    };

    if replacing_placeholder {
        set_try_list(&mut doc, vec![edge.name.clone()])?;
    } else if edge.default {
        promote(&mut doc, &edge.name)?;
    }
    save(&path, &doc)
}

/// Rewrites the address of an existing backend.
pub fn update_edge(workspace: &Path, edge: &BackendEdge) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;
    {
        let servers = servers_table_mut(&mut doc)?;
        if !servers.contains_key(&edge.name) {
            return Err(BlockforgeError::not_found(format!(
                "backend '{}'",
                edge.name
            )));
        }
        servers.insert(edge.name.clone(), Value::String(edge.address.clone()));
    }
    if edge.default {
        promote(&mut doc, &edge.name)?;
    }
    save(&path, &doc)
}

/// Drops a backend and prunes it from `try` and `forced-hosts`.
pub fn remove_edge(workspace: &Path, name: &str) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;
    {
        let servers = servers_table_mut(&mut doc)?;
        if servers.remove(name).is_none() {
            return Err(BlockforgeError::not_found(format!("backend '{name}'")));
        }
    }
    prune_unknown_references(&mut doc)?;
    save(&path, &doc)
}

/// Moves a backend to the head of the `try` connection order.
pub fn set_default(workspace: &Path, name: &str) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;
    let known = servers_table(&doc)
        .map(|t| t.contains_key(name))
        .unwrap_or(false);
    if !known || name == "try" {
        return Err(BlockforgeError::not_found(format!("backend '{name}'")));
    }
    promote(&mut doc, name)?;
    save(&path, &doc)
}

fn promote(doc: &mut Value, name: &str) -> Result<(), BlockforgeError> {
    let mut order = try_list(doc);
    order.retain(|n| n != name);
    order.insert(0, name.to_string());
    set_try_list(doc, order)
}

/// Reads the forwarding secret velocity wrote into its workspace, if any.
pub fn read_forwarding_secret(workspace: &Path) -> Result<Option<String>, BlockforgeError> {
    match std::fs::read_to_string(workspace.join(FORWARDING_SECRET_FILE)) {
        Ok(secret) => {
            let secret = secret.trim().to_string();
            Ok((!secret.is_empty()).then_some(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Normalizes `velocity.toml` before a start: folds the on-disk forwarding
/// secret into the document and prunes references to servers that no longer
/// exist. Velocity refuses to start over dangling `try` or forced-host
/// entries.
pub fn ensure_config_valid(workspace: &Path) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;

    if let Some(secret) = read_forwarding_secret(workspace)? {
        if let Some(root) = doc.as_table_mut() {
            root.insert("forwarding-secret".to_string(), Value::String(secret));
        }
    }

    prune_unknown_references(&mut doc)?;
    save(&path, &doc)
}

/// Prunes `try` entries and forced-host targets that do not name a server
/// in the `[servers]` table.
fn prune_unknown_references(doc: &mut Value) -> Result<(), BlockforgeError> {
    let known: Vec<String> = servers_table(doc)
        .map(|t| t.keys().filter(|k| *k != "try").cloned().collect())
        .unwrap_or_default();

    let pruned: Vec<String> = try_list(doc)
        .into_iter()
        .filter(|n| known.contains(n))
        .collect();
    set_try_list(doc, pruned)?;

    if let Some(forced) = doc.get_mut("forced-hosts").and_then(|v| v.as_table_mut()) {
        for (_host, targets) in forced.iter_mut() {
            if let Some(list) = targets.as_array_mut() {
                list.retain(|v| v.as_str().map(|s| known.contains(&s.to_string())).unwrap_or(false));
            }
        }
    }
    Ok(())
}
