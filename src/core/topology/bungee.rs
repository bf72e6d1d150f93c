// src/core/topology/bungee.rs

//! Reads and rewrites the BungeeCord/Waterfall `config.yml`.
//!
//! Edits operate on the parsed YAML document rather than a typed model so
//! that keys this daemon does not manage survive a round-trip untouched.
//! The default backend is whichever name heads the first listener's
//! `priorities` list.

use crate::core::errors::BlockforgeError;
use crate::core::registry::instance::Instance;
use crate::core::topology::{BackendEdge, PLACEHOLDER_ADDRESS, PLACEHOLDER_NAME};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

fn config_path(workspace: &Path) -> PathBuf {
    workspace.join("config.yml")
}

fn str_value(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Generates the initial `config.yml` for a bungee-family proxy: one
/// listener bound to the instance address, a placeholder backend, and the
/// stock permission blocks.
pub fn write_initial(instance: &Instance) -> Result<(), BlockforgeError> {
    let mut listener = Mapping::new();
    listener.insert(str_value("host"), str_value(&instance.address()));
    listener.insert(str_value("motd"), str_value(&instance.name));
    listener.insert(str_value("max_players"), Value::Number(500.into()));
    listener.insert(str_value("tab_size"), Value::Number(60.into()));
    listener.insert(
        str_value("priorities"),
        Value::Sequence(vec![str_value(PLACEHOLDER_NAME)]),
    );
    listener.insert(str_value("force_default_server"), Value::Bool(false));
    listener.insert(str_value("proxy_protocol"), Value::Bool(false));
    listener.insert(str_value("ping_passthrough"), Value::Bool(false));

    let mut placeholder = Mapping::new();
    placeholder.insert(str_value("address"), str_value(PLACEHOLDER_ADDRESS));
    placeholder.insert(str_value("motd"), str_value("Placeholder server"));
    placeholder.insert(str_value("restricted"), Value::Bool(false));
    let mut servers = Mapping::new();
    servers.insert(str_value(PLACEHOLDER_NAME), Value::Mapping(placeholder));

    let mut permissions = Mapping::new();
    permissions.insert(
        str_value("default"),
        Value::Sequence(vec![
            str_value("bungeecord.command.server"),
            str_value("bungeecord.command.list"),
        ]),
    );
    permissions.insert(
        str_value("admin"),
        Value::Sequence(vec![
            str_value("bungeecord.command.alert"),
            str_value("bungeecord.command.end"),
            str_value("bungeecord.command.ip"),
            str_value("bungeecord.command.reload"),
        ]),
    );

    let mut root = Mapping::new();
    root.insert(
        str_value("listeners"),
        Value::Sequence(vec![Value::Mapping(listener)]),
    );
    root.insert(str_value("servers"), Value::Mapping(servers));
    root.insert(str_value("online_mode"), Value::Bool(true));
    root.insert(str_value("ip_forward"), Value::Bool(true));
    root.insert(str_value("permissions"), Value::Mapping(permissions));

    save(&config_path(&instance.workspace), &Value::Mapping(root))
}

fn load(path: &Path) -> Result<Value, BlockforgeError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

fn save(path: &Path, doc: &Value) -> Result<(), BlockforgeError> {
    std::fs::write(path, serde_yaml::to_string(doc)?)?;
    Ok(())
}

/// The head of the first listener's priorities list, if any.
fn default_name(doc: &Value) -> Option<String> {
    doc.get("listeners")?
        .as_sequence()?
        .first()?
        .get("priorities")?
        .as_sequence()?
        .first()?
        .as_str()
        .map(|s| s.to_string())
}

fn priorities_mut(doc: &mut Value) -> Option<&mut Vec<Value>> {
    doc.get_mut("listeners")?
        .as_sequence_mut()?
        .first_mut()?
        .get_mut("priorities")?
        .as_sequence_mut()
}

/// Reconstructs the backend edge set from `config.yml`.
pub fn list_edges(workspace: &Path) -> Result<Vec<BackendEdge>, BlockforgeError> {
    let doc = load(&config_path(workspace))?;
    let default = default_name(&doc);

    let mut edges = Vec::new();
    let Some(servers) = doc.get("servers").and_then(|v| v.as_mapping()) else {
        return Ok(edges);
    };
    for (name, entry) in servers {
        let Some(name) = name.as_str() else { continue };
        let address = entry
            .get("address")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        edges.push(BackendEdge {
            name: name.to_string(),
            address,
            motd: entry
                .get("motd")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            restricted: entry
                .get("restricted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            default: default.as_deref() == Some(name),
        });
    }
    Ok(edges)
}

fn edge_mapping(edge: &BackendEdge) -> Value {
    let mut entry = Mapping::new();
    entry.insert(str_value("address"), str_value(&edge.address));
    if let Some(motd) = &edge.motd {
        entry.insert(str_value("motd"), str_value(motd));
    }
    entry.insert(str_value("restricted"), Value::Bool(edge.restricted));
    Value::Mapping(entry)
}

/// Inserts a backend into the `servers` map. A duplicate name is a
/// conflict. When the edge carries the default flag it is promoted to the
/// head of the listener priorities.
pub fn add_edge(workspace: &Path, edge: &BackendEdge) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;

    {
        let servers = doc
            .get_mut("servers")
            .and_then(|v| v.as_mapping_mut())
            .ok_or_else(|| BlockforgeError::Internal("config.yml has no servers map".into()))?;
        let key = str_value(&edge.name);
        if servers.contains_key(&key) {
            return Err(BlockforgeError::Conflict(format!(
                "backend '{}' already exists",
                edge.name
            )));
        }
        servers.insert(key, edge_mapping(edge));
    }

    if edge.default {
        promote(&mut doc, &edge.name);
    }
    save(&path, &doc)
}

/// Replaces an existing backend entry, preserving its position.
pub fn update_edge(workspace: &Path, edge: &BackendEdge) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;
    {
        let servers = doc
            .get_mut("servers")
            .and_then(|v| v.as_mapping_mut())
            .ok_or_else(|| BlockforgeError::Internal("config.yml has no servers map".into()))?;
        let key = str_value(&edge.name);
        if !servers.contains_key(&key) {
            return Err(BlockforgeError::not_found(format!(
                "backend '{}'",
                edge.name
            )));
        }
        servers.insert(key, edge_mapping(edge));
    }
    if edge.default {
        promote(&mut doc, &edge.name);
    }
    save(&path, &doc)
}

/// Drops a backend from the `servers` map and from every priorities list.
pub fn remove_edge(workspace: &Path, name: &str) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;
    {
        let servers = doc
            .get_mut("servers")
            .and_then(|v| v.as_mapping_mut())
            .ok_or_else(|| BlockforgeError::Internal("config.yml has no servers map".into()))?;
        if servers.remove(str_value(name)).is_none() {
            return Err(BlockforgeError::not_found(format!("backend '{name}'")));
        }
    }
    if let Some(priorities) = priorities_mut(&mut doc) {
        priorities.retain(|v| v.as_str() != Some(name));
    }
    save(&path, &doc)
}

/// Moves a backend to the head of the listener priorities.
pub fn set_default(workspace: &Path, name: &str) -> Result<(), BlockforgeError> {
    let path = config_path(workspace);
    let mut doc = load(&path)?;

    let known = doc
        .get("servers")
        .and_then(|v| v.as_mapping())
        .map(|m| m.contains_key(&str_value(name)))
        .unwrap_or(false);
    if !known {
        return Err(BlockforgeError::not_found(format!("backend '{name}'")));
    }

    promote(&mut doc, name);
    save(&path, &doc)
}

fn promote(doc: &mut Value, name: &str) {
    if let Some(priorities) = priorities_mut(doc) {
        priorities.retain(|v| v.as_str() != Some(name));
        priorities.insert(0, str_value(name));
    }
}
