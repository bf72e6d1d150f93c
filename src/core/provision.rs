// src/core/provision.rs

//! Kind-aware generation of instance config files.
//!
//! Creation always overwrites: these files are regenerated wholesale when an
//! instance is provisioned. Updates to `server.properties` after creation go
//! through [`update_properties`], which preserves comments and unmanaged
//! keys.

use crate::core::errors::BlockforgeError;
use crate::core::registry::instance::Instance;
use crate::core::topology;
use indexmap::IndexMap;
use std::fmt::Write as _;
use std::path::Path;

/// Writes the full initial config set for a freshly provisioned instance.
pub fn write_initial_config(instance: &Instance) -> Result<(), BlockforgeError> {
    if instance.kind.is_bungee_family() {
        topology::bungee::write_initial(instance)?;
    } else if instance.kind.is_proxy() {
        topology::velocity::write_initial(instance)?;
    } else {
        write_server_properties(instance)?;
        write_eula(&instance.workspace)?;
    }
    Ok(())
}

/// Generates `server.properties` with RCON enabled and sane gameplay
/// defaults. The MOTD mirrors the instance name.
pub fn write_server_properties(instance: &Instance) -> Result<(), BlockforgeError> {
    let mut contents = String::from("#Minecraft server properties\n");
    let pairs: &[(&str, String)] = &[
        ("server-ip", instance.host.clone()),
        ("server-port", instance.port.to_string()),
        ("motd", instance.name.clone()),
        ("enable-rcon", "true".to_string()),
        ("rcon.port", instance.rcon_port.to_string()),
        ("rcon.password", instance.rcon_password.clone()),
        ("online-mode", "true".to_string()),
        ("difficulty", "normal".to_string()),
        ("gamemode", "survival".to_string()),
        ("view-distance", "10".to_string()),
        ("max-players", "20".to_string()),
        ("spawn-protection", "16".to_string()),
        ("level-name", "world".to_string()),
        ("enable-command-block", "false".to_string()),
        ("allow-nether", "true".to_string()),
        ("pvp", "true".to_string()),
        ("white-list", "false".to_string()),
    ];
    for (key, value) in pairs {
        let _ = writeln!(contents, "{key}={value}");
    }
    std::fs::write(instance.workspace.join("server.properties"), contents)?;
    Ok(())
}

/// Rewrites selected keys of a Java properties file in place. Comments,
/// blank lines, and keys not present in `updates` are preserved verbatim;
/// keys missing from the file are appended.
pub fn update_properties(
    path: &Path,
    updates: &IndexMap<String, String>,
) -> Result<(), BlockforgeError> {
    let contents = std::fs::read_to_string(path)?;
    let mut remaining = updates.clone();
    let mut out = String::with_capacity(contents.len());

    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        match line.split_once('=') {
            Some((key, _)) if remaining.contains_key(key.trim()) => {
                let key = key.trim().to_string();
                let value = remaining
                    .shift_remove(&key)
                    .unwrap_or_default();
                let _ = writeln!(out, "{key}={value}");
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    for (key, value) in remaining {
        let _ = writeln!(out, "{key}={value}");
    }

    std::fs::write(path, out)?;
    Ok(())
}

/// Accepts the EULA. Written for non-proxy kinds only; proxies have none.
pub fn write_eula(workspace: &Path) -> Result<(), BlockforgeError> {
    std::fs::write(workspace.join("eula.txt"), "eula=true\n")?;
    Ok(())
}

/// Marks a backend as proxied for the bungee family.
pub fn write_spigot_config(workspace: &Path) -> Result<(), BlockforgeError> {
    let mut settings = IndexMap::new();
    settings.insert("bungeecord".to_string(), serde_yaml::Value::Bool(true));
    let mut root = IndexMap::new();
    root.insert("settings".to_string(), settings);
    let yaml = serde_yaml::to_string(&root)?;
    std::fs::write(workspace.join("spigot.yml"), yaml)?;
    Ok(())
}

/// Enables velocity modern forwarding on a Paper backend with the given
/// shared secret. Overwrites `config/paper-global.yml`.
pub fn write_paper_global(workspace: &Path, secret: &str) -> Result<(), BlockforgeError> {
    let config_dir = workspace.join("config");
    std::fs::create_dir_all(&config_dir)?;

    let mut velocity = IndexMap::new();
    velocity.insert(
        "enabled".to_string(),
        serde_yaml::Value::Bool(true),
    );
    velocity.insert(
        "online-mode".to_string(),
        serde_yaml::Value::Bool(true),
    );
    velocity.insert(
        "secret".to_string(),
        serde_yaml::Value::String(secret.to_string()),
    );
    let mut proxies = IndexMap::new();
    proxies.insert("velocity".to_string(), velocity);
    let mut root = IndexMap::new();
    root.insert("proxies".to_string(), proxies);

    let yaml = serde_yaml::to_string(&root)?;
    std::fs::write(config_dir.join("paper-global.yml"), yaml)?;
    Ok(())
}

/// Reads the velocity forwarding secret a Paper backend is configured with,
/// if any. Used to verify secret synchronization.
pub fn read_paper_global_secret(workspace: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(workspace.join("config/paper-global.yml")).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&contents).ok()?;
    value
        .get("proxies")?
        .get("velocity")?
        .get("secret")?
        .as_str()
        .map(|s| s.to_string())
}
