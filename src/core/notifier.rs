// src/core/notifier.rs

//! Best-effort outbound webhook dispatch.
//!
//! The notifier is a bus sink: it subscribes to status, player, and backup
//! topics rather than being called by the supervisor. Delivery failures are
//! logged and never propagated anywhere.

use crate::core::errors::BlockforgeError;
use crate::core::events::{Event, EventBus};
use crate::core::registry::instance::InstanceStatus;
use crate::core::registry::InstanceRegistry;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Webhook delivery timeout.
const POST_TIMEOUT: Duration = Duration::from_secs(5);

/// The event kinds a subscription can select.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotifyKind {
    Crash,
    Start,
    Stop,
    PlayerJoin,
    PlayerLeave,
    BackupComplete,
    BackupFailed,
}

impl NotifyKind {
    fn title(&self) -> &'static str {
        match self {
            NotifyKind::Crash => "🔴 Server Crashed",
            NotifyKind::Start => "🟢 Server Started",
            NotifyKind::Stop => "⚫ Server Stopped",
            NotifyKind::PlayerJoin => "👋 Player Joined",
            NotifyKind::PlayerLeave => "🚪 Player Left",
            NotifyKind::BackupComplete => "💾 Backup Complete",
            NotifyKind::BackupFailed => "⚠️ Backup Failed",
        }
    }

    fn color(&self) -> u32 {
        match self {
            NotifyKind::Crash | NotifyKind::BackupFailed => 0x00ED_4245,
            NotifyKind::Start | NotifyKind::BackupComplete => 0x0057_F287,
            NotifyKind::Stop => 0x0095_A5A6,
            NotifyKind::PlayerJoin => 0x0058_65F2,
            NotifyKind::PlayerLeave => 0x00FE_E75C,
        }
    }
}

/// The payload shape POSTed to the delivery URL.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookDialect {
    Discord,
    Generic,
}

/// A persisted webhook subscription row.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookSubscription {
    pub id: String,
    pub server_id: String,
    pub url: String,
    pub dialect: WebhookDialect,
    pub events: Vec<NotifyKind>,
    pub enabled: bool,
}

/// Caller-supplied portion of a new subscription.
#[derive(Deserialize, Debug, Clone)]
pub struct WebhookSpec {
    pub server_id: String,
    pub url: String,
    pub dialect: WebhookDialect,
    pub events: Vec<NotifyKind>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The persisted webhook catalog.
pub struct WebhookStore {
    rows: Mutex<HashMap<String, WebhookSubscription>>,
    path: PathBuf,
}

impl WebhookStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BlockforgeError> {
        let path = path.into();
        let mut rows = HashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let loaded: Vec<WebhookSubscription> =
                    serde_json::from_str(&contents).map_err(|e| {
                        BlockforgeError::Internal(format!(
                            "corrupt webhook catalog '{}': {e}",
                            path.display()
                        ))
                    })?;
                for row in loaded {
                    rows.insert(row.id.clone(), row);
                }
                info!("Loaded {} webhook subscriptions.", rows.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            rows: Mutex::new(rows),
            path,
        })
    }

    pub fn create(&self, spec: WebhookSpec) -> Result<WebhookSubscription, BlockforgeError> {
        let row = WebhookSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: spec.server_id,
            url: spec.url,
            dialect: spec.dialect,
            events: spec.events,
            enabled: spec.enabled,
        };
        self.rows.lock().insert(row.id.clone(), row.clone());
        if let Err(e) = self.save() {
            self.rows.lock().remove(&row.id);
            return Err(e);
        }
        Ok(row)
    }

    pub fn delete(&self, id: &str) -> Result<(), BlockforgeError> {
        let previous = self.rows.lock().remove(id);
        if previous.is_none() {
            return Err(BlockforgeError::not_found(format!("webhook '{id}'")));
        }
        if let Err(e) = self.save() {
            if let Some(previous) = previous {
                self.rows.lock().insert(id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), BlockforgeError> {
        {
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| BlockforgeError::not_found(format!("webhook '{id}'")))?;
            row.enabled = enabled;
        }
        self.save()
    }

    pub fn list(&self) -> Vec<WebhookSubscription> {
        self.rows.lock().values().cloned().collect()
    }

    /// Enabled subscriptions for one instance that select the given kind.
    pub fn matching(&self, server_id: &str, kind: NotifyKind) -> Vec<WebhookSubscription> {
        self.rows
            .lock()
            .values()
            .filter(|row| row.enabled && row.server_id == server_id && row.events.contains(&kind))
            .cloned()
            .collect()
    }

    fn save(&self) -> Result<(), BlockforgeError> {
        let json = {
            let rows = self.rows.lock();
            let list: Vec<&WebhookSubscription> = rows.values().collect();
            serde_json::to_string_pretty(&list)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Builds the dialect-appropriate payload for one notification.
pub fn build_payload(
    dialect: WebhookDialect,
    kind: NotifyKind,
    server_name: &str,
    server_kind: &str,
    data: &serde_json::Value,
) -> serde_json::Value {
    match dialect {
        WebhookDialect::Discord => json!({
            "embeds": [{
                "title": kind.title(),
                "description": format!("**{server_name}** ({server_kind})"),
                "color": kind.color(),
                "fields": [{
                    "name": "Details",
                    "value": data.to_string(),
                    "inline": false,
                }],
                "timestamp": Utc::now().to_rfc3339(),
            }]
        }),
        WebhookDialect::Generic => json!({
            "event": kind,
            "server": { "name": server_name, "kind": server_kind },
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        }),
    }
}

/// The bus sink that turns status, player, and backup events into webhook
/// POSTs.
pub struct WebhookNotifier {
    store: Arc<WebhookStore>,
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(
        store: Arc<WebhookStore>,
        registry: Arc<InstanceRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            store,
            registry,
            bus,
            client,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut status_rx = self.bus.subscribe_pattern("server.*.status");
        let mut player_rx = self.bus.subscribe_pattern("server.*.player");
        let mut backup_rx = self.bus.subscribe_pattern("server.*.backup");

        loop {
            let received = tokio::select! {
                received = status_rx.recv() => received,
                received = player_rx.recv() => received,
                received = backup_rx.recv() => received,
                _ = shutdown_rx.recv() => {
                    info!("Webhook notifier shutting down.");
                    return;
                }
            };

            let event = match received {
                Ok((_topic, event)) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Notifier lagged behind {} events.", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            if let Some((server_id, kind, data)) = classify(&event) {
                self.dispatch(&server_id, kind, data).await;
            }
        }
    }

    async fn dispatch(&self, server_id: &str, kind: NotifyKind, data: serde_json::Value) {
        let subscriptions = self.store.matching(server_id, kind);
        if subscriptions.is_empty() {
            return;
        }
        let Ok(instance) = self.registry.get(server_id) else {
            return;
        };

        for subscription in subscriptions {
            let payload = build_payload(
                subscription.dialect,
                kind,
                &instance.name,
                &instance.kind.to_string(),
                &data,
            );
            match self
                .client
                .post(&subscription.url)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!("Delivered {} webhook for '{}'.", kind, instance.name);
                }
                Ok(response) => warn!(
                    "Webhook {} for '{}' answered {}.",
                    subscription.url,
                    instance.name,
                    response.status()
                ),
                Err(e) => warn!(
                    "Webhook {} for '{}' failed: {}.",
                    subscription.url, instance.name, e
                ),
            }
        }
    }
}

/// Maps a bus event onto a notification kind and its payload data.
fn classify(event: &Event) -> Option<(String, NotifyKind, serde_json::Value)> {
    match event {
        Event::StatusChange {
            server_id,
            status,
            exit_code,
            ..
        } => match (status, exit_code) {
            (InstanceStatus::Running, _) => {
                Some((server_id.clone(), NotifyKind::Start, json!({})))
            }
            (InstanceStatus::Stopped, Some(code)) if *code != 0 => Some((
                server_id.clone(),
                NotifyKind::Crash,
                json!({ "exit_code": code }),
            )),
            (InstanceStatus::Stopped, Some(code)) => Some((
                server_id.clone(),
                NotifyKind::Stop,
                json!({ "exit_code": code }),
            )),
            _ => None,
        },
        Event::Player {
            server_id,
            player,
            joined,
            ..
        } => Some((
            server_id.clone(),
            if *joined {
                NotifyKind::PlayerJoin
            } else {
                NotifyKind::PlayerLeave
            },
            json!({ "player": player }),
        )),
        Event::Backup {
            server_id,
            backup,
            success,
            error,
        } => Some((
            server_id.clone(),
            if *success {
                NotifyKind::BackupComplete
            } else {
                NotifyKind::BackupFailed
            },
            json!({ "backup": backup, "error": error }),
        )),
        _ => None,
    }
}
