// src/core/events.rs

//! The topic-keyed event bus that fans process output, status transitions,
//! and telemetry out to subscribers.

use crate::core::monitor::{ResourceSample, SystemStats};
use crate::core::probe::BackendHealth;
use crate::core::registry::instance::InstanceStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;
use wildmatch::WildMatch;

/// The capacity of each individual topic channel. Slow consumers that fall
/// further behind than this see `RecvError::Lagged` and lose the oldest
/// events, never blocking publishers.
const CHANNEL_CAPACITY: usize = 256;

/// Which child pipe a console line was read from.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// A single event as delivered on the bus.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// One line of process output, in emission order per instance.
    ConsoleLine {
        server_id: String,
        stream: ConsoleStream,
        line: String,
        timestamp: DateTime<Utc>,
    },
    /// A lifecycle transition; `exit_code` is set on stop/crash.
    StatusChange {
        server_id: String,
        status: InstanceStatus,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    /// A periodic CPU/RSS/TPS sample for one running instance.
    Resource {
        server_id: String,
        sample: ResourceSample,
    },
    /// A player joined or left, as derived from stdout.
    Player {
        server_id: String,
        player: String,
        joined: bool,
        timestamp: DateTime<Utc>,
    },
    /// Outcome of a backup snapshot.
    Backup {
        server_id: String,
        backup: String,
        success: bool,
        error: Option<String>,
    },
    /// The probe's latest view of a proxy's backend edges.
    ProxyStatus {
        proxy_id: String,
        backends: Vec<BackendHealth>,
    },
    /// Host-wide resource stats.
    SystemStats(SystemStats),
}

/// Topic under which an instance's console lines are published.
pub fn console_topic(server_id: &str) -> String {
    format!("server.{server_id}.console")
}

/// Topic under which an instance's status transitions are published.
pub fn status_topic(server_id: &str) -> String {
    format!("server.{server_id}.status")
}

/// Topic under which an instance's resource samples are published.
pub fn resource_topic(server_id: &str) -> String {
    format!("server.{server_id}.resource")
}

/// Topic under which player join/leave events are published.
pub fn player_topic(server_id: &str) -> String {
    format!("server.{server_id}.player")
}

/// Topic under which backup outcomes are published.
pub fn backup_topic(server_id: &str) -> String {
    format!("server.{server_id}.backup")
}

/// Topic under which a proxy's backend health set is published.
pub fn proxy_status_topic(proxy_id: &str) -> String {
    format!("proxy.{proxy_id}.status")
}

/// The host-wide stats topic.
pub const SYSTEM_STATS_TOPIC: &str = "system.stats";

/// A message delivered to a pattern subscriber: (matched topic, event).
pub type PatternMessage = (String, Event);

/// `EventBus` is the central fan-out hub. It uses `DashMap` for thread-safe
/// management of topic and pattern subscriptions; delivery is per-topic FIFO
/// with no cross-topic ordering guarantee.
#[derive(Debug, Default)]
pub struct EventBus {
    /// A map from a topic name to its broadcast sender.
    topics: DashMap<String, Arc<Sender<Event>>>,
    /// A map from a glob pattern (e.g. `server.*.status`) to its sender.
    patterns: DashMap<String, Arc<Sender<PatternMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Subscribes to a single topic, creating it on first use.
    pub fn subscribe(&self, topic: &str) -> Receiver<Event> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Subscribes to every topic matching a glob pattern.
    pub fn subscribe_pattern(&self, pattern: &str) -> Receiver<PatternMessage> {
        self.patterns
            .entry(pattern.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Publishes an event to a topic and to every matching pattern
    /// subscription. Returns the number of receivers reached.
    pub fn publish(&self, topic: &str, event: Event) -> usize {
        let mut receivers = 0;

        if let Some(channel) = self.topics.get(topic) {
            receivers += channel.send(event.clone()).unwrap_or(0);
        }

        for entry in self.patterns.iter() {
            if WildMatch::new(entry.key()).matches(topic) {
                let message: PatternMessage = (topic.to_string(), event.clone());
                receivers += entry.value().send(message).unwrap_or(0);
            }
        }

        receivers
    }

    /// Removes topics and patterns that no longer have any subscribers.
    /// Prevents unbounded growth from short-lived subscriptions.
    pub fn purge_empty_topics(&self) -> usize {
        let mut purged = 0;
        self.topics.retain(|_topic, sender| {
            if sender.receiver_count() == 0 {
                purged += 1;
                false
            } else {
                true
            }
        });
        self.patterns.retain(|_pattern, sender| {
            if sender.receiver_count() == 0 {
                purged += 1;
                false
            } else {
                true
            }
        });

        if purged > 0 {
            debug!("Purged {} empty event bus topics.", purged);
        }
        purged
    }

    /// Returns the number of subscribers on one topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |s| s.receiver_count())
    }
}
