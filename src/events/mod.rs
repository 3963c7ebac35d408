// SPDX-License-Identifier: MIT
//! In-process pub/sub event bus.
//!
//! The lifecycle engine, memory store, model router, and cluster coordinator
//! publish here; the gateway subscribes to the wildcard feed and fans events
//! out to connected clients. Per channel, publish order is preserved by the
//! underlying broadcast channel; there is no cross-channel ordering
//! guarantee. Publishing never blocks and never fails — a channel with no
//! subscribers simply drops the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Capacity of each channel buffer. Lagging subscribers lose oldest events.
const CHANNEL_CAPACITY: usize = 1024;

/// Well-known channel names.
pub mod channels {
    pub const AGENTS: &str = "agents";
    pub const MEMORY: &str = "memory";
    pub const PROVIDERS: &str = "providers";
    pub const CLUSTER: &str = "cluster";
    pub const GATEWAY: &str = "gateway";
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast-backed event bus with per-channel senders plus a wildcard feed.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
    all: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channels: RwLock::new(HashMap::new()),
            all,
        }
    }

    /// Publish an event to `channel` and the wildcard feed.
    pub fn publish(&self, channel: &str, event_type: &str, data: Value) {
        let event = BusEvent {
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        };

        // Ignore send errors — no subscribers is fine.
        if let Some(tx) = self.channels.read().expect("event bus lock").get(channel) {
            let _ = tx.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Subscribe to a single channel, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusEvent> {
        let mut channels = self.channels.write().expect("event bus lock");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every channel (`*`).
    pub fn subscribe_all(&self) -> broadcast::Receiver<BusEvent> {
        self.all.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_channel_subscription_receives_only_that_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(channels::AGENTS);
        bus.publish(channels::MEMORY, "saved", serde_json::json!({}));
        bus.publish(channels::AGENTS, "spawn", serde_json::json!({"id": "a1"}));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.channel, "agents");
        assert_eq!(ev.event_type, "spawn");
    }

    #[tokio::test]
    async fn wildcard_sees_every_channel_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        bus.publish(channels::AGENTS, "a", serde_json::json!(1));
        bus.publish(channels::MEMORY, "b", serde_json::json!(2));

        assert_eq!(rx.recv().await.unwrap().event_type, "a");
        assert_eq!(rx.recv().await.unwrap().event_type, "b");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish("nobody-listens", "x", serde_json::json!(null));
    }
}
