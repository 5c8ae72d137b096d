//! Vault pub/sub broker.
//!
//! Topics: `memory.delta.{created,updated,deleted}`,
//! `memory.policy.promoted`, `memory.frame.invalidated`. Subscriptions
//! take the same wildcard patterns as the engine event bus.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::topic_matches;

pub const TOPIC_DELTA_CREATED: &str = "memory.delta.created";
pub const TOPIC_DELTA_UPDATED: &str = "memory.delta.updated";
pub const TOPIC_DELTA_DELETED: &str = "memory.delta.deleted";
pub const TOPIC_POLICY_PROMOTED: &str = "memory.policy.promoted";
pub const TOPIC_FRAME_INVALIDATED: &str = "memory.frame.invalidated";

/// A vault notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub topic: String,
    pub frame_id: String,
    pub theme: String,
    pub at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn now(topic: &str, frame_id: &str, theme: &str) -> Self {
        Self {
            topic: topic.to_string(),
            frame_id: frame_id.to_string(),
            theme: theme.to_string(),
            at: Utc::now(),
        }
    }
}

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<Arc<MemoryEvent>>,
}

/// In-process broker for vault notifications.
#[derive(Default)]
pub struct MemoryBroker {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a topic pattern (`memory.delta.*`, exact names, or
    /// `*`). Dropping the receiver unsubscribes.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<Arc<MemoryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("memory broker lock")
            .push(Subscriber { pattern: pattern.into(), tx });
        rx
    }

    pub fn publish(&self, event: MemoryEvent) {
        let event = Arc::new(event);
        let mut subs = self.subscribers.lock().expect("memory broker lock");
        subs.retain(|sub| {
            if !topic_matches(&sub.pattern, &event.topic) {
                return true;
            }
            sub.tx.send(Arc::clone(&event)).is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_delivery() {
        let broker = MemoryBroker::new();
        let mut deltas = broker.subscribe("memory.delta.*");
        let mut created = broker.subscribe(TOPIC_DELTA_CREATED);
        let mut policy = broker.subscribe("memory.policy.*");

        broker.publish(MemoryEvent::now(TOPIC_DELTA_CREATED, "frame_a", "pricing"));

        assert_eq!(deltas.try_recv().unwrap().frame_id, "frame_a");
        assert_eq!(created.try_recv().unwrap().topic, TOPIC_DELTA_CREATED);
        assert!(policy.try_recv().is_err());
    }

    #[test]
    fn test_deleted_topic_routes_separately() {
        let broker = MemoryBroker::new();
        let mut deleted = broker.subscribe(TOPIC_DELTA_DELETED);
        broker.publish(MemoryEvent::now(TOPIC_DELTA_UPDATED, "frame_a", "pricing"));
        assert!(deleted.try_recv().is_err());
        broker.publish(MemoryEvent::now(TOPIC_DELTA_DELETED, "frame_a", "pricing"));
        assert_eq!(deleted.try_recv().unwrap().topic, TOPIC_DELTA_DELETED);
    }
}
