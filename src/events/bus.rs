//! In-process event bus.
//!
//! Components publish whole [`Event`] objects; subscribers register a topic
//! pattern and receive matching events over an unbounded channel. Closed
//! receivers are pruned on the next publish.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use super::topic_matches;
use super::types::Event;

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

/// Logical event bus backing the engine's event trail.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic pattern (`phase.*`, `gate.evaluation.completed`,
    /// `*`). Dropping the receiver unsubscribes.
    pub fn subscribe(&self, pattern: impl Into<String>) -> mpsc::UnboundedReceiver<Arc<Event>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().expect("event bus lock");
        subs.push(Subscriber { pattern: pattern.into(), tx });
        rx
    }

    /// Publish an event to every matching subscriber. Invalid events are
    /// dropped with a warning rather than poisoning the trail.
    pub fn publish(&self, event: Event) {
        if let Err(err) = event.validate() {
            warn!(topic = event.topic(), %err, "dropping invalid event");
            return;
        }
        let event = Arc::new(event);
        let topic = event.topic();
        let mut subs = self.subscribers.lock().expect("event bus lock");
        subs.retain(|sub| {
            if !topic_matches(&sub.pattern, topic) {
                return true;
            }
            sub.tx.send(Arc::clone(&event)).is_ok()
        });
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus lock").len()
    }
}
