//! Typed event trail: envelope, payload families, and the in-process bus.
//!
//! Topic names are dot-separated (`phase.started`, `gate.evaluation.completed`).
//! Subscribers receive whole event objects, filtered by topic pattern.

pub mod bus;
pub mod types;

pub use bus::EventBus;
pub use types::{Event, EventPayload, GateEvidence, GateResult, ToolRuntime};

/// Match a dot-separated topic against a subscription pattern.
///
/// `*` matches everything; a trailing `.*` matches the prefix; anything
/// else must match exactly.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == topic
}
