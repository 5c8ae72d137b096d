//! Durable stream + KV backend seam.
//!
//! The queue and heartbeat cache are written against [`StreamBackend`]:
//! an append-only stream with consumer groups and a KV store with TTLs.
//! [`redis::RedisBackend`] is the production implementation (Redis
//! Streams); [`memory::MemoryBackend`] backs tests and single-process
//! deployments.

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::QueueError;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// One delivered stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Backend-assigned message id, ordered within the topic.
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// A pending-entries-list row: delivered but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Milliseconds since last delivery.
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Append-only stream with consumer groups, plus a KV side-channel with
/// TTLs. All operations are per-topic; ordering is guaranteed within a
/// topic only.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append an entry; returns the assigned message id.
    async fn append(
        &self,
        topic: &str,
        fields: &[(String, String)],
    ) -> Result<String, QueueError>;

    /// Create a consumer group reading from the start of the topic.
    /// Succeeds if the group already exists.
    async fn create_group(&self, topic: &str, group: &str) -> Result<(), QueueError>;

    /// Block-read up to `count` new messages for `consumer` in `group`,
    /// waiting at most `block_ms`. Delivered entries land in the group's
    /// pending-entries list until acknowledged.
    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, QueueError>;

    /// Acknowledge a delivered entry, removing it from the PEL.
    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), QueueError>;

    /// List up to `count` PEL rows for the group.
    async fn pending(
        &self,
        topic: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError>;

    /// Transfer ownership of the given pending entries to `consumer`,
    /// provided they have been idle at least `min_idle_ms`. Returns the
    /// successfully claimed entries.
    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, QueueError>;

    /// Number of entries in the topic.
    async fn len(&self, topic: &str) -> Result<u64, QueueError>;

    /// KV read.
    async fn kv_get(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// KV write with TTL.
    async fn kv_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), QueueError>;
}
