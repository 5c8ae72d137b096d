//! In-process implementation of [`StreamBackend`].
//!
//! Mirrors the Redis Streams semantics the engine relies on: per-topic
//! append order, consumer groups with a pending-entries list, idle-based
//! claim, and a KV with TTLs. Blocking reads poll on a short interval
//! until the deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{PendingEntry, StreamBackend, StreamEntry};
use crate::errors::QueueError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct PendingRow {
    consumer: String,
    delivered_at: Option<Instant>,
    delivery_count: u64,
}

#[derive(Default)]
struct Group {
    /// Index of the next undelivered entry in the topic log.
    cursor: usize,
    /// entry id -> delivery state.
    pending: HashMap<String, PendingRow>,
}

#[derive(Default)]
struct Topic {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, Group>,
}

struct KvCell {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    kv: HashMap<String, KvCell>,
    sequence: u64,
}

/// Single-process stream + KV, for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory backend lock")
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn append(
        &self,
        topic: &str,
        fields: &[(String, String)],
    ) -> Result<String, QueueError> {
        let mut inner = self.lock();
        inner.sequence += 1;
        let id = format!("{}-0", inner.sequence);
        let entry = StreamEntry {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        };
        inner.topics.entry(topic.to_string()).or_default().entries.push(entry);
        Ok(id)
    }

    async fn create_group(&self, topic: &str, group: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            {
                let mut inner = self.lock();
                if let Some(topic_state) = inner.topics.get_mut(topic) {
                    // Split borrow: the group cursor walks the entry log.
                    let entries = &topic_state.entries;
                    if let Some(group_state) = topic_state.groups.get_mut(group) {
                        let available = entries.len().saturating_sub(group_state.cursor);
                        if available > 0 {
                            let take = available.min(count);
                            let start = group_state.cursor;
                            let delivered: Vec<StreamEntry> =
                                entries[start..start + take].to_vec();
                            group_state.cursor += take;
                            for entry in &delivered {
                                group_state.pending.insert(
                                    entry.id.clone(),
                                    PendingRow {
                                        consumer: consumer.to_string(),
                                        delivered_at: Some(Instant::now()),
                                        delivery_count: 1,
                                    },
                                );
                            }
                            return Ok(delivered);
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if let Some(group_state) = inner
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
        {
            group_state.pending.remove(id);
        }
        Ok(())
    }

    async fn pending(
        &self,
        topic: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let inner = self.lock();
        let Some(group_state) = inner.topics.get(topic).and_then(|t| t.groups.get(group)) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut rows: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, row)| PendingEntry {
                id: id.clone(),
                consumer: row.consumer.clone(),
                idle_ms: row
                    .delivered_at
                    .map(|at| now.duration_since(at).as_millis() as u64)
                    .unwrap_or(0),
                delivery_count: row.delivery_count,
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows.truncate(count);
        Ok(rows)
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut inner = self.lock();
        let Some(topic_state) = inner.topics.get_mut(topic) else {
            return Ok(Vec::new());
        };
        let entries = topic_state.entries.clone();
        let Some(group_state) = topic_state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(row) = group_state.pending.get_mut(id) else {
                continue;
            };
            let idle = row
                .delivered_at
                .map(|at| now.duration_since(at).as_millis() as u64)
                .unwrap_or(u64::MAX);
            if idle < min_idle_ms {
                continue;
            }
            row.consumer = consumer.to_string();
            row.delivered_at = Some(now);
            row.delivery_count += 1;
            if let Some(entry) = entries.iter().find(|e| &e.id == id) {
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn len(&self, topic: &str) -> Result<u64, QueueError> {
        let inner = self.lock();
        Ok(inner.topics.get(topic).map(|t| t.entries.len() as u64).unwrap_or(0))
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut inner = self.lock();
        if let Some(cell) = inner.kv.get(key) {
            if cell.expires_at > Instant::now() {
                return Ok(Some(cell.value.clone()));
            }
        }
        inner.kv.remove(key);
        Ok(None)
    }

    async fn kv_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.kv.insert(
            key.to_string(),
            KvCell {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let backend = MemoryBackend::new();
        backend.append("t", &fields(&[("n", "1")])).await.unwrap();
        backend.append("t", &fields(&[("n", "2")])).await.unwrap();
        backend.create_group("t", "g").await.unwrap();

        let read = backend.read_group("t", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].field("n"), Some("1"));
        assert_eq!(read[1].field("n"), Some("2"));
    }

    #[tokio::test]
    async fn test_group_delivery_is_exclusive() {
        let backend = MemoryBackend::new();
        backend.create_group("t", "g").await.unwrap();
        backend.append("t", &fields(&[("n", "1")])).await.unwrap();

        let first = backend.read_group("t", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = backend.read_group("t", "g", "c2", 10, 0).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let backend = MemoryBackend::new();
        backend.create_group("t", "g").await.unwrap();
        backend.append("t", &fields(&[("n", "1")])).await.unwrap();

        let read = backend.read_group("t", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(backend.pending("t", "g", 10).await.unwrap().len(), 1);
        backend.ack("t", "g", &read[0].id).await.unwrap();
        assert!(backend.pending("t", "g", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle() {
        let backend = MemoryBackend::new();
        backend.create_group("t", "g").await.unwrap();
        backend.append("t", &fields(&[("n", "1")])).await.unwrap();
        let read = backend.read_group("t", "g", "dead", 10, 0).await.unwrap();
        let ids = vec![read[0].id.clone()];

        // Too fresh to claim.
        let none = backend.claim("t", "g", "alive", 60_000, &ids).await.unwrap();
        assert!(none.is_empty());

        // Idle threshold zero claims immediately and reassigns.
        let claimed = backend.claim("t", "g", "alive", 0, &ids).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = backend.pending("t", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "alive");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_kv_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend.kv_set_ex("k", "v", 60).await.unwrap();
        assert_eq!(backend.kv_get("k").await.unwrap(), Some("v".to_string()));

        // A zero TTL is already expired.
        backend.kv_set_ex("gone", "v", 0).await.unwrap();
        assert_eq!(backend.kv_get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let backend = MemoryBackend::new();
        backend.create_group("t", "g").await.unwrap();
        let start = Instant::now();
        let read = backend.read_group("t", "g", "c1", 10, 50).await.unwrap();
        assert!(read.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
