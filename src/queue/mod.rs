//! Stream-based job queue with consumer groups and idempotent enqueue.
//!
//! Delivery is at-least-once: a handler may see a message twice, and
//! idempotence of the work itself is the handler's responsibility (the
//! task status transitions enforce it). Duplicate *enqueues* are absorbed
//! here via the `idempotence:{key}` KV side-channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::keys::derived_message_key;
use crate::store::{StreamBackend, StreamEntry};

/// A delivered queue message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Stream-assigned message id.
    pub id: String,
    /// Idempotence key recorded at enqueue time.
    pub key: String,
    /// The enqueued payload (a serialized `TaskSpec` for the task topic).
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Consumer-side message processing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()>;
}

/// Durable queue over an append-only stream plus a dedup KV.
pub struct JobQueue {
    backend: Arc<dyn StreamBackend>,
    config: QueueConfig,
    /// `{topic}:{group}:{consumer}` -> stop flag for the consume loop.
    stops: DashMap<String, Arc<AtomicBool>>,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn StreamBackend>, config: QueueConfig) -> Self {
        Self {
            backend,
            config,
            stops: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> Arc<dyn StreamBackend> {
        Arc::clone(&self.backend)
    }

    /// Append a message unless its idempotence key was seen within the
    /// dedup TTL. Returns the message id, or `None` for a duplicate.
    pub async fn enqueue(
        &self,
        topic: &str,
        msg: &Value,
        key: Option<&str>,
    ) -> Result<Option<String>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let payload = serde_json::to_string(msg)?;
        let key = match key {
            Some(k) => k.to_string(),
            None => derived_message_key(topic, &payload),
        };

        let dedup_key = format!("idempotence:{key}");
        if self.backend.kv_get(&dedup_key).await?.is_some() {
            debug!(topic, %key, "duplicate enqueue absorbed");
            return Ok(None);
        }

        let fields = vec![
            ("key".to_string(), key.clone()),
            ("payload".to_string(), payload),
            ("timestamp".to_string(), Utc::now().to_rfc3339()),
        ];
        let message_id = self.backend.append(topic, &fields).await?;
        // A KV failure here is fatal for this enqueue; the duplicate window
        // for the key is bounded by the TTL.
        self.backend
            .kv_set_ex(&dedup_key, &message_id, self.config.idempotence_ttl_seconds)
            .await?;
        Ok(Some(message_id))
    }

    /// Cooperative consume loop. Runs until [`stop_consumer`] flips the
    /// flag; transient backend errors back off one second and retry.
    /// Failed handler invocations leave the message in the PEL.
    ///
    /// [`stop_consumer`]: JobQueue::stop_consumer
    pub async fn consume(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        self.backend.create_group(topic, group).await?;

        let stop = self.stop_flag(topic, group, consumer);
        stop.store(false, Ordering::SeqCst);
        debug!(topic, group, consumer, "consumer loop starting");

        while !stop.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            let batch = self
                .backend
                .read_group(
                    topic,
                    group,
                    consumer,
                    self.config.batch_size,
                    self.config.block_time_ms,
                )
                .await;
            let entries = match batch {
                Ok(entries) => entries,
                Err(err) => {
                    error!(topic, group, consumer, %err, "consume read failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for entry in entries {
                self.dispatch(topic, group, consumer, &entry, handler.as_ref()).await;
            }
        }
        debug!(topic, group, consumer, "consumer loop stopped");
        Ok(())
    }

    async fn dispatch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        entry: &StreamEntry,
        handler: &dyn MessageHandler,
    ) {
        let message = match parse_entry(topic, entry) {
            Ok(message) => message,
            Err(err) => {
                // Poison payloads are acked away rather than redelivered
                // forever.
                warn!(topic, id = %entry.id, %err, "dropping malformed message");
                if let Err(err) = self.backend.ack(topic, group, &entry.id).await {
                    warn!(topic, id = %entry.id, %err, "ack of malformed message failed");
                }
                return;
            }
        };
        match handler.handle(&message).await {
            Ok(()) => {
                if let Err(err) = self.backend.ack(topic, group, &message.id).await {
                    warn!(topic, id = %message.id, %err, "ack failed; message stays pending");
                }
            }
            Err(err) => {
                warn!(
                    topic, group, consumer, id = %message.id, key = %message.key, %err,
                    "handler failed; message left pending for claim"
                );
            }
        }
    }

    /// Signal the consume loop for `(topic, group, consumer)` to exit after
    /// its current batch.
    pub fn stop_consumer(&self, topic: &str, group: &str, consumer: &str) {
        self.stop_flag(topic, group, consumer).store(true, Ordering::SeqCst);
    }

    /// Claim pending entries idle for at least `min_idle_ms` and run them
    /// through `handler`, acknowledging successes. Returns the number of
    /// entries claimed.
    pub async fn claim_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<usize, QueueError> {
        let pending = self.backend.pending(topic, group, self.config.batch_size * 10).await?;
        let stale_ids: Vec<String> = pending
            .into_iter()
            .filter(|row| row.idle_ms >= min_idle_ms)
            .map(|row| row.id)
            .collect();
        if stale_ids.is_empty() {
            return Ok(0);
        }
        let claimed = self
            .backend
            .claim(topic, group, consumer, min_idle_ms, &stale_ids)
            .await?;
        let count = claimed.len();
        if count > 0 {
            debug!(topic, group, consumer, count, "claimed stale pending entries");
        }
        for entry in &claimed {
            self.dispatch(topic, group, consumer, entry, handler.as_ref()).await;
        }
        Ok(count)
    }

    /// Number of entries appended to the topic.
    pub async fn get_queue_depth(&self, topic: &str) -> Result<u64, QueueError> {
        self.backend.len(topic).await
    }

    /// Stop every consumer and refuse further enqueues.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.stops.iter() {
            entry.value().store(true, Ordering::SeqCst);
        }
    }

    fn stop_flag(&self, topic: &str, group: &str, consumer: &str) -> Arc<AtomicBool> {
        let key = format!("{topic}:{group}:{consumer}");
        self.stops
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

fn parse_entry(topic: &str, entry: &StreamEntry) -> Result<QueueMessage, QueueError> {
    let missing = |field: &str| QueueError::Payload {
        topic: topic.to_string(),
        message: format!("missing field '{field}'"),
    };
    let key = entry.field("key").ok_or_else(|| missing("key"))?.to_string();
    let raw_payload = entry.field("payload").ok_or_else(|| missing("payload"))?;
    let payload: Value = serde_json::from_str(raw_payload).map_err(|err| QueueError::Payload {
        topic: topic.to_string(),
        message: format!("payload is not JSON: {err}"),
    })?;
    let timestamp = entry
        .field("timestamp")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(QueueMessage { id: entry.id.clone(), key, payload, timestamp })
}
