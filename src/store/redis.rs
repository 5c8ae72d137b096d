//! Redis Streams implementation of [`StreamBackend`].
//!
//! One auto-reconnecting connection manager backs both the streams and the
//! KV side-channel. Consumer groups are created with MKSTREAM so topics
//! materialize on first use.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::debug;

use super::{PendingEntry, StreamBackend, StreamEntry};
use crate::errors::QueueError;

/// Stream + KV handle over a Redis deployment.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect and wait for the connection manager to become ready.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::Redis)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(QueueError::Redis)?;
        debug!(url, "connected stream backend");
        Ok(Self { conn })
    }

    fn entry_from_stream_id(id: &redis::streams::StreamId) -> StreamEntry {
        let mut fields = HashMap::new();
        for key in id.map.keys() {
            if let Some(value) = id.get::<String>(key) {
                fields.insert(key.clone(), value);
            }
        }
        StreamEntry { id: id.id.clone(), fields }
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn append(
        &self,
        topic: &str,
        fields: &[(String, String)],
    ) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(topic, "*", fields).await?;
        Ok(id)
    }

    async fn create_group(&self, topic: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(topic, group, "0").await;
        match created {
            Ok(_) => Ok(()),
            // Auto-create semantics: an existing group is not an error.
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(QueueError::Redis(err)),
        }
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn.xread_options(&[topic], &[">"], &options).await?;
        let mut entries = Vec::new();
        for key in &reply.keys {
            for id in &key.ids {
                entries.push(Self::entry_from_stream_id(id));
            }
        }
        Ok(entries)
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(topic, group, &[id]).await?;
        Ok(())
    }

    async fn pending(
        &self,
        topic: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(topic, group, "-", "+", count).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|row| PendingEntry {
                id: row.id,
                consumer: row.consumer,
                idle_ms: row.last_delivered_ms as u64,
                delivery_count: row.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(topic, group, consumer, min_idle_ms as usize, ids)
            .await?;
        Ok(reply.ids.iter().map(Self::entry_from_stream_id).collect())
    }

    async fn len(&self, topic: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(topic).await?;
        Ok(len)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn kv_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }
}
