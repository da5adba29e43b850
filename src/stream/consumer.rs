//! Consumer-group reads (XREADGROUP / XACK / XPENDING / XCLAIM)
//!
//! Each worker reads through a named consumer in a shared group. Delivered
//! messages stay on the consumer's pending list until acked, which is what
//! makes crash recovery and cross-consumer reclaim possible.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{FeedEvent, StreamResult};
use crate::metrics;

/// A message read from the stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Log-assigned id ("<ms>-<seq>")
    pub id: String,
    /// Decoded payload. None when the payload was malformed or trimmed
    /// away; the worker acks such messages and advances.
    pub event: Option<FeedEvent>,
}

/// Contract for consuming events through a consumer group.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Create the group if it doesn't exist; success no-op otherwise.
    /// A fresh group starts from the earliest surviving message.
    async fn ensure_group(&self, stream: &str, group: &str) -> StreamResult<()>;

    /// Read up to `count` new messages for `consumer`, blocking up to
    /// `block`. Returns an empty batch on timeout.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamMessage>>;

    /// Read up to `count` messages already delivered to `consumer` but not
    /// yet acked. Used at startup to resume interrupted work.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>>;

    /// Acknowledge processed messages. Returns how many were still pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<i64>;

    /// Total unacked messages across the group.
    async fn pending_count(&self, stream: &str, group: &str) -> StreamResult<i64>;

    /// Claim up to `count` messages idle at least `min_idle` from any
    /// consumer in the group to `consumer`. This is how peers take over the
    /// pending list of a dead worker.
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>>;
}

/// Flat field map of one stream entry; nil when the entry was trimmed.
type EntryFields = Option<HashMap<String, String>>;
type ReadGroupReply = Vec<(String, Vec<(String, EntryFields)>)>;

/// Consumer backed by Redis Streams.
#[derive(Clone)]
pub struct RedisConsumer {
    conn: ConnectionManager,
}

impl RedisConsumer {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn decode_entries(stream: &str, entries: Vec<(String, EntryFields)>) -> Vec<StreamMessage> {
        entries
            .into_iter()
            .map(|(id, fields)| {
                let event = fields
                    .as_ref()
                    .and_then(|f| f.get("data"))
                    .and_then(|data| match serde_json::from_str::<FeedEvent>(data) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(stream, message_id = %id, error = %e, "malformed event payload");
                            None
                        }
                    });
                if event.is_none() {
                    metrics::record_malformed(stream);
                }
                StreamMessage { id, event }
            })
            .collect()
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
        start_id: &str,
    ) -> StreamResult<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        cmd.arg("COUNT").arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(start_id);

        // Nil reply means the block timed out with nothing new
        let reply: Option<ReadGroupReply> = cmd.query_async(&mut conn).await?;

        let mut messages = Vec::new();
        if let Some(streams) = reply {
            for (_, entries) in streams {
                messages.extend(Self::decode_entries(stream, entries));
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl EventConsumer for RedisConsumer {
    async fn ensure_group(&self, stream: &str, group: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();

        // XGROUP CREATE stream group 0 MKSTREAM: "0" replays everything the
        // log still holds into a fresh group
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                debug!(stream, group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => {
                warn!(stream, group, error = %e, "consumer group create failed");
                Err(e.into())
            }
        }
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamMessage>> {
        // ">" asks for messages never delivered to this group. A zero block
        // would mean "wait forever" on the wire, so it is simply omitted.
        let block = (!block.is_zero()).then_some(block);
        let messages = self
            .read_group(stream, group, consumer, count, block, ">")
            .await?;
        if !messages.is_empty() {
            debug!(stream, group, consumer, count = messages.len(), "read new messages");
        }
        Ok(messages)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        // "0" replays this consumer's own pending list
        let messages = self
            .read_group(stream, group, consumer, count, None, "0")
            .await?;
        debug!(stream, group, consumer, count = messages.len(), "read pending messages");
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<i64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        debug!(stream, group, acked, "acked messages");
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StreamResult<i64> {
        let mut conn = self.conn.clone();

        // Summary form: [count, min-id, max-id, per-consumer counts]
        type PendingSummary = (i64, Option<String>, Option<String>, Option<Vec<(String, String)>>);
        let summary: PendingSummary = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        Ok(summary.0)
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        // Extended XPENDING with an IDLE filter lists claimable entries:
        // [id, owning consumer, idle ms, delivery count]
        let pending: Vec<(String, String, i64, i64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Nothing idle enough, or only our own fresh deliveries
        let ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, owner, _, _)| owner != consumer)
            .map(|(id, _, _, _)| id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: Vec<(String, EntryFields)> = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let messages = Self::decode_entries(stream, claimed);
        debug!(stream, group, consumer, claimed = messages.len(), "reclaimed idle messages");
        Ok(messages)
    }
}
