//! Event publishing (XADD)

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{FeedEvent, StreamError, StreamResult};

/// Contract for publishing events to a stream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Append an event to the stream. Returns the id assigned by the log
    /// once the event is durably accepted.
    async fn publish(&self, stream: &str, event: &FeedEvent) -> StreamResult<String>;
}

/// Receives events that committed locally but could not be published.
///
/// Write paths never fail on a publish error; a reconciliation job can
/// implement this to re-drive the lost fan-out.
pub trait ReconcileHook: Send + Sync {
    fn on_publish_failure(&self, event: &FeedEvent, error: &StreamError);
}

/// Publisher backed by Redis Streams.
#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
    /// Approximate stream length bound applied on every XADD
    max_len: usize,
}

impl RedisPublisher {
    pub fn new(conn: ConnectionManager, max_len: usize) -> Self {
        Self { conn, max_len }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, stream: &str, event: &FeedEvent) -> StreamResult<String> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();

        // XADD stream MAXLEN ~ n * type <tag> data <json>
        // "~" keeps trimming approximate so appends stay O(1)
        let message_id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("type")
            .arg(event.type_name())
            .arg("data")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(stream, event = event.type_name(), error = %e, "publish failed");
                StreamError::Redis(e)
            })?;

        debug!(
            stream,
            event = event.type_name(),
            message_id = %message_id,
            "event published"
        );
        Ok(message_id)
    }
}
