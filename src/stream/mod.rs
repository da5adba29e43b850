//! Durable event stream on Redis Streams
//!
//! The coordination backbone of the feed pipeline: write paths publish
//! events after their local commit, workers consume them through a shared
//! consumer group with per-consumer pending lists.

mod consumer;
mod events;
mod publisher;

pub use consumer::{EventConsumer, RedisConsumer, StreamMessage};
pub use events::FeedEvent;
pub use publisher::{EventPublisher, ReconcileHook, RedisPublisher};

use thiserror::Error;

/// Stream (topic) carrying all feed events
pub const STREAM_FEED: &str = "stream:feed";

/// Consumer group shared by the feed workers
pub const GROUP_FEED_WORKERS: &str = "feed_workers";

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;
