//! Redis-backed caching layer

mod feed_cache;

pub use feed_cache::{feed_key, FeedCache, FeedCacheConfig, RedisFeedCache};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid cache data: {0}")]
    InvalidData(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
