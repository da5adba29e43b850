//! Per-user feed cache on Redis sorted sets
//!
//! Each user's feed is one sorted set under `feed:user:{id}`: members are
//! post ids, scores are the post's creation time in whole seconds. Every
//! mutation that must leave no observable partial state (add + trim to cap
//! + TTL refresh) runs as one MULTI/EXEC pipeline.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{CacheError, CacheResult};
use crate::models::{FeedEntry, PostScore};

/// Key prefix for user feed caches
pub const FEED_CACHE_PREFIX: &str = "feed:user:";

/// Redis key for a user's feed cache.
pub fn feed_key(user_id: i64) -> String {
    format!("{}{}", FEED_CACHE_PREFIX, user_id)
}

/// Cap and TTL applied by every mutating operation.
#[derive(Debug, Clone, Copy)]
pub struct FeedCacheConfig {
    /// Maximum entries kept per user
    pub cap: usize,
    /// TTL in seconds, refreshed on every access
    pub ttl_secs: i64,
}

impl Default for FeedCacheConfig {
    fn default() -> Self {
        Self {
            cap: 500,
            ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Contract for feed cache operations.
///
/// An interface so the read service and workers can run against a test
/// double; the production implementation is [`RedisFeedCache`].
#[async_trait]
pub trait FeedCache: Send + Sync {
    /// Insert or re-score one entry, trim to cap, refresh TTL, atomically.
    async fn add_post(&self, user_id: i64, post_id: i64, timestamp: i64) -> CacheResult<()>;

    /// Remove one entry if present. Does not touch the TTL.
    async fn remove_post(&self, user_id: i64, post_id: i64) -> CacheResult<()>;

    /// Read up to `limit` entries in descending score order. With a cursor
    /// score, only entries strictly below it are returned. Refreshes TTL.
    async fn get_feed(
        &self,
        user_id: i64,
        cursor_score: Option<f64>,
        limit: usize,
    ) -> CacheResult<Vec<FeedEntry>>;

    /// Score of one entry, or None when absent.
    async fn get_score(&self, user_id: i64, post_id: i64) -> CacheResult<Option<i64>>;

    /// Bulk-insert a precomputed batch, trim to cap, set TTL, atomically.
    /// An empty batch is a no-op.
    async fn warm(&self, user_id: i64, posts: &[PostScore]) -> CacheResult<()>;

    /// Number of entries in the user's cache.
    async fn size(&self, user_id: i64) -> CacheResult<i64>;

    /// Whether the user has a cache at all (false for new users and after
    /// TTL expiry; the read service warms on false).
    async fn exists(&self, user_id: i64) -> CacheResult<bool>;
}

/// Feed cache implementation on Redis sorted sets.
#[derive(Clone)]
pub struct RedisFeedCache {
    conn: ConnectionManager,
    config: FeedCacheConfig,
}

/// Rank bound for ZREMRANGEBYRANK: removes everything below the cap,
/// lowest scores first.
fn trim_stop(cap: usize) -> i64 {
    -(cap as i64) - 1
}

impl RedisFeedCache {
    pub fn new(conn: ConnectionManager, config: FeedCacheConfig) -> Self {
        Self { conn, config }
    }

    fn parse_entries(&self, raw: Vec<(String, f64)>) -> CacheResult<Vec<FeedEntry>> {
        raw.into_iter()
            .map(|(member, score)| {
                let post_id = member.parse::<i64>().map_err(|_| {
                    CacheError::InvalidData(format!("non-numeric feed member: {member}"))
                })?;
                Ok(FeedEntry {
                    post_id,
                    score: score as i64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl FeedCache for RedisFeedCache {
    async fn add_post(&self, user_id: i64, post_id: i64, timestamp: i64) -> CacheResult<()> {
        let key = feed_key(user_id);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .zadd(&key, post_id.to_string(), timestamp)
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(trim_stop(self.config.cap))
            .ignore()
            .expire(&key, self.config.ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                warn!(user_id, post_id, error = %e, "feed cache add failed");
                CacheError::Redis(e)
            })?;

        debug!(user_id, post_id, timestamp, "feed cache add");
        Ok(())
    }

    async fn remove_post(&self, user_id: i64, post_id: i64) -> CacheResult<()> {
        let key = feed_key(user_id);
        let mut conn = self.conn.clone();

        let removed: i64 = redis::cmd("ZREM")
            .arg(&key)
            .arg(post_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(user_id, post_id, error = %e, "feed cache remove failed");
                CacheError::Redis(e)
            })?;

        debug!(user_id, post_id, removed, "feed cache remove");
        Ok(())
    }

    async fn get_feed(
        &self,
        user_id: i64,
        cursor_score: Option<f64>,
        limit: usize,
    ) -> CacheResult<Vec<FeedEntry>> {
        let key = feed_key(user_id);
        let mut conn = self.conn.clone();

        let raw: Vec<(String, f64)> = match cursor_score {
            None => {
                redis::cmd("ZREVRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(limit as i64 - 1)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?
            }
            Some(score) => {
                // "(" prefix makes the max bound exclusive
                redis::cmd("ZREVRANGEBYSCORE")
                    .arg(&key)
                    .arg(format!("({score}"))
                    .arg("-inf")
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit as i64)
                    .query_async(&mut conn)
                    .await?
            }
        };

        // Refresh TTL on access
        let _: Result<bool, _> = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.ttl_secs)
            .query_async(&mut conn)
            .await;

        let entries = self.parse_entries(raw)?;
        debug!(
            user_id,
            returned = entries.len(),
            cursor = ?cursor_score,
            "feed cache read"
        );
        Ok(entries)
    }

    async fn get_score(&self, user_id: i64, post_id: i64) -> CacheResult<Option<i64>> {
        let key = feed_key(user_id);
        let mut conn = self.conn.clone();

        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(&key)
            .arg(post_id.to_string())
            .query_async(&mut conn)
            .await?;

        Ok(score.map(|s| s as i64))
    }

    async fn warm(&self, user_id: i64, posts: &[PostScore]) -> CacheResult<()> {
        if posts.is_empty() {
            debug!(user_id, "feed cache warm: nothing to warm");
            return Ok(());
        }

        let key = feed_key(user_id);
        let mut conn = self.conn.clone();

        let members: Vec<(i64, String)> = posts
            .iter()
            .map(|p| (p.timestamp, p.post_id.to_string()))
            .collect();

        redis::pipe()
            .atomic()
            .zadd_multiple(&key, &members)
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(trim_stop(self.config.cap))
            .ignore()
            .expire(&key, self.config.ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                warn!(user_id, posts = posts.len(), error = %e, "feed cache warm failed");
                CacheError::Redis(e)
            })?;

        debug!(user_id, posts = posts.len(), "feed cache warmed");
        Ok(())
    }

    async fn size(&self, user_id: i64) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        let size: i64 = redis::cmd("ZCARD")
            .arg(feed_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(size)
    }

    async fn exists(&self, user_id: i64) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(feed_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists > 0)
    }
}
