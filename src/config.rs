/// Configuration for the feed pipeline
///
/// Loads configuration from environment variables. Every tuning knob has a
/// default; only the two backend URLs are required.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Feed cache tuning
    pub feed: FeedConfig,
    /// Follow backfill tuning
    pub follow: FollowConfig,
    /// Event stream tuning
    pub stream: StreamConfig,
    /// Worker pool tuning
    pub workers: WorkersConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Max connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Min connections in pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port)
    pub url: String,
}

/// Per-user feed cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Maximum entries kept per user
    #[serde(default = "default_feed_cap")]
    pub cap: usize,
    /// Cache TTL in seconds, refreshed on every access
    #[serde(default = "default_feed_ttl_secs")]
    pub ttl_secs: i64,
    /// Maximum entries seeded during a cold warm
    #[serde(default = "default_warm_limit")]
    pub warm_limit: usize,
    /// Default page size
    #[serde(default = "default_page_limit")]
    pub default_limit: usize,
    /// Maximum page size
    #[serde(default = "default_max_page_limit")]
    pub max_limit: usize,
}

/// Follow / unfollow fan-in settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowConfig {
    /// Posts pushed to a new follower on user_followed
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    /// Recent-post window swept on user_unfollowed
    #[serde(default = "default_unfollow_remove_limit")]
    pub unfollow_remove_limit: usize,
}

/// Event stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Approximate upper bound on stream length (XADD MAXLEN ~)
    #[serde(default = "default_stream_max_len")]
    pub max_len: usize,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of consumers in the group
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Messages per read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Block time for group reads, milliseconds
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Idle threshold before a peer's pending message is reclaimed, seconds
    #[serde(default = "default_reclaim_idle_secs")]
    pub reclaim_idle_secs: u64,
    /// How often each worker attempts a reclaim pass, seconds
    #[serde(default = "default_reclaim_every_secs")]
    pub reclaim_every_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_feed_cap() -> usize {
    500
}

fn default_feed_ttl_secs() -> i64 {
    7 * 24 * 60 * 60
}

fn default_warm_limit() -> usize {
    500
}

fn default_page_limit() -> usize {
    10
}

fn default_max_page_limit() -> usize {
    50
}

fn default_backfill_limit() -> usize {
    20
}

fn default_unfollow_remove_limit() -> usize {
    100
}

fn default_stream_max_len() -> usize {
    100_000
}

fn default_worker_count() -> usize {
    2
}

fn default_batch_size() -> usize {
    10
}

fn default_block_ms() -> u64 {
    5_000
}

fn default_reclaim_idle_secs() -> u64 {
    60
}

fn default_reclaim_every_secs() -> u64 {
    30
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable not set")?,
            max_connections: env_parse("DB_MAX_CONNECTIONS")
                .unwrap_or_else(default_max_connections),
            min_connections: env_parse("DB_MIN_CONNECTIONS")
                .unwrap_or_else(default_min_connections),
        };

        let redis = RedisConfig {
            url: std::env::var("REDIS_URL").context("REDIS_URL environment variable not set")?,
        };

        let feed = FeedConfig {
            cap: env_parse("FEED_CACHE_CAP").unwrap_or_else(default_feed_cap),
            ttl_secs: env_parse("FEED_CACHE_TTL_SECS").unwrap_or_else(default_feed_ttl_secs),
            warm_limit: env_parse("FEED_WARM_LIMIT").unwrap_or_else(default_warm_limit),
            default_limit: env_parse("FEED_DEFAULT_LIMIT").unwrap_or_else(default_page_limit),
            max_limit: env_parse("FEED_MAX_LIMIT").unwrap_or_else(default_max_page_limit),
        };

        let follow = FollowConfig {
            backfill_limit: env_parse("FOLLOW_BACKFILL_LIMIT")
                .unwrap_or_else(default_backfill_limit),
            unfollow_remove_limit: env_parse("FOLLOW_UNFOLLOW_REMOVE_LIMIT")
                .unwrap_or_else(default_unfollow_remove_limit),
        };

        let stream = StreamConfig {
            max_len: env_parse("STREAM_MAX_LEN").unwrap_or_else(default_stream_max_len),
        };

        let workers = WorkersConfig {
            count: env_parse("WORKER_COUNT").unwrap_or_else(default_worker_count),
            batch_size: env_parse("WORKER_BATCH_SIZE").unwrap_or_else(default_batch_size),
            block_ms: env_parse("WORKER_BLOCK_MS").unwrap_or_else(default_block_ms),
            reclaim_idle_secs: env_parse("WORKER_RECLAIM_IDLE_SECS")
                .unwrap_or_else(default_reclaim_idle_secs),
            reclaim_every_secs: env_parse("WORKER_RECLAIM_EVERY_SECS")
                .unwrap_or_else(default_reclaim_every_secs),
        };

        Ok(Config {
            database,
            redis,
            feed,
            follow,
            stream,
            workers,
        })
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cap: default_feed_cap(),
            ttl_secs: default_feed_ttl_secs(),
            warm_limit: default_warm_limit(),
            default_limit: default_page_limit(),
            max_limit: default_max_page_limit(),
        }
    }
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            backfill_limit: default_backfill_limit(),
            unfollow_remove_limit: default_unfollow_remove_limit(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_len: default_stream_max_len(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            reclaim_idle_secs: default_reclaim_idle_secs(),
            reclaim_every_secs: default_reclaim_every_secs(),
        }
    }
}
