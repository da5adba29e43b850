use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use photofeed::cache::{FeedCacheConfig, RedisFeedCache};
use photofeed::config::Config;
use photofeed::db::{PgFollowStore, PgPostStore, PgUserStore};
use photofeed::services::{FeedService, FollowService, PostService};
use photofeed::stream::{RedisConsumer, RedisPublisher};
use photofeed::workers::{EventHandler, WorkerManager};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting photofeed");

    let config = Config::from_env()?;

    // Backends
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("failed to connect to Postgres")?;
    info!("connected to Postgres");

    let redis_client =
        redis::Client::open(config.redis.url.as_str()).context("invalid Redis URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to Redis")?;
    info!("connected to Redis");

    // Adapters
    let feed_cache = Arc::new(RedisFeedCache::new(
        redis_conn.clone(),
        FeedCacheConfig {
            cap: config.feed.cap,
            ttl_secs: config.feed.ttl_secs,
        },
    ));
    let publisher = Arc::new(RedisPublisher::new(redis_conn.clone(), config.stream.max_len));
    let consumer = Arc::new(RedisConsumer::new(redis_conn));
    let post_store = Arc::new(PgPostStore::new(pool.clone()));
    let follow_store = Arc::new(PgFollowStore::new(pool.clone()));
    let user_store = Arc::new(PgUserStore::new(pool.clone()));

    // Services
    let feed_service = Arc::new(FeedService::new(
        feed_cache.clone(),
        post_store.clone(),
        follow_store.clone(),
        user_store.clone(),
        config.feed.clone(),
    ));
    let post_service = Arc::new(PostService::new(
        post_store.clone(),
        user_store.clone(),
        publisher.clone(),
    ));
    let follow_service = Arc::new(FollowService::new(
        follow_store.clone(),
        user_store.clone(),
        publisher.clone(),
    ));
    // The transport layer (out of scope here) is what calls these
    let _ = (feed_service, post_service, follow_service);

    // Workers
    let handler = Arc::new(EventHandler::new(
        feed_cache,
        post_store,
        follow_store,
        config.follow.clone(),
    ));
    let mut manager = WorkerManager::new(consumer, handler, config.workers.clone());
    manager.start().await.context("failed to start workers")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    // Tear down in reverse order: workers first, then the pools they use
    manager.stop().await;
    pool.close().await;

    info!("photofeed stopped");
    Ok(())
}
