//! Event routing
//!
//! Every handler is idempotent: adds are set-upserts and removes are
//! set-removes, so redelivering an event reproduces the same end state. A
//! failing recipient never aborts the fan-out; the rest of the recipients
//! still get the mutation and the event is acked, with the stragglers
//! paying an eventual-consistency cost instead of stalling the stream.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::FeedCache;
use crate::config::FollowConfig;
use crate::db::{FollowStore, PostStore};
use crate::error::ServiceResult;
use crate::metrics;
use crate::stream::FeedEvent;

pub struct EventHandler {
    feed_cache: Arc<dyn FeedCache>,
    posts: Arc<dyn PostStore>,
    follows: Arc<dyn FollowStore>,
    config: FollowConfig,
}

impl EventHandler {
    pub fn new(
        feed_cache: Arc<dyn FeedCache>,
        posts: Arc<dyn PostStore>,
        follows: Arc<dyn FollowStore>,
        config: FollowConfig,
    ) -> Self {
        Self {
            feed_cache,
            posts,
            follows,
            config,
        }
    }

    /// Route one event. An Err here means a transient failure before any
    /// fan-out started (typically the primary-store lookup); the caller
    /// leaves the message unacked so a peer can retry it.
    pub async fn handle(&self, event: &FeedEvent) -> ServiceResult<()> {
        match *event {
            FeedEvent::PostCreated {
                post_id,
                author_id,
                timestamp,
            } => self.on_post_created(post_id, author_id, timestamp).await,
            FeedEvent::PostDeleted {
                post_id, author_id, ..
            } => self.on_post_deleted(post_id, author_id).await,
            FeedEvent::UserFollowed {
                follower_id,
                followee_id,
                ..
            } => self.on_user_followed(follower_id, followee_id).await,
            FeedEvent::UserUnfollowed {
                follower_id,
                followee_id,
                ..
            } => self.on_user_unfollowed(follower_id, followee_id).await,
            // Notification-only events: not ours
            FeedEvent::PostLiked { .. } | FeedEvent::PostCommented { .. } => {
                debug!(event = event.type_name(), "ignored by feed worker");
                Ok(())
            }
        }
    }

    /// Fan the new post out to every follower of the author, and to the
    /// author themselves.
    async fn on_post_created(&self, post_id: i64, author_id: i64, timestamp: i64) -> ServiceResult<()> {
        let followers = self.follows.follower_ids(author_id).await?;

        debug!(post_id, author_id, recipients = followers.len() + 1, "fanning out post");

        let mut failed = 0u64;
        for recipient in followers.iter().copied().chain(std::iter::once(author_id)) {
            if let Err(e) = self.feed_cache.add_post(recipient, post_id, timestamp).await {
                warn!(post_id, recipient, error = %e, "fan-out add failed");
                failed += 1;
            }
        }
        metrics::record_fanout_failures("post_created", failed);

        debug!(post_id, failed, "fan-out complete");
        Ok(())
    }

    /// Remove the deleted post from every follower's cache and the
    /// author's own. Removal is unconditional: if this delete overtook its
    /// create for some recipient, the stale entry is filtered at hydration.
    async fn on_post_deleted(&self, post_id: i64, author_id: i64) -> ServiceResult<()> {
        let followers = self.follows.follower_ids(author_id).await?;

        debug!(post_id, author_id, recipients = followers.len() + 1, "sweeping deleted post");

        let mut failed = 0u64;
        for recipient in followers.iter().copied().chain(std::iter::once(author_id)) {
            if let Err(e) = self.feed_cache.remove_post(recipient, post_id).await {
                warn!(post_id, recipient, error = %e, "fan-out remove failed");
                failed += 1;
            }
        }
        metrics::record_fanout_failures("post_deleted", failed);

        Ok(())
    }

    /// Push the followee's recent posts into the new follower's cache.
    async fn on_user_followed(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        let posts = self
            .posts
            .recent_post_scores(followee_id, self.config.backfill_limit)
            .await?;

        if posts.is_empty() {
            debug!(follower_id, followee_id, "followee has no posts to backfill");
            return Ok(());
        }

        debug!(follower_id, followee_id, posts = posts.len(), "backfilling feed");

        let mut failed = 0u64;
        for post in &posts {
            if let Err(e) = self
                .feed_cache
                .add_post(follower_id, post.post_id, post.timestamp)
                .await
            {
                warn!(follower_id, post_id = post.post_id, error = %e, "backfill add failed");
                failed += 1;
            }
        }
        metrics::record_fanout_failures("user_followed", failed);

        Ok(())
    }

    /// Remove the followee's recent posts from the follower's cache. Posts
    /// older than the cache horizon were never cached, so removing them is
    /// a no-op.
    async fn on_user_unfollowed(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        let posts = self
            .posts
            .recent_post_scores(followee_id, self.config.unfollow_remove_limit)
            .await?;

        if posts.is_empty() {
            return Ok(());
        }

        debug!(follower_id, followee_id, posts = posts.len(), "removing unfollowed posts");

        let mut failed = 0u64;
        for post in &posts {
            if let Err(e) = self.feed_cache.remove_post(follower_id, post.post_id).await {
                warn!(follower_id, post_id = post.post_id, error = %e, "unfollow remove failed");
                failed += 1;
            }
        }
        metrics::record_fanout_failures("user_unfollowed", failed);

        Ok(())
    }
}
