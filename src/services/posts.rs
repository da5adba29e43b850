//! Post write paths
//!
//! Every mutation that can change feed contents commits its transaction
//! first and publishes its event second. A post that commits but whose
//! event is lost stays reachable through the read service's primary-store
//! fallback until reconciliation replays the fan-out.

use std::sync::Arc;

use tracing::{debug, info};

use super::publish_after_commit;
use crate::db::{PostStore, UserStore};
use crate::error::{ServiceError, ServiceResult};
use crate::models::{
    CreatePostRequest, Post, UserSummary, MAX_POST_CAPTION_LENGTH, MAX_POST_MEDIA_COUNT,
};
use crate::stream::{EventPublisher, FeedEvent, ReconcileHook};

pub struct PostService {
    posts: Arc<dyn PostStore>,
    users: Arc<dyn UserStore>,
    publisher: Arc<dyn EventPublisher>,
    reconcile: Option<Arc<dyn ReconcileHook>>,
}

impl PostService {
    pub fn new(
        posts: Arc<dyn PostStore>,
        users: Arc<dyn UserStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            posts,
            users,
            publisher,
            reconcile: None,
        }
    }

    /// Attach a reconciliation sink for events that fail to publish.
    pub fn with_reconcile_hook(mut self, hook: Arc<dyn ReconcileHook>) -> Self {
        self.reconcile = Some(hook);
        self
    }

    /// Create a post and fan it out to followers via the stream.
    pub async fn create(&self, author_id: i64, req: CreatePostRequest) -> ServiceResult<Post> {
        if req.media_urls.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "at least one media item is required".into(),
            ));
        }
        if req.media_urls.len() > MAX_POST_MEDIA_COUNT {
            return Err(ServiceError::InvalidArgument(format!(
                "too many media items: {} (max {MAX_POST_MEDIA_COUNT})",
                req.media_urls.len()
            )));
        }
        if let Some(caption) = &req.caption {
            if caption.chars().count() > MAX_POST_CAPTION_LENGTH {
                return Err(ServiceError::InvalidArgument(format!(
                    "caption too long (max {MAX_POST_CAPTION_LENGTH} characters)"
                )));
            }
        }

        let mut post = self
            .posts
            .create(author_id, req.caption.as_deref(), &req.media_urls)
            .await?;

        info!(post_id = post.id, author_id, "post created");

        // The event score must equal the post's creation time
        let event = FeedEvent::post_created(post.id, author_id, post.created_at.timestamp());
        publish_after_commit(&self.publisher, &self.reconcile, event).await;

        match self.users.get_by_id(author_id).await {
            Ok(author) => post.author = Some(UserSummary::from(&author)),
            Err(e) => debug!(author_id, error = %e, "author lookup after create failed"),
        }

        Ok(post)
    }

    /// Soft-delete a post and sweep it out of follower feeds.
    pub async fn delete(&self, post_id: i64, caller_id: i64) -> ServiceResult<()> {
        self.posts.soft_delete(post_id, caller_id).await?;

        info!(post_id, caller_id, "post deleted");

        let event = FeedEvent::post_deleted(post_id, caller_id);
        publish_after_commit(&self.publisher, &self.reconcile, event).await;

        Ok(())
    }

    /// Like a post. The `post_liked` event only feeds notifications; the
    /// feed workers ignore it.
    pub async fn like(&self, post_id: i64, user_id: i64) -> ServiceResult<()> {
        let post = self.posts.get_by_id(post_id).await?;

        self.posts.like(post_id, user_id).await?;

        if post.user_id != user_id {
            let event = FeedEvent::post_liked(post_id, user_id, post.user_id);
            publish_after_commit(&self.publisher, &self.reconcile, event).await;
        }

        Ok(())
    }

    /// Remove a like.
    pub async fn unlike(&self, post_id: i64, user_id: i64) -> ServiceResult<()> {
        self.posts.unlike(post_id, user_id).await
    }
}
