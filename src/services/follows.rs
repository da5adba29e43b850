//! Follow write paths

use std::sync::Arc;

use tracing::info;

use super::publish_after_commit;
use crate::db::{FollowStore, UserStore};
use crate::error::{ServiceError, ServiceResult};
use crate::stream::{EventPublisher, FeedEvent, ReconcileHook};

pub struct FollowService {
    follows: Arc<dyn FollowStore>,
    users: Arc<dyn UserStore>,
    publisher: Arc<dyn EventPublisher>,
    reconcile: Option<Arc<dyn ReconcileHook>>,
}

impl FollowService {
    pub fn new(
        follows: Arc<dyn FollowStore>,
        users: Arc<dyn UserStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            follows,
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

    /// Create the follow edge and backfill the follower's feed via the
    /// stream. An existing edge is a Conflict and publishes nothing, so a
    /// repeated follow cannot re-run the backfill.
    pub async fn follow(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        if follower_id == followee_id {
            return Err(ServiceError::InvalidArgument(
                "cannot follow yourself".into(),
            ));
        }

        // Surfaces NotFound for a missing followee before touching the edge
        self.users.get_by_id(followee_id).await?;

        let inserted = self.follows.create(follower_id, followee_id).await?;
        if !inserted {
            return Err(ServiceError::Conflict(format!(
                "user {follower_id} already follows {followee_id}"
            )));
        }

        info!(follower_id, followee_id, "follow created");

        let event = FeedEvent::user_followed(follower_id, followee_id);
        publish_after_commit(&self.publisher, &self.reconcile, event).await;

        Ok(())
    }

    /// Remove the follow edge and clean the followee's posts out of the
    /// follower's feed via the stream.
    pub async fn unfollow(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        self.follows.delete(follower_id, followee_id).await?;

        info!(follower_id, followee_id, "follow removed");

        let event = FeedEvent::user_unfollowed(follower_id, followee_id);
        publish_after_commit(&self.publisher, &self.reconcile, event).await;

        Ok(())
    }
}
