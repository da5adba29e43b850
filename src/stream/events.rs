//! Feed event envelope
//!
//! Events travel as two XADD fields: `type` (a copy of the serde tag, so
//! consumers can dispatch without parsing the payload) and `data` (the full
//! JSON payload). Redelivery is expected; every event is handled
//! idempotently downstream.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An event published to the feed stream.
///
/// The first four variants mutate feed caches. `PostLiked` and
/// `PostCommented` exist for the notification pipeline and are ignored by
/// the feed workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    PostCreated {
        post_id: i64,
        author_id: i64,
        timestamp: i64,
    },
    PostDeleted {
        post_id: i64,
        author_id: i64,
        timestamp: i64,
    },
    UserFollowed {
        follower_id: i64,
        followee_id: i64,
        timestamp: i64,
    },
    UserUnfollowed {
        follower_id: i64,
        followee_id: i64,
        timestamp: i64,
    },
    PostLiked {
        post_id: i64,
        actor_id: i64,
        recipient_id: i64,
        timestamp: i64,
    },
    PostCommented {
        post_id: i64,
        comment_id: i64,
        actor_id: i64,
        recipient_id: i64,
        timestamp: i64,
    },
}

impl FeedEvent {
    /// Fan this post out to the author's followers.
    pub fn post_created(post_id: i64, author_id: i64, timestamp: i64) -> Self {
        Self::PostCreated {
            post_id,
            author_id,
            timestamp,
        }
    }

    /// Sweep this post from the author's followers' caches.
    pub fn post_deleted(post_id: i64, author_id: i64) -> Self {
        Self::PostDeleted {
            post_id,
            author_id,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Backfill the followee's recent posts into the follower's cache.
    pub fn user_followed(follower_id: i64, followee_id: i64) -> Self {
        Self::UserFollowed {
            follower_id,
            followee_id,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Remove the followee's posts from the follower's cache.
    pub fn user_unfollowed(follower_id: i64, followee_id: i64) -> Self {
        Self::UserUnfollowed {
            follower_id,
            followee_id,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn post_liked(post_id: i64, actor_id: i64, recipient_id: i64) -> Self {
        Self::PostLiked {
            post_id,
            actor_id,
            recipient_id,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Stable type tag, duplicated into the envelope for fast dispatch.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PostCreated { .. } => "post_created",
            Self::PostDeleted { .. } => "post_deleted",
            Self::UserFollowed { .. } => "user_followed",
            Self::UserUnfollowed { .. } => "user_unfollowed",
            Self::PostLiked { .. } => "post_liked",
            Self::PostCommented { .. } => "post_commented",
        }
    }

    /// When the event occurred, unix seconds.
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::PostCreated { timestamp, .. }
            | Self::PostDeleted { timestamp, .. }
            | Self::UserFollowed { timestamp, .. }
            | Self::UserUnfollowed { timestamp, .. }
            | Self::PostLiked { timestamp, .. }
            | Self::PostCommented { timestamp, .. } => *timestamp,
        }
    }
}
