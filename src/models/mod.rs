//! Data models for the feed pipeline
//!
//! Row types mirror the primary store; the joined fields (media, author,
//! like status) are attached during hydration and never read from a single
//! query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum media attachments per post
pub const MAX_POST_MEDIA_COUNT: usize = 10;

/// Maximum caption length in characters
pub const MAX_POST_CAPTION_LENGTH: usize = 2200;

/// A user's post with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub caption: Option<String>,
    pub like_count: i32,
    pub comment_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,

    // Joined fields, attached during hydration
    #[sqlx(skip)]
    #[serde(default)]
    pub media: Vec<PostMedia>,
    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<UserSummary>,
    #[sqlx(skip)]
    #[serde(default)]
    pub is_liked: bool,
}

/// A single media item in a post (carousel support).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostMedia {
    pub id: i64,
    pub post_id: i64,
    pub media_url: String,
    /// "image" or "video"
    pub media_type: String,
    pub position: i32,
}

/// Full user row with denormalized counters.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub follower_count: i32,
    pub following_count: i32,
    pub post_count: i32,
}

/// Lightweight user projection for embedding in feed responses.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    #[sqlx(default)]
    #[serde(default)]
    pub is_following: bool,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            is_following: false,
        }
    }
}

/// A (post id, unix-second timestamp) projection. This is the shape that
/// flows between the primary store and the feed cache: warming, backfill
/// and the fallback page all speak it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostScore {
    pub post_id: i64,
    pub timestamp: i64,
}

/// An entry read back from a user's cached feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedEntry {
    pub post_id: i64,
    pub score: i64,
}

/// An enriched post for feed display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPost {
    #[serde(flatten)]
    pub post: Post,
    pub author: UserSummary,
}

/// Paginated feed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedResponse {
    pub posts: Vec<FeedPost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Request body for creating a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePostRequest {
    pub caption: Option<String>,
    /// Pre-uploaded media URLs, 1..=10 items
    pub media_urls: Vec<String>,
}
