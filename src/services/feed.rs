//! Feed read service
//!
//! Serves `ReadFeed(viewer, cursor, limit)`. The cache is authoritative for
//! page selection when it can answer; anything it cannot serve (cold key
//! with a cursor, evicted entries, a cache outage) falls through to the
//! primary store with the same compound cursor. Both paths converge on one
//! hydration step so ordering and filtering behave identically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cache::FeedCache;
use crate::config::FeedConfig;
use crate::db::{FollowStore, PostStore, UserStore};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::models::{FeedPost, FeedResponse, PostScore, UserSummary};

/// Parse a `"<postId>:<unixSeconds>"` cursor into (post id, timestamp).
fn parse_cursor(cursor: &str) -> ServiceResult<(i64, i64)> {
    let (id_part, ts_part) = cursor.split_once(':').ok_or_else(|| {
        ServiceError::InvalidArgument(format!("invalid cursor format: {cursor:?}"))
    })?;

    let post_id = id_part.parse::<i64>().map_err(|_| {
        ServiceError::InvalidArgument(format!("invalid post id in cursor: {cursor:?}"))
    })?;
    let timestamp = ts_part.parse::<i64>().map_err(|_| {
        ServiceError::InvalidArgument(format!("invalid timestamp in cursor: {cursor:?}"))
    })?;

    Ok((post_id, timestamp))
}

/// Format the compound cursor for the next page.
fn format_cursor(post_id: i64, score: i64) -> String {
    format!("{post_id}:{score}")
}

pub struct FeedService {
    feed_cache: Arc<dyn FeedCache>,
    posts: Arc<dyn PostStore>,
    follows: Arc<dyn FollowStore>,
    users: Arc<dyn UserStore>,
    config: FeedConfig,
}

impl FeedService {
    pub fn new(
        feed_cache: Arc<dyn FeedCache>,
        posts: Arc<dyn PostStore>,
        follows: Arc<dyn FollowStore>,
        users: Arc<dyn UserStore>,
        config: FeedConfig,
    ) -> Self {
        Self {
            feed_cache,
            posts,
            follows,
            users,
            config,
        }
    }

    /// Read one page of the viewer's home feed.
    pub async fn get_feed(
        &self,
        viewer_id: i64,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> ServiceResult<FeedResponse> {
        let limit = self.clamp_limit(limit);
        let cursor = cursor.map(parse_cursor).transpose()?;

        let selection = self.select_page(viewer_id, cursor, limit).await?;
        if selection.is_empty() {
            return Ok(FeedResponse {
                posts: Vec::new(),
                next_cursor: None,
                has_more: false,
            });
        }

        let posts = self.hydrate(viewer_id, &selection).await?;

        // has_more == a full page; the final short page carries no cursor.
        // A page that was full before hydration filtering can come back
        // short here, which simply ends pagination one request early.
        let has_more = posts.len() == limit;
        let score_of: HashMap<i64, i64> = selection
            .iter()
            .map(|p| (p.post_id, p.timestamp))
            .collect();
        let next_cursor = if has_more {
            posts
                .last()
                .and_then(|fp| score_of.get(&fp.post.id).copied().map(|s| format_cursor(fp.post.id, s)))
        } else {
            None
        };

        debug!(
            viewer_id,
            returned = posts.len(),
            has_more,
            "feed page served"
        );

        Ok(FeedResponse {
            posts,
            next_cursor,
            has_more,
        })
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        match limit {
            None | Some(0) => self.config.default_limit,
            Some(n) => n.min(self.config.max_limit),
        }
    }

    /// Decide which (id, score) pairs make up the page.
    async fn select_page(
        &self,
        viewer_id: i64,
        cursor: Option<(i64, i64)>,
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>> {
        // Cache errors are equivalent to "absent": never fail a read
        // because the cache is down.
        let exists = match self.feed_cache.exists(viewer_id).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(viewer_id, error = %e, "cache existence probe failed");
                false
            }
        };

        if !exists && cursor.is_some() {
            // Cold key mid-pagination: the cursor is self-describing, so
            // serve straight from the primary store. No re-warming here.
            return self.fallback_page(viewer_id, cursor, limit).await;
        }

        if !exists {
            self.warm(viewer_id).await;
        }

        let cursor_score = cursor.map(|(_, ts)| ts as f64);
        match self.feed_cache.get_feed(viewer_id, cursor_score, limit).await {
            Ok(mut entries) => {
                if entries.is_empty() && cursor.is_some() {
                    // The cursor points past everything cached (evicted or
                    // trimmed entries): page from the primary store.
                    return self.fallback_page(viewer_id, cursor, limit).await;
                }

                // The backend breaks score ties by member ordering; the
                // contract is (score desc, id desc).
                entries.sort_by(|a, b| b.score.cmp(&a.score).then(b.post_id.cmp(&a.post_id)));

                Ok(entries
                    .into_iter()
                    .map(|e| PostScore {
                        post_id: e.post_id,
                        timestamp: e.score,
                    })
                    .collect())
            }
            Err(e) => {
                warn!(viewer_id, error = %e, "cache read failed, falling back to primary store");
                self.fallback_page(viewer_id, cursor, limit).await
            }
        }
    }

    /// Primary-store page: posts by the viewer or anyone they follow,
    /// strictly older than the cursor tuple.
    async fn fallback_page(
        &self,
        viewer_id: i64,
        cursor: Option<(i64, i64)>,
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>> {
        let mut authors = self.follows.followee_ids(viewer_id).await?;
        authors.push(viewer_id);

        let cursor_tuple = cursor
            .map(|(post_id, ts)| {
                let cursor_ts = DateTime::<Utc>::from_timestamp(ts, 0).ok_or_else(|| {
                    ServiceError::InvalidArgument(format!("cursor timestamp out of range: {ts}"))
                })?;
                Ok::<_, ServiceError>((cursor_ts, post_id))
            })
            .transpose()?;

        debug!(viewer_id, cursor = ?cursor, "serving feed page from primary store");
        self.posts.fallback_page(&authors, cursor_tuple, limit).await
    }

    /// Seed a cold cache with the most recent posts from the viewer's
    /// followees (and the viewer themselves). Best-effort: a failed warm
    /// degrades to the fallback path, it never fails the read.
    async fn warm(&self, viewer_id: i64) {
        match self.try_warm(viewer_id).await {
            Ok(0) => {
                debug!(viewer_id, "nothing to warm");
                metrics::record_cache_warm("empty");
            }
            Ok(seeded) => {
                debug!(viewer_id, seeded, "feed cache warmed");
                metrics::record_cache_warm("ok");
            }
            Err(e) => {
                warn!(viewer_id, error = %e, "feed cache warm failed");
                metrics::record_cache_warm("error");
            }
        }
    }

    async fn try_warm(&self, viewer_id: i64) -> ServiceResult<usize> {
        let mut sources = self.follows.followee_ids(viewer_id).await?;
        sources.push(viewer_id);

        let posts = self
            .posts
            .feed_post_scores(&sources, self.config.warm_limit)
            .await?;
        if posts.is_empty() {
            return Ok(0);
        }

        self.feed_cache.warm(viewer_id, &posts).await?;
        Ok(posts.len())
    }

    /// Expand the selected ids into display posts: one batched query each
    /// for posts+media, authors, follow status and like status. Selection
    /// order is preserved; posts that turn out deleted or author-less are
    /// dropped.
    async fn hydrate(&self, viewer_id: i64, selection: &[PostScore]) -> ServiceResult<Vec<FeedPost>> {
        let post_ids: Vec<i64> = selection.iter().map(|p| p.post_id).collect();
        let posts = self.posts.get_by_ids(&post_ids).await?;

        let author_ids: Vec<i64> = {
            let unique: HashSet<i64> = posts.iter().map(|p| p.user_id).collect();
            unique.into_iter().collect()
        };
        let authors: HashMap<i64, UserSummary> = self
            .users
            .get_by_ids(&author_ids)
            .await?
            .iter()
            .map(|u| (u.id, UserSummary::from(u)))
            .collect();

        // Status enrichment degrades gracefully: a failed batch check means
        // unmarked posts, not a failed page.
        let follow_status = match self.follows.check_follows(viewer_id, &author_ids).await {
            Ok(status) => status,
            Err(e) => {
                warn!(viewer_id, error = %e, "follow status check failed");
                HashMap::new()
            }
        };
        let like_status = match self.posts.check_likes(viewer_id, &post_ids).await {
            Ok(status) => status,
            Err(e) => {
                warn!(viewer_id, error = %e, "like status check failed");
                HashMap::new()
            }
        };

        let feed_posts = posts
            .into_iter()
            .filter_map(|mut post| {
                let mut author = authors.get(&post.user_id).cloned()?;
                author.is_following = follow_status.get(&author.id).copied().unwrap_or(false);
                post.is_liked = like_status.get(&post.id).copied().unwrap_or(false);
                Some(FeedPost { post, author })
            })
            .collect();

        Ok(feed_posts)
    }
}
