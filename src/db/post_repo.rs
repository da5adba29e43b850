//! Post queries and write transactions

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Post, PostMedia, PostScore};

/// Postgres unique-constraint violation
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Typed post queries needed by the feed pipeline.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Insert a post, its media rows (positions 0..n-1) and bump the
    /// author's post count, in one transaction.
    async fn create(
        &self,
        author_id: i64,
        caption: Option<&str>,
        media_urls: &[String],
    ) -> ServiceResult<Post>;

    /// Soft-delete a post and decrement the author's post count, in one
    /// transaction. NotFound when the post is missing or already deleted;
    /// Forbidden when the caller is not the author.
    async fn soft_delete(&self, post_id: i64, caller_id: i64) -> ServiceResult<()>;

    /// One post with media, excluding soft-deleted. NotFound on miss.
    async fn get_by_id(&self, post_id: i64) -> ServiceResult<Post>;

    /// Posts by id with media, soft-deleted filtered out, returned in the
    /// input order (the feed order has already been decided upstream).
    async fn get_by_ids(&self, post_ids: &[i64]) -> ServiceResult<Vec<Post>>;

    /// Most recent non-deleted posts by one user as (id, timestamp) pairs.
    async fn recent_post_scores(&self, user_id: i64, limit: usize) -> ServiceResult<Vec<PostScore>>;

    /// Most recent non-deleted posts across a set of authors, used for
    /// cold-cache warming.
    async fn feed_post_scores(
        &self,
        author_ids: &[i64],
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>>;

    /// Cursor-paginated page over a set of authors, ordered by
    /// (created_at DESC, id DESC) with a strict tuple bound. This is the
    /// read service's fallback when the cache can't serve a page.
    async fn fallback_page(
        &self,
        author_ids: &[i64],
        cursor: Option<(DateTime<Utc>, i64)>,
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>>;

    /// Which of these posts the viewer has liked.
    async fn check_likes(
        &self,
        viewer_id: i64,
        post_ids: &[i64],
    ) -> ServiceResult<HashMap<i64, bool>>;

    /// Insert a like and bump the counter, in one transaction.
    /// Conflict when already liked, NotFound when the post is gone.
    async fn like(&self, post_id: i64, user_id: i64) -> ServiceResult<()>;

    /// Delete a like and decrement the counter, in one transaction.
    /// NotFound when there was no like.
    async fn unlike(&self, post_id: i64, user_id: i64) -> ServiceResult<()>;
}

/// PostStore over Postgres.
#[derive(Clone)]
pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Media rows for a set of posts, grouped by post id.
    async fn media_for(&self, post_ids: &[i64]) -> ServiceResult<HashMap<i64, Vec<PostMedia>>> {
        if post_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, PostMedia>(
            r#"
            SELECT id, post_id, media_url, media_type, position
            FROM post_media
            WHERE post_id = ANY($1)
            ORDER BY post_id, position
            "#,
        )
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<i64, Vec<PostMedia>> = HashMap::new();
        for media in rows {
            grouped.entry(media.post_id).or_default().push(media);
        }
        Ok(grouped)
    }
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn create(
        &self,
        author_id: i64,
        caption: Option<&str>,
        media_urls: &[String],
    ) -> ServiceResult<Post> {
        let mut tx = self.pool.begin().await?;

        let mut post = sqlx::query_as::<_, Post>(
            r#"
            INSERT INTO posts (user_id, caption)
            VALUES ($1, $2)
            RETURNING id, user_id, caption, like_count, comment_count,
                      created_at, updated_at, deleted_at
            "#,
        )
        .bind(author_id)
        .bind(caption)
        .fetch_one(&mut *tx)
        .await?;

        let mut media = Vec::with_capacity(media_urls.len());
        for (position, url) in media_urls.iter().enumerate() {
            let row = sqlx::query_as::<_, PostMedia>(
                r#"
                INSERT INTO post_media (post_id, media_url, media_type, position)
                VALUES ($1, $2, $3, $4)
                RETURNING id, post_id, media_url, media_type, position
                "#,
            )
            .bind(post.id)
            .bind(url)
            .bind("image")
            .bind(position as i32)
            .fetch_one(&mut *tx)
            .await?;
            media.push(row);
        }
        post.media = media;

        sqlx::query("UPDATE users SET post_count = post_count + 1 WHERE id = $1")
            .bind(author_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(post)
    }

    async fn soft_delete(&self, post_id: i64, caller_id: i64) -> ServiceResult<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            UPDATE posts SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(post_id)
        .bind(caller_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted == 0 {
            // Distinguish wrong owner from missing/already-deleted
            let owned_by_other: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1 AND deleted_at IS NULL)",
            )
            .bind(post_id)
            .fetch_one(&mut *tx)
            .await?;

            return if owned_by_other {
                Err(ServiceError::Forbidden(format!(
                    "post {post_id} is not owned by user {caller_id}"
                )))
            } else {
                Err(ServiceError::NotFound(format!("post {post_id}")))
            };
        }

        sqlx::query("UPDATE users SET post_count = post_count - 1 WHERE id = $1")
            .bind(caller_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, post_id: i64) -> ServiceResult<Post> {
        let post = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, user_id, caption, like_count, comment_count,
                   created_at, updated_at, deleted_at
            FROM posts
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut post = post.ok_or_else(|| ServiceError::NotFound(format!("post {post_id}")))?;
        let mut media = self.media_for(&[post_id]).await?;
        post.media = media.remove(&post_id).unwrap_or_default();
        Ok(post)
    }

    async fn get_by_ids(&self, post_ids: &[i64]) -> ServiceResult<Vec<Post>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }

        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, user_id, caption, like_count, comment_count,
                   created_at, updated_at, deleted_at
            FROM posts
            WHERE id = ANY($1) AND deleted_at IS NULL
            "#,
        )
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut media = self.media_for(post_ids).await?;
        let mut by_id: HashMap<i64, Post> = posts.into_iter().map(|p| (p.id, p)).collect();

        // Re-order to the input order; ids that vanished are simply skipped
        let mut ordered = Vec::with_capacity(post_ids.len());
        for id in post_ids {
            if let Some(mut post) = by_id.remove(id) {
                post.media = media.remove(id).unwrap_or_default();
                ordered.push(post);
            }
        }
        Ok(ordered)
    }

    async fn recent_post_scores(&self, user_id: i64, limit: usize) -> ServiceResult<Vec<PostScore>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT id, EXTRACT(EPOCH FROM created_at)::bigint
            FROM posts
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(post_id, timestamp)| PostScore { post_id, timestamp })
            .collect())
    }

    async fn feed_post_scores(
        &self,
        author_ids: &[i64],
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>> {
        if author_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT id, EXTRACT(EPOCH FROM created_at)::bigint
            FROM posts
            WHERE user_id = ANY($1) AND deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(author_ids)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(post_id, timestamp)| PostScore { post_id, timestamp })
            .collect())
    }

    async fn fallback_page(
        &self,
        author_ids: &[i64],
        cursor: Option<(DateTime<Utc>, i64)>,
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>> {
        if author_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = match cursor {
            None => {
                sqlx::query_as::<_, (i64, i64)>(
                    r#"
                    SELECT id, EXTRACT(EPOCH FROM created_at)::bigint
                    FROM posts
                    WHERE user_id = ANY($1) AND deleted_at IS NULL
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(author_ids)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            Some((cursor_ts, cursor_id)) => {
                sqlx::query_as::<_, (i64, i64)>(
                    r#"
                    SELECT id, EXTRACT(EPOCH FROM created_at)::bigint
                    FROM posts
                    WHERE user_id = ANY($1) AND deleted_at IS NULL
                      AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(author_ids)
                .bind(cursor_ts)
                .bind(cursor_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(post_id, timestamp)| PostScore { post_id, timestamp })
            .collect())
    }

    async fn check_likes(
        &self,
        viewer_id: i64,
        post_ids: &[i64],
    ) -> ServiceResult<HashMap<i64, bool>> {
        let mut result: HashMap<i64, bool> = post_ids.iter().map(|id| (*id, false)).collect();
        if post_ids.is_empty() {
            return Ok(result);
        }

        let liked: Vec<(i64,)> = sqlx::query_as(
            "SELECT post_id FROM post_likes WHERE user_id = $1 AND post_id = ANY($2)",
        )
        .bind(viewer_id)
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in liked {
            result.insert(id, true);
        }
        Ok(result)
    }

    async fn like(&self, post_id: i64, user_id: i64) -> ServiceResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query("INSERT INTO post_likes (post_id, user_id) VALUES ($1, $2)")
            .bind(post_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await;

        if let Err(e) = inserted {
            if let sqlx::Error::Database(ref db) = e {
                if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
                    return Err(ServiceError::Conflict(format!(
                        "user {user_id} already liked post {post_id}"
                    )));
                }
            }
            return Err(e.into());
        }

        let updated = sqlx::query(
            r#"
            UPDATE posts SET like_count = like_count + 1, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(post_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ServiceError::NotFound(format!("post {post_id}")));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unlike(&self, post_id: i64, user_id: i64) -> ServiceResult<()> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM post_likes WHERE post_id = $1 AND user_id = $2")
            .bind(post_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed == 0 {
            return Err(ServiceError::NotFound(format!(
                "like by user {user_id} on post {post_id}"
            )));
        }

        sqlx::query(
            r#"
            UPDATE posts SET like_count = like_count - 1, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(post_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
