//! Follow-edge queries and write transactions

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{ServiceError, ServiceResult};

/// Typed follow-graph queries needed by the feed pipeline. The graph is
/// only ever traversed one hop (author → followers, viewer → followees).
#[async_trait]
pub trait FollowStore: Send + Sync {
    /// Insert the edge and bump both counters, in one transaction.
    /// Returns false without touching counters when the edge already
    /// existed.
    async fn create(&self, follower_id: i64, followee_id: i64) -> ServiceResult<bool>;

    /// Delete the edge and decrement both counters, in one transaction.
    /// NotFound when there was no edge.
    async fn delete(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()>;

    /// Everyone following `user_id` (the fan-out recipient set).
    async fn follower_ids(&self, user_id: i64) -> ServiceResult<Vec<i64>>;

    /// Everyone `user_id` follows (the warm source set).
    async fn followee_ids(&self, user_id: i64) -> ServiceResult<Vec<i64>>;

    /// Which of these users the viewer follows.
    async fn check_follows(
        &self,
        viewer_id: i64,
        followee_ids: &[i64],
    ) -> ServiceResult<HashMap<i64, bool>>;
}

/// FollowStore over Postgres.
#[derive(Clone)]
pub struct PgFollowStore {
    pool: PgPool,
}

impl PgFollowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowStore for PgFollowStore {
    async fn create(&self, follower_id: i64, followee_id: i64) -> ServiceResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO follows (follower_id, followee_id)
            VALUES ($1, $2)
            ON CONFLICT (follower_id, followee_id) DO NOTHING
            "#,
        )
        .bind(follower_id)
        .bind(followee_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Existing edge: nothing to count, nothing to publish
            return Ok(false);
        }

        sqlx::query("UPDATE users SET follower_count = follower_count + 1 WHERE id = $1")
            .bind(followee_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE users SET following_count = following_count + 1 WHERE id = $1")
            .bind(follower_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM follows WHERE follower_id = $1 AND followee_id = $2",
        )
        .bind(follower_id)
        .bind(followee_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed == 0 {
            return Err(ServiceError::NotFound(format!(
                "follow edge {follower_id} -> {followee_id}"
            )));
        }

        sqlx::query("UPDATE users SET follower_count = follower_count - 1 WHERE id = $1")
            .bind(followee_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE users SET following_count = following_count - 1 WHERE id = $1")
            .bind(follower_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn follower_ids(&self, user_id: i64) -> ServiceResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT follower_id FROM follows WHERE followee_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn followee_ids(&self, user_id: i64) -> ServiceResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT followee_id FROM follows WHERE follower_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn check_follows(
        &self,
        viewer_id: i64,
        followee_ids: &[i64],
    ) -> ServiceResult<HashMap<i64, bool>> {
        let mut result: HashMap<i64, bool> = followee_ids.iter().map(|id| (*id, false)).collect();
        if followee_ids.is_empty() {
            return Ok(result);
        }

        let followed: Vec<(i64,)> = sqlx::query_as(
            "SELECT followee_id FROM follows WHERE follower_id = $1 AND followee_id = ANY($2)",
        )
        .bind(viewer_id)
        .bind(followee_ids)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in followed {
            result.insert(id, true);
        }
        Ok(result)
    }
}
