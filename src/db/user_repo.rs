//! User lookups

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{ServiceError, ServiceResult};
use crate::models::User;

/// Typed user queries needed by the feed pipeline. The core only reads
/// users; their lifecycle belongs to other services.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// One user. NotFound on miss.
    async fn get_by_id(&self, user_id: i64) -> ServiceResult<User>;

    /// Batched lookup for hydration; missing ids are simply absent from
    /// the result.
    async fn get_by_ids(&self, user_ids: &[i64]) -> ServiceResult<Vec<User>>;
}

/// UserStore over Postgres.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_by_id(&self, user_id: i64) -> ServiceResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, display_name, avatar_url,
                   follower_count, following_count, post_count
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        user.ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))
    }

    async fn get_by_ids(&self, user_ids: &[i64]) -> ServiceResult<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, display_name, avatar_url,
                   follower_count, following_count, post_count
            FROM users
            WHERE id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}
