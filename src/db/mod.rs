//! Primary-store adapters
//!
//! Typed query groups over Postgres. Each group is a trait with one
//! production implementation so the read service and workers can run
//! against in-memory doubles.

mod follow_repo;
mod post_repo;
mod user_repo;

pub use follow_repo::{FollowStore, PgFollowStore};
pub use post_repo::{PgPostStore, PostStore};
pub use user_repo::{PgUserStore, UserStore};
