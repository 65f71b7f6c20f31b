//! Access to the hosted database that stores posts, comments and reactions.
//!
//! [`Backend`] is the narrow surface the sync layer depends on. [`client::DbClient`]
//! talks to Postgres. With the `memory` feature, `memory::MemoryBackend` keeps
//! everything in process for tests.

pub mod client;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
mod record;

use async_trait::async_trait;
use fellowship_common::model::{
    Id, ModelValidationError,
    change::ChangeEvent,
    comment::{Comment, CommentMarker, NewComment},
    post::{NewPost, Post, PostMarker},
    user::UserMarker,
};
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("An object in the database was invalid: {0}")]
    Data(#[from] ModelValidationError),
    #[error("A change notification could not be parsed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("No {entity} with id {id} was found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("The change stream skipped {0} events")]
    ChangesLagged(u64),
    #[error("The backend is unavailable")]
    Unavailable,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    pub(crate) fn not_found<Marker>(entity: &'static str, id: Id<Marker>) -> Self {
        DbError::NotFound {
            entity,
            id: id.uuid(),
        }
    }
}

/// Remote operations the sync layer performs.
///
/// Reads return posts as seen by `viewer`: like and save flags refer to that
/// user and comments arrive already nested.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_feed(&self, viewer: Id<UserMarker>) -> Result<Vec<Post>>;

    async fn fetch_saved(&self, viewer: Id<UserMarker>) -> Result<Vec<Post>>;

    async fn fetch_user_posts(
        &self,
        author: Id<UserMarker>,
        viewer: Id<UserMarker>,
    ) -> Result<Vec<Post>>;

    /// Stores a comment and returns it with the author expanded.
    async fn insert_comment(&self, comment: &NewComment) -> Result<Comment>;

    async fn delete_comment(&self, id: Id<CommentMarker>) -> Result<()>;

    async fn update_comment(&self, id: Id<CommentMarker>, content: &str) -> Result<()>;

    async fn like_comment(&self, comment: Id<CommentMarker>, user: Id<UserMarker>) -> Result<()>;

    async fn unlike_comment(&self, comment: Id<CommentMarker>, user: Id<UserMarker>)
    -> Result<()>;

    async fn insert_post(&self, post: &NewPost) -> Result<Post>;

    /// Deletes a post only if `owner` wrote it.
    async fn delete_post(&self, id: Id<PostMarker>, owner: Id<UserMarker>) -> Result<()>;

    async fn like_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()>;

    async fn unlike_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()>;

    async fn save_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()>;

    async fn unsave_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()>;

    /// Opens a stream of row changes on the posts and comments tables.
    async fn subscribe(&self) -> Result<ChangeStream>;
}
