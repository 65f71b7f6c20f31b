use crate::{
    Backend, ChangeStream, DbError, Result,
    record::{CommentRecord, PostRecord, decode_change},
};
use async_trait::async_trait;
use fellowship_common::{
    model::{
        Id,
        comment::{Comment, CommentMarker, NewComment},
        post::{NewPost, Post, PostMarker},
        user::UserMarker,
    },
    tree::CommentForest,
};
use futures::StreamExt;
use sqlx::{PgPool, postgres::PgListener, query, query_as};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_CHANGE_CHANNEL: &str = "fellowship_changes";

const POST_SELECT: &str = "
    SELECT
        posts.id AS post_id,
        posts.content,
        posts.media_url,
        posts.media_type,
        posts.created_at,
        profiles.id AS author_id,
        profiles.full_name AS author_name,
        profiles.avatar_url AS author_avatar_url,
        (SELECT count(*) FROM likes WHERE likes.post_id = posts.id) AS like_count,
        EXISTS (
            SELECT 1 FROM likes
            WHERE likes.post_id = posts.id AND likes.user_id = $1
        ) AS liked,
        EXISTS (
            SELECT 1 FROM saved_posts
            WHERE saved_posts.post_id = posts.id AND saved_posts.user_id = $1
        ) AS saved
    FROM
        posts JOIN profiles ON profiles.id = posts.user_id
    ";

pub struct DbClient {
    pool: PgPool,
    change_channel: String,
}

impl DbClient {
    #[must_use]
    pub fn new(pool: PgPool, change_channel: String) -> Self {
        Self {
            pool,
            change_channel,
        }
    }

    async fn fetch_posts(&self, filter: PostFilter, viewer: Uuid) -> Result<Vec<Post>> {
        let sql = match filter {
            PostFilter::All => format!("{POST_SELECT} ORDER BY posts.created_at DESC"),
            PostFilter::SavedByViewer => format!(
                "{POST_SELECT}
                WHERE EXISTS (
                    SELECT 1 FROM saved_posts
                    WHERE saved_posts.post_id = posts.id AND saved_posts.user_id = $1
                )
                ORDER BY posts.created_at DESC"
            ),
            PostFilter::AuthoredBy(_) => format!(
                "{POST_SELECT} WHERE posts.user_id = $2 ORDER BY posts.created_at DESC"
            ),
        };

        let mut records = query_as::<_, PostRecord>(&sql).bind(viewer);
        if let PostFilter::AuthoredBy(author) = filter {
            records = records.bind(author);
        }
        let records = records.fetch_all(&self.pool).await?;

        let mut posts = records
            .into_iter()
            .map(Post::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut threads = self.fetch_threads(&persisted_ids(&posts), viewer).await?;
        for post in &mut posts {
            let rows = post
                .id
                .persisted()
                .and_then(|id| threads.remove(&id.uuid()));
            if let Some(rows) = rows {
                post.comments = CommentForest::from_flat(rows);
            }
        }

        debug!(?filter, posts = posts.len(), "Fetched posts");
        Ok(posts)
    }

    async fn fetch_threads(
        &self,
        post_ids: &[Uuid],
        viewer: Uuid,
    ) -> Result<HashMap<Uuid, Vec<Comment>>> {
        let records = query_as::<_, CommentRecord>(
            "
            SELECT
                comments.id AS comment_id,
                comments.post_id,
                comments.parent_id,
                comments.content,
                comments.created_at,
                profiles.id AS author_id,
                profiles.full_name AS author_name,
                profiles.avatar_url AS author_avatar_url,
                (
                    SELECT count(*) FROM comment_likes
                    WHERE comment_likes.comment_id = comments.id
                ) AS like_count,
                EXISTS (
                    SELECT 1 FROM comment_likes
                    WHERE comment_likes.comment_id = comments.id AND comment_likes.user_id = $2
                ) AS liked
            FROM
                comments JOIN profiles ON profiles.id = comments.user_id
            WHERE
                comments.post_id = ANY($1)
            ",
        )
        .bind(post_ids)
        .bind(viewer)
        .fetch_all(&self.pool)
        .await?;

        let mut threads: HashMap<Uuid, Vec<Comment>> = HashMap::new();
        for record in records {
            let post_id = record.post_id;
            threads
                .entry(post_id)
                .or_default()
                .push(Comment::try_from(record)?);
        }

        Ok(threads)
    }

    async fn execute_pair(&self, sql: &str, first: Uuid, second: Uuid) -> Result<()> {
        query(sql).bind(first).bind(second).execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
enum PostFilter {
    All,
    SavedByViewer,
    AuthoredBy(Uuid),
}

fn persisted_ids(posts: &[Post]) -> Vec<Uuid> {
    posts
        .iter()
        .filter_map(|post| post.id.persisted())
        .map(Id::uuid)
        .collect()
}

#[async_trait]
impl Backend for DbClient {
    async fn fetch_feed(&self, viewer: Id<UserMarker>) -> Result<Vec<Post>> {
        self.fetch_posts(PostFilter::All, viewer.uuid()).await
    }

    async fn fetch_saved(&self, viewer: Id<UserMarker>) -> Result<Vec<Post>> {
        self.fetch_posts(PostFilter::SavedByViewer, viewer.uuid())
            .await
    }

    async fn fetch_user_posts(
        &self,
        author: Id<UserMarker>,
        viewer: Id<UserMarker>,
    ) -> Result<Vec<Post>> {
        self.fetch_posts(PostFilter::AuthoredBy(author.uuid()), viewer.uuid())
            .await
    }

    async fn insert_comment(&self, comment: &NewComment) -> Result<Comment> {
        let record = query_as::<_, CommentRecord>(
            "
            WITH inserted AS (
                INSERT INTO comments (user_id, post_id, parent_id, content)
                VALUES ($1, $2, $3, $4)
                RETURNING *
            )
            SELECT
                inserted.id AS comment_id,
                inserted.post_id,
                inserted.parent_id,
                inserted.content,
                inserted.created_at,
                profiles.id AS author_id,
                profiles.full_name AS author_name,
                profiles.avatar_url AS author_avatar_url,
                0::bigint AS like_count,
                false AS liked
            FROM
                inserted JOIN profiles ON profiles.id = inserted.user_id
            ",
        )
        .bind(comment.author.uuid())
        .bind(comment.post_id.uuid())
        .bind(comment.parent_id.map(Id::uuid))
        .bind(&comment.content)
        .fetch_one(&self.pool)
        .await?;

        Ok(Comment::try_from(record)?)
    }

    async fn delete_comment(&self, id: Id<CommentMarker>) -> Result<()> {
        let result = query("DELETE FROM comments WHERE id = $1")
            .bind(id.uuid())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("comment", id));
        }
        Ok(())
    }

    async fn update_comment(&self, id: Id<CommentMarker>, content: &str) -> Result<()> {
        let result = query("UPDATE comments SET content = $2 WHERE id = $1")
            .bind(id.uuid())
            .bind(content)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("comment", id));
        }
        Ok(())
    }

    async fn like_comment(&self, comment: Id<CommentMarker>, user: Id<UserMarker>) -> Result<()> {
        self.execute_pair(
            "
            INSERT INTO comment_likes (comment_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            ",
            comment.uuid(),
            user.uuid(),
        )
        .await
    }

    async fn unlike_comment(
        &self,
        comment: Id<CommentMarker>,
        user: Id<UserMarker>,
    ) -> Result<()> {
        self.execute_pair(
            "DELETE FROM comment_likes WHERE comment_id = $1 AND user_id = $2",
            comment.uuid(),
            user.uuid(),
        )
        .await
    }

    async fn insert_post(&self, post: &NewPost) -> Result<Post> {
        let record = query_as::<_, PostRecord>(
            "
            WITH inserted AS (
                INSERT INTO posts (user_id, content, media_url, media_type)
                VALUES ($1, $2, $3, $4)
                RETURNING *
            )
            SELECT
                inserted.id AS post_id,
                inserted.content,
                inserted.media_url,
                inserted.media_type,
                inserted.created_at,
                profiles.id AS author_id,
                profiles.full_name AS author_name,
                profiles.avatar_url AS author_avatar_url,
                0::bigint AS like_count,
                false AS liked,
                false AS saved
            FROM
                inserted JOIN profiles ON profiles.id = inserted.user_id
            ",
        )
        .bind(post.author.uuid())
        .bind(&post.content)
        .bind(post.media.as_ref().map(|media| media.url.as_str()))
        .bind(post.media.as_ref().map(|media| media.kind.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(Post::try_from(record)?)
    }

    async fn delete_post(&self, id: Id<PostMarker>, owner: Id<UserMarker>) -> Result<()> {
        let result = query("DELETE FROM posts WHERE id = $1 AND user_id = $2")
            .bind(id.uuid())
            .bind(owner.uuid())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("post", id));
        }
        Ok(())
    }

    async fn like_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        self.execute_pair(
            "
            INSERT INTO likes (post_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            ",
            post.uuid(),
            user.uuid(),
        )
        .await
    }

    async fn unlike_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        self.execute_pair(
            "DELETE FROM likes WHERE post_id = $1 AND user_id = $2",
            post.uuid(),
            user.uuid(),
        )
        .await
    }

    async fn save_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        self.execute_pair(
            "
            INSERT INTO saved_posts (post_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            ",
            post.uuid(),
            user.uuid(),
        )
        .await
    }

    async fn unsave_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        self.execute_pair(
            "DELETE FROM saved_posts WHERE post_id = $1 AND user_id = $2",
            post.uuid(),
            user.uuid(),
        )
        .await
    }

    async fn subscribe(&self) -> Result<ChangeStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.change_channel).await?;
        debug!(channel = %self.change_channel, "Listening for row changes");

        let changes = listener
            .into_stream()
            .map(|notification| decode_change(notification?.payload()));

        Ok(changes.boxed())
    }
}
