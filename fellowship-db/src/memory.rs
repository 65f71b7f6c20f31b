//! In-process backend with the same observable behaviour as the database:
//! cascading deletes, owner checks and a change stream. Failures and slow
//! writes can be injected to exercise the sync layer.

use crate::{Backend, ChangeStream, DbError, Result};
use async_trait::async_trait;
use fellowship_common::{
    model::{
        Id, LikeState, LocalId,
        change::{ChangeEvent, ChangeKind, WatchedTable},
        comment::{Comment, CommentMarker, NewComment},
        post::{Media, NewPost, Post, PostMarker},
        user::{Author, UserMarker},
    },
    tree::CommentForest,
};
use futures::{StreamExt, stream};
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use time::{Duration, UtcDateTime};
use tokio::sync::{Mutex, MutexGuard, broadcast, broadcast::error::RecvError};
use tracing::warn;
use uuid::Uuid;

const CHANGE_BUFFER: usize = 256;

#[derive(Clone, Debug)]
struct StoredPost {
    id: Id<PostMarker>,
    author: Id<UserMarker>,
    content: String,
    media: Option<Media>,
    created_at: UtcDateTime,
}

#[derive(Clone, Debug)]
struct StoredComment {
    id: Id<CommentMarker>,
    post_id: Id<PostMarker>,
    parent_id: Option<Id<CommentMarker>>,
    author: Id<UserMarker>,
    content: String,
    created_at: UtcDateTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    profiles: HashMap<Id<UserMarker>, Author>,
    posts: Vec<StoredPost>,
    comments: Vec<StoredComment>,
    post_likes: HashSet<(Id<PostMarker>, Id<UserMarker>)>,
    saved_posts: HashSet<(Id<PostMarker>, Id<UserMarker>)>,
    comment_likes: HashSet<(Id<CommentMarker>, Id<UserMarker>)>,
    ticks: i64,
}

impl MemoryState {
    fn author(&self, id: Id<UserMarker>) -> Result<Author> {
        self.profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("profile", id))
    }

    fn post(&self, id: Id<PostMarker>) -> Result<&StoredPost> {
        self.posts
            .iter()
            .find(|post| post.id == id)
            .ok_or_else(|| DbError::not_found("post", id))
    }

    fn comment(&self, id: Id<CommentMarker>) -> Result<&StoredComment> {
        self.comments
            .iter()
            .find(|comment| comment.id == id)
            .ok_or_else(|| DbError::not_found("comment", id))
    }

    fn next_timestamp(&mut self, epoch: UtcDateTime) -> UtcDateTime {
        self.ticks += 1;
        epoch + Duration::seconds(self.ticks)
    }

    fn view_comment(&self, stored: &StoredComment, viewer: Id<UserMarker>) -> Result<Comment> {
        let count = self
            .comment_likes
            .iter()
            .filter(|(comment, _)| *comment == stored.id)
            .count();

        Ok(Comment {
            id: LocalId::Persisted(stored.id),
            post_id: stored.post_id,
            parent_id: stored.parent_id.map(LocalId::Persisted),
            author: self.author(stored.author)?,
            content: stored.content.clone(),
            created_at: stored.created_at,
            likes: LikeState::new(
                u32::try_from(count).unwrap_or(u32::MAX),
                self.comment_likes.contains(&(stored.id, viewer)),
            ),
            replies: Vec::new(),
        })
    }

    fn view_post(&self, stored: &StoredPost, viewer: Id<UserMarker>) -> Result<Post> {
        let count = self
            .post_likes
            .iter()
            .filter(|(post, _)| *post == stored.id)
            .count();
        let rows = self
            .comments
            .iter()
            .filter(|comment| comment.post_id == stored.id)
            .map(|comment| self.view_comment(comment, viewer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Post {
            id: LocalId::Persisted(stored.id),
            author: self.author(stored.author)?,
            content: stored.content.clone(),
            media: stored.media.clone(),
            created_at: stored.created_at,
            likes: LikeState::new(
                u32::try_from(count).unwrap_or(u32::MAX),
                self.post_likes.contains(&(stored.id, viewer)),
            ),
            is_saved: self.saved_posts.contains(&(stored.id, viewer)),
            comments: CommentForest::from_flat(rows),
        })
    }

    fn view_posts(
        &self,
        viewer: Id<UserMarker>,
        filter: impl Fn(&StoredPost) -> bool,
    ) -> Result<Vec<Post>> {
        let mut posts = self
            .posts
            .iter()
            .filter(|post| filter(post))
            .map(|post| self.view_post(post, viewer))
            .collect::<Result<Vec<_>>>()?;
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts)
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    epoch: UtcDateTime,
    changes: broadcast::Sender<ChangeEvent>,
    gate: Mutex<()>,
    failing: AtomicBool,
    write_attempts: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        Self {
            state: Mutex::new(MemoryState::default()),
            epoch: UtcDateTime::now(),
            changes,
            gate: Mutex::new(()),
            failing: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
        }
    }

    pub async fn add_profile(&self, author: Author) {
        self.state.lock().await.profiles.insert(author.id, author);
    }

    /// Stores a post without announcing it on the change stream.
    pub async fn seed_post(&self, author: Id<UserMarker>, content: &str) -> Id<PostMarker> {
        let mut state = self.state.lock().await;
        let id = Id::new(Uuid::new_v4());
        let created_at = state.next_timestamp(self.epoch);
        state.posts.push(StoredPost {
            id,
            author,
            content: content.to_owned(),
            media: None,
            created_at,
        });
        id
    }

    /// Stores a comment without announcing it on the change stream.
    pub async fn seed_comment(
        &self,
        post_id: Id<PostMarker>,
        parent_id: Option<Id<CommentMarker>>,
        author: Id<UserMarker>,
        content: &str,
    ) -> Id<CommentMarker> {
        let mut state = self.state.lock().await;
        let id = Id::new(Uuid::new_v4());
        let created_at = state.next_timestamp(self.epoch);
        state.comments.push(StoredComment {
            id,
            post_id,
            parent_id,
            author,
            content: content.to_owned(),
            created_at,
        });
        id
    }

    pub async fn seed_post_like(&self, post: Id<PostMarker>, user: Id<UserMarker>) {
        self.state.lock().await.post_likes.insert((post, user));
    }

    /// Makes every following call fail with [`DbError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Blocks writes until the returned guard is dropped.
    pub async fn hold_writes(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Number of write calls that reached the backend, failed ones included.
    #[must_use]
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Number of open change streams.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Pushes an event to subscribers as if another client changed a row.
    pub fn announce(&self, event: ChangeEvent) {
        if self.changes.send(event).is_err() {
            warn!(?event, "No subscribers for change event");
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DbError::Unavailable)
        } else {
            Ok(())
        }
    }

    async fn begin_write(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        drop(self.gate.lock().await);
        self.check_available()?;
        Ok(self.state.lock().await)
    }

    fn emit(
        &self,
        kind: ChangeKind,
        table: WatchedTable,
        id: Uuid,
        post_id: Id<PostMarker>,
        author: Id<UserMarker>,
    ) {
        // Nobody listening is fine.
        let _ = self.changes.send(ChangeEvent {
            kind,
            table,
            id,
            post_id: Some(post_id),
            author: Some(author),
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_feed(&self, viewer: Id<UserMarker>) -> Result<Vec<Post>> {
        self.check_available()?;
        self.state.lock().await.view_posts(viewer, |_| true)
    }

    async fn fetch_saved(&self, viewer: Id<UserMarker>) -> Result<Vec<Post>> {
        self.check_available()?;
        let state = self.state.lock().await;
        state.view_posts(viewer, |post| state.saved_posts.contains(&(post.id, viewer)))
    }

    async fn fetch_user_posts(
        &self,
        author: Id<UserMarker>,
        viewer: Id<UserMarker>,
    ) -> Result<Vec<Post>> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .view_posts(viewer, |post| post.author == author)
    }

    async fn insert_comment(&self, comment: &NewComment) -> Result<Comment> {
        let mut state = self.begin_write().await?;
        state.author(comment.author)?;
        state.post(comment.post_id)?;
        if let Some(parent) = comment.parent_id {
            state.comment(parent)?;
        }

        let id = Id::new(Uuid::new_v4());
        let stored = StoredComment {
            id,
            post_id: comment.post_id,
            parent_id: comment.parent_id,
            author: comment.author,
            content: comment.content.clone(),
            created_at: state.next_timestamp(self.epoch),
        };
        let view = state.view_comment(&stored, comment.author)?;
        state.comments.push(stored);
        drop(state);

        self.emit(
            ChangeKind::Inserted,
            WatchedTable::Comments,
            id.uuid(),
            comment.post_id,
            comment.author,
        );
        Ok(view)
    }

    async fn delete_comment(&self, id: Id<CommentMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.comment(id)?;

        let mut doomed = vec![id];
        let mut index = 0;
        while index < doomed.len() {
            let current = doomed[index];
            doomed.extend(
                state
                    .comments
                    .iter()
                    .filter(|comment| comment.parent_id == Some(current))
                    .map(|comment| comment.id),
            );
            index += 1;
        }

        let removed: Vec<StoredComment> = state
            .comments
            .iter()
            .filter(|comment| doomed.contains(&comment.id))
            .cloned()
            .collect();
        state.comments.retain(|comment| !doomed.contains(&comment.id));
        state
            .comment_likes
            .retain(|(comment, _)| !doomed.contains(comment));
        drop(state);

        for comment in removed {
            self.emit(
                ChangeKind::Deleted,
                WatchedTable::Comments,
                comment.id.uuid(),
                comment.post_id,
                comment.author,
            );
        }
        Ok(())
    }

    async fn update_comment(&self, id: Id<CommentMarker>, content: &str) -> Result<()> {
        let mut state = self.begin_write().await?;
        let comment = state
            .comments
            .iter_mut()
            .find(|comment| comment.id == id)
            .ok_or_else(|| DbError::not_found("comment", id))?;
        content.clone_into(&mut comment.content);
        let (post_id, author) = (comment.post_id, comment.author);
        drop(state);

        self.emit(
            ChangeKind::Updated,
            WatchedTable::Comments,
            id.uuid(),
            post_id,
            author,
        );
        Ok(())
    }

    async fn like_comment(&self, comment: Id<CommentMarker>, user: Id<UserMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.comment(comment)?;
        state.comment_likes.insert((comment, user));
        Ok(())
    }

    async fn unlike_comment(
        &self,
        comment: Id<CommentMarker>,
        user: Id<UserMarker>,
    ) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.comment_likes.remove(&(comment, user));
        Ok(())
    }

    async fn insert_post(&self, post: &NewPost) -> Result<Post> {
        let mut state = self.begin_write().await?;
        state.author(post.author)?;

        let stored = StoredPost {
            id: Id::new(Uuid::new_v4()),
            author: post.author,
            content: post.content.clone(),
            media: post.media.clone(),
            created_at: state.next_timestamp(self.epoch),
        };
        let view = state.view_post(&stored, post.author)?;
        state.posts.push(stored.clone());
        drop(state);

        self.emit(
            ChangeKind::Inserted,
            WatchedTable::Posts,
            stored.id.uuid(),
            stored.id,
            stored.author,
        );
        Ok(view)
    }

    async fn delete_post(&self, id: Id<PostMarker>, owner: Id<UserMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        let post = state.post(id)?;
        if post.author != owner {
            return Err(DbError::not_found("post", id));
        }

        let doomed_comments: Vec<Id<CommentMarker>> = state
            .comments
            .iter()
            .filter(|comment| comment.post_id == id)
            .map(|comment| comment.id)
            .collect();
        state.posts.retain(|post| post.id != id);
        state.comments.retain(|comment| comment.post_id != id);
        state
            .comment_likes
            .retain(|(comment, _)| !doomed_comments.contains(comment));
        state.post_likes.retain(|(post, _)| *post != id);
        state.saved_posts.retain(|(post, _)| *post != id);
        drop(state);

        self.emit(ChangeKind::Deleted, WatchedTable::Posts, id.uuid(), id, owner);
        Ok(())
    }

    async fn like_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.post(post)?;
        state.post_likes.insert((post, user));
        Ok(())
    }

    async fn unlike_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.post_likes.remove(&(post, user));
        Ok(())
    }

    async fn save_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.post(post)?;
        state.saved_posts.insert((post, user));
        Ok(())
    }

    async fn unsave_post(&self, post: Id<PostMarker>, user: Id<UserMarker>) -> Result<()> {
        let mut state = self.begin_write().await?;
        state.saved_posts.remove(&(post, user));
        Ok(())
    }

    async fn subscribe(&self) -> Result<ChangeStream> {
        self.check_available()?;
        let receiver = self.changes.subscribe();

        let changes = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    Some((Err(DbError::ChangesLagged(skipped)), receiver))
                }
                Err(RecvError::Closed) => None,
            }
        });

        Ok(changes.boxed())
    }
}
