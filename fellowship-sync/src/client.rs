use crate::{
    cache::{QueryCache, QueryState},
    mutation::{
        MutationHandle,
        comments::{AddComment, DeleteComment, EditComment, ToggleCommentLike},
        posts::{CreatePost, DeletePost, TogglePostLike, TogglePostSave},
    },
    realtime::{self, RealtimeError, Scope, Subscription},
    session::Session,
};
use fellowship_common::model::{
    Id, change::ChangeEvent, post::Post, post::PostMarker, user::UserMarker,
};
use fellowship_db::Backend;
use std::sync::Arc;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NOTICE_BUFFER: usize = 64;

/// Collections of posts the client caches, each as seen by `viewer`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum QueryKey {
    Feed {
        viewer: Id<UserMarker>,
    },
    Saved {
        viewer: Id<UserMarker>,
    },
    Authored {
        author: Id<UserMarker>,
        viewer: Id<UserMarker>,
    },
}

impl QueryKey {
    #[must_use]
    pub fn viewer(self) -> Id<UserMarker> {
        match self {
            QueryKey::Feed { viewer }
            | QueryKey::Saved { viewer }
            | QueryKey::Authored { viewer, .. } => viewer,
        }
    }
}

pub type FeedCache = QueryCache<QueryKey, Vec<Post>>;

/// Live view of one cached collection. Dropping it stops background reloads
/// of the collection.
#[derive(Debug)]
pub struct PostsQuery {
    key: QueryKey,
    state: watch::Receiver<QueryState<Vec<Post>>>,
}

impl PostsQuery {
    #[must_use]
    pub fn key(&self) -> QueryKey {
        self.key
    }

    #[must_use]
    pub fn state(&self) -> QueryState<Vec<Post>> {
        self.state.borrow().clone()
    }

    /// Waits for the next write to the collection. Returns `false` once the
    /// cache is gone.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }
}

#[derive(Clone)]
pub struct SyncClient {
    backend: Arc<dyn Backend>,
    cache: Arc<FeedCache>,
    session: Session,
    notices: broadcast::Sender<ChangeEvent>,
}

impl SyncClient {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, session: Session) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            backend,
            cache: Arc::new(FeedCache::new()),
            session,
            notices,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The community feed as seen by `viewer`, loaded if not cached yet.
    pub async fn posts(&self, viewer: Id<UserMarker>) -> PostsQuery {
        self.query(QueryKey::Feed { viewer }).await
    }

    pub async fn saved_posts(&self, viewer: Id<UserMarker>) -> PostsQuery {
        self.query(QueryKey::Saved { viewer }).await
    }

    pub async fn user_posts(&self, author: Id<UserMarker>, viewer: Id<UserMarker>) -> PostsQuery {
        self.query(QueryKey::Authored { author, viewer }).await
    }

    async fn query(&self, key: QueryKey) -> PostsQuery {
        let query = PostsQuery {
            key,
            state: self.cache.watch(key),
        };

        let state = query.state();
        if state.data.is_none() || state.is_stale {
            self.refetch(key).await;
        }
        query
    }

    /// Loads `key` from the backend. Returns whether the result was written.
    pub async fn refetch(&self, key: QueryKey) -> bool {
        let ticket = self.cache.begin_fetch(key);
        let result = match key {
            QueryKey::Feed { viewer } => self.backend.fetch_feed(viewer).await,
            QueryKey::Saved { viewer } => self.backend.fetch_saved(viewer).await,
            QueryKey::Authored { author, viewer } => {
                self.backend.fetch_user_posts(author, viewer).await
            }
        };

        if let Err(error) = &result {
            warn!(?key, %error, "Fetching posts failed");
        }
        self.cache.finish_fetch(ticket, result)
    }

    /// Reloads observed collections whenever they are invalidated.
    pub fn spawn_refetcher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        let mut invalidations = self.cache.invalidations();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = invalidations.recv() => match received {
                        Ok(key) => {
                            if client.cache.is_observed(&key) {
                                client.refetch(key).await;
                            } else {
                                debug!(?key, "Skipping refetch of unobserved query");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Missed invalidations, reloading every observed query");
                            for key in client.cache.observed_keys() {
                                client.refetch(key).await;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Refetcher stopped");
        })
    }

    /// Row changes made by other users, for display as notices.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notices.subscribe()
    }

    /// Keeps every cached collection in sync with remote changes.
    pub async fn realtime_feed(&self) -> Result<Subscription, RealtimeError> {
        self.realtime(Scope::Feed).await
    }

    /// Keeps an open comment thread in sync with remote changes.
    pub async fn realtime_comments(
        &self,
        post: Id<PostMarker>,
    ) -> Result<Subscription, RealtimeError> {
        self.realtime(Scope::Thread(post)).await
    }

    async fn realtime(&self, scope: Scope) -> Result<Subscription, RealtimeError> {
        let actor = self.session.actor().ok_or(RealtimeError::MissingActor)?;
        realtime::subscribe(
            self.backend.as_ref(),
            Arc::clone(&self.cache),
            actor.id,
            scope,
            self.notices.clone(),
        )
        .await
    }

    #[must_use]
    pub fn add_comment(&self) -> MutationHandle<AddComment> {
        MutationHandle::new(self.clone(), AddComment)
    }

    #[must_use]
    pub fn delete_comment(&self) -> MutationHandle<DeleteComment> {
        MutationHandle::new(self.clone(), DeleteComment)
    }

    #[must_use]
    pub fn edit_comment(&self) -> MutationHandle<EditComment> {
        MutationHandle::new(self.clone(), EditComment)
    }

    #[must_use]
    pub fn toggle_comment_like(&self) -> MutationHandle<ToggleCommentLike> {
        MutationHandle::new(self.clone(), ToggleCommentLike)
    }

    #[must_use]
    pub fn create_post(&self) -> MutationHandle<CreatePost> {
        MutationHandle::new(self.clone(), CreatePost)
    }

    #[must_use]
    pub fn delete_post(&self) -> MutationHandle<DeletePost> {
        MutationHandle::new(self.clone(), DeletePost)
    }

    #[must_use]
    pub fn toggle_like(&self) -> MutationHandle<TogglePostLike> {
        MutationHandle::new(self.clone(), TogglePostLike)
    }

    #[must_use]
    pub fn toggle_save(&self) -> MutationHandle<TogglePostSave> {
        MutationHandle::new(self.clone(), TogglePostSave)
    }
}
