//! Optimistic writes.
//!
//! Every mutation follows the same protocol: the feed entry of the signed-in
//! user is snapshotted and rewritten before the remote call starts, restored
//! when the call fails or the caller drops the mutation early, and
//! invalidated once the call settles either way so the next fetch brings the
//! canonical rows.

pub mod comments;
pub mod posts;

use crate::{
    cache::Snapshot,
    client::{FeedCache, QueryKey, SyncClient},
};
use async_trait::async_trait;
use fellowship_common::model::{
    Id, LocalId, ModelValidationError,
    post::{Post, PostId},
    user::{Actor, UserMarker},
};
use fellowship_db::{Backend, DbError};
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("No user is signed in")]
    MissingActor,
    #[error("The input was invalid: {0}")]
    Invalid(#[from] ModelValidationError),
    #[error("The {entity} {id} has not been saved yet")]
    NotYetSaved { entity: &'static str, id: String },
    #[error("The remote write failed: {0}")]
    Remote(#[from] DbError),
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed(String),
}

/// Outcome of rewriting the cached posts before the remote call.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Applied {
    Changed,
    Untouched,
    /// The cached posts could not reflect the change and must be reloaded.
    NeedsRefetch,
}

#[async_trait]
pub trait Mutation: Send + Sync + 'static {
    type Input: Debug + Send + Sync;
    type Output: Send;

    const NAME: &'static str;

    /// Rejects input that must never reach the cache or the backend.
    fn validate(&self, input: Self::Input) -> Result<Self::Input, MutationError> {
        Ok(input)
    }

    /// Rewrites the cached posts as if the write had already succeeded.
    fn apply(&self, actor: &Actor, input: &Self::Input, posts: &mut Vec<Post>) -> Applied;

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: Self::Input,
    ) -> Result<Self::Output, MutationError>;
}

/// Settles the mutation on the entry, also when the caller drops the future
/// before the remote call finished. An abandoned mutation rolls back to its
/// snapshot.
struct InFlight<'a> {
    cache: &'a FeedCache,
    key: QueryKey,
    viewer: Id<UserMarker>,
    status: &'a watch::Sender<MutationStatus>,
    snapshot: Option<Snapshot<QueryKey, Vec<Post>>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!(key = ?self.key, "Mutation dropped before it settled, rolling back");
            self.cache.restore(snapshot);
            self.status.send_replace(MutationStatus::Idle);
        }

        self.cache.end_mutation(&self.key);
        let viewer = self.viewer;
        self.cache
            .invalidate_matching(|candidate| candidate.viewer() == viewer);
    }
}

pub struct MutationHandle<M: Mutation> {
    client: SyncClient,
    mutation: M,
    status: watch::Sender<MutationStatus>,
}

impl<M: Mutation> MutationHandle<M> {
    pub(crate) fn new(client: SyncClient, mutation: M) -> Self {
        let (status, _) = watch::channel(MutationStatus::Idle);
        Self {
            client,
            mutation,
            status,
        }
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<MutationStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        *self.status.borrow() == MutationStatus::Pending
    }

    /// Runs the mutation. The cache already shows its effect when the first
    /// await inside this call suspends.
    pub async fn mutate(&self, input: M::Input) -> Result<M::Output, MutationError> {
        let result = self.run(input).await;
        self.status.send_replace(match &result {
            Ok(_) => MutationStatus::Succeeded,
            Err(error) => MutationStatus::Failed(error.to_string()),
        });
        result
    }

    async fn run(&self, input: M::Input) -> Result<M::Output, MutationError> {
        let actor = self
            .client
            .session()
            .actor()
            .ok_or(MutationError::MissingActor)?;
        let input = self.mutation.validate(input)?;
        self.status.send_replace(MutationStatus::Pending);

        let cache = self.client.cache();
        let key = QueryKey::Feed { viewer: actor.id };
        let snapshot = cache.begin_mutation(&key);
        let optimistic = snapshot.data().cloned();
        let mut in_flight = InFlight {
            cache,
            key,
            viewer: actor.id,
            status: &self.status,
            snapshot: Some(snapshot),
        };

        if let Some(mut posts) = optimistic {
            match self.mutation.apply(&actor, &input, &mut posts) {
                Applied::Changed => cache.set(key, posts),
                Applied::Untouched => {
                    debug!(mutation = M::NAME, ?input, "Nothing to update optimistically");
                }
                Applied::NeedsRefetch => {
                    warn!(
                        mutation = M::NAME,
                        ?input,
                        "Cached posts are out of date, forcing a refetch"
                    );
                    cache.invalidate(&key);
                }
            }
        }

        let result = self
            .mutation
            .commit(self.client.backend(), &actor, input)
            .await;

        let snapshot = in_flight.snapshot.take();
        if let (Err(error), Some(snapshot)) = (&result, snapshot) {
            warn!(mutation = M::NAME, %error, "Remote write failed, rolling back");
            cache.restore(snapshot);
        }
        drop(in_flight);

        result
    }
}

pub(crate) fn require_persisted<Marker>(
    entity: &'static str,
    id: LocalId<Marker>,
) -> Result<Id<Marker>, MutationError> {
    id.persisted().ok_or_else(|| MutationError::NotYetSaved {
        entity,
        id: id.to_string(),
    })
}

pub(crate) fn find_post(posts: &mut [Post], id: PostId) -> Option<&mut Post> {
    posts.iter_mut().find(|post| post.id == id)
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::{
        client::{QueryKey, SyncClient},
        mutation::{
            MutationError, MutationStatus,
            posts::{PostDraft, PostLike, PostSave},
        },
        session::Session,
    };
    use fellowship_common::model::{
        Id,
        post::Post,
        user::{Actor, Author, DisplayName, UserMarker},
    };
    use fellowship_db::memory::MemoryBackend;
    use std::sync::Arc;
    use uuid::Uuid;

    pub(crate) struct Fixture {
        pub backend: Arc<MemoryBackend>,
        pub client: SyncClient,
        pub ana: Actor,
        pub pablo: Id<UserMarker>,
    }

    impl Fixture {
        pub(crate) async fn new() -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let ana = Actor {
                id: Id::new(Uuid::from_u128(1)),
                name: DisplayName::new("Ana".to_owned()).unwrap(),
                avatar_url: None,
            };
            let pablo = Author {
                id: Id::new(Uuid::from_u128(2)),
                name: DisplayName::new("Pablo".to_owned()).unwrap(),
                avatar_url: Some("https://example.org/pablo.png".to_owned()),
            };
            backend.add_profile(ana.as_author()).await;
            backend.add_profile(pablo.clone()).await;

            let session = Session::new();
            session.sign_in(ana.clone());
            let client = SyncClient::new(backend.clone(), session);

            Self {
                backend,
                client,
                ana,
                pablo: pablo.id,
            }
        }

        pub(crate) fn feed_key(&self) -> QueryKey {
            QueryKey::Feed {
                viewer: self.ana.id,
            }
        }

        /// Loads the feed into the cache and returns it.
        pub(crate) async fn load(&self) -> Vec<Post> {
            assert!(self.client.refetch(self.feed_key()).await);
            self.cached()
        }

        pub(crate) fn cached(&self) -> Vec<Post> {
            self.client.cache().get(&self.feed_key()).unwrap()
        }
    }

    #[tokio::test]
    async fn signed_out_mutations_touch_nothing() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let before = fixture.load().await;
        fixture.client.session().sign_out();

        let handle = fixture.client.toggle_like();
        let status = handle.status();
        let result = handle
            .mutate(PostLike {
                post_id: post.into(),
                was_liked: false,
            })
            .await;

        assert!(matches!(result, Err(MutationError::MissingActor)));
        assert_eq!(fixture.backend.write_attempts(), 0);
        assert_eq!(fixture.client.cache().get(&fixture.feed_key()), Some(before));
        assert!(matches!(*status.borrow(), MutationStatus::Failed(_)));
    }

    #[tokio::test]
    async fn settle_invalidates_every_collection_of_the_actor() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.load().await;
        let saved = QueryKey::Saved {
            viewer: fixture.ana.id,
        };
        let someone_else = QueryKey::Feed {
            viewer: fixture.pablo,
        };
        assert!(fixture.client.refetch(saved).await);
        assert!(fixture.client.refetch(someone_else).await);

        fixture
            .client
            .toggle_save()
            .mutate(PostSave {
                post_id: post.into(),
                was_saved: false,
            })
            .await
            .unwrap();

        let cache = fixture.client.cache();
        assert!(cache.state(&fixture.feed_key()).is_stale);
        assert!(cache.state(&saved).is_stale);
        assert!(!cache.state(&someone_else).is_stale);
        assert_eq!(cache.pending_mutations(&fixture.feed_key()), 0);
    }

    #[tokio::test]
    async fn dropped_mutation_rolls_back_and_settles() {
        let fixture = Fixture::new().await;
        fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let before = fixture.load().await;

        let handle = fixture.client.create_post();
        let gate = fixture.backend.hold_writes().await;
        let mut creating = Box::pin(handle.mutate(PostDraft {
            content: "Nos vemos el domingo".to_owned(),
            media: None,
        }));
        assert!(futures::poll!(&mut creating).is_pending());
        assert!(handle.is_pending());
        assert!(fixture.cached()[0].id.is_pending());

        drop(creating);
        drop(gate);

        let cache = fixture.client.cache();
        assert_eq!(fixture.cached(), before);
        assert!(cache.state(&fixture.feed_key()).is_stale);
        assert_eq!(cache.pending_mutations(&fixture.feed_key()), 0);
        assert_eq!(*handle.status().borrow(), MutationStatus::Idle);

        let reloaded = fixture.load().await;
        assert_eq!(reloaded, before);
        assert!(reloaded.iter().all(|post| !post.id.is_pending()));
    }
}
