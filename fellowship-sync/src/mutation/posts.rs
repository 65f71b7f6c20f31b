use crate::mutation::{Applied, Mutation, MutationError, find_post, require_persisted};
use async_trait::async_trait;
use fellowship_common::{
    model::{
        LikeState, LocalId, ModelValidationError,
        post::{Media, NewPost, Post, PostId},
        user::Actor,
    },
    tree::CommentForest,
};
use fellowship_db::Backend;
use time::UtcDateTime;

/// A post to publish. Either text or media must be present.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PostDraft {
    pub content: String,
    pub media: Option<Media>,
}

/// Like toggle requested while the user saw `was_liked`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PostLike {
    pub post_id: PostId,
    pub was_liked: bool,
}

/// Save toggle requested while the user saw `was_saved`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PostSave {
    pub post_id: PostId,
    pub was_saved: bool,
}

fn update_post(posts: &mut [Post], id: PostId, update: impl FnOnce(&mut Post)) -> Applied {
    match find_post(posts, id) {
        Some(post) => {
            update(post);
            Applied::Changed
        }
        None => Applied::Untouched,
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CreatePost;

#[async_trait]
impl Mutation for CreatePost {
    type Input = PostDraft;
    type Output = Post;

    const NAME: &'static str = "create_post";

    fn validate(&self, input: PostDraft) -> Result<PostDraft, MutationError> {
        let content = input.content.trim().to_owned();
        if content.is_empty() && input.media.is_none() {
            return Err(ModelValidationError::EmptyContent.into());
        }
        Ok(PostDraft { content, ..input })
    }

    fn apply(&self, actor: &Actor, input: &PostDraft, posts: &mut Vec<Post>) -> Applied {
        posts.insert(
            0,
            Post {
                id: LocalId::pending(),
                author: actor.as_author(),
                content: input.content.clone(),
                media: input.media.clone(),
                created_at: UtcDateTime::now(),
                likes: LikeState::default(),
                is_saved: false,
                comments: CommentForest::new(),
            },
        );
        Applied::Changed
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: PostDraft,
    ) -> Result<Post, MutationError> {
        let post = NewPost {
            author: actor.id,
            content: input.content,
            media: input.media,
        };
        Ok(backend.insert_post(&post).await?)
    }
}

/// Deletes one of the actor's own posts. Posts by others stay in the cache
/// and the backend refuses the write.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeletePost;

#[async_trait]
impl Mutation for DeletePost {
    type Input = PostId;
    type Output = ();

    const NAME: &'static str = "delete_post";

    fn validate(&self, input: PostId) -> Result<PostId, MutationError> {
        require_persisted("post", input)?;
        Ok(input)
    }

    fn apply(&self, actor: &Actor, input: &PostId, posts: &mut Vec<Post>) -> Applied {
        let before = posts.len();
        posts.retain(|post| !(post.id == *input && post.is_authored_by(actor.id)));

        if posts.len() == before {
            Applied::Untouched
        } else {
            Applied::Changed
        }
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: PostId,
    ) -> Result<(), MutationError> {
        let id = require_persisted("post", input)?;
        Ok(backend.delete_post(id, actor.id).await?)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TogglePostLike;

#[async_trait]
impl Mutation for TogglePostLike {
    type Input = PostLike;
    type Output = ();

    const NAME: &'static str = "toggle_post_like";

    fn validate(&self, input: PostLike) -> Result<PostLike, MutationError> {
        require_persisted("post", input.post_id)?;
        Ok(input)
    }

    fn apply(&self, _actor: &Actor, input: &PostLike, posts: &mut Vec<Post>) -> Applied {
        update_post(posts, input.post_id, |post| {
            post.likes.toggle_from(input.was_liked);
        })
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: PostLike,
    ) -> Result<(), MutationError> {
        let id = require_persisted("post", input.post_id)?;
        if input.was_liked {
            backend.unlike_post(id, actor.id).await?;
        } else {
            backend.like_post(id, actor.id).await?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TogglePostSave;

#[async_trait]
impl Mutation for TogglePostSave {
    type Input = PostSave;
    type Output = ();

    const NAME: &'static str = "toggle_post_save";

    fn validate(&self, input: PostSave) -> Result<PostSave, MutationError> {
        require_persisted("post", input.post_id)?;
        Ok(input)
    }

    fn apply(&self, _actor: &Actor, input: &PostSave, posts: &mut Vec<Post>) -> Applied {
        update_post(posts, input.post_id, |post| {
            post.is_saved = !input.was_saved;
        })
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: PostSave,
    ) -> Result<(), MutationError> {
        let id = require_persisted("post", input.post_id)?;
        if input.was_saved {
            backend.unsave_post(id, actor.id).await?;
        } else {
            backend.save_post(id, actor.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        client::QueryKey,
        mutation::{
            MutationError,
            posts::{PostDraft, PostLike, PostSave},
            tests::Fixture,
        },
    };
    use fellowship_common::model::{
        Id, LikeState, ModelValidationError,
        post::{Media, MediaKind, PostId},
    };
    use uuid::Uuid;

    #[tokio::test]
    async fn created_post_is_prepended_then_replaced_by_refetch() {
        let fixture = Fixture::new().await;
        fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.load().await;

        let handle = fixture.client.create_post();
        let gate = fixture.backend.hold_writes().await;
        let (result, ()) = tokio::join!(
            handle.mutate(PostDraft {
                content: String::new(),
                media: Some(Media {
                    url: "https://example.org/retiro.jpg".to_owned(),
                    kind: MediaKind::Image,
                }),
            }),
            async {
                tokio::task::yield_now().await;
                let cached = fixture.cached();
                assert_eq!(cached.len(), 2);
                assert!(cached[0].id.is_pending());
                assert!(cached[0].is_authored_by(fixture.ana.id));
                assert!(cached[0].comments.is_empty());
                drop(gate);
            }
        );

        let stored = result.unwrap();
        fixture.load().await;
        let cached = fixture.cached();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].id, stored.id);
    }

    #[tokio::test]
    async fn empty_post_is_rejected() {
        let fixture = Fixture::new().await;
        fixture.load().await;

        let result = fixture
            .client
            .create_post()
            .mutate(PostDraft {
                content: "   ".to_owned(),
                media: None,
            })
            .await;

        assert!(matches!(
            result,
            Err(MutationError::Invalid(ModelValidationError::EmptyContent))
        ));
        assert!(fixture.cached().is_empty());
        assert_eq!(fixture.backend.write_attempts(), 0);
    }

    #[tokio::test]
    async fn deleting_own_post_removes_it() {
        let fixture = Fixture::new().await;
        let own = fixture.backend.seed_post(fixture.ana.id, "Mío").await;
        fixture.backend.seed_post(fixture.pablo, "Ajeno").await;
        fixture.load().await;

        fixture.client.delete_post().mutate(own.into()).await.unwrap();

        let cached = fixture.cached();
        assert_eq!(cached.len(), 1);
        assert!(cached[0].is_authored_by(fixture.pablo));
    }

    #[tokio::test]
    async fn deleting_someone_elses_post_changes_nothing() {
        let fixture = Fixture::new().await;
        let theirs = fixture.backend.seed_post(fixture.pablo, "Ajeno").await;
        let before = fixture.load().await;

        let result = fixture.client.delete_post().mutate(theirs.into()).await;

        assert!(matches!(result, Err(MutationError::Remote(_))));
        assert_eq!(fixture.cached(), before);
    }

    #[tokio::test]
    async fn unlike_rolls_back_when_the_write_fails() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.backend.seed_post_like(post, fixture.ana.id).await;
        for _ in 0..2 {
            let fan = Id::new(Uuid::new_v4());
            fixture.backend.seed_post_like(post, fan).await;
        }
        let before = fixture.load().await;
        assert_eq!(before[0].likes, LikeState::new(3, true));

        fixture.backend.set_failing(true);
        let handle = fixture.client.toggle_like();
        let gate = fixture.backend.hold_writes().await;
        let (result, ()) = tokio::join!(
            handle.mutate(PostLike {
                post_id: post.into(),
                was_liked: true,
            }),
            async {
                tokio::task::yield_now().await;
                assert_eq!(fixture.cached()[0].likes, LikeState::new(2, false));
                drop(gate);
            }
        );

        assert!(matches!(result, Err(MutationError::Remote(_))));
        assert_eq!(fixture.cached(), before);
        assert_eq!(fixture.cached()[0].likes, LikeState::new(3, true));
    }

    #[tokio::test]
    async fn like_then_unlike_in_flight_together_end_where_they_started() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let before = fixture.load().await;
        assert_eq!(before[0].likes, LikeState::default());

        let handle = fixture.client.toggle_like();
        let gate = fixture.backend.hold_writes().await;
        let (like, unlike, ()) = tokio::join!(
            handle.mutate(PostLike {
                post_id: post.into(),
                was_liked: false,
            }),
            handle.mutate(PostLike {
                post_id: post.into(),
                was_liked: true,
            }),
            async {
                tokio::task::yield_now().await;
                assert_eq!(fixture.client.cache().pending_mutations(&fixture.feed_key()), 2);
                assert_eq!(fixture.cached()[0].likes, LikeState::new(0, false));
                drop(gate);
            }
        );
        like.unwrap();
        unlike.unwrap();

        let cache = fixture.client.cache();
        assert_eq!(cache.pending_mutations(&fixture.feed_key()), 0);
        assert!(cache.state(&fixture.feed_key()).is_stale);
        assert_eq!(fixture.cached()[0].likes, LikeState::new(0, false));
        assert_eq!(fixture.backend.write_attempts(), 2);

        let reloaded = fixture.load().await;
        assert_eq!(reloaded[0].likes, LikeState::new(0, false));
    }

    #[tokio::test]
    async fn like_is_optimistic_and_confirmed_by_refetch() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.load().await;
        let handle = fixture.client.toggle_like();

        handle
            .mutate(PostLike {
                post_id: post.into(),
                was_liked: false,
            })
            .await
            .unwrap();
        assert_eq!(fixture.cached()[0].likes, LikeState::new(1, true));

        fixture.load().await;
        assert_eq!(fixture.cached()[0].likes, LikeState::new(1, true));
    }

    #[tokio::test]
    async fn concurrent_unlikes_diverge_until_refetch() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.backend.seed_post_like(post, fixture.ana.id).await;
        fixture.backend.seed_post_like(post, fixture.pablo).await;
        fixture.load().await;

        // Two taps on a stale "liked" button both decrement locally, while the
        // backend only drops the one like the actor owned.
        let handle = fixture.client.toggle_like();
        let unlike = PostLike {
            post_id: post.into(),
            was_liked: true,
        };
        let (first, second) = tokio::join!(handle.mutate(unlike), handle.mutate(unlike));
        first.unwrap();
        second.unwrap();
        assert_eq!(fixture.cached()[0].likes, LikeState::new(0, false));

        fixture.load().await;
        assert_eq!(fixture.cached()[0].likes, LikeState::new(1, false));
    }

    #[tokio::test]
    async fn save_toggles_and_reaches_saved_collection() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.load().await;
        let saved = QueryKey::Saved {
            viewer: fixture.ana.id,
        };
        assert!(fixture.client.refetch(saved).await);
        assert_eq!(fixture.client.cache().get(&saved), Some(Vec::new()));

        fixture
            .client
            .toggle_save()
            .mutate(PostSave {
                post_id: post.into(),
                was_saved: false,
            })
            .await
            .unwrap();
        assert!(fixture.cached()[0].is_saved);
        assert!(fixture.client.cache().state(&saved).is_stale);

        assert!(fixture.client.refetch(saved).await);
        let saved_posts = fixture.client.cache().get(&saved).unwrap();
        assert!(saved_posts.len() == 1 && saved_posts[0].is_saved);
    }

    #[tokio::test]
    async fn pending_posts_cannot_be_liked() {
        let fixture = Fixture::new().await;
        fixture.load().await;

        let result = fixture
            .client
            .toggle_like()
            .mutate(PostLike {
                post_id: PostId::pending(),
                was_liked: false,
            })
            .await;

        assert!(matches!(
            result,
            Err(MutationError::NotYetSaved { entity: "post", .. })
        ));
        assert_eq!(fixture.backend.write_attempts(), 0);
    }
}
