use crate::mutation::{Applied, Mutation, MutationError, find_post, require_persisted};
use async_trait::async_trait;
use fellowship_common::model::{
    LikeState, LocalId, validate_content,
    comment::{Comment, CommentId, NewComment},
    post::{Post, PostId},
    user::Actor,
};
use fellowship_db::Backend;
use time::UtcDateTime;
use tracing::warn;

/// A comment to write, at the root of a post's thread or as a reply.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CommentDraft {
    pub post_id: PostId,
    pub parent_id: Option<CommentId>,
    pub content: String,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CommentEdit {
    pub id: CommentId,
    pub content: String,
}

/// Like toggle requested while the user saw `was_liked`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct CommentLike {
    pub comment_id: CommentId,
    pub was_liked: bool,
}

fn update_comment(
    posts: &mut [Post],
    id: CommentId,
    mut update: impl FnMut(&mut Comment),
) -> Applied {
    for post in posts {
        if post.comments.update_where(id, &mut update) {
            return Applied::Changed;
        }
    }
    Applied::Untouched
}

#[derive(Copy, Clone, Debug, Default)]
pub struct AddComment;

#[async_trait]
impl Mutation for AddComment {
    type Input = CommentDraft;
    type Output = Comment;

    const NAME: &'static str = "add_comment";

    fn validate(&self, input: CommentDraft) -> Result<CommentDraft, MutationError> {
        let content = validate_content(&input.content)?.to_owned();
        require_persisted("post", input.post_id)?;
        if let Some(parent) = input.parent_id {
            require_persisted("comment", parent)?;
        }

        Ok(CommentDraft { content, ..input })
    }

    fn apply(&self, actor: &Actor, input: &CommentDraft, posts: &mut Vec<Post>) -> Applied {
        let Some(post_id) = input.post_id.persisted() else {
            return Applied::Untouched;
        };
        let Some(post) = find_post(posts, input.post_id) else {
            return Applied::Untouched;
        };

        let comment = Comment {
            id: LocalId::pending(),
            post_id,
            parent_id: input.parent_id,
            author: actor.as_author(),
            content: input.content.clone(),
            created_at: UtcDateTime::now(),
            likes: LikeState::default(),
            replies: Vec::new(),
        };

        match post.comments.insert(comment) {
            Ok(()) => Applied::Changed,
            Err(orphan) => {
                warn!(%orphan, "Reply has no parent in the cached thread");
                Applied::NeedsRefetch
            }
        }
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: CommentDraft,
    ) -> Result<Comment, MutationError> {
        let comment = NewComment {
            author: actor.id,
            post_id: require_persisted("post", input.post_id)?,
            parent_id: input
                .parent_id
                .map(|parent| require_persisted("comment", parent))
                .transpose()?,
            content: input.content,
        };

        Ok(backend.insert_comment(&comment).await?)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DeleteComment;

#[async_trait]
impl Mutation for DeleteComment {
    type Input = CommentId;
    type Output = ();

    const NAME: &'static str = "delete_comment";

    fn validate(&self, input: CommentId) -> Result<CommentId, MutationError> {
        require_persisted("comment", input)?;
        Ok(input)
    }

    fn apply(&self, _actor: &Actor, input: &CommentId, posts: &mut Vec<Post>) -> Applied {
        let mut removed = false;
        for post in posts.iter_mut() {
            removed |= post.comments.remove(*input);
        }

        if removed {
            Applied::Changed
        } else {
            Applied::Untouched
        }
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        _actor: &Actor,
        input: CommentId,
    ) -> Result<(), MutationError> {
        let id = require_persisted("comment", input)?;
        Ok(backend.delete_comment(id).await?)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct EditComment;

#[async_trait]
impl Mutation for EditComment {
    type Input = CommentEdit;
    type Output = ();

    const NAME: &'static str = "edit_comment";

    fn validate(&self, input: CommentEdit) -> Result<CommentEdit, MutationError> {
        let content = validate_content(&input.content)?.to_owned();
        require_persisted("comment", input.id)?;
        Ok(CommentEdit { content, ..input })
    }

    fn apply(&self, _actor: &Actor, input: &CommentEdit, posts: &mut Vec<Post>) -> Applied {
        update_comment(posts, input.id, |comment| {
            input.content.clone_into(&mut comment.content);
        })
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        _actor: &Actor,
        input: CommentEdit,
    ) -> Result<(), MutationError> {
        let id = require_persisted("comment", input.id)?;
        Ok(backend.update_comment(id, &input.content).await?)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ToggleCommentLike;

#[async_trait]
impl Mutation for ToggleCommentLike {
    type Input = CommentLike;
    type Output = ();

    const NAME: &'static str = "toggle_comment_like";

    fn validate(&self, input: CommentLike) -> Result<CommentLike, MutationError> {
        require_persisted("comment", input.comment_id)?;
        Ok(input)
    }

    fn apply(&self, _actor: &Actor, input: &CommentLike, posts: &mut Vec<Post>) -> Applied {
        update_comment(posts, input.comment_id, |comment| {
            comment.likes.toggle_from(input.was_liked);
        })
    }

    async fn commit(
        &self,
        backend: &dyn Backend,
        actor: &Actor,
        input: CommentLike,
    ) -> Result<(), MutationError> {
        let id = require_persisted("comment", input.comment_id)?;
        if input.was_liked {
            backend.unlike_comment(id, actor.id).await?;
        } else {
            backend.like_comment(id, actor.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::mutation::{
        MutationError, MutationStatus,
        comments::{CommentDraft, CommentEdit, CommentLike},
        tests::Fixture,
    };
    use fellowship_common::model::{
        Id, LikeState, LocalId, ModelValidationError, comment::CommentId,
    };
    use uuid::Uuid;

    #[tokio::test]
    async fn added_comment_is_visible_before_the_write_lands() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let root = fixture
            .backend
            .seed_comment(post, None, fixture.pablo, "¿Quién viene?")
            .await;
        fixture.load().await;

        let handle = fixture.client.add_comment();
        let gate = fixture.backend.hold_writes().await;
        let (result, ()) = tokio::join!(
            handle.mutate(CommentDraft {
                post_id: post.into(),
                parent_id: Some(root.into()),
                content: "  Yo voy  ".to_owned(),
            }),
            async {
                tokio::task::yield_now().await;
                assert!(handle.is_pending());

                let cached = fixture.cached();
                let thread = cached[0].comments.roots();
                let reply = &thread[0].replies[0];
                assert!(reply.id.is_pending());
                assert_eq!(reply.content, "Yo voy");
                assert_eq!(reply.author.id, fixture.ana.id);
                drop(gate);
            }
        );

        let stored = result.unwrap();
        assert_eq!(stored.content, "Yo voy");
        assert_eq!(*handle.status().borrow(), MutationStatus::Succeeded);
        assert!(fixture.client.cache().state(&fixture.feed_key()).is_stale);

        let cached = fixture.load().await;
        let reply = &cached[0].comments.roots()[0].replies[0];
        assert_eq!(reply.id, stored.id);
        assert!(!reply.id.is_pending());
    }

    #[tokio::test]
    async fn failed_add_restores_the_snapshot() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let before = fixture.load().await;

        fixture.backend.set_failing(true);
        let handle = fixture.client.add_comment();
        let result = handle
            .mutate(CommentDraft {
                post_id: post.into(),
                parent_id: None,
                content: "Hola".to_owned(),
            })
            .await;

        assert!(matches!(result, Err(MutationError::Remote(_))));
        assert_eq!(fixture.cached(), before);
        assert!(matches!(*handle.status().borrow(), MutationStatus::Failed(_)));
        assert_eq!(fixture.backend.write_attempts(), 1);
    }

    #[tokio::test]
    async fn blank_comment_never_reaches_the_backend() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let before = fixture.load().await;

        let result = fixture
            .client
            .add_comment()
            .mutate(CommentDraft {
                post_id: post.into(),
                parent_id: None,
                content: " \n\t".to_owned(),
            })
            .await;

        assert!(matches!(
            result,
            Err(MutationError::Invalid(ModelValidationError::EmptyContent))
        ));
        assert_eq!(fixture.backend.write_attempts(), 0);
        assert_eq!(fixture.cached(), before);
    }

    #[tokio::test]
    async fn replying_to_a_pending_comment_is_rejected() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        fixture.load().await;

        let result = fixture
            .client
            .add_comment()
            .mutate(CommentDraft {
                post_id: post.into(),
                parent_id: Some(CommentId::pending()),
                content: "Respuesta".to_owned(),
            })
            .await;

        assert!(matches!(
            result,
            Err(MutationError::NotYetSaved {
                entity: "comment",
                ..
            })
        ));
        assert_eq!(fixture.backend.write_attempts(), 0);
    }

    #[tokio::test]
    async fn reply_to_uncached_parent_marks_feed_stale() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let before = fixture.load().await;
        let parent = fixture
            .backend
            .seed_comment(post, None, fixture.pablo, "Nuevo hilo")
            .await;

        let handle = fixture.client.add_comment();
        let gate = fixture.backend.hold_writes().await;
        let (result, ()) = tokio::join!(
            handle.mutate(CommentDraft {
                post_id: post.into(),
                parent_id: Some(parent.into()),
                content: "Respuesta".to_owned(),
            }),
            async {
                tokio::task::yield_now().await;
                let state = fixture.client.cache().state(&fixture.feed_key());
                assert!(state.is_stale);
                assert_eq!(state.data, Some(before));
                drop(gate);
            }
        );

        result.unwrap();
        fixture.load().await;
        assert_eq!(fixture.cached()[0].comments.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_subtree_and_rolls_back_on_failure() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let root = fixture
            .backend
            .seed_comment(post, None, fixture.pablo, "Hilo")
            .await;
        fixture
            .backend
            .seed_comment(post, Some(root), fixture.ana.id, "Respuesta")
            .await;
        let before = fixture.load().await;
        assert_eq!(before[0].comments.len(), 2);

        fixture.backend.set_failing(true);
        let handle = fixture.client.delete_comment();
        assert!(handle.mutate(root.into()).await.is_err());
        assert_eq!(fixture.cached(), before);

        fixture.backend.set_failing(false);
        handle.mutate(root.into()).await.unwrap();
        assert!(fixture.cached()[0].comments.is_empty());

        // Deleting again is harmless locally and reported by the backend.
        assert!(matches!(
            handle.mutate(root.into()).await,
            Err(MutationError::Remote(_))
        ));
        assert!(fixture.cached()[0].comments.is_empty());
    }

    #[tokio::test]
    async fn edit_replaces_only_content() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let comment = fixture
            .backend
            .seed_comment(post, None, fixture.ana.id, "Hloa")
            .await;
        let before = fixture.load().await;

        fixture
            .client
            .edit_comment()
            .mutate(CommentEdit {
                id: comment.into(),
                content: "Hola".to_owned(),
            })
            .await
            .unwrap();

        let cached = fixture.cached();
        let after = &cached[0].comments.roots()[0];
        let original = &before[0].comments.roots()[0];
        assert_eq!(after.content, "Hola");
        assert_eq!(after.created_at, original.created_at);
        assert_eq!(after.author, original.author);
        assert_eq!(after.likes, original.likes);
    }

    #[tokio::test]
    async fn comment_like_toggles_and_rolls_back() {
        let fixture = Fixture::new().await;
        let post = fixture.backend.seed_post(fixture.pablo, "Ensayo").await;
        let comment = fixture
            .backend
            .seed_comment(post, None, fixture.pablo, "Gracias")
            .await;
        fixture.load().await;
        let handle = fixture.client.toggle_comment_like();
        let like = CommentLike {
            comment_id: comment.into(),
            was_liked: false,
        };

        handle.mutate(like).await.unwrap();
        let likes = fixture.cached()[0].comments.roots()[0].likes;
        assert_eq!(likes, LikeState::new(1, true));

        fixture.backend.set_failing(true);
        let unlike = CommentLike {
            was_liked: true,
            ..like
        };
        assert!(handle.mutate(unlike).await.is_err());
        assert_eq!(fixture.cached()[0].comments.roots()[0].likes, likes);

        let unknown = CommentLike {
            comment_id: LocalId::Persisted(Id::new(Uuid::from_u128(77))),
            was_liked: false,
        };
        fixture.backend.set_failing(false);
        assert!(handle.mutate(unknown).await.is_err());
        assert_eq!(fixture.cached()[0].comments.roots()[0].likes, likes);
    }
}
