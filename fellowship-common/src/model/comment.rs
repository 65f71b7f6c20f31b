use crate::model::{
    Id, LikeState, LocalId,
    post::PostMarker,
    user::{Author, UserMarker},
};
use time::UtcDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct CommentMarker;

pub type CommentId = LocalId<CommentMarker>;

/// A node of a post's comment forest.
///
/// Root comments and replies share this type. `replies` is always present,
/// possibly empty, and holds the children in the order they were written.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: Id<PostMarker>,
    pub parent_id: Option<CommentId>,
    pub author: Author,
    pub content: String,
    pub created_at: UtcDateTime,
    pub likes: LikeState,
    pub replies: Vec<Comment>,
}

impl Comment {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Fields sent to the backend when writing a comment.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct NewComment {
    pub author: Id<UserMarker>,
    pub post_id: Id<PostMarker>,
    pub parent_id: Option<Id<CommentMarker>>,
    pub content: String,
}
