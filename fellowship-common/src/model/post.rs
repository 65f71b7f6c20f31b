use crate::{
    model::{
        Id, LikeState, LocalId, ModelValidationError,
        user::{Author, UserMarker},
    },
    tree::CommentForest,
};
use std::str::FromStr;
use time::UtcDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct PostMarker;

pub type PostId = LocalId<PostMarker>;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Post {
    pub id: PostId,
    pub author: Author,
    pub content: String,
    pub media: Option<Media>,
    pub created_at: UtcDateTime,
    pub likes: LikeState,
    pub is_saved: bool,
    pub comments: CommentForest,
}

impl Post {
    #[must_use]
    pub fn is_authored_by(&self, user: Id<UserMarker>) -> bool {
        self.author.id == user
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Media {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

impl FromStr for MediaKind {
    type Err = ModelValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(ModelValidationError::UnknownMediaKind(other.to_owned())),
        }
    }
}

/// Fields sent to the backend when publishing a post.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct NewPost {
    pub author: Id<UserMarker>,
    pub content: String,
    pub media: Option<Media>,
}
