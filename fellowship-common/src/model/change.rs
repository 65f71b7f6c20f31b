use crate::model::{Id, ModelValidationError, post::PostMarker, user::UserMarker};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};
use uuid::Uuid;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

impl FromStr for ChangeKind {
    type Err = ModelValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(ChangeKind::Inserted),
            "UPDATE" => Ok(ChangeKind::Updated),
            "DELETE" => Ok(ChangeKind::Deleted),
            other => Err(ModelValidationError::UnknownChangeKind(other.to_owned())),
        }
    }
}

/// Remote collections whose row changes are pushed to clients.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum WatchedTable {
    Posts,
    Comments,
}

impl WatchedTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WatchedTable::Posts => "posts",
            WatchedTable::Comments => "comments",
        }
    }
}

impl Display for WatchedTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchedTable {
    type Err = ModelValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posts" => Ok(WatchedTable::Posts),
            "comments" => Ok(WatchedTable::Comments),
            other => Err(ModelValidationError::UnwatchedTable(other.to_owned())),
        }
    }
}

/// A row change pushed by the backend.
///
/// `post_id` is the post itself for the posts table and the commented post
/// for the comments table. `author` is absent when the backend only sends the
/// primary key of a deleted row.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: WatchedTable,
    pub id: Uuid,
    pub post_id: Option<Id<PostMarker>>,
    pub author: Option<Id<UserMarker>>,
}

impl ChangeEvent {
    #[must_use]
    pub fn is_authored_by(&self, user: Id<UserMarker>) -> bool {
        self.author == Some(user)
    }

    #[must_use]
    pub fn concerns_post(&self, post: Id<PostMarker>) -> bool {
        self.post_id == Some(post)
    }
}
