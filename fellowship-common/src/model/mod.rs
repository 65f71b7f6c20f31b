pub mod change;
pub mod comment;
pub mod post;
pub mod user;

use crate::model::user::InvalidDisplayNameError;
use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    marker::PhantomData,
    str::FromStr,
};
use thiserror::Error;
use uuid::Uuid;

pub const PENDING_ID_PREFIX: &str = "pending-";

#[derive(Clone, Eq, PartialEq, Debug, Hash, Error)]
pub enum ModelValidationError {
    #[error(transparent)]
    DisplayName(#[from] InvalidDisplayNameError),
    #[error("Content must not be empty")]
    EmptyContent,
    #[error("Unknown media kind: {0}")]
    UnknownMediaKind(String),
    #[error("Unknown change event type: {0}")]
    UnknownChangeKind(String),
    #[error("Change event for unwatched table: {0}")]
    UnwatchedTable(String),
    #[error("Change event row is missing field `{0}`")]
    MissingField(&'static str),
    #[error("Like count was negative: {0}")]
    NegativeLikeCount(i64),
}

/// A server-assigned identifier, tagged with the kind of entity it names.
#[derive_where(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<Marker>(Uuid, #[serde(skip)] PhantomData<Marker>);

impl<Marker> Id<Marker> {
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid, PhantomData)
    }

    #[must_use]
    pub fn uuid(self) -> Uuid {
        self.0
    }
}

impl<Marker> Display for Id<Marker> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<Marker> From<Uuid> for Id<Marker> {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl<Marker> From<Id<Marker>> for Uuid {
    fn from(value: Id<Marker>) -> Self {
        value.0
    }
}

/// Identifier of a node held by the client.
///
/// Nodes created optimistically carry a `Pending` id until the next refetch
/// replaces them with the canonical row. Pending ids never reach the backend.
#[derive_where(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum LocalId<Marker> {
    Persisted(Id<Marker>),
    Pending(Uuid),
}

impl<Marker> LocalId<Marker> {
    #[must_use]
    pub fn pending() -> Self {
        Self::Pending(Uuid::new_v4())
    }

    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending(_))
    }

    #[must_use]
    pub fn persisted(self) -> Option<Id<Marker>> {
        match self {
            Self::Persisted(id) => Some(id),
            Self::Pending(_) => None,
        }
    }
}

impl<Marker> From<Id<Marker>> for LocalId<Marker> {
    fn from(value: Id<Marker>) -> Self {
        Self::Persisted(value)
    }
}

impl<Marker> PartialEq<Id<Marker>> for LocalId<Marker> {
    fn eq(&self, other: &Id<Marker>) -> bool {
        matches!(self, Self::Persisted(id) if id == other)
    }
}

impl<Marker> Display for LocalId<Marker> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persisted(id) => Display::fmt(id, f),
            Self::Pending(uuid) => write!(f, "{PENDING_ID_PREFIX}{uuid}"),
        }
    }
}

impl<Marker> FromStr for LocalId<Marker> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(PENDING_ID_PREFIX) {
            Some(pending) => Ok(Self::Pending(pending.parse()?)),
            None => Ok(Self::Persisted(Id::new(s.parse()?))),
        }
    }
}

/// Like count and whether the current user is among the likers.
///
/// The count is unsigned, so `unlike` floors at zero instead of going
/// negative when two unlikes race.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct LikeState {
    pub count: u32,
    pub liked: bool,
}

impl LikeState {
    #[must_use]
    pub fn new(count: u32, liked: bool) -> Self {
        Self { count, liked }
    }

    pub fn like(&mut self) {
        self.count = self.count.saturating_add(1);
        self.liked = true;
    }

    pub fn unlike(&mut self) {
        self.count = self.count.saturating_sub(1);
        self.liked = false;
    }

    /// Applies the toggle the user requested while seeing `was_liked`.
    pub fn toggle_from(&mut self, was_liked: bool) {
        if was_liked {
            self.unlike();
        } else {
            self.like();
        }
    }
}

impl TryFrom<(i64, bool)> for LikeState {
    type Error = ModelValidationError;

    fn try_from((count, liked): (i64, bool)) -> Result<Self, Self::Error> {
        let count = u32::try_from(count).map_err(|_| ModelValidationError::NegativeLikeCount(count))?;
        Ok(Self { count, liked })
    }
}

pub fn validate_content(content: &str) -> Result<&str, ModelValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        Err(ModelValidationError::EmptyContent)
    } else {
        Ok(trimmed)
    }
}
