use crate::model::Id;
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{Error, Unexpected},
};
use thiserror::Error;

pub const DISPLAY_NAME_MAX_LEN: usize = 80;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct UserMarker;

/// Author details denormalized onto every post and comment for display.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Author {
    pub id: Id<UserMarker>,
    pub name: DisplayName,
    pub avatar_url: Option<String>,
}

/// The signed-in user on whose behalf mutations run.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Actor {
    pub id: Id<UserMarker>,
    pub name: DisplayName,
    pub avatar_url: Option<String>,
}

impl Actor {
    #[must_use]
    pub fn as_author(&self) -> Author {
        Author {
            id: self.id,
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Serialize)]
#[serde(transparent)]
pub struct DisplayName(String);

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("The display name is invalid: {0:?}")]
pub struct InvalidDisplayNameError(String);

impl DisplayName {
    pub fn new(name: String) -> Result<Self, InvalidDisplayNameError> {
        let length = name.trim().chars().count();
        if length > 0 && length <= DISPLAY_NAME_MAX_LEN {
            Ok(DisplayName(name))
        } else {
            Err(InvalidDisplayNameError(name))
        }
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl<'de> Deserialize<'de> for DisplayName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        DisplayName::new(inner)
            .map_err(|err| Error::invalid_value(Unexpected::Str(&err.0), &"DisplayName"))
    }
}
