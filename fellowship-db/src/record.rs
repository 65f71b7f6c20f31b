use fellowship_common::{
    model::{
        Id, LikeState, LocalId, ModelValidationError,
        change::{ChangeEvent, ChangeKind, WatchedTable},
        comment::Comment,
        post::{Media, Post},
        user::{Author, DisplayName},
    },
    tree::CommentForest,
};
use serde::Deserialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct PostRecord {
    pub post_id: Uuid,
    pub content: String,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub created_at: OffsetDateTime,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_avatar_url: Option<String>,
    pub like_count: i64,
    pub liked: bool,
    pub saved: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct CommentRecord {
    pub comment_id: Uuid,
    pub post_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_avatar_url: Option<String>,
    pub like_count: i64,
    pub liked: bool,
}

/// Notification body sent by the `notify_change` trigger.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
pub(crate) struct ChangePayload {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<ChangedRow>,
    #[serde(default)]
    pub old: Option<ChangedRow>,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Deserialize)]
pub(crate) struct ChangedRow {
    pub id: Option<Uuid>,
    pub post_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

fn author(id: Uuid, name: String, avatar_url: Option<String>) -> Result<Author, ModelValidationError> {
    Ok(Author {
        id: id.into(),
        name: DisplayName::new(name)?,
        avatar_url,
    })
}

impl TryFrom<PostRecord> for Post {
    type Error = ModelValidationError;

    fn try_from(value: PostRecord) -> Result<Self, Self::Error> {
        let media = match (value.media_url, value.media_type) {
            (Some(url), Some(kind)) => Some(Media {
                url,
                kind: kind.parse()?,
            }),
            _ => None,
        };

        Ok(Self {
            id: LocalId::Persisted(value.post_id.into()),
            author: author(value.author_id, value.author_name, value.author_avatar_url)?,
            content: value.content,
            media,
            created_at: value.created_at.to_utc(),
            likes: LikeState::try_from((value.like_count, value.liked))?,
            is_saved: value.saved,
            comments: CommentForest::new(),
        })
    }
}

impl TryFrom<CommentRecord> for Comment {
    type Error = ModelValidationError;

    fn try_from(value: CommentRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: LocalId::Persisted(value.comment_id.into()),
            post_id: value.post_id.into(),
            parent_id: value.parent_id.map(|parent| LocalId::Persisted(parent.into())),
            author: author(value.author_id, value.author_name, value.author_avatar_url)?,
            content: value.content,
            created_at: value.created_at.to_utc(),
            likes: LikeState::try_from((value.like_count, value.liked))?,
            replies: Vec::new(),
        })
    }
}

impl TryFrom<ChangePayload> for ChangeEvent {
    type Error = ModelValidationError;

    fn try_from(value: ChangePayload) -> Result<Self, Self::Error> {
        let kind: ChangeKind = value.event_type.parse()?;
        let table: WatchedTable = value.table.parse()?;
        // Deletes only carry the old row, the new one is absent or all null.
        let row = value
            .new
            .filter(|row| row.id.is_some())
            .or(value.old)
            .unwrap_or_default();
        let id = row.id.ok_or(ModelValidationError::MissingField("id"))?;

        let post_id = match table {
            WatchedTable::Posts => Some(id),
            WatchedTable::Comments => row.post_id,
        };

        Ok(Self {
            kind,
            table,
            id,
            post_id: post_id.map(Id::new),
            author: row.user_id.map(Id::new),
        })
    }
}

pub(crate) fn decode_change(payload: &str) -> crate::Result<ChangeEvent> {
    let payload: ChangePayload = serde_json::from_str(payload)?;
    Ok(ChangeEvent::try_from(payload)?)
}
