//! Domain types for the feed: posts as they exist on the wire, decoded feed
//! entries, and the draft inputs handed to the publish pipeline.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{FieldMap, RecordDocument};

/// Record field holding the creation timestamp; the feed's sort key.
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Record field holding the ordered photo URL list.
pub const PHOTO_URLS_FIELD: &str = "photoUrls";

/// Opaque identifier of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque identifier of a post record, assigned by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PostId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Authenticated identity passed explicitly into actor-scoped operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    /// Account identifier; becomes `authorId` on published posts.
    pub id: UserId,
    /// Display string; absent when the account never set one.
    pub display_name: Option<String>,
}

impl Author {
    pub fn new(id: impl Into<UserId>, display_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            display_name,
        }
    }
}

/// Wire shape of a post record's fields.
///
/// `createdAt` travels as integer milliseconds since the Unix epoch so the
/// record store can sort on it numerically. `photoUrls` is omitted entirely
/// until the publish pipeline's finalize step writes it. `likes` is a
/// reserved field: serialized empty on creation, carried through on decode,
/// never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostFields {
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_display_name: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_urls: Option<Vec<String>>,
    #[serde(default)]
    pub likes: Vec<UserId>,
}

impl PostFields {
    /// Serialize into the generic field map handed to the record store.
    pub fn to_map(&self) -> serde_json::Result<FieldMap> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "post fields serialized to non-object value: {other}"
            ))),
        }
    }

    /// Partial field map attaching an ordered photo URL list to a record.
    pub fn photo_urls_patch(urls: &[String]) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(PHOTO_URLS_FIELD.to_string(), serde_json::json!(urls));
        map
    }
}

/// A decoded feed post.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub author_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub caption: String,
    /// Resolved media URLs in upload order; empty until finalized.
    pub photo_urls: Vec<String>,
    pub likes: Vec<UserId>,
}

impl Post {
    /// Decode a raw record into a post. Absent `photoUrls` decodes to an
    /// empty list; absent `authorDisplayName` is tolerated.
    pub fn from_document(document: &RecordDocument) -> Result<Self, PostDecodeError> {
        let value = serde_json::Value::Object(document.fields.clone());
        let fields: PostFields =
            serde_json::from_value(value).map_err(|source| PostDecodeError {
                id: document.id.clone(),
                source,
            })?;
        Ok(Self::from_fields(PostId::new(document.id.clone()), fields))
    }

    pub fn from_fields(id: PostId, fields: PostFields) -> Self {
        Self {
            id,
            author_id: fields.author_id,
            author_display_name: fields.author_display_name,
            created_at: fields.created_at,
            caption: fields.caption,
            photo_urls: fields.photo_urls.unwrap_or_default(),
            likes: fields.likes,
        }
    }
}

/// A record that could not be decoded into a [`Post`].
#[derive(Debug, Error)]
#[error("failed to decode post record {id}: {source}")]
pub struct PostDecodeError {
    pub id: String,
    #[source]
    pub source: serde_json::Error,
}

/// Input to the publish pipeline: a caption plus photos in presentation order.
#[derive(Debug, Clone, Default)]
pub struct PostDraft {
    pub caption: String,
    pub photos: Vec<NewPhoto>,
}

impl PostDraft {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            photos: Vec::new(),
        }
    }

    /// Append a photo; order of calls is the order photos are uploaded.
    pub fn with_photo(mut self, photo: NewPhoto) -> Self {
        self.photos.push(photo);
        self
    }
}

/// One photo to attach to a new post.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    /// Identifier used as the final media path segment.
    pub id: String,
    pub payload: PhotoPayload,
    /// Explicit content type; inferred from the id's extension when `None`.
    pub content_type: Option<String>,
}

impl NewPhoto {
    pub fn from_bytes(id: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: PhotoPayload::Bytes(bytes.into()),
            content_type: None,
        }
    }

    /// Photo backed by a local file; the file name becomes the photo id.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            payload: PhotoPayload::File(path),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn resolved_content_type(&self) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| content_type_for(&self.id))
    }
}

/// Binary content of a photo, either in memory or on local disk.
#[derive(Debug, Clone)]
pub enum PhotoPayload {
    Bytes(Bytes),
    File(PathBuf),
}

impl PhotoPayload {
    /// Load the payload into memory.
    pub async fn load(&self) -> std::io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

/// Content type for a photo file name based on its extension.
fn content_type_for(name: &str) -> String {
    let extension = name.rsplit('.').next().unwrap_or_default();
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg".to_string(),
        "png" => "image/png".to_string(),
        "webp" => "image/webp".to_string(),
        "bmp" => "image/bmp".to_string(),
        "gif" => "image/gif".to_string(),
        "heic" => "image/heic".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}
