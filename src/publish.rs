//! Post publish pipeline.
//!
//! Publishing is one logical operation in two record round-trips: create the
//! metadata-only record, upload each photo under paths derived from the
//! assigned record id, then patch the record with the collected URL list.
//! The record must exist first because media paths embed its id. Failures
//! never roll back completed steps; a record created before a photo failure
//! survives as a metadata-only stub carried inside the error.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{Author, NewPhoto, Post, PostDraft, PostFields, PostId, UserId};
use crate::paths;
use crate::store::{MediaBlob, MediaStore, RecordStore, RecordStoreError};

/// Metadata-only record left behind when photo attachment fails: the
/// recoverable-orphan state an external sweep can retry or clean up.
#[derive(Debug, Clone, PartialEq)]
pub struct PostStub {
    pub id: PostId,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
    pub caption: String,
}

/// Publish pipeline failures.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No authenticated actor supplied.
    #[error("publishing requires an authenticated author")]
    Unauthorized,
    /// Draft fields could not be encoded for the record store.
    #[error("failed to encode post fields: {0}")]
    Encode(#[from] serde_json::Error),
    /// Record creation failed; nothing was uploaded.
    #[error("failed to create post record: {0}")]
    CreateRecord(#[source] RecordStoreError),
    /// A photo failed partway through the upload sequence. The record
    /// already exists without `photoUrls` and is not rolled back.
    #[error("photo {photo_id} failed after {uploaded} of {total} uploads; post record kept without photos")]
    PartialUpload {
        stub: PostStub,
        photo_id: String,
        uploaded: usize,
        total: usize,
        #[source]
        source: anyhow::Error,
    },
    /// Every photo uploaded but the final URL attach failed; the uploaded
    /// objects are orphaned alongside the metadata-only record.
    #[error("failed to attach photo urls to post record: {source}")]
    Finalize {
        stub: PostStub,
        photo_urls: Vec<String>,
        #[source]
        source: RecordStoreError,
    },
}

/// Publishes new posts against a record store and a media store.
pub struct PostPublisher<R, M> {
    records: Arc<R>,
    media: Arc<M>,
    collection: String,
}

impl<R: RecordStore, M: MediaStore> PostPublisher<R, M> {
    pub fn new(records: Arc<R>, media: Arc<M>, collection: impl Into<String>) -> Self {
        Self {
            records,
            media,
            collection: collection.into(),
        }
    }

    /// Publish a draft as the given author.
    ///
    /// Photos upload strictly in draft order and the resulting URL list
    /// preserves that order. With no photos the record is still finalized
    /// with an empty list.
    #[instrument(
        skip(self, author, draft),
        fields(
            photos = draft.photos.len(),
            author = author.map(|a| a.id.as_str()).unwrap_or("anonymous"),
        )
    )]
    pub async fn publish(
        &self,
        author: Option<&Author>,
        draft: PostDraft,
    ) -> Result<Post, PublishError> {
        let author = author.ok_or(PublishError::Unauthorized)?;

        let fields = PostFields {
            author_id: author.id.clone(),
            author_display_name: author.display_name.clone(),
            created_at: Utc::now(),
            caption: draft.caption.clone(),
            photo_urls: None,
            likes: Vec::new(),
        };
        let id = self
            .records
            .create(&self.collection, fields.to_map()?)
            .await
            .map_err(PublishError::CreateRecord)?;
        let post_id = PostId::new(id);
        debug!(post = %post_id, "Post record created");

        let stub = PostStub {
            id: post_id.clone(),
            author_id: author.id.clone(),
            created_at: fields.created_at,
            caption: fields.caption.clone(),
        };

        let total = draft.photos.len();
        let mut photo_urls = Vec::with_capacity(total);
        for (index, photo) in draft.photos.iter().enumerate() {
            match self.attach_photo(author, &post_id, photo).await {
                Ok(url) => {
                    metrics::counter!("publish.photos.uploaded").increment(1);
                    photo_urls.push(url);
                }
                Err(source) => {
                    metrics::counter!("publish.partial_failures").increment(1);
                    warn!(
                        post = %post_id,
                        photo = %photo.id,
                        uploaded = index,
                        total = total,
                        error = %source,
                        "Photo upload failed; record kept without photos"
                    );
                    return Err(PublishError::PartialUpload {
                        stub,
                        photo_id: photo.id.clone(),
                        uploaded: index,
                        total,
                        source,
                    });
                }
            }
        }

        self.records
            .update(
                &self.collection,
                post_id.as_str(),
                PostFields::photo_urls_patch(&photo_urls),
            )
            .await
            .map_err(|source| PublishError::Finalize {
                stub,
                photo_urls: photo_urls.clone(),
                source,
            })?;

        info!(post = %post_id, photos = photo_urls.len(), "Post published");
        metrics::counter!("publish.posts.published").increment(1);

        Ok(Post::from_fields(
            post_id,
            PostFields {
                photo_urls: Some(photo_urls),
                ..fields
            },
        ))
    }

    /// Upload one photo into the post's namespace and resolve its URL.
    async fn attach_photo(
        &self,
        author: &Author,
        post_id: &PostId,
        photo: &NewPhoto,
    ) -> anyhow::Result<String> {
        let path = paths::post_photo(&author.id, post_id, &photo.id);
        let bytes = photo
            .payload
            .load()
            .await
            .context("Failed to load photo payload")?;
        let blob = MediaBlob::new(bytes, photo.resolved_content_type());

        let media = self
            .media
            .upload(&path, blob)
            .await
            .context("Failed to upload photo")?;
        let url = self
            .media
            .fetch_url(&media)
            .await
            .context("Failed to resolve photo url")?;

        debug!(path = %path, "Photo attached");
        Ok(url)
    }
}
