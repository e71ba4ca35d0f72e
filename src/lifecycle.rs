//! Post deletion and profile image lookups.
//!
//! Deletion is author-only and record-first: the record disappears from the
//! live feed before any media is touched, so a media failure can only leave
//! orphaned objects, never a visible post without its record. A non-author
//! request changes nothing and reports [`DeleteOutcome::NotAuthor`] instead
//! of failing.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{Author, Post, UserId};
use crate::paths;
use crate::store::{MediaRef, MediaStore, RecordStore, RecordStoreError};

/// Caller's answer to the delete prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Cancelled,
}

/// What a delete request actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Record and namespaced media are gone.
    Deleted,
    /// Record is gone but media cleanup failed; objects remain orphaned.
    MediaOrphaned,
    /// Actor does not own the post; nothing was touched.
    NotAuthor,
    /// Caller declined the confirmation prompt; nothing was touched.
    Cancelled,
    /// The record was already gone; media was left alone.
    AlreadyDeleted,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No authenticated actor supplied.
    #[error("deleting a post requires an authenticated author")]
    Unauthorized,
    /// The record store failed before the record could be removed.
    #[error("failed to delete post record: {0}")]
    Record(#[source] RecordStoreError),
}

/// Coordinates post deletion and profile image resolution.
pub struct PostLifecycle<R, M> {
    records: Arc<R>,
    media: Arc<M>,
    collection: String,
}

impl<R: RecordStore, M: MediaStore> PostLifecycle<R, M> {
    pub fn new(records: Arc<R>, media: Arc<M>, collection: impl Into<String>) -> Self {
        Self {
            records,
            media,
            collection: collection.into(),
        }
    }

    /// Delete a post as the given actor.
    ///
    /// The record is removed first, then every media object under the post's
    /// namespace. Outcomes other than a record-store failure are reported
    /// through [`DeleteOutcome`] rather than as errors.
    #[instrument(
        skip(self, actor, post, confirmation),
        fields(
            post = %post.id,
            actor = actor.map(|a| a.id.as_str()).unwrap_or("anonymous"),
        )
    )]
    pub async fn delete_post(
        &self,
        actor: Option<&Author>,
        post: &Post,
        confirmation: Confirmation,
    ) -> Result<DeleteOutcome, LifecycleError> {
        if confirmation == Confirmation::Cancelled {
            debug!("Delete cancelled at confirmation prompt");
            return Ok(DeleteOutcome::Cancelled);
        }
        let actor = actor.ok_or(LifecycleError::Unauthorized)?;
        if actor.id != post.author_id {
            debug!(author = %post.author_id, "Delete requested by non-author; ignoring");
            return Ok(DeleteOutcome::NotAuthor);
        }

        match self.records.delete(&self.collection, post.id.as_str()).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!("Post record already gone");
                return Ok(DeleteOutcome::AlreadyDeleted);
            }
            Err(err) => return Err(LifecycleError::Record(err)),
        }

        let namespace = paths::post_media_root(&post.author_id, &post.id);
        match self.media.delete_prefix(&namespace).await {
            Ok(removed) => {
                metrics::counter!("lifecycle.posts.deleted").increment(1);
                metrics::counter!("lifecycle.media_objects_removed").increment(removed);
                info!(media_removed = removed, "Post deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(err) => {
                metrics::counter!("lifecycle.media_orphans").increment(1);
                warn!(
                    namespace = %namespace,
                    error = %err,
                    "Post record deleted but media cleanup failed"
                );
                Ok(DeleteOutcome::MediaOrphaned)
            }
        }
    }

    /// Resolve the profile image URL for an author, if one exists.
    ///
    /// Best effort: a missing image and a backend failure both come back as
    /// `None`, they only differ in how loudly they are logged.
    #[instrument(skip(self), fields(author = %author))]
    pub async fn author_profile_image(&self, author: &UserId) -> Option<String> {
        let path = paths::profile_image(author);
        match self.media.fetch_url(&MediaRef::new(path)).await {
            Ok(url) => Some(url),
            Err(err) if err.is_not_found() => {
                debug!("No profile image for author");
                None
            }
            Err(err) => {
                warn!(error = %err, "Profile image lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PostFields, PostId};
    use crate::store::memory::{InMemoryMediaStore, InMemoryRecordStore};
    use crate::store::{MediaBlob, MediaStoreError, MockMediaStore, MockRecordStore};
    use chrono::Utc;

    fn author(id: &str) -> Author {
        Author::new(id, None)
    }

    fn fields_for(author_id: &str, caption: &str) -> crate::store::FieldMap {
        PostFields {
            author_id: UserId::new(author_id),
            author_display_name: None,
            created_at: Utc::now(),
            caption: caption.to_string(),
            photo_urls: Some(vec![]),
            likes: vec![],
        }
        .to_map()
        .unwrap()
    }

    async fn seed(
        records: &InMemoryRecordStore,
        media: &InMemoryMediaStore,
        author_id: &str,
    ) -> Post {
        let id = records
            .create("posts", fields_for(author_id, "to be deleted"))
            .await
            .unwrap();
        for name in ["a.jpg", "b.jpg"] {
            let path = format!("posts/{author_id}/{id}/{name}");
            media
                .upload(&path, MediaBlob::new(vec![0u8; 4], "image/jpeg"))
                .await
                .unwrap();
        }
        let document = records.fetch("posts", &id).await.unwrap();
        Post::from_document(&document).unwrap()
    }

    #[tokio::test]
    async fn test_author_delete_removes_record_and_media() {
        let records = Arc::new(InMemoryRecordStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        let post = seed(&records, &media, "u1").await;
        media
            .upload("posts/u2/other/c.jpg", MediaBlob::new(vec![1u8], "image/jpeg"))
            .await
            .unwrap();
        let lifecycle = PostLifecycle::new(records.clone(), media.clone(), "posts");

        let outcome = lifecycle
            .delete_post(Some(&author("u1")), &post, Confirmation::Confirmed)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::Deleted);
        let err = records.fetch("posts", post.id.as_str()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!media.contains(&format!("posts/u1/{}/b.jpg", post.id)));
        assert!(media.contains("posts/u2/other/c.jpg"));

        let gone = MediaRef::new(format!("posts/u1/{}/a.jpg", post.id));
        let err = media.fetch_url(&gone).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_non_author_delete_touches_nothing() {
        let records = Arc::new(InMemoryRecordStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        let post = seed(&records, &media, "u1").await;
        let lifecycle = PostLifecycle::new(records.clone(), media.clone(), "posts");

        let outcome = lifecycle
            .delete_post(Some(&author("u2")), &post, Confirmation::Confirmed)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::NotAuthor);
        assert!(records.fetch("posts", post.id.as_str()).await.is_ok());
        assert_eq!(media.object_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_confirmation_keeps_post() {
        let records = Arc::new(InMemoryRecordStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        let post = seed(&records, &media, "u1").await;
        let lifecycle = PostLifecycle::new(records.clone(), media.clone(), "posts");

        let outcome = lifecycle
            .delete_post(Some(&author("u1")), &post, Confirmation::Cancelled)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::Cancelled);
        assert!(records.fetch("posts", post.id.as_str()).await.is_ok());
        assert_eq!(media.object_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_without_actor_is_unauthorized() {
        let records = Arc::new(InMemoryRecordStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        let post = seed(&records, &media, "u1").await;
        let lifecycle = PostLifecycle::new(records.clone(), media.clone(), "posts");

        let err = lifecycle
            .delete_post(None, &post, Confirmation::Confirmed)
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Unauthorized));
        assert!(records.fetch("posts", post.id.as_str()).await.is_ok());
    }

    #[tokio::test]
    async fn test_deleting_missing_record_skips_media() {
        let records = Arc::new(InMemoryRecordStore::new());
        // no expectations: any media call would panic the mock
        let media = Arc::new(MockMediaStore::new());
        let lifecycle = PostLifecycle::new(records, media, "posts");

        let post = Post {
            id: PostId::new("gone"),
            author_id: UserId::new("u1"),
            author_display_name: None,
            created_at: Utc::now(),
            caption: String::new(),
            photo_urls: vec![],
            likes: vec![],
        };
        let outcome = lifecycle
            .delete_post(Some(&author("u1")), &post, Confirmation::Confirmed)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::AlreadyDeleted);
    }

    #[tokio::test]
    async fn test_media_failure_reports_orphaned() {
        let records = Arc::new(InMemoryRecordStore::new());
        let staging = InMemoryMediaStore::new();
        let post = seed(&records, &staging, "u1").await;

        let mut media = MockMediaStore::new();
        media.expect_delete_prefix().times(1).returning(|_| {
            Err(MediaStoreError::backend(anyhow::anyhow!("bucket offline")))
        });
        let lifecycle = PostLifecycle::new(records.clone(), Arc::new(media), "posts");

        let outcome = lifecycle
            .delete_post(Some(&author("u1")), &post, Confirmation::Confirmed)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::MediaOrphaned);
        let err = records.fetch("posts", post.id.as_str()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_record_backend_failure_aborts_before_media() {
        let mut records = MockRecordStore::new();
        records.expect_delete().times(1).returning(|_, _| {
            Err(RecordStoreError::backend(anyhow::anyhow!("db down")))
        });
        let media = Arc::new(MockMediaStore::new());
        let lifecycle = PostLifecycle::new(Arc::new(records), media, "posts");

        let post = Post {
            id: PostId::new("p1"),
            author_id: UserId::new("u1"),
            author_display_name: None,
            created_at: Utc::now(),
            caption: String::new(),
            photo_urls: vec![],
            likes: vec![],
        };
        let err = lifecycle
            .delete_post(Some(&author("u1")), &post, Confirmation::Confirmed)
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Record(_)));
    }

    #[tokio::test]
    async fn test_profile_image_resolves_when_present() {
        let records = Arc::new(InMemoryRecordStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        media
            .upload("profiles/u1", MediaBlob::new(vec![9u8], "image/png"))
            .await
            .unwrap();
        let lifecycle = PostLifecycle::new(records, media, "posts");

        let url = lifecycle.author_profile_image(&UserId::new("u1")).await;
        assert_eq!(url.as_deref(), Some("memory://profiles/u1"));
    }

    #[tokio::test]
    async fn test_missing_profile_image_is_absent() {
        let records = Arc::new(InMemoryRecordStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        let lifecycle = PostLifecycle::new(records, media, "posts");

        assert!(lifecycle.author_profile_image(&UserId::new("u1")).await.is_none());
    }

    #[tokio::test]
    async fn test_profile_image_backend_failure_is_absent() {
        let records = Arc::new(InMemoryRecordStore::new());
        let mut media = MockMediaStore::new();
        media.expect_fetch_url().times(1).returning(|_| {
            Err(MediaStoreError::backend(anyhow::anyhow!("credentials expired")))
        });
        let lifecycle = PostLifecycle::new(records, Arc::new(media), "posts");

        assert!(lifecycle.author_profile_image(&UserId::new("u1")).await.is_none());
    }
}
