//! In-memory store backends.
//!
//! Primary substrate for tests and local development. Mutations and watcher
//! delivery happen under one lock, so every subscriber observes batches in
//! mutation order with the full document set as of that mutation.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    ChangeBatch, ChangeKind, FieldMap, MediaBlob, MediaRef, MediaStore, MediaStoreError,
    RecordChange, RecordDocument, RecordQuery, RecordStore, RecordStoreError, RecordWatch,
    SortDirection, WatchHandle,
};

/// Record store holding collections as ordered maps of id to fields.
#[derive(Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<RecordState>,
}

#[derive(Default)]
struct RecordState {
    collections: HashMap<String, BTreeMap<String, FieldMap>>,
    watchers: Vec<RecordWatcher>,
}

struct RecordWatcher {
    query: RecordQuery,
    sender: mpsc::UnboundedSender<ChangeBatch>,
    handle: WatchHandle,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordState {
    fn ordered_documents(&self, query: &RecordQuery) -> Vec<RecordDocument> {
        let mut documents: Vec<RecordDocument> = self
            .collections
            .get(&query.collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, fields)| RecordDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        documents.sort_by(|a, b| {
            let ordering = compare_sort_values(
                a.fields.get(&query.order_by),
                b.fields.get(&query.order_by),
            )
            .then_with(|| a.id.cmp(&b.id));
            match query.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
        documents
    }

    /// Fan one change out to every live watcher of the collection, each with
    /// its own view of the full current set.
    fn broadcast(&mut self, collection: &str, change: RecordChange) {
        self.watchers
            .retain(|w| !w.handle.is_cancelled() && !w.sender.is_closed());
        for watcher in self
            .watchers
            .iter()
            .filter(|w| w.query.collection == collection)
        {
            let batch = ChangeBatch {
                changes: vec![change.clone()],
                documents: self.ordered_documents(&watcher.query),
            };
            let _ = watcher.sender.send(batch);
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, collection: &str, fields: FieldMap) -> Result<String, RecordStoreError> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.inner.lock();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields.clone());
        state.broadcast(
            collection,
            RecordChange {
                kind: ChangeKind::Added,
                id: id.clone(),
                document: Some(RecordDocument {
                    id: id.clone(),
                    fields,
                }),
            },
        );
        Ok(id)
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<RecordDocument, RecordStoreError> {
        let state = self.inner.lock();
        state
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|fields| RecordDocument {
                id: id.to_string(),
                fields: fields.clone(),
            })
            .ok_or_else(|| RecordStoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: FieldMap,
    ) -> Result<(), RecordStoreError> {
        let mut state = self.inner.lock();
        let merged = {
            let record = state
                .collections
                .get_mut(collection)
                .and_then(|records| records.get_mut(id))
                .ok_or_else(|| RecordStoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            for (key, value) in fields {
                record.insert(key, value);
            }
            record.clone()
        };
        state.broadcast(
            collection,
            RecordChange {
                kind: ChangeKind::Modified,
                id: id.to_string(),
                document: Some(RecordDocument {
                    id: id.to_string(),
                    fields: merged,
                }),
            },
        );
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RecordStoreError> {
        let mut state = self.inner.lock();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|records| records.remove(id))
            .ok_or_else(|| RecordStoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        state.broadcast(
            collection,
            RecordChange {
                kind: ChangeKind::Removed,
                id: id.to_string(),
                document: Some(RecordDocument {
                    id: id.to_string(),
                    fields: removed,
                }),
            },
        );
        Ok(())
    }

    async fn query_ordered(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<RecordDocument>, RecordStoreError> {
        Ok(self.inner.lock().ordered_documents(query))
    }

    async fn subscribe(&self, query: &RecordQuery) -> Result<RecordWatch, RecordStoreError> {
        let (sender, watch) = RecordWatch::channel();
        let mut state = self.inner.lock();
        let initial = ChangeBatch::initial(state.ordered_documents(query));
        let _ = sender.send(initial);
        state.watchers.push(RecordWatcher {
            query: query.clone(),
            sender,
            handle: watch.handle(),
        });
        Ok(watch)
    }
}

/// Ordering over JSON sort-key values: absent first, then by type rank,
/// numbers numerically, strings lexically.
fn compare_sort_values(
    a: Option<&serde_json::Value>,
    b: Option<&serde_json::Value>,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &serde_json::Value) -> u8 {
    use serde_json::Value;
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

struct StoredMedia {
    bytes: Bytes,
    content_type: String,
}

/// Media store holding objects in a flat keyed map.
#[derive(Default)]
pub struct InMemoryMediaStore {
    objects: Mutex<BTreeMap<String, StoredMedia>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Stored bytes at a path, if any.
    pub fn object_bytes(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().get(path).map(|stored| stored.bytes.clone())
    }

    /// Stored content type at a path, if any.
    pub fn object_content_type(&self, path: &str) -> Option<String> {
        self.objects
            .lock()
            .get(path)
            .map(|stored| stored.content_type.clone())
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn upload(&self, path: &str, blob: MediaBlob) -> Result<MediaRef, MediaStoreError> {
        self.objects.lock().insert(
            path.to_string(),
            StoredMedia {
                bytes: blob.bytes,
                content_type: blob.content_type,
            },
        );
        Ok(MediaRef::new(path))
    }

    async fn fetch_url(&self, media: &MediaRef) -> Result<String, MediaStoreError> {
        if !self.objects.lock().contains_key(media.path()) {
            return Err(MediaStoreError::NotFound {
                path: media.path().to_string(),
            });
        }
        Ok(format!("memory://{}", media.path()))
    }

    async fn delete(&self, path: &str) -> Result<(), MediaStoreError> {
        self.objects
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MediaStoreError::NotFound {
                path: path.to_string(),
            })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, MediaStoreError> {
        let root = prefix.trim_end_matches('/').to_string();
        let child_prefix = format!("{root}/");
        let mut removed = 0u64;
        self.objects.lock().retain(|key, _| {
            let matched = *key == root || key.starts_with(&child_prefix);
            if matched {
                removed += 1;
            }
            !matched
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_fields(author: &str, caption: &str, created_ms: i64) -> FieldMap {
        match serde_json::json!({
            "authorId": author,
            "createdAt": created_ms,
            "caption": caption,
            "likes": []
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn feed_query() -> RecordQuery {
        RecordQuery::descending("posts", "createdAt")
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let store = InMemoryRecordStore::new();
        let id = store
            .create("posts", post_fields("u1", "hello", 100))
            .await
            .unwrap();

        let document = store.fetch("posts", &id).await.unwrap();
        assert_eq!(document.id, id);
        assert_eq!(
            document.fields.get("caption"),
            Some(&serde_json::json!("hello"))
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store.fetch("posts", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = InMemoryRecordStore::new();
        let id = store
            .create("posts", post_fields("u1", "hello", 100))
            .await
            .unwrap();

        let mut patch = FieldMap::new();
        patch.insert("photoUrls".to_string(), serde_json::json!(["https://a"]));
        store.update("posts", &id, patch).await.unwrap();

        let document = store.fetch("posts", &id).await.unwrap();
        assert_eq!(
            document.fields.get("photoUrls"),
            Some(&serde_json::json!(["https://a"]))
        );
        // untouched fields survive the merge
        assert_eq!(
            document.fields.get("caption"),
            Some(&serde_json::json!("hello"))
        );
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store
            .update("posts", "nope", FieldMap::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_then_delete_again() {
        let store = InMemoryRecordStore::new();
        let id = store
            .create("posts", post_fields("u1", "hello", 100))
            .await
            .unwrap();

        store.delete("posts", &id).await.unwrap();
        let err = store.delete("posts", &id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_query_ordered_descending() {
        let store = InMemoryRecordStore::new();
        store
            .create("posts", post_fields("u1", "t3", 300))
            .await
            .unwrap();
        store
            .create("posts", post_fields("u1", "t1", 100))
            .await
            .unwrap();
        store
            .create("posts", post_fields("u1", "t2", 200))
            .await
            .unwrap();

        let documents = store.query_ordered(&feed_query()).await.unwrap();
        let captions: Vec<&serde_json::Value> = documents
            .iter()
            .filter_map(|d| d.fields.get("caption"))
            .collect();
        assert_eq!(
            captions,
            vec![
                &serde_json::json!("t3"),
                &serde_json::json!("t2"),
                &serde_json::json!("t1")
            ]
        );

        let ascending = store
            .query_ordered(&RecordQuery::ascending("posts", "createdAt"))
            .await
            .unwrap();
        assert_eq!(
            ascending.first().and_then(|d| d.fields.get("caption")),
            Some(&serde_json::json!("t1"))
        );
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_snapshot() {
        let store = InMemoryRecordStore::new();
        store
            .create("posts", post_fields("u1", "t1", 100))
            .await
            .unwrap();
        store
            .create("posts", post_fields("u2", "t2", 200))
            .await
            .unwrap();

        let mut watch = store.subscribe(&feed_query()).await.unwrap();
        let initial = watch.next_batch().await.unwrap();
        assert_eq!(initial.changes.len(), 2);
        assert!(initial.changes.iter().all(|c| c.kind == ChangeKind::Added));
        assert_eq!(
            initial.documents[0].fields.get("caption"),
            Some(&serde_json::json!("t2"))
        );
    }

    #[tokio::test]
    async fn test_subscribe_observes_mutations_in_order() {
        let store = InMemoryRecordStore::new();
        let mut watch = store.subscribe(&feed_query()).await.unwrap();
        // empty initial snapshot
        assert!(!watch.next_batch().await.unwrap().has_changes());

        let id = store
            .create("posts", post_fields("u1", "hello", 100))
            .await
            .unwrap();
        let added = watch.next_batch().await.unwrap();
        assert_eq!(added.changes[0].kind, ChangeKind::Added);
        assert_eq!(added.documents.len(), 1);

        let mut patch = FieldMap::new();
        patch.insert("photoUrls".to_string(), serde_json::json!(["https://a"]));
        store.update("posts", &id, patch).await.unwrap();
        let modified = watch.next_batch().await.unwrap();
        assert_eq!(modified.changes[0].kind, ChangeKind::Modified);

        store.delete("posts", &id).await.unwrap();
        let removed = watch.next_batch().await.unwrap();
        assert_eq!(removed.changes[0].kind, ChangeKind::Removed);
        assert!(removed.documents.is_empty());
        // the removed entry still carries the last known fields
        assert!(removed.changes[0].document.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_watcher_receives_nothing() {
        let store = InMemoryRecordStore::new();
        let mut watch = store.subscribe(&feed_query()).await.unwrap();
        watch.handle().unsubscribe();

        store
            .create("posts", post_fields("u1", "hello", 100))
            .await
            .unwrap();
        assert!(watch.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_other_collections_do_not_notify() {
        let store = InMemoryRecordStore::new();
        let mut watch = store.subscribe(&feed_query()).await.unwrap();
        assert!(!watch.next_batch().await.unwrap().has_changes());

        store
            .create("drafts", post_fields("u1", "hidden", 100))
            .await
            .unwrap();
        store
            .create("posts", post_fields("u1", "visible", 200))
            .await
            .unwrap();

        let batch = watch.next_batch().await.unwrap();
        assert_eq!(
            batch.documents[0].fields.get("caption"),
            Some(&serde_json::json!("visible"))
        );
    }

    #[tokio::test]
    async fn test_dropped_watch_does_not_block_mutations() {
        let store = InMemoryRecordStore::new();
        let watch = store.subscribe(&feed_query()).await.unwrap();
        drop(watch);

        store
            .create("posts", post_fields("u1", "hello", 100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_media_upload_and_url() {
        let store = InMemoryMediaStore::new();
        let media = store
            .upload("posts/u1/p1/a.jpg", MediaBlob::new(vec![1u8, 2], "image/jpeg"))
            .await
            .unwrap();

        let url = store.fetch_url(&media).await.unwrap();
        assert_eq!(url, "memory://posts/u1/p1/a.jpg");

        let err = store
            .fetch_url(&MediaRef::new("posts/u1/p1/missing.jpg"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_media_delete() {
        let store = InMemoryMediaStore::new();
        store
            .upload("profiles/u1", MediaBlob::new(vec![1u8], "image/png"))
            .await
            .unwrap();

        store.delete("profiles/u1").await.unwrap();
        let err = store.delete("profiles/u1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_prefix_spares_siblings() {
        let store = InMemoryMediaStore::new();
        for path in [
            "posts/u1/p1/a.jpg",
            "posts/u1/p1/b.jpg",
            "posts/u1/p10/c.jpg",
        ] {
            store
                .upload(path, MediaBlob::new(vec![0u8], "image/jpeg"))
                .await
                .unwrap();
        }

        let removed = store.delete_prefix("posts/u1/p1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(!store.contains("posts/u1/p1/a.jpg"));
        assert!(store.contains("posts/u1/p10/c.jpg"));

        // nothing under the prefix is success, not an error
        assert_eq!(store.delete_prefix("posts/u1/p1").await.unwrap(), 0);
    }
}
