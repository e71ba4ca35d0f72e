//! Store client seams.
//!
//! The engine talks to two backends through these traits: a structured
//! record store (post records, ordered queries, live change subscription)
//! and a binary media store (photo and profile-image objects keyed by
//! hierarchical paths). Backends in this module tree implement both for
//! Postgres/S3 and for in-memory use in tests and local development.

pub mod memory;
pub mod postgres;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// JSON object holding a record's fields.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// A stored record: opaque id plus its current fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDocument {
    pub id: String,
    pub fields: FieldMap,
}

/// What happened to one record within a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One per-record entry in a change batch. `document` carries the record's
/// fields when the backend can supply them (removed entries may not).
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub kind: ChangeKind,
    pub id: String,
    pub document: Option<RecordDocument>,
}

/// A batch of changes to a subscribed query, paired with the full current
/// matching document set in query order. Consumers that rebuild wholesale
/// only need `documents`; `changes` says why the batch fired.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub changes: Vec<RecordChange>,
    pub documents: Vec<RecordDocument>,
}

impl ChangeBatch {
    /// Batch delivered on subscription: every current document tagged added.
    pub fn initial(documents: Vec<RecordDocument>) -> Self {
        let changes = documents
            .iter()
            .map(|document| RecordChange {
                kind: ChangeKind::Added,
                id: document.id.clone(),
                document: Some(document.clone()),
            })
            .collect();
        Self { changes, documents }
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Sort direction for ordered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// An ordered query over one collection, also the shape of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub collection: String,
    pub order_by: String,
    pub direction: SortDirection,
}

impl RecordQuery {
    pub fn descending(collection: impl Into<String>, order_by: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            direction: SortDirection::Descending,
        }
    }

    pub fn ascending(collection: impl Into<String>, order_by: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            direction: SortDirection::Ascending,
        }
    }
}

/// Cancellation handle for a live subscription.
///
/// Cancelling is idempotent: repeated or concurrent calls are safe and do
/// nothing beyond the first.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    token: CancellationToken,
}

impl WatchHandle {
    /// Stop delivery. Batches already queued are discarded, not delivered.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the subscription has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Receiving side of a live subscription.
///
/// Batches arrive in mutation order, one at a time. Dropping the watch
/// implicitly unsubscribes; backends stop delivering once the handle is
/// cancelled or the receiver is gone.
#[derive(Debug)]
pub struct RecordWatch {
    receiver: mpsc::UnboundedReceiver<ChangeBatch>,
    handle: WatchHandle,
}

impl RecordWatch {
    /// Create a watch plus the sender half a store backend delivers into.
    pub fn channel() -> (mpsc::UnboundedSender<ChangeBatch>, RecordWatch) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = WatchHandle {
            token: CancellationToken::new(),
        };
        (sender, RecordWatch { receiver, handle })
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }

    /// Next change batch, or `None` once cancelled or the backend closed
    /// the subscription. Cancellation wins over queued batches.
    pub async fn next_batch(&mut self) -> Option<ChangeBatch> {
        tokio::select! {
            biased;
            _ = self.handle.cancelled() => None,
            batch = self.receiver.recv() => batch,
        }
    }

    /// Consume the watch as a stream of batches. The stream ends when the
    /// backend closes the subscription; callers that also hold the handle
    /// should select against its cancellation.
    pub fn into_stream(self) -> UnboundedReceiverStream<ChangeBatch> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Record store failures.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    /// No record with this id in the collection; often an expected outcome
    /// the caller tolerates.
    #[error("record {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    /// The backing store failed for an infrastructure reason.
    #[error("record store unavailable: {0}")]
    Backend(#[source] anyhow::Error),
}

impl RecordStoreError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Media store failures.
#[derive(Debug, Error)]
pub enum MediaStoreError {
    /// Nothing stored at this path.
    #[error("no media object at {path}")]
    NotFound { path: String },
    /// The backing store failed for an infrastructure reason.
    #[error("media store unavailable: {0}")]
    Backend(#[source] anyhow::Error),
}

impl MediaStoreError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Structured record storage with ordered queries and live change feeds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record from a field map; the store assigns and returns the
    /// opaque record id.
    async fn create(&self, collection: &str, fields: FieldMap) -> Result<String, RecordStoreError>;

    /// Fetch one record by id.
    async fn fetch(&self, collection: &str, id: &str) -> Result<RecordDocument, RecordStoreError>;

    /// Shallow-merge fields into an existing record.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: FieldMap,
    ) -> Result<(), RecordStoreError>;

    /// Remove a record. `NotFound` if it is already absent.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RecordStoreError>;

    /// One-shot fetch of all records in the query's collection, sorted by
    /// the query's order key and direction.
    async fn query_ordered(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<RecordDocument>, RecordStoreError>;

    /// Register a live subscription on a query. The first batch snapshots
    /// the current matching set (every document tagged added); subsequent
    /// batches fire on every mutation of the collection.
    async fn subscribe(&self, query: &RecordQuery) -> Result<RecordWatch, RecordStoreError>;
}

/// Binary content plus its content type, ready for upload.
#[derive(Debug, Clone)]
pub struct MediaBlob {
    pub bytes: Bytes,
    pub content_type: String,
}

impl MediaBlob {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }
}

/// Reference to an uploaded media object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    path: String,
}

impl MediaRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Binary media storage keyed by hierarchical paths.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Upload content to a path, overwriting any existing object.
    async fn upload(&self, path: &str, blob: MediaBlob) -> Result<MediaRef, MediaStoreError>;

    /// Resolve a fetchable URL for an object. `NotFound` if nothing exists
    /// at the referenced path.
    async fn fetch_url(&self, media: &MediaRef) -> Result<String, MediaStoreError>;

    /// Remove the object at an exact path. `NotFound` if absent.
    async fn delete(&self, path: &str) -> Result<(), MediaStoreError>;

    /// Remove every object under a prefix, returning how many were removed.
    /// An empty prefix match removes nothing and is success.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, MediaStoreError>;
}
