//! Photofeed Feed Engine
//!
//! Client-core engine for the Photofeed social app. It keeps a live,
//! newest-first snapshot of the home feed synchronized against a record
//! store and coordinates the post lifecycle: two-phase publishing of posts
//! with photos into a media store, author-only deletion, and best-effort
//! profile image resolution.
//!
//! ## Features
//!
//! - **Live Feed Synchronization**: ordered bulk load on start, then a full
//!   feed rebuild from every change batch the record store delivers
//! - **Two-Phase Publishing**: metadata-only record first, photos uploaded
//!   under paths derived from the assigned record id, URL list patched on
//!   at the end
//! - **Author-Only Deletion**: confirmation-gated, record-first delete that
//!   sweeps the post's whole media namespace afterwards
//! - **Pluggable Backends**: PostgreSQL/JSONB with LISTEN/NOTIFY change
//!   feeds and S3 presigned URLs in production, in-memory stores for tests
//!
//! ## Architecture
//!
//! ```text
//!                     ordered load + change batches
//! ┌────────────────┐ ───────────────────────────────▶ ┌────────────────┐
//! │  Record Store  │                                  │     Feed       │
//! │ (Postgres JSONB│ ◀─────────────────────────────── │  Synchronizer  │──▶ watch::Receiver<Feed>
//! │  or in-memory) │      subscribe / unsubscribe     └────────────────┘
//! └────────────────┘
//!     ▲        ▲
//!     │        │ create record, patch photoUrls
//!     │        │                          upload photos, resolve URLs
//!     │   ┌────────────────┐ ──────────────────────▶ ┌────────────────┐
//!     │   │ Post Publisher │                         │  Media Store   │
//!     │   └────────────────┘                         │ (S3 or         │
//!     │                                              │  in-memory)    │
//!     │ delete record                                └────────────────┘
//!     │                                                      ▲
//! ┌────────────────┐        delete media namespace           │
//! │ Post Lifecycle │ ───────────────────────────────────────┘
//! └────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use feed_engine::{Config, FeedSynchronizer, PostgresRecordStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let records = Arc::new(PostgresRecordStore::connect(&config.database).await?);
//!     let feed = FeedSynchronizer::new(records, config.feed.collection.clone());
//!
//!     let mut updates = feed.watch();
//!     feed.start().await?;
//!     while updates.changed().await.is_ok() {
//!         let snapshot = updates.borrow().clone();
//!         println!("{} posts ({:?})", snapshot.posts.len(), snapshot.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod feed;
pub mod lifecycle;
pub mod model;
pub mod paths;
pub mod publish;
pub mod store;

pub use config::{Config, DatabaseConfig, FeedConfig, MediaConfig};
pub use feed::{Feed, FeedError, FeedStatus, FeedSubscription, FeedSynchronizer};
pub use lifecycle::{Confirmation, DeleteOutcome, LifecycleError, PostLifecycle};
pub use model::{
    Author, NewPhoto, PhotoPayload, Post, PostDecodeError, PostDraft, PostFields, PostId, UserId,
};
pub use publish::{PostPublisher, PostStub, PublishError};
pub use store::memory::{InMemoryMediaStore, InMemoryRecordStore};
pub use store::postgres::PostgresRecordStore;
pub use store::s3::S3MediaStore;
pub use store::{
    ChangeBatch, ChangeKind, FieldMap, MediaBlob, MediaRef, MediaStore, MediaStoreError,
    RecordChange, RecordDocument, RecordQuery, RecordStore, RecordStoreError, RecordWatch,
    SortDirection, WatchHandle,
};
