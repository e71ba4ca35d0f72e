//! Feed synchronization.
//!
//! The synchronizer owns the ordered post collection. `start` installs one
//! bulk-loaded snapshot, then a spawned task consumes the record store's
//! live change batches and rebuilds the collection wholesale from each
//! batch's full document set. Rebuilding from scratch on every batch trades
//! redundant work for ordering correctness; feeds are small. Observers read
//! point-in-time snapshots or follow a watch channel.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::model::{Post, CREATED_AT_FIELD};
use crate::store::{
    ChangeBatch, RecordDocument, RecordQuery, RecordStore, RecordStoreError, RecordWatch,
};

/// Observable feed state: the ordered posts plus liveness status.
#[derive(Debug, Clone, Default)]
pub struct Feed {
    /// Posts sorted descending by creation time.
    pub posts: Vec<Post>,
    pub status: FeedStatus,
}

/// Liveness of the feed's backing subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedStatus {
    /// Never started, or stopped by the caller.
    #[default]
    Offline,
    /// Live subscription active; the feed tracks the record store.
    Live,
    /// The live subscription ended on a backend failure. The synchronizer
    /// does not retry; callers recover by calling `start` again.
    Unavailable,
}

/// Feed synchronization failures.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(#[source] RecordStoreError),
}

/// Handle to a running live subscription.
#[derive(Debug, Clone)]
pub struct FeedSubscription {
    token: Arc<CancellationToken>,
}

impl FeedSubscription {
    /// Stop the live subscription. Safe to call twice or concurrently;
    /// repeated cancellation has no further effect. Cancelling a
    /// subscription that `start` has since replaced is a no-op.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The currently active subscription's token, shared with its loop task so
/// a superseded loop can tell it no longer owns the feed status.
type ActiveToken = Arc<Mutex<Option<Arc<CancellationToken>>>>;

/// Owns the in-memory feed and keeps it synchronized with the record store.
pub struct FeedSynchronizer<R> {
    records: Arc<R>,
    query: RecordQuery,
    state: Arc<watch::Sender<Feed>>,
    active: ActiveToken,
}

impl<R: RecordStore> FeedSynchronizer<R> {
    pub fn new(records: Arc<R>, collection: impl Into<String>) -> Self {
        let (state, _) = watch::channel(Feed::default());
        Self {
            records,
            query: RecordQuery::descending(collection, CREATED_AT_FIELD),
            state: Arc::new(state),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Current feed snapshot.
    pub fn feed(&self) -> Feed {
        self.state.borrow().clone()
    }

    /// Follow the feed; the receiver sees every rebuild and status change.
    pub fn watch(&self) -> watch::Receiver<Feed> {
        self.state.subscribe()
    }

    /// Bulk-load the collection, install it, and go live. Calling `start`
    /// while already live replaces the previous subscription.
    #[instrument(skip(self), fields(collection = %self.query.collection))]
    pub async fn start(&self) -> Result<FeedSubscription, FeedError> {
        let documents = self
            .records
            .query_ordered(&self.query)
            .await
            .map_err(FeedError::Unavailable)?;
        let posts = decode_feed(&documents);
        info!(posts = posts.len(), "Initial feed loaded");
        metrics::gauge!("feed.posts").set(posts.len() as f64);
        self.state.send_replace(Feed {
            posts,
            status: FeedStatus::Live,
        });

        let subscription = self
            .records
            .subscribe(&self.query)
            .await
            .map_err(|error| {
                // the snapshot was already published as Live; a feed with no
                // subscription behind it must not keep advertising liveness
                self.state
                    .send_modify(|feed| feed.status = FeedStatus::Unavailable);
                FeedError::Unavailable(error)
            })?;

        let token = Arc::new(CancellationToken::new());
        if let Some(previous) = self.active.lock().replace(token.clone()) {
            previous.cancel();
        }

        let state = self.state.clone();
        let active = self.active.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            run_feed_loop(subscription, state, active, task_token).await;
        });

        Ok(FeedSubscription { token })
    }

    /// Cancel the live subscription, if any, and mark the feed offline.
    /// Safe to call before `start` and safe to call twice.
    pub fn stop(&self) {
        if let Some(token) = self.active.lock().take() {
            token.cancel();
        }
        mark_offline(&self.state);
    }
}

/// Consume change batches until cancelled or the backend closes the stream.
///
/// Only the loop that still holds the active token may change the feed
/// status on exit; a loop superseded by a later `start` leaves quietly.
async fn run_feed_loop(
    subscription: RecordWatch,
    state: Arc<watch::Sender<Feed>>,
    active: ActiveToken,
    token: Arc<CancellationToken>,
) {
    let watch_handle = subscription.handle();
    let mut batches = subscription.into_stream();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                watch_handle.unsubscribe();
                if clear_if_current(&active, &token) {
                    mark_offline(&state);
                }
                debug!("feed subscription stopped");
                break;
            }
            batch = batches.next() => {
                match batch {
                    Some(batch) if batch.has_changes() => apply_batch(&state, batch),
                    Some(_) => {}
                    None => {
                        watch_handle.unsubscribe();
                        if clear_if_current(&active, &token) {
                            warn!("live feed subscription closed by the record store");
                            state.send_modify(|feed| feed.status = FeedStatus::Unavailable);
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Clear the active slot if it still holds this loop's token. Returns
/// whether the loop was the current subscription.
fn clear_if_current(active: &ActiveToken, token: &Arc<CancellationToken>) -> bool {
    let mut active = active.lock();
    if active
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, token))
    {
        *active = None;
        true
    } else {
        false
    }
}

fn mark_offline(state: &watch::Sender<Feed>) {
    state.send_if_modified(|feed| {
        if feed.status == FeedStatus::Offline {
            false
        } else {
            feed.status = FeedStatus::Offline;
            true
        }
    });
}

/// Rebuild the whole collection from the batch's current document set.
/// Added, modified and removed entries all take this path, so insertion
/// position and stale entries never need special handling.
fn apply_batch(state: &watch::Sender<Feed>, batch: ChangeBatch) {
    let posts = decode_feed(&batch.documents);
    metrics::counter!("feed.rebuilds").increment(1);
    metrics::gauge!("feed.posts").set(posts.len() as f64);
    debug!(
        changes = batch.changes.len(),
        posts = posts.len(),
        "Feed rebuilt from change batch"
    );
    state.send_modify(|feed| feed.posts = posts);
}

/// Decode raw documents into the ordered feed. Undecodable records are
/// skipped with a warning, duplicate ids collapse to the first occurrence,
/// and the result is sorted descending by `(createdAt, id)` regardless of
/// input order.
fn decode_feed(documents: &[RecordDocument]) -> Vec<Post> {
    let mut seen = HashSet::new();
    let mut posts = Vec::with_capacity(documents.len());
    for document in documents {
        if !seen.insert(document.id.clone()) {
            warn!(id = %document.id, "duplicate record id in snapshot");
            continue;
        }
        match Post::from_document(document) {
            Ok(post) => posts.push(post),
            Err(error) => {
                warn!(error = %error, "skipping undecodable post record");
                metrics::counter!("feed.decode_failures").increment(1);
            }
        }
    }
    posts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.as_str().cmp(a.id.as_str()))
    });
    posts
}
