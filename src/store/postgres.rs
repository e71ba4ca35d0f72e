//! PostgreSQL record store.
//!
//! Records live as JSONB documents in one `records` table keyed by
//! `(collection, id)`. A row trigger announces every mutation on the
//! `record_changes` NOTIFY channel; subscriptions LISTEN there and re-read
//! the ordered collection on each matching notification, so subscribers get
//! the same full-snapshot batches the in-memory store produces.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    ChangeBatch, ChangeKind, FieldMap, RecordChange, RecordDocument, RecordQuery, RecordStore,
    RecordStoreError, RecordWatch, SortDirection, WatchHandle,
};
use crate::config::DatabaseConfig;

/// NOTIFY channel the records trigger announces mutations on.
const NOTIFY_CHANNEL: &str = "record_changes";

/// Record store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Connect a pool, optionally running migrations per the config.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RecordStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")
            .map_err(RecordStoreError::backend)?;

        info!("Connected to PostgreSQL record store");

        let store = Self { pool };
        if config.run_migrations {
            store.run_migrations().await?;
        }
        Ok(store)
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<(), RecordStoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")
            .map_err(RecordStoreError::backend)?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Re-read loop behind a subscription: initial snapshot, then one batch
    /// per matching notification until cancelled or the channel closes.
    async fn pump_changes(
        self,
        mut listener: PgListener,
        query: RecordQuery,
        sender: mpsc::UnboundedSender<ChangeBatch>,
        handle: WatchHandle,
    ) -> anyhow::Result<()> {
        let documents = self.query_ordered(&query).await?;
        if sender.send(ChangeBatch::initial(documents)).is_err() {
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;
                _ = handle.cancelled() => {
                    debug!(collection = %query.collection, "record subscription cancelled");
                    break;
                }
                notification = listener.try_recv() => {
                    // try_recv, not recv: recv reconnects silently and drops
                    // notifications issued while the connection was down,
                    // leaving the feed live over stale posts. Ok(None) is the
                    // connection-lost signal; end the stream and let the
                    // caller decide whether to re-subscribe.
                    let notification = notification
                        .context("record change listener failed")?
                        .ok_or_else(|| {
                            anyhow::anyhow!("record change listener connection lost")
                        })?;
                    let Some(event) = parse_change_payload(notification.payload()) else {
                        warn!(
                            payload = %notification.payload(),
                            "ignoring unparseable record change notification"
                        );
                        continue;
                    };
                    if event.collection != query.collection {
                        continue;
                    }

                    let documents = self.query_ordered(&query).await?;
                    let document = documents.iter().find(|d| d.id == event.id).cloned();
                    let change = RecordChange {
                        kind: event.kind(),
                        id: event.id,
                        document,
                    };
                    if sender
                        .send(ChangeBatch {
                            changes: vec![change],
                            documents,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, fields), fields(collection = %collection))]
    async fn create(&self, collection: &str, fields: FieldMap) -> Result<String, RecordStoreError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO records (collection, id, fields) VALUES ($1, $2, $3)")
            .bind(collection)
            .bind(&id)
            .bind(serde_json::Value::Object(fields))
            .execute(&self.pool)
            .await
            .context("Failed to insert record")
            .map_err(RecordStoreError::backend)?;

        debug!(collection = %collection, id = %id, "Record created");
        Ok(id)
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<RecordDocument, RecordStoreError> {
        let row = sqlx::query("SELECT fields FROM records WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query record")
            .map_err(RecordStoreError::backend)?;

        let row = row.ok_or_else(|| RecordStoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        let fields: serde_json::Value = row
            .try_get("fields")
            .context("Failed to read record fields")
            .map_err(RecordStoreError::backend)?;
        document_from_fields(id.to_string(), fields)
    }

    #[instrument(skip(self, fields), fields(collection = %collection, id = %id))]
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: FieldMap,
    ) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            "UPDATE records SET fields = fields || $3, updated_at = now() \
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::Value::Object(fields))
        .execute(&self.pool)
        .await
        .context("Failed to update record")
        .map_err(RecordStoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(RecordStoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(collection = %collection, id = %id))]
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RecordStoreError> {
        let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete record")
            .map_err(RecordStoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(RecordStoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        debug!(collection = %collection, id = %id, "Record deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_ordered(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<RecordDocument>, RecordStoreError> {
        let rows = sqlx::query(ordered_select_sql(query.direction))
            .bind(&query.collection)
            .bind(&query.order_by)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query ordered records")
            .map_err(RecordStoreError::backend)?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("id")
                .context("Failed to read record id")
                .map_err(RecordStoreError::backend)?;
            let fields: serde_json::Value = row
                .try_get("fields")
                .context("Failed to read record fields")
                .map_err(RecordStoreError::backend)?;
            documents.push(document_from_fields(id, fields)?);
        }
        Ok(documents)
    }

    #[instrument(skip(self), fields(collection = %query.collection))]
    async fn subscribe(&self, query: &RecordQuery) -> Result<RecordWatch, RecordStoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("Failed to open change listener")
            .map_err(RecordStoreError::backend)?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .context("Failed to listen on change channel")
            .map_err(RecordStoreError::backend)?;

        let (sender, watch) = RecordWatch::channel();
        let handle = watch.handle();
        let store = self.clone();
        let query = query.clone();
        tokio::spawn(async move {
            let collection = query.collection.clone();
            if let Err(error) = store.pump_changes(listener, query, sender, handle).await {
                warn!(
                    collection = %collection,
                    error = %error,
                    "record change listener terminated"
                );
            }
        });

        Ok(watch)
    }
}

/// Ordered select with the sort key as a bound parameter. Absent keys sort
/// last on descending reads and first on ascending, matching the in-memory
/// store's comparator.
fn ordered_select_sql(direction: SortDirection) -> &'static str {
    match direction {
        SortDirection::Descending => {
            "SELECT id, fields FROM records WHERE collection = $1 \
             ORDER BY fields->($2::text) DESC NULLS LAST, id DESC"
        }
        SortDirection::Ascending => {
            "SELECT id, fields FROM records WHERE collection = $1 \
             ORDER BY fields->($2::text) ASC NULLS FIRST, id ASC"
        }
    }
}

fn document_from_fields(
    id: String,
    fields: serde_json::Value,
) -> Result<RecordDocument, RecordStoreError> {
    match fields {
        serde_json::Value::Object(fields) => Ok(RecordDocument { id, fields }),
        other => Err(RecordStoreError::backend(anyhow::anyhow!(
            "record {id} holds non-object fields: {other}"
        ))),
    }
}

/// Payload of one `record_changes` notification.
#[derive(Debug, Deserialize, PartialEq)]
struct ChangeNotification {
    collection: String,
    id: String,
    op: String,
}

impl ChangeNotification {
    fn kind(&self) -> ChangeKind {
        match self.op.as_str() {
            "INSERT" => ChangeKind::Added,
            "DELETE" => ChangeKind::Removed,
            // UPDATE, plus anything a newer trigger might emit: a rebuild is
            // always safe, so default to modified.
            _ => ChangeKind::Modified,
        }
    }
}

fn parse_change_payload(payload: &str) -> Option<ChangeNotification> {
    serde_json::from_str(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_change_payload() {
        let event =
            parse_change_payload(r#"{"collection":"posts","id":"p1","op":"INSERT"}"#).unwrap();
        assert_eq!(event.collection, "posts");
        assert_eq!(event.id, "p1");
        assert_eq!(event.kind(), ChangeKind::Added);

        assert!(parse_change_payload("not json").is_none());
        assert!(parse_change_payload(r#"{"collection":"posts"}"#).is_none());
    }

    #[test]
    fn test_op_to_change_kind() {
        for (op, kind) in [
            ("INSERT", ChangeKind::Added),
            ("UPDATE", ChangeKind::Modified),
            ("DELETE", ChangeKind::Removed),
            ("TRUNCATE", ChangeKind::Modified),
        ] {
            let event = ChangeNotification {
                collection: "posts".to_string(),
                id: "p1".to_string(),
                op: op.to_string(),
            };
            assert_eq!(event.kind(), kind, "op {op}");
        }
    }

    #[test]
    fn test_ordered_select_sql() {
        let descending = ordered_select_sql(SortDirection::Descending);
        assert!(descending.contains("DESC NULLS LAST"));
        assert!(descending.contains("id DESC"));

        let ascending = ordered_select_sql(SortDirection::Ascending);
        assert!(ascending.contains("ASC NULLS FIRST"));
    }

    #[test]
    fn test_document_from_fields_rejects_non_objects() {
        let document =
            document_from_fields("p1".to_string(), serde_json::json!({"caption": "hi"})).unwrap();
        assert_eq!(document.id, "p1");

        let err = document_from_fields("p2".to_string(), serde_json::json!(42)).unwrap_err();
        assert!(!err.is_not_found());
    }
}
