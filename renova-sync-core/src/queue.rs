//! Durable, ordered queue of local mutations awaiting the remote store.
//!
//! Items live in a SQLite database (`queue.db` in the data directory). An
//! item stays pending until the remote acknowledges it, after which it is
//! marked synced and becomes eligible for [`SyncQueue::compact`].

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::record::Record;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    /// Parse from the stored name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending (or acknowledged) local mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub operation: OperationKind,
    pub collection: String,
    pub payload: Record,
    pub enqueued_at: DateTime<Utc>,
    pub synced: bool,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    operation: String,
    collection: String,
    payload: String,
    enqueued_at: String,
    synced: bool,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = SyncError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| {
            SyncError::StorageUnavailable(format!("corrupt queue item {}: {}", row.id, what))
        };

        let operation = OperationKind::parse(&row.operation).ok_or_else(|| corrupt("operation"))?;
        let payload: Record =
            serde_json::from_str(&row.payload).map_err(|e| corrupt(&e.to_string()))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&row.enqueued_at)
            .map_err(|e| corrupt(&e.to_string()))?
            .with_timezone(&Utc);

        Ok(QueueItem {
            id: row.id,
            operation,
            collection: row.collection,
            payload,
            enqueued_at,
            synced: row.synced,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, operation, collection, payload, enqueued_at, synced FROM sync_queue";

/// The sync queue. Sole writer of pending-operation records.
#[derive(Debug)]
pub struct SyncQueue {
    pool: SqlitePool,
    events: EventBus,
}

impl SyncQueue {
    /// Opens (or creates) the queue database at `path` and applies migrations.
    pub async fn open(path: &Path, events: EventBus) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::StorageUnavailable(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, events).await
    }

    /// A queue that lives only as long as the process. Used by tests and by
    /// engines that do not need durability.
    pub async fn in_memory(events: EventBus) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, events).await
    }

    async fn with_pool(pool: SqlitePool, events: EventBus) -> Result<Self, SyncError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, events })
    }

    /// Appends a mutation to the queue and emits `queueChanged`.
    pub async fn enqueue(
        &self,
        operation: OperationKind,
        collection: &str,
        payload: Record,
    ) -> Result<QueueItem, SyncError> {
        let item = QueueItem {
            id: format!("sync-{}", Uuid::new_v4()),
            operation,
            collection: collection.to_string(),
            payload,
            enqueued_at: Utc::now(),
            synced: false,
        };

        let payload_json = serde_json::to_string(&item.payload)
            .map_err(|e| SyncError::InvalidRecord(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (id, seq, operation, collection, payload, enqueued_at, synced)
            VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_queue), ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&item.id)
        .bind(item.operation.as_str())
        .bind(&item.collection)
        .bind(&payload_json)
        .bind(item.enqueued_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Enqueued {} {} for {} ({})",
            item.operation,
            item.payload.id(),
            item.collection,
            item.id
        );

        self.notify_changed().await;
        Ok(item)
    }

    /// All pending items, in enqueue order.
    pub async fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        let rows: Vec<QueueRow> =
            sqlx::query_as(&format!("{} WHERE synced = 0 ORDER BY seq", SELECT_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    /// Pending items for one collection, in enqueue order.
    pub async fn list_pending_for(&self, collection: &str) -> Result<Vec<QueueItem>, SyncError> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{} WHERE synced = 0 AND collection = ? ORDER BY seq",
            SELECT_COLUMNS
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    /// Marks one item as synced.
    ///
    /// Idempotent: returns `false` without error if the item was already
    /// synced or does not exist.
    pub async fn mark_synced(&self, item_id: &str) -> Result<bool, SyncError> {
        let changed = self.mark_synced_many(&[item_id.to_string()]).await?;
        Ok(changed > 0)
    }

    /// Marks a batch of items as synced in one transaction.
    pub async fn mark_synced_many(&self, item_ids: &[String]) -> Result<u64, SyncError> {
        if item_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for id in item_ids {
            let result = sqlx::query("UPDATE sync_queue SET synced = 1 WHERE id = ? AND synced = 0")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;

        if changed > 0 {
            self.notify_changed().await;
        }
        Ok(changed)
    }

    pub async fn pending_count(&self) -> Result<u64, SyncError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE synced = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Deletes items that were already acknowledged.
    pub async fn compact(&self) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE synced = 1")
            .execute(&self.pool)
            .await?;
        tracing::debug!("Compacted {} synced queue item(s)", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Marks every pending item as synced without sending it.
    ///
    /// Escape hatch for batches the remote keeps rejecting; the next full
    /// pull brings local data back in line with the remote.
    pub async fn clear(&self) -> Result<u64, SyncError> {
        let result = sqlx::query("UPDATE sync_queue SET synced = 1 WHERE synced = 0")
            .execute(&self.pool)
            .await?;
        tracing::warn!("Discarded {} pending queue item(s)", result.rows_affected());
        if result.rows_affected() > 0 {
            self.notify_changed().await;
        }
        Ok(result.rows_affected())
    }

    async fn notify_changed(&self) {
        match self.pending_count().await {
            Ok(pending_count) => self
                .events
                .publish(SyncEvent::QueueChanged { pending_count }),
            Err(e) => tracing::warn!("Could not count pending queue items: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    async fn memory_queue() -> SyncQueue {
        SyncQueue::in_memory(EventBus::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_list_in_order() {
        let queue = memory_queue().await;

        for n in 0..3 {
            queue
                .enqueue(OperationKind::Create, "clientes", record(json!({"id": n})))
                .await
                .unwrap();
        }
        queue
            .enqueue(OperationKind::Update, "produtos", record(json!({"id": "p1"})))
            .await
            .unwrap();

        let pending = queue.list_pending().await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|i| i.payload.id().as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "p1"]);
        assert!(pending.iter().all(|i| !i.synced));
        assert!(pending[0].id.starts_with("sync-"));

        let clientes = queue.list_pending_for("clientes").await.unwrap();
        assert_eq!(clientes.len(), 3);
        assert_eq!(queue.pending_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_enqueue_emits_queue_changed() {
        let events = EventBus::new();
        let queue = SyncQueue::in_memory(events.clone()).await.unwrap();
        let mut rx = events.subscribe();

        queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "c1"})))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::QueueChanged { pending_count: 1 }
        );
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let queue = memory_queue().await;
        let a = queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "a"})))
            .await
            .unwrap();
        queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "b"})))
            .await
            .unwrap();

        assert!(queue.mark_synced(&a.id).await.unwrap());
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        assert!(!queue.mark_synced(&a.id).await.unwrap());
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        assert!(!queue.mark_synced("sync-unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_compact_removes_only_synced() {
        let queue = memory_queue().await;
        let a = queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "a"})))
            .await
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, "clientes", record(json!({"id": "b"})))
            .await
            .unwrap();

        queue.mark_synced(&a.id).await.unwrap();
        assert_eq!(queue.compact().await.unwrap(), 1);

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OperationKind::Delete);
    }

    #[tokio::test]
    async fn test_clear_marks_everything_synced() {
        let queue = memory_queue().await;
        for n in 0..2 {
            queue
                .enqueue(OperationKind::Update, "caixa", record(json!({"id": n})))
                .await
                .unwrap();
        }
        assert_eq!(queue.clear().await.unwrap(), 2);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("queue.db");

        {
            let queue = SyncQueue::open(&path, EventBus::new()).await.unwrap();
            queue
                .enqueue(
                    OperationKind::Create,
                    "clientes",
                    record(json!({"id": "c1", "name": "Ana"})),
                )
                .await
                .unwrap();
        }

        let queue = SyncQueue::open(&path, EventBus::new()).await.unwrap();
        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].collection, "clientes");
        assert_eq!(pending[0].payload.get("name"), Some(&json!("Ana")));
    }

    #[test]
    fn test_operation_kind_parse() {
        for kind in [OperationKind::Create, OperationKind::Update, OperationKind::Delete] {
            assert_eq!(OperationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OperationKind::parse("upsert"), None);
    }
}
