//! Cloud mirror: drains the sync queue to the remote store and refreshes
//! local collections from it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::conflict::{resolve_list, ConflictPolicy};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::queue::{OperationKind, QueueItem, SyncQueue};
use crate::record::{Record, RecordId};
use crate::remote::RemoteStore;
use crate::status::StatusReporter;
use crate::store::RecordStore;

/// What one drain sent to the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Queue items marked synced, including superseded ones.
    pub acknowledged: u64,
}

impl PushReport {
    fn absorb(&mut self, other: PushReport) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.acknowledged += other.acknowledged;
    }
}

/// Net effect of all pending items for one record id.
#[derive(Debug)]
struct PendingChange {
    operation: OperationKind,
    payload: Record,
    item_ids: Vec<String>,
}

/// Collapses pending items per record id; the last operation wins.
fn coalesce(items: Vec<QueueItem>) -> Vec<PendingChange> {
    let mut index: HashMap<RecordId, usize> = HashMap::new();
    let mut changes: Vec<PendingChange> = Vec::new();

    for item in items {
        match index.get(item.payload.id()) {
            Some(&pos) => {
                let change = &mut changes[pos];
                change.operation = item.operation;
                change.payload = item.payload;
                change.item_ids.push(item.id);
            }
            None => {
                index.insert(item.payload.id().clone(), changes.len());
                changes.push(PendingChange {
                    operation: item.operation,
                    payload: item.payload,
                    item_ids: vec![item.id],
                });
            }
        }
    }

    changes
}

/// Bidirectional bridge between the local store and the remote store.
pub struct CloudMirror {
    store: RecordStore,
    queue: Option<Arc<SyncQueue>>,
    remote: Arc<dyn RemoteStore>,
    policy: Arc<ConflictPolicy>,
    status: Arc<StatusReporter>,
    events: EventBus,
    /// Serialises drains so a batch is never in flight twice.
    drain: Mutex<()>,
}

impl CloudMirror {
    pub fn new(
        store: RecordStore,
        queue: Option<Arc<SyncQueue>>,
        remote: Arc<dyn RemoteStore>,
        policy: Arc<ConflictPolicy>,
        status: Arc<StatusReporter>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            policy,
            status,
            events,
            drain: Mutex::new(()),
        }
    }

    /// Sends every pending item of `collection` to the remote.
    ///
    /// Upserts go out as one batch stamped with `syncedAt`, deletes one by
    /// one. Items are marked synced only after the remote accepted them; on
    /// failure they stay pending for the next trigger.
    pub async fn push(&self, collection: &str) -> Result<PushReport, SyncError> {
        let Some(queue) = &self.queue else {
            return Ok(PushReport::default());
        };

        let _drain = self.drain.lock().await;

        let pending = queue.list_pending_for(collection).await?;
        if pending.is_empty() {
            return Ok(PushReport::default());
        }

        let result = self.send(queue, collection, coalesce(pending)).await;
        match &result {
            Ok(report) => {
                tracing::info!(
                    "Pushed {}: {} upserted, {} deleted",
                    collection,
                    report.upserted,
                    report.deleted
                );
                self.status.record_sync();
            }
            Err(e) if e.is_transient() => {
                tracing::info!("Push of {} deferred, items stay pending: {}", collection, e)
            }
            Err(e) => tracing::warn!(
                "Push of {} refused, items stay pending until fixed: {}",
                collection,
                e
            ),
        }

        self.status.publish().await;
        result
    }

    async fn send(
        &self,
        queue: &SyncQueue,
        collection: &str,
        changes: Vec<PendingChange>,
    ) -> Result<PushReport, SyncError> {
        let now = Utc::now();
        let mut report = PushReport::default();
        let mut batch = Vec::new();
        let mut batch_ids = Vec::new();
        let mut deletes = Vec::new();

        for change in changes {
            if change.operation == OperationKind::Delete {
                deletes.push(change);
            } else {
                let mut record = change.payload;
                record.stamp_synced_at(now);
                batch.push(record);
                batch_ids.extend(change.item_ids);
            }
        }

        if !batch.is_empty() {
            self.remote.upsert_many(collection, &batch).await?;
            report.upserted = batch.len();
            report.acknowledged += queue.mark_synced_many(&batch_ids).await?;
        }

        for change in deletes {
            self.remote.delete_one(collection, change.payload.id()).await?;
            report.deleted += 1;
            report.acknowledged += queue.mark_synced_many(&change.item_ids).await?;
        }

        Ok(report)
    }

    /// Drains every collection that has pending items.
    ///
    /// A failing collection does not stop the others; the first error is
    /// returned after all were attempted.
    pub async fn push_all(&self) -> Result<PushReport, SyncError> {
        let Some(queue) = &self.queue else {
            return Ok(PushReport::default());
        };

        let mut collections: Vec<String> = Vec::new();
        for item in queue.list_pending().await? {
            if !collections.contains(&item.collection) {
                collections.push(item.collection);
            }
        }

        let mut total = PushReport::default();
        let mut first_error = None;
        for collection in collections {
            match self.push(&collection).await {
                Ok(report) => total.absorb(report),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Replaces the local collection with the remote snapshot.
    ///
    /// Local mutations still waiting in the queue are laid over the snapshot
    /// with the active conflict strategy so a pull never discards unsent
    /// work. The local write does not go through the queue. If the remote
    /// call fails, nothing local changes.
    pub async fn pull(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        let remote_records = match self.remote.select_all(collection).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Pull of {} failed, local data unchanged: {}", collection, e);
                self.status.publish().await;
                return Err(e);
            }
        };

        let pending = match &self.queue {
            Some(queue) => queue.list_pending_for(collection).await.unwrap_or_else(|e| {
                tracing::warn!("Could not read pending items for {}: {}", collection, e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut unsent = Vec::new();
        let mut deleted: HashSet<RecordId> = HashSet::new();
        for change in coalesce(pending) {
            if change.operation == OperationKind::Delete {
                deleted.insert(change.payload.id().clone());
            } else {
                unsent.push(change.payload);
            }
        }

        let mut records = resolve_list(&unsent, &remote_records, self.policy.strategy());
        records.retain(|r| !deleted.contains(r.id()));

        let stored = self.store.set(collection, records)?;
        tracing::info!("Pulled {} record(s) into {}", stored.len(), collection);

        self.events.publish(SyncEvent::CollectionUpdated {
            collection: collection.to_string(),
            records: stored.clone(),
        });
        self.status.record_sync();
        self.status.publish().await;

        Ok(stored)
    }

    /// Pulls each collection; failures are logged and the first is returned.
    pub async fn pull_all(&self, collections: &[String]) -> Result<usize, SyncError> {
        let mut pulled = 0;
        let mut first_error = None;
        for collection in collections {
            match self.pull(collection).await {
                Ok(_) => pulled += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(pulled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    struct Fixture {
        mirror: CloudMirror,
        remote: Arc<MemoryRemoteStore>,
        queue: Arc<SyncQueue>,
        store: RecordStore,
        status: Arc<StatusReporter>,
    }

    async fn fixture() -> Fixture {
        let events = EventBus::new();
        let queue = Arc::new(SyncQueue::in_memory(events.clone()).await.unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let store = RecordStore::in_memory();
        let status = Arc::new(StatusReporter::new(Some(queue.clone()), events.clone()));
        let mirror = CloudMirror::new(
            store.clone(),
            Some(queue.clone()),
            remote.clone(),
            Arc::new(ConflictPolicy::default()),
            status.clone(),
            events,
        );
        Fixture {
            mirror,
            remote,
            queue,
            store,
            status,
        }
    }

    #[test]
    fn test_coalesce_keeps_last_operation() {
        let item = |id: &str, op, rid: &str| QueueItem {
            id: id.to_string(),
            operation: op,
            collection: "clientes".to_string(),
            payload: Record::with_id(&RecordId::from(rid)),
            enqueued_at: Utc::now(),
            synced: false,
        };

        let changes = coalesce(vec![
            item("q1", OperationKind::Create, "a"),
            item("q2", OperationKind::Create, "b"),
            item("q3", OperationKind::Update, "a"),
            item("q4", OperationKind::Delete, "b"),
        ]);

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].operation, OperationKind::Update);
        assert_eq!(changes[0].item_ids, vec!["q1", "q3"]);
        assert_eq!(changes[1].operation, OperationKind::Delete);
        assert_eq!(changes[1].item_ids, vec!["q2", "q4"]);
    }

    #[tokio::test]
    async fn test_push_sends_batch_and_marks_synced() {
        let f = fixture().await;
        f.queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "c1", "name": "Ana"})))
            .await
            .unwrap();
        f.queue
            .enqueue(OperationKind::Update, "clientes", record(json!({"id": "c1", "name": "Ana Maria"})))
            .await
            .unwrap();
        f.queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "c2", "name": "Bia"})))
            .await
            .unwrap();

        let report = f.mirror.push("clientes").await.unwrap();
        assert_eq!(
            report,
            PushReport {
                upserted: 2,
                deleted: 0,
                acknowledged: 3
            }
        );

        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
        assert!(f.status.last_sync_at().is_some());

        let remote = f.remote.records("clientes");
        assert_eq!(remote.len(), 2);
        assert_eq!(remote[0].get("name"), Some(&json!("Ana Maria")));
        assert!(remote.iter().all(|r| r.get("syncedAt").is_some()));
    }

    #[tokio::test]
    async fn test_push_failure_keeps_items_pending() {
        let f = fixture().await;
        for n in 0..3 {
            f.queue
                .enqueue(OperationKind::Create, "produtos", record(json!({"id": n})))
                .await
                .unwrap();
        }
        let before = f.queue.pending_count().await.unwrap();

        f.remote.set_offline(true);
        assert!(matches!(
            f.mirror.push("produtos").await,
            Err(SyncError::TransportFailure(_))
        ));
        assert_eq!(f.queue.pending_count().await.unwrap(), before);

        f.remote.set_offline(false);
        f.remote.set_rejecting(true);
        assert!(matches!(
            f.mirror.push("produtos").await,
            Err(SyncError::RemoteRejected(_))
        ));
        assert_eq!(f.queue.pending_count().await.unwrap(), before);
        assert!(f.status.last_sync_at().is_none());

        f.remote.set_rejecting(false);
        f.mirror.push("produtos").await.unwrap();
        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
        assert_eq!(f.remote.records("produtos").len(), 3);
    }

    #[tokio::test]
    async fn test_push_sends_deletes_individually() {
        let f = fixture().await;
        f.remote
            .upsert_many("clientes", &[record(json!({"id": 7})), record(json!({"id": 8}))])
            .await
            .unwrap();

        f.queue
            .enqueue(OperationKind::Delete, "clientes", Record::with_id(&RecordId::from("7")))
            .await
            .unwrap();

        let report = f.mirror.push("clientes").await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.upserted, 0);

        let ids: Vec<String> = f
            .remote
            .records("clientes")
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["8"]);
    }

    #[tokio::test]
    async fn test_push_all_covers_every_collection() {
        let f = fixture().await;
        f.queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "c1"})))
            .await
            .unwrap();
        f.queue
            .enqueue(OperationKind::Create, "vendas", record(json!({"id": "v1"})))
            .await
            .unwrap();

        let report = f.mirror.push_all().await.unwrap();
        assert_eq!(report.upserted, 2);
        assert_eq!(f.remote.records("clientes").len(), 1);
        assert_eq!(f.remote.records("vendas").len(), 1);
    }

    #[tokio::test]
    async fn test_pull_replaces_local_without_enqueueing() {
        let f = fixture().await;
        f.store
            .set("clientes", vec![record(json!({"id": "stale"}))])
            .unwrap();
        f.remote
            .upsert_many("clientes", &[record(json!({"id": "c1"})), record(json!({"id": "c2"}))])
            .await
            .unwrap();

        let pulled = f.mirror.pull("clientes").await.unwrap();
        assert_eq!(pulled.len(), 2);
        assert_eq!(f.store.get("clientes").unwrap(), pulled);
        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
        assert!(f.status.last_sync_at().is_some());
    }

    #[tokio::test]
    async fn test_pull_keeps_unsent_local_changes() {
        let f = fixture().await;
        f.remote
            .upsert_many(
                "clientes",
                &[
                    record(json!({"id": "c1", "name": "old", "lastModified": 100})),
                    record(json!({"id": "c2", "name": "gone"})),
                ],
            )
            .await
            .unwrap();

        f.queue
            .enqueue(
                OperationKind::Update,
                "clientes",
                record(json!({"id": "c1", "name": "new", "lastModified": 200})),
            )
            .await
            .unwrap();
        f.queue
            .enqueue(OperationKind::Create, "clientes", record(json!({"id": "c3"})))
            .await
            .unwrap();
        f.queue
            .enqueue(OperationKind::Delete, "clientes", Record::with_id(&RecordId::from("c2")))
            .await
            .unwrap();

        let pulled = f.mirror.pull("clientes").await.unwrap();
        let ids: Vec<&str> = pulled.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert_eq!(pulled[0].get("name"), Some(&json!("new")));
        assert_eq!(f.queue.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pull_failure_leaves_local_untouched() {
        let f = fixture().await;
        let local = vec![record(json!({"id": "c1", "name": "Ana"}))];
        f.store.set("clientes", local.clone()).unwrap();

        f.remote.set_offline(true);
        assert!(f.mirror.pull("clientes").await.is_err());
        assert_eq!(f.store.get("clientes").unwrap(), local);
        assert!(f.status.last_sync_at().is_none());
    }

    #[tokio::test]
    async fn test_queueless_push_is_noop() {
        let events = EventBus::new();
        let mirror = CloudMirror::new(
            RecordStore::in_memory(),
            None,
            Arc::new(MemoryRemoteStore::new()),
            Arc::new(ConflictPolicy::default()),
            Arc::new(StatusReporter::new(None, events.clone())),
            events,
        );
        assert_eq!(mirror.push_all().await.unwrap(), PushReport::default());
    }
}
