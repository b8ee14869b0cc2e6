//! The sync engine: one explicit, constructible owner of the queue, the
//! mirror, realtime subscriptions and the cross-context coordinator.
//!
//! Several engines can run in one process. Engines built on the same
//! [`SharedStorage`] behave like tabs of one application: they see each
//! other's writes through the cross-context coordinator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::conflict::{ConflictPolicy, ConflictStrategy, DEFAULT_CONFLICT_WINDOW};
use crate::cross_tab::CrossTabCoordinator;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::mirror::{CloudMirror, PushReport};
use crate::queue::{OperationKind, QueueItem, SyncQueue};
use crate::realtime::RealtimeIngestion;
use crate::record::{Record, RecordId};
use crate::remote::RemoteStore;
use crate::status::{Connectivity, StatusReporter, SyncStatus};
use crate::store::{RecordStore, SharedStorage};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub strategy: ConflictStrategy,
    pub conflict_window: Duration,
    /// Collections pulled on start and reconnect, and subscribed for realtime.
    pub collections: Vec<String>,
    pub realtime: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            conflict_window: DEFAULT_CONFLICT_WINDOW,
            collections: Vec::new(),
            realtime: true,
        }
    }
}

/// Result of a local write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub collection: String,
    pub operation: OperationKind,
    pub record: Record,
    /// `None` when the write could not be queued; the local write stands.
    pub queued: Option<QueueItem>,
}

#[derive(Debug)]
enum QueueSetup {
    File(PathBuf),
    Memory,
    Disabled,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    storage: SharedStorage,
    remote: Arc<dyn RemoteStore>,
    queue: QueueSetup,
    options: SyncOptions,
}

impl SyncEngineBuilder {
    /// Durable queue at `path` (usually `<data_dir>/queue.db`).
    pub fn queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue = QueueSetup::File(path.into());
        self
    }

    /// Queue that does not survive the process.
    pub fn memory_queue(mut self) -> Self {
        self.queue = QueueSetup::Memory;
        self
    }

    /// Runs without a queue: local writes are never pushed.
    pub fn without_queue(mut self) -> Self {
        self.queue = QueueSetup::Disabled;
        self
    }

    pub fn options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the engine. A queue that cannot be opened is not an error: the
    /// engine degrades to store-only operation and logs it.
    pub async fn build(self) -> SyncEngine {
        let events = EventBus::new();

        let opened = match &self.queue {
            QueueSetup::File(path) => Some(SyncQueue::open(path, events.clone()).await),
            QueueSetup::Memory => Some(SyncQueue::in_memory(events.clone()).await),
            QueueSetup::Disabled => None,
        };
        let queue = match opened {
            Some(Ok(queue)) => Some(Arc::new(queue)),
            Some(Err(e)) => {
                tracing::warn!("Sync queue unavailable, local writes will not be pushed: {}", e);
                None
            }
            None => None,
        };

        let store = self.storage.context();
        let policy = Arc::new(ConflictPolicy::new(
            self.options.strategy,
            self.options.conflict_window,
        ));
        let status = Arc::new(StatusReporter::new(queue.clone(), events.clone()));

        let mirror = CloudMirror::new(
            store.clone(),
            queue.clone(),
            self.remote.clone(),
            policy.clone(),
            status.clone(),
            events.clone(),
        );
        let realtime = RealtimeIngestion::new(
            store.clone(),
            self.remote,
            policy.clone(),
            status.clone(),
            events.clone(),
        );
        let cross_tab = CrossTabCoordinator::new(store.clone(), events.clone());
        cross_tab.watch();

        SyncEngine {
            store,
            queue,
            mirror,
            realtime,
            cross_tab,
            policy,
            status,
            events,
            options: self.options,
            online: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }
}

/// Offline-first sync engine.
pub struct SyncEngine {
    store: RecordStore,
    queue: Option<Arc<SyncQueue>>,
    mirror: CloudMirror,
    realtime: RealtimeIngestion,
    cross_tab: CrossTabCoordinator,
    policy: Arc<ConflictPolicy>,
    status: Arc<StatusReporter>,
    events: EventBus,
    options: SyncOptions,
    online: AtomicBool,
    /// Serialises connectivity transitions.
    transition: Mutex<()>,
}

impl SyncEngine {
    pub fn builder(storage: SharedStorage, remote: Arc<dyn RemoteStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            storage,
            remote,
            queue: QueueSetup::Memory,
            options: SyncOptions::default(),
        }
    }

    /// Starts the engine. When online this drains the queue, pulls every
    /// configured collection and opens realtime channels.
    pub async fn start(&self, online: bool) -> SyncStatus {
        tracing::info!(
            "Starting sync engine ({} collection(s), {})",
            self.options.collections.len(),
            if online { "online" } else { "offline" }
        );
        if online {
            self.set_online(true).await
        } else {
            self.status.set_connectivity(Connectivity::Offline);
            self.status.publish().await
        }
    }

    /// Reports a connectivity change.
    ///
    /// Offline→online: `syncing`, push everything, pull every collection,
    /// subscribe realtime, then `online`. Online→offline closes realtime
    /// channels. Failures are logged; the data stays where it was.
    pub async fn set_online(&self, online: bool) -> SyncStatus {
        let _transition = self.transition.lock().await;

        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            self.reconnect().await;
        } else if !online && was_online {
            tracing::info!("Connectivity lost, deferring sync");
            self.realtime.unsubscribe_all();
            self.status.set_connectivity(Connectivity::Offline);
        }

        self.status.publish().await
    }

    async fn reconnect(&self) {
        tracing::info!("Connectivity restored, synchronizing");
        self.status.set_connectivity(Connectivity::Syncing);
        self.status.publish().await;

        if let Err(e) = self.mirror.push_all().await {
            tracing::warn!("Push on reconnect incomplete: {}", e);
        }
        if let Err(e) = self.mirror.pull_all(&self.options.collections).await {
            tracing::warn!("Pull on reconnect incomplete: {}", e);
        }

        if self.options.realtime {
            for collection in &self.options.collections {
                if let Err(e) = self.realtime.subscribe(collection).await {
                    tracing::warn!("Realtime subscription for {} failed: {}", collection, e);
                }
            }
        }

        self.status.set_connectivity(Connectivity::Online);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn list(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        self.store.get(collection)
    }

    pub fn find(&self, collection: &str, id: &RecordId) -> Result<Option<Record>, SyncError> {
        self.store.find(collection, id)
    }

    /// Adds a record, replacing any record with the same id.
    pub async fn create(&self, collection: &str, record: Record) -> Result<WriteReceipt, SyncError> {
        self.write(collection, OperationKind::Create, record, false).await
    }

    /// Updates the fields given in `patch`; other fields keep their values.
    /// An unknown id is inserted.
    pub async fn update(&self, collection: &str, patch: Record) -> Result<WriteReceipt, SyncError> {
        self.write(collection, OperationKind::Update, patch, true).await
    }

    /// Stores `record` as is: a create when the id is new, an update otherwise.
    pub async fn put(&self, collection: &str, record: Record) -> Result<WriteReceipt, SyncError> {
        let operation = match self.store.find(collection, record.id())? {
            Some(_) => OperationKind::Update,
            None => OperationKind::Create,
        };
        self.write(collection, operation, record, false).await
    }

    pub async fn delete(&self, collection: &str, id: &RecordId) -> Result<WriteReceipt, SyncError> {
        let (removed, stored) = self.store.modify(collection, |records| {
            let pos = records.iter().position(|r| r.id() == id);
            pos.map(|pos| records.remove(pos))
        })?;

        let payload = Record::with_id(id);
        let queued = self.enqueue(OperationKind::Delete, collection, payload.clone()).await;
        self.after_write(collection, stored).await;

        Ok(WriteReceipt {
            collection: collection.to_string(),
            operation: OperationKind::Delete,
            record: removed.unwrap_or(payload),
            queued,
        })
    }

    async fn write(
        &self,
        collection: &str,
        operation: OperationKind,
        mut record: Record,
        patch: bool,
    ) -> Result<WriteReceipt, SyncError> {
        let now = Utc::now();
        record.touch(now);

        let (written, stored) = self.store.modify(collection, |records| {
            match records.iter_mut().find(|r| r.id() == record.id()) {
                Some(existing) if patch => {
                    for (field, value) in record.fields() {
                        // `id` is equal by construction
                        let _ = existing.set(field, value.clone());
                    }
                    existing.touch(now);
                    existing.clone()
                }
                Some(existing) => {
                    *existing = record.clone();
                    record
                }
                None => {
                    records.push(record.clone());
                    record
                }
            }
        })?;

        let queued = self.enqueue(operation, collection, written.clone()).await;
        self.after_write(collection, stored).await;

        Ok(WriteReceipt {
            collection: collection.to_string(),
            operation,
            record: written,
            queued,
        })
    }

    /// Queues a mutation. A failure is logged and never undoes the local
    /// write.
    async fn enqueue(
        &self,
        operation: OperationKind,
        collection: &str,
        payload: Record,
    ) -> Option<QueueItem> {
        let queue = self.queue.as_ref()?;
        match queue.enqueue(operation, collection, payload).await {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Could not queue {} on {}: {}", operation, collection, e);
                None
            }
        }
    }

    async fn after_write(&self, collection: &str, stored: Vec<Record>) {
        self.events.publish(SyncEvent::CollectionUpdated {
            collection: collection.to_string(),
            records: stored,
        });
        self.status.publish().await;

        if self.is_online() {
            if let Err(e) = self.mirror.push(collection).await {
                tracing::debug!("Deferred push of {}: {}", collection, e);
            }
        }
    }

    pub async fn push(&self, collection: &str) -> Result<PushReport, SyncError> {
        self.mirror.push(collection).await
    }

    pub async fn push_all(&self) -> Result<PushReport, SyncError> {
        self.mirror.push_all().await
    }

    pub async fn pull(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        self.mirror.pull(collection).await
    }

    /// Pulls every configured collection.
    pub async fn pull_all(&self) -> Result<usize, SyncError> {
        self.mirror.pull_all(&self.options.collections).await
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.snapshot().await
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.policy.strategy()
    }

    pub fn set_strategy(&self, strategy: ConflictStrategy) {
        self.policy.set_strategy(strategy);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn queue(&self) -> Option<&Arc<SyncQueue>> {
        self.queue.as_ref()
    }

    pub fn realtime(&self) -> &RealtimeIngestion {
        &self.realtime
    }

    pub fn cross_tab(&self) -> &CrossTabCoordinator {
        &self.cross_tab
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Closes realtime channels and stops cross-context delivery.
    pub fn shutdown(&self) {
        self.realtime.unsubscribe_all();
        self.cross_tab.stop();
        tracing::info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemoteStore, RealtimeMessage};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn options(realtime: bool) -> SyncOptions {
        SyncOptions {
            collections: vec!["clientes".to_string(), "produtos".to_string()],
            realtime,
            ..SyncOptions::default()
        }
    }

    async fn engine(remote: Arc<MemoryRemoteStore>, realtime: bool) -> SyncEngine {
        SyncEngine::builder(SharedStorage::in_memory(), remote)
            .memory_queue()
            .options(options(realtime))
            .build()
            .await
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_offline_create_then_reconnect() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote.clone(), false).await;
        engine.start(false).await;

        let receipt = engine
            .create("clientes", record(json!({"id": "c1", "name": "Ana"})))
            .await
            .unwrap();
        assert!(receipt.queued.is_some());
        assert_eq!(engine.status().await.pending_count, 1);
        assert!(remote.records("clientes").is_empty());

        let status = engine.set_online(true).await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.connectivity, Connectivity::Online);
        assert!(status.last_sync_at.is_some());

        assert_eq!(remote.records("clientes").len(), 1);
        let local = engine
            .find("clientes", &RecordId::from("c1"))
            .unwrap()
            .unwrap();
        assert_eq!(local.get("name"), Some(&json!("Ana")));
    }

    #[tokio::test]
    async fn test_online_write_is_pushed_immediately() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote.clone(), false).await;
        engine.start(true).await;

        engine
            .put("produtos", record(json!({"id": "p1", "qty": 1})))
            .await
            .unwrap();
        assert_eq!(engine.status().await.pending_count, 0);
        assert_eq!(remote.records("produtos").len(), 1);

        let receipt = engine
            .delete("produtos", &RecordId::from("p1"))
            .await
            .unwrap();
        assert_eq!(receipt.operation, OperationKind::Delete);
        assert!(remote.records("produtos").is_empty());
        assert!(engine.list("produtos").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_keeps_local_write_and_queue() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote.clone(), false).await;
        engine.start(true).await;

        remote.set_offline(true);
        engine
            .create("clientes", record(json!({"id": "c1"})))
            .await
            .unwrap();

        assert_eq!(engine.list("clientes").unwrap().len(), 1);
        assert_eq!(engine.status().await.pending_count, 1);
    }

    #[tokio::test]
    async fn test_put_and_update_semantics() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote, false).await;

        let first = engine
            .put("clientes", record(json!({"id": 1, "name": "Ana", "phone": "555"})))
            .await
            .unwrap();
        assert_eq!(first.operation, OperationKind::Create);

        let patched = engine
            .update("clientes", record(json!({"id": 1, "name": "Ana Maria"})))
            .await
            .unwrap();
        assert_eq!(patched.operation, OperationKind::Update);
        assert_eq!(patched.record.get("phone"), Some(&json!("555")));
        assert_eq!(patched.record.get("name"), Some(&json!("Ana Maria")));

        let replaced = engine
            .put("clientes", record(json!({"id": "1", "name": "Bia"})))
            .await
            .unwrap();
        assert_eq!(replaced.operation, OperationKind::Update);
        assert!(replaced.record.get("phone").is_none());

        assert_eq!(engine.list("clientes").unwrap().len(), 1);
        assert_eq!(engine.status().await.pending_count, 3);
    }

    #[tokio::test]
    async fn test_unusable_queue_degrades_to_store_only() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let engine = SyncEngine::builder(
            SharedStorage::json_files(temp_dir.path().join("data")),
            Arc::new(MemoryRemoteStore::new()),
        )
        .queue_path(blocker.join("queue.db"))
        .build()
        .await;

        assert!(engine.queue().is_none());
        let receipt = engine
            .create("clientes", record(json!({"id": "c1"})))
            .await
            .unwrap();
        assert!(receipt.queued.is_none());
        assert_eq!(engine.list("clientes").unwrap().len(), 1);
        assert_eq!(engine.status().await.pending_count, 0);
    }

    #[tokio::test]
    async fn test_engines_on_shared_storage_see_each_other() {
        let storage = SharedStorage::in_memory();
        let remote = Arc::new(MemoryRemoteStore::new());
        let tab_a = SyncEngine::builder(storage.clone(), remote.clone()).build().await;
        let tab_b = SyncEngine::builder(storage, remote).build().await;
        let mut events_b = tab_b.subscribe_events();

        tab_a
            .create("clientes", record(json!({"id": "c1"})))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let SyncEvent::CollectionUpdated { collection, records } =
                    events_b.recv().await.unwrap()
                {
                    return (collection, records.len());
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, ("clientes".to_string(), 1));
        assert_eq!(tab_b.list("clientes").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_independent_engines_do_not_interfere() {
        let a = engine(Arc::new(MemoryRemoteStore::new()), false).await;
        let b = engine(Arc::new(MemoryRemoteStore::new()), false).await;

        a.create("clientes", record(json!({"id": "c1"})))
            .await
            .unwrap();
        a.set_strategy(ConflictStrategy::Merge);

        assert!(b.list("clientes").unwrap().is_empty());
        assert_eq!(b.status().await.pending_count, 0);
        assert_eq!(b.strategy(), ConflictStrategy::LastWriteWins);
    }

    #[tokio::test]
    async fn test_realtime_changes_reach_local_store() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote.clone(), true).await;
        engine.start(true).await;
        assert!(engine.realtime().is_subscribed("clientes"));

        remote.apply_external(
            "clientes",
            RealtimeMessage::Insert {
                record: record(json!({"id": "r1", "name": "remote"})),
            },
        );
        wait_until(|| engine.list("clientes").unwrap().len() == 1).await;

        engine.set_online(false).await;
        assert!(!engine.realtime().is_subscribed("clientes"));
        assert_eq!(engine.status().await.connectivity, Connectivity::Offline);

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_start_pulls_configured_collections() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote
            .upsert_many("produtos", &[record(json!({"id": "p1"})), record(json!({"id": "p2"}))])
            .await
            .unwrap();

        let engine = engine(remote, false).await;
        let status = engine.start(true).await;
        assert_eq!(status.connectivity, Connectivity::Online);
        assert_eq!(engine.list("produtos").unwrap().len(), 2);
        assert!(engine.list("clientes").unwrap().is_empty());
    }
}
