//! Realtime ingestion of remote mutations.
//!
//! One task per subscribed collection reads the remote feed, decodes each
//! frame and applies it to the local store through the conflict policy.
//! Applied changes never reach the sync queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::conflict::{ConflictDecision, ConflictPolicy};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::record::Record;
use crate::remote::{RealtimeMessage, RemoteStore};
use crate::status::StatusReporter;
use crate::store::RecordStore;

struct Subscription {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Applies decoded realtime messages to the local store.
struct Applier {
    store: RecordStore,
    policy: Arc<ConflictPolicy>,
    status: Arc<StatusReporter>,
    events: EventBus,
}

impl Applier {
    async fn apply(&self, collection: &str, message: RealtimeMessage) -> Result<Vec<Record>, SyncError> {
        tracing::debug!("Realtime {} on {}", message.kind(), collection);

        let stored = match message {
            RealtimeMessage::Insert { record } | RealtimeMessage::Update { record } => {
                let (decision, stored) = self.store.modify(collection, |records| {
                    match records.iter_mut().find(|r| r.id() == record.id()) {
                        Some(local) => {
                            let decision = self.policy.decide(local, &record);
                            *local = decision.record().clone();
                            Some(decision)
                        }
                        None => {
                            records.push(record);
                            None
                        }
                    }
                })?;

                if let Some(ConflictDecision::Conflict {
                    local,
                    remote,
                    resolved,
                    strategy,
                }) = decision
                {
                    let total = self.status.record_conflict();
                    tracing::info!(
                        "Conflict on {}/{} resolved with {} ({} so far)",
                        collection,
                        resolved.id(),
                        strategy,
                        total
                    );
                    self.events.publish(SyncEvent::ConflictDetected {
                        collection: collection.to_string(),
                        local,
                        remote,
                        resolved,
                        strategy,
                        total,
                    });
                }
                stored
            }
            RealtimeMessage::Delete { id } => {
                let (_, stored) = self
                    .store
                    .modify(collection, |records| records.retain(|r| r.id() != &id))?;
                stored
            }
        };

        self.events.publish(SyncEvent::CollectionUpdated {
            collection: collection.to_string(),
            records: stored.clone(),
        });
        self.status.record_sync();
        self.status.publish().await;

        Ok(stored)
    }
}

/// Per-collection realtime subscriptions.
pub struct RealtimeIngestion {
    remote: Arc<dyn RemoteStore>,
    applier: Arc<Applier>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl RealtimeIngestion {
    pub fn new(
        store: RecordStore,
        remote: Arc<dyn RemoteStore>,
        policy: Arc<ConflictPolicy>,
        status: Arc<StatusReporter>,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            applier: Arc::new(Applier {
                store,
                policy,
                status,
                events,
            }),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the realtime channel for `collection`. Already-subscribed
    /// collections are left as they are.
    pub async fn subscribe(&self, collection: &str) -> Result<(), SyncError> {
        if self.is_subscribed(collection) {
            return Ok(());
        }

        let mut feed = self.remote.subscribe(collection).await?;
        let active = Arc::new(AtomicBool::new(true));

        let task = {
            let active = active.clone();
            let applier = self.applier.clone();
            let collection = collection.to_string();
            tokio::spawn(async move {
                while let Some(text) = feed.recv().await {
                    if !active.load(Ordering::SeqCst) {
                        break;
                    }
                    match RealtimeMessage::decode(&text) {
                        Ok(message) => {
                            if let Err(e) = applier.apply(&collection, message).await {
                                tracing::warn!("Could not apply realtime change to {}: {}", collection, e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Dropping realtime message on {}: {}", collection, e);
                        }
                    }
                }
                tracing::debug!("Realtime feed for {} ended", collection);
            })
        };

        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = subscriptions.insert(collection.to_string(), Subscription { active, task }) {
            // Lost a race with a concurrent subscribe
            previous.active.store(false, Ordering::SeqCst);
            previous.task.abort();
        }

        tracing::info!("Subscribed to realtime changes on {}", collection);
        Ok(())
    }

    pub fn is_subscribed(&self, collection: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(collection)
    }

    /// Applies one message as if it arrived on the channel.
    pub async fn apply_message(
        &self,
        collection: &str,
        message: RealtimeMessage,
    ) -> Result<Vec<Record>, SyncError> {
        self.applier.apply(collection, message).await
    }

    /// Closes every channel. Safe to call repeatedly.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<(String, Subscription)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        if drained.is_empty() {
            return;
        }

        for (_, subscription) in &drained {
            subscription.active.store(false, Ordering::SeqCst);
            subscription.task.abort();
        }
        tracing::info!("Closed {} realtime subscription(s)", drained.len());
    }
}

impl Drop for RealtimeIngestion {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordId;
    use crate::remote::MemoryRemoteStore;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    struct Fixture {
        ingestion: RealtimeIngestion,
        remote: Arc<MemoryRemoteStore>,
        store: RecordStore,
        status: Arc<StatusReporter>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let events = EventBus::new();
        let remote = Arc::new(MemoryRemoteStore::new());
        let store = RecordStore::in_memory();
        let status = Arc::new(StatusReporter::new(None, events.clone()));
        let ingestion = RealtimeIngestion::new(
            store.clone(),
            remote.clone(),
            Arc::new(ConflictPolicy::default()),
            status.clone(),
            events.clone(),
        );
        Fixture {
            ingestion,
            remote,
            store,
            status,
            events,
        }
    }

    async fn wait_for_update(rx: &mut broadcast::Receiver<SyncEvent>, name: &str) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.name() == name {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn conflicts_seen(rx: &mut broadcast::Receiver<SyncEvent>) -> usize {
        let mut seen = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::ConflictDetected { .. }) {
                seen += 1;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_insert_of_unknown_id_is_stored() {
        let f = fixture();
        let stored = f
            .ingestion
            .apply_message(
                "clientes",
                RealtimeMessage::Insert {
                    record: record(json!({"id": "c1", "name": "Ana"})),
                },
            )
            .await
            .unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(f.store.get("clientes").unwrap(), stored);
        assert!(f.status.last_sync_at().is_some());
    }

    #[tokio::test]
    async fn test_update_within_window_is_a_conflict() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.store
            .set("clientes", vec![record(json!({"id": 1, "v": "a", "lastModified": 10_000}))])
            .unwrap();

        f.ingestion
            .apply_message(
                "clientes",
                RealtimeMessage::Update {
                    record: record(json!({"id": 1, "v": "b", "lastModified": 14_000})),
                },
            )
            .await
            .unwrap();

        assert_eq!(conflicts_seen(&mut rx), 1);
        assert_eq!(f.status.conflict_count(), 1);
        let stored = f.store.get("clientes").unwrap();
        assert_eq!(stored[0].get("v"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_update_outside_window_resolves_silently() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.store
            .set("clientes", vec![record(json!({"id": 1, "v": "a", "lastModified": 20_000}))])
            .unwrap();

        f.ingestion
            .apply_message(
                "clientes",
                RealtimeMessage::Update {
                    record: record(json!({"id": 1, "v": "b", "lastModified": 14_000})),
                },
            )
            .await
            .unwrap();

        assert_eq!(conflicts_seen(&mut rx), 0);
        assert_eq!(f.status.conflict_count(), 0);
        // Local is newer and wins
        let stored = f.store.get("clientes").unwrap();
        assert_eq!(stored[0].get("v"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn test_delete_wins_unconditionally() {
        let f = fixture();
        f.store
            .set(
                "clientes",
                vec![
                    record(json!({"id": 7, "v": "edited", "lastModified": 99_999_999})),
                    record(json!({"id": 8})),
                ],
            )
            .unwrap();

        f.ingestion
            .apply_message(
                "clientes",
                RealtimeMessage::Delete {
                    id: RecordId::from("7"),
                },
            )
            .await
            .unwrap();

        let ids: Vec<String> = f
            .store
            .get("clientes")
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["8"]);
    }

    #[tokio::test]
    async fn test_subscription_applies_remote_writes_and_drops_garbage() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.ingestion.subscribe("produtos").await.unwrap();
        f.ingestion.subscribe("produtos").await.unwrap();
        assert!(f.ingestion.is_subscribed("produtos"));

        f.remote.inject_raw("produtos", "{not json");
        f.remote.apply_external(
            "produtos",
            RealtimeMessage::Insert {
                record: record(json!({"id": "p1", "qty": 3})),
            },
        );

        match wait_for_update(&mut rx, "produtosUpdated").await {
            SyncEvent::CollectionUpdated { records, .. } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].get("qty"), Some(&json!(3)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_all_stops_ingestion() {
        let f = fixture();
        f.ingestion.subscribe("produtos").await.unwrap();

        f.ingestion.unsubscribe_all();
        f.ingestion.unsubscribe_all();
        assert!(!f.ingestion.is_subscribed("produtos"));

        f.remote.apply_external(
            "produtos",
            RealtimeMessage::Insert {
                record: record(json!({"id": "p1"})),
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.store.get("produtos").unwrap().is_empty());
    }
}
