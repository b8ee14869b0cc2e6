//! In-process remote store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use super::{RealtimeMessage, RemoteFeed, RemoteStore, FEED_BUFFER};
use crate::error::SyncError;
use crate::record::{Record, RecordId};

/// Remote store kept in memory, with the same semantics as the HTTP server.
///
/// Every write is fanned out to subscribers of the collection. Failures can
/// be injected with [`set_offline`](Self::set_offline) and
/// [`set_rejecting`](Self::set_rejecting).
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    tables: Mutex<HashMap<String, BTreeMap<RecordId, Record>>>,
    hubs: Mutex<HashMap<String, broadcast::Sender<String>>>,
    offline: AtomicBool,
    rejecting: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `TransportFailure` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes fail with `RemoteRejected` while rejecting.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Current contents of a collection, ordered by id.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends a raw frame to the collection's subscribers without touching
    /// the table.
    pub fn inject_raw(&self, collection: &str, text: impl Into<String>) {
        let _ = self.hub(collection).send(text.into());
    }

    /// Applies a change as if another client made it: the table is updated
    /// and subscribers are notified.
    pub fn apply_external(&self, collection: &str, message: RealtimeMessage) {
        {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let table = tables.entry(collection.to_string()).or_default();
            match &message {
                RealtimeMessage::Insert { record } | RealtimeMessage::Update { record } => {
                    table.insert(record.id().clone(), record.clone());
                }
                RealtimeMessage::Delete { id } => {
                    table.remove(id);
                }
            }
        }
        self.fan_out(collection, &message);
    }

    fn hub(&self, collection: &str) -> broadcast::Sender<String> {
        self.hubs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(FEED_BUFFER).0)
            .clone()
    }

    fn fan_out(&self, collection: &str, message: &RealtimeMessage) {
        match message.encode() {
            Ok(text) => {
                let _ = self.hub(collection).send(text);
            }
            Err(e) => tracing::warn!("Could not encode realtime message: {}", e),
        }
    }

    fn check_online(&self) -> Result<(), SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::TransportFailure("remote unreachable".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        self.check_online()?;
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteRejected("write rejected by remote".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert_many(&self, collection: &str, records: &[Record]) -> Result<(), SyncError> {
        self.check_writable()?;

        let mut messages = Vec::with_capacity(records.len());
        {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let table = tables.entry(collection.to_string()).or_default();
            for record in records {
                let previous = table.insert(record.id().clone(), record.clone());
                messages.push(match previous {
                    Some(_) => RealtimeMessage::Update {
                        record: record.clone(),
                    },
                    None => RealtimeMessage::Insert {
                        record: record.clone(),
                    },
                });
            }
        }

        for message in &messages {
            self.fan_out(collection, message);
        }
        Ok(())
    }

    async fn delete_one(&self, collection: &str, id: &RecordId) -> Result<(), SyncError> {
        self.check_writable()?;

        let removed = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(collection)
            .and_then(|table| table.remove(id));

        if removed.is_some() {
            self.fan_out(collection, &RealtimeMessage::Delete { id: id.clone() });
        }
        Ok(())
    }

    async fn select_all(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        self.check_online()?;
        Ok(self.records(collection))
    }

    async fn subscribe(&self, collection: &str) -> Result<RemoteFeed, SyncError> {
        self.check_online()?;

        let mut hub = self.hub(collection).subscribe();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);

        let pump = tokio::spawn(async move {
            loop {
                match hub.recv().await {
                    Ok(text) => {
                        if tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Realtime subscriber lagged by {} message(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(RemoteFeed::new(rx, Some(pump)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    async fn next_message(feed: &mut RemoteFeed) -> RealtimeMessage {
        let text = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap()
            .unwrap();
        RealtimeMessage::decode(&text).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_id() {
        let remote = MemoryRemoteStore::new();
        let batch = vec![
            record(json!({"id": "c1", "name": "Ana"})),
            record(json!({"id": "c2", "name": "Bia"})),
        ];

        remote.upsert_many("clientes", &batch).await.unwrap();
        remote.upsert_many("clientes", &batch).await.unwrap();

        assert_eq!(remote.select_all("clientes").await.unwrap(), batch);
    }

    #[tokio::test]
    async fn test_delete_missing_id_is_ok() {
        let remote = MemoryRemoteStore::new();
        remote
            .delete_one("clientes", &RecordId::from("nope"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = MemoryRemoteStore::new();

        remote.set_rejecting(true);
        assert!(matches!(
            remote.upsert_many("clientes", &[]).await,
            Err(SyncError::RemoteRejected(_))
        ));
        assert!(remote.select_all("clientes").await.is_ok());

        remote.set_offline(true);
        assert!(matches!(
            remote.select_all("clientes").await,
            Err(SyncError::TransportFailure(_))
        ));
        assert!(remote.subscribe("clientes").await.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_receive_writes() {
        let remote = MemoryRemoteStore::new();
        let mut feed = remote.subscribe("produtos").await.unwrap();

        remote
            .upsert_many("produtos", &[record(json!({"id": "p1"}))])
            .await
            .unwrap();
        remote
            .upsert_many("produtos", &[record(json!({"id": "p1", "qty": 2}))])
            .await
            .unwrap();
        remote
            .delete_one("produtos", &RecordId::from("p1"))
            .await
            .unwrap();

        assert_eq!(next_message(&mut feed).await.kind(), "insert");
        assert_eq!(next_message(&mut feed).await.kind(), "update");
        assert_eq!(
            next_message(&mut feed).await,
            RealtimeMessage::Delete {
                id: RecordId::from("p1")
            }
        );
    }

    #[tokio::test]
    async fn test_inject_raw_does_not_touch_table() {
        let remote = MemoryRemoteStore::new();
        let mut feed = remote.subscribe("clientes").await.unwrap();

        remote.inject_raw("clientes", "garbage");
        let text = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "garbage");
        assert!(remote.records("clientes").is_empty());
    }
}
