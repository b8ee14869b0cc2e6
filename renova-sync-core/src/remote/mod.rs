//! Remote (authoritative) store interface.
//!
//! Writes are idempotent by id: resending an already-applied batch leaves the
//! remote unchanged. The cloud mirror relies on this when it retries a batch
//! after a partial failure.

mod http;
mod memory;

pub use http::{check_server, HttpRemoteStore};
pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::record::{Record, RecordId};

/// Buffered inbound realtime frames per subscription.
pub(crate) const FEED_BUFFER: usize = 256;

/// Operations the sync core needs from the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts or replaces records by id.
    async fn upsert_many(&self, collection: &str, records: &[Record]) -> Result<(), SyncError>;

    async fn delete_one(&self, collection: &str, id: &RecordId) -> Result<(), SyncError>;

    /// Full authoritative contents of a collection.
    async fn select_all(&self, collection: &str) -> Result<Vec<Record>, SyncError>;

    /// Opens the push channel for one collection.
    async fn subscribe(&self, collection: &str) -> Result<RemoteFeed, SyncError>;
}

/// Raw realtime frames for one collection.
///
/// Frames are delivered undecoded so that the consumer decides what to do
/// with malformed ones. Dropping the feed closes the underlying channel.
#[derive(Debug)]
pub struct RemoteFeed {
    receiver: mpsc::Receiver<String>,
    pump: Option<JoinHandle<()>>,
}

impl RemoteFeed {
    /// Wraps a receiver fed by `pump`, which is aborted with the feed.
    pub fn new(receiver: mpsc::Receiver<String>, pump: Option<JoinHandle<()>>) -> Self {
        Self { receiver, pump }
    }

    /// Next frame, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for RemoteFeed {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Realtime message pushed by the remote for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RealtimeMessage {
    Insert { record: Record },
    Update { record: Record },
    Delete { id: RecordId },
}

impl RealtimeMessage {
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::MalformedMessage(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::MalformedMessage(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeMessage::Insert { .. } => "insert",
            RealtimeMessage::Update { .. } => "update",
            RealtimeMessage::Delete { .. } => "delete",
        }
    }
}
