//! Typed notification bus consumed by the UI layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::conflict::ConflictStrategy;
use crate::record::Record;
use crate::status::{Connectivity, SyncStatus};

/// Events are dropped for listeners that fall this far behind.
const EVENT_BUFFER: usize = 256;

/// Notifications produced by the sync core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The sync queue changed.
    #[serde(rename_all = "camelCase")]
    QueueChanged { pending_count: u64 },

    /// Composite status snapshot, built with [`SyncEvent::status_updated`].
    #[serde(rename_all = "camelCase")]
    StatusUpdated {
        last_sync: Option<DateTime<Utc>>,
        conflict_count: u64,
        queue_count: u64,
        connectivity: Connectivity,
    },

    /// Two versions of a record were edited within the conflict window.
    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        collection: String,
        local: Record,
        remote: Record,
        resolved: Record,
        strategy: ConflictStrategy,
        total: u64,
    },

    /// A collection's contents changed, whatever the origin of the change.
    #[serde(rename_all = "camelCase")]
    CollectionUpdated {
        collection: String,
        records: Vec<Record>,
    },
}

impl SyncEvent {
    pub fn status_updated(status: &SyncStatus) -> Self {
        SyncEvent::StatusUpdated {
            last_sync: status.last_sync_at,
            conflict_count: status.conflict_count,
            queue_count: status.pending_count,
            connectivity: status.connectivity,
        }
    }

    /// UI-facing event name, e.g. `queueChanged` or `clientesUpdated`.
    pub fn name(&self) -> String {
        match self {
            SyncEvent::QueueChanged { .. } => "queueChanged".to_string(),
            SyncEvent::StatusUpdated { .. } => "statusUpdated".to_string(),
            SyncEvent::ConflictDetected { .. } => "conflictDetected".to_string(),
            SyncEvent::CollectionUpdated { collection, .. } => format!("{}Updated", collection),
        }
    }
}

/// Process-wide publish/subscribe channel for [`SyncEvent`]s.
///
/// Cloning the bus shares the channel; every subscriber sees every event
/// published after it subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        tracing::trace!("event {}", event.name());
        // No listeners is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
