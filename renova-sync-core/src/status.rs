//! Aggregated sync status for UI consumption.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, SyncEvent};
use crate::queue::SyncQueue;

/// Connectivity as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
    Syncing,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Online => write!(f, "online"),
            Connectivity::Offline => write!(f, "offline"),
            Connectivity::Syncing => write!(f, "syncing"),
        }
    }
}

/// Derived sync state. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub conflict_count: u64,
    pub connectivity: Connectivity,
}

/// Combines queue depth, last sync time and conflict counters.
///
/// Holds only counters; pending count is always read from the queue.
#[derive(Debug)]
pub struct StatusReporter {
    queue: Option<Arc<SyncQueue>>,
    events: EventBus,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    conflicts: AtomicU64,
    connectivity: Mutex<Connectivity>,
}

impl StatusReporter {
    pub fn new(queue: Option<Arc<SyncQueue>>, events: EventBus) -> Self {
        Self {
            queue,
            events,
            last_sync_at: Mutex::new(None),
            conflicts: AtomicU64::new(0),
            connectivity: Mutex::new(Connectivity::Offline),
        }
    }

    /// Records a successful exchange with the remote.
    pub fn record_sync(&self) {
        *self.last_sync_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// Counts a detected conflict and returns the running total.
    pub fn record_conflict(&self) -> u64 {
        self.conflicts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        *self.connectivity.lock().unwrap_or_else(PoisonError::into_inner) = connectivity;
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recomputes the status from scratch.
    pub async fn snapshot(&self) -> SyncStatus {
        let pending_count = match &self.queue {
            Some(queue) => queue.pending_count().await.unwrap_or_else(|e| {
                tracing::debug!("Pending count unavailable: {}", e);
                0
            }),
            None => 0,
        };

        SyncStatus {
            pending_count,
            last_sync_at: self.last_sync_at(),
            conflict_count: self.conflict_count(),
            connectivity: self.connectivity(),
        }
    }

    /// Recomputes the status and emits `statusUpdated`.
    pub async fn publish(&self) -> SyncStatus {
        let status = self.snapshot().await;
        self.events.publish(SyncEvent::status_updated(&status));
        status
    }
}
