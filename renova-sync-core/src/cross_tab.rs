//! Propagation of local-store changes between contexts sharing one storage.
//!
//! A change written by one context reaches every *other* context. Changes
//! received here are only reported (listeners + `<collection>Updated`), never
//! written again, so two coordinators cannot ping-pong.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::record::Record;
use crate::store::{ContextId, RecordStore, StorageChange};

/// In-process listener for changes made by sibling contexts.
pub type ChangeListener = Arc<dyn Fn(&str, &[Record]) + Send + Sync>;

struct Inner {
    context: ContextId,
    events: EventBus,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Inner {
    /// Returns `false` for changes that originated in this context.
    fn on_remote_change(&self, change: &StorageChange) -> bool {
        if change.origin == self.context {
            return false;
        }

        tracing::debug!(
            "Collection {} changed in context {}",
            change.collection,
            change.origin
        );

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(&change.collection, &change.records);
        }

        self.events.publish(SyncEvent::CollectionUpdated {
            collection: change.collection.clone(),
            records: change.records.clone(),
        });
        true
    }
}

/// Cross-context coordinator for one [`RecordStore`] context.
pub struct CrossTabCoordinator {
    store: RecordStore,
    inner: Arc<Inner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabCoordinator {
    pub fn new(store: RecordStore, events: EventBus) -> Self {
        let inner = Arc::new(Inner {
            context: store.context_id(),
            events,
            listeners: Mutex::new(Vec::new()),
        });
        Self {
            store,
            inner,
            watcher: Mutex::new(None),
        }
    }

    /// Writes `records` to the shared storage; sibling contexts are notified.
    pub fn broadcast(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Record>, SyncError> {
        self.store.set(collection, records)
    }

    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &[Record]) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Handles a change notification directly. Own-context changes are
    /// ignored; returns whether the change was delivered.
    pub fn on_remote_change(&self, change: &StorageChange) -> bool {
        self.inner.on_remote_change(change)
    }

    /// Starts delivering sibling changes. Calling it again is a no-op.
    pub fn watch(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }

        let mut changes = self.store.subscribe_changes();
        let inner = self.inner.clone();
        *watcher = Some(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        inner.on_remote_change(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} cross-context change(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for CrossTabCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
