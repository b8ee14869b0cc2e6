//! Realtime fan-out of table changes to connected WebSocket clients.

use renova_sync_core::RealtimeMessage;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Messages buffered per collection before slow clients start lagging.
const CHANNEL_BUFFER: usize = 64;

/// Broadcast channels keyed by collection.
pub struct RealtimeHub {
    channels: RwLock<HashMap<String, broadcast::Sender<RealtimeMessage>>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to changes of one collection.
    pub async fn subscribe(&self, collection: &str) -> broadcast::Receiver<RealtimeMessage> {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(collection) {
            sender.subscribe()
        } else {
            let (sender, receiver) = broadcast::channel(CHANNEL_BUFFER);
            channels.insert(collection.to_string(), sender);
            receiver
        }
    }

    /// Sends a change to every subscriber of the collection.
    pub async fn broadcast(&self, collection: &str, message: RealtimeMessage) {
        let channels = self.channels.read().await;

        if let Some(sender) = channels.get(collection) {
            // No subscribers is fine
            let _ = sender.send(message);
        }
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renova_sync_core::RecordId;

    #[tokio::test]
    async fn test_subscribe_and_broadcast() {
        let hub = RealtimeHub::new();
        let mut rx = hub.subscribe("crm_clientes").await;

        hub.broadcast(
            "crm_clientes",
            RealtimeMessage::Delete {
                id: RecordId::from("c1"),
            },
        )
        .await;

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.kind(), "delete");
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let hub = RealtimeHub::new();
        let mut clientes = hub.subscribe("crm_clientes").await;
        let mut caixa = hub.subscribe("crm_caixa").await;

        hub.broadcast(
            "crm_clientes",
            RealtimeMessage::Delete {
                id: RecordId::from("c1"),
            },
        )
        .await;

        assert!(clientes.try_recv().is_ok());
        assert!(caixa.try_recv().is_err());
    }
}
