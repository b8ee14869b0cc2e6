use clap::{Args, Subcommand};
use renova_sync_core::SyncEngine;

use super::{CommandError, OutputFormat};

/// Inspect and maintain the sync queue
#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List pending changes
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete changes the server already acknowledged
    Compact,

    /// Drop every pending change without sending it
    Clear,
}

impl QueueCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), CommandError> {
        let queue = engine.queue().ok_or_else(|| {
            CommandError::InvalidInput("sync queue is unavailable in this data directory".into())
        })?;

        match &self.command {
            QueueSubcommand::List { format } => {
                let pending = queue.list_pending().await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&pending)?);
                    }
                    OutputFormat::Text => {
                        if pending.is_empty() {
                            println!("Queue is empty.");
                        }
                        for item in &pending {
                            println!(
                                "{}  {:<6} {}/{}  {}",
                                item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                                item.operation,
                                item.collection,
                                item.payload.id(),
                                item.id
                            );
                        }
                    }
                }
            }
            QueueSubcommand::Compact => {
                let removed = queue.compact().await?;
                println!("✓ Removed {} synced item(s)", removed);
            }
            QueueSubcommand::Clear => {
                let dropped = queue.clear().await?;
                println!("✓ Dropped {} pending item(s)", dropped);
                println!("  Run `renova sync` to reload local data from the server.");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renova_sync_core::{MemoryRemoteStore, Record, SharedStorage};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_clear_then_compact() {
        let engine =
            SyncEngine::builder(SharedStorage::in_memory(), Arc::new(MemoryRemoteStore::new()))
                .memory_queue()
                .build()
                .await;
        engine
            .create("crm_caixa", Record::from_value(json!({"id": 1})).unwrap())
            .await
            .unwrap();

        QueueCommand {
            command: QueueSubcommand::Clear,
        }
        .run(&engine)
        .await
        .unwrap();
        assert_eq!(engine.status().await.pending_count, 0);

        QueueCommand {
            command: QueueSubcommand::Compact,
        }
        .run(&engine)
        .await
        .unwrap();
        assert!(engine.queue().unwrap().list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queueless_engine_is_reported() {
        let engine =
            SyncEngine::builder(SharedStorage::in_memory(), Arc::new(MemoryRemoteStore::new()))
                .without_queue()
                .build()
                .await;
        let result = QueueCommand {
            command: QueueSubcommand::Compact,
        }
        .run(&engine)
        .await;
        assert!(matches!(result, Err(CommandError::InvalidInput(_))));
    }
}
