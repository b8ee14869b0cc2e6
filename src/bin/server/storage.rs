//! Server-side table storage.
//!
//! Each collection is one JSON array on disk:
//! ```text
//! <DATA_DIR>/
//!   crm_clientes.json
//!   crm_caixa.json
//! ```
//!
//! Writes are serialized through a single lock so concurrent requests never
//! interleave a read-modify-write on the same table.

use renova_sync_core::store::validate_collection;
use renova_sync_core::{JsonFileStore, LocalStore, RealtimeMessage, Record, RecordId, SyncError};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Errors that can occur during table storage operations.
#[derive(Debug)]
pub enum TableStorageError {
    /// Collection name rejected (e.g. contains path separators).
    InvalidCollection(String),
    /// Reading or writing the table file failed.
    Io(String),
}

impl std::fmt::Display for TableStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableStorageError::InvalidCollection(c) => write!(f, "Invalid collection: {}", c),
            TableStorageError::Io(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for TableStorageError {}

impl From<SyncError> for TableStorageError {
    fn from(e: SyncError) -> Self {
        TableStorageError::Io(e.to_string())
    }
}

/// Authoritative record tables.
#[derive(Debug)]
pub struct TableStorage {
    files: JsonFileStore,
    write_lock: Mutex<()>,
}

impl TableStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            files: JsonFileStore::new(data_dir),
            write_lock: Mutex::new(()),
        }
    }

    fn check(collection: &str) -> Result<(), TableStorageError> {
        validate_collection(collection)
            .map_err(|_| TableStorageError::InvalidCollection(collection.to_string()))
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<Record>, TableStorageError> {
        Self::check(collection)?;
        let _guard = self.write_lock.lock().await;
        Ok(self.files.load(collection)?)
    }

    /// Inserts or replaces records by id.
    ///
    /// Returns one realtime message per record, `insert` for new ids and
    /// `update` for replaced ones.
    pub async fn upsert_many(
        &self,
        collection: &str,
        records: Vec<Record>,
    ) -> Result<Vec<RealtimeMessage>, TableStorageError> {
        Self::check(collection)?;
        let _guard = self.write_lock.lock().await;

        let mut table = self.files.load(collection)?;
        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            match table.iter_mut().find(|r| r.id() == record.id()) {
                Some(existing) => {
                    *existing = record.clone();
                    messages.push(RealtimeMessage::Update { record });
                }
                None => {
                    table.push(record.clone());
                    messages.push(RealtimeMessage::Insert { record });
                }
            }
        }
        self.files.save(collection, &table)?;

        tracing::debug!("Upserted {} record(s) into {}", messages.len(), collection);
        Ok(messages)
    }

    /// Deletes a record. Deleting a missing id is not an error and yields
    /// no message.
    pub async fn delete(
        &self,
        collection: &str,
        id: &RecordId,
    ) -> Result<Option<RealtimeMessage>, TableStorageError> {
        Self::check(collection)?;
        let _guard = self.write_lock.lock().await;

        let mut table = self.files.load(collection)?;
        let before = table.len();
        table.retain(|r| r.id() != id);
        if table.len() == before {
            return Ok(None);
        }
        self.files.save(collection, &table)?;

        Ok(Some(RealtimeMessage::Delete { id: id.clone() }))
    }
}
