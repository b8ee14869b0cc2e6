//! Sync error types.
//!
//! Every failure inside the sync core is reported as a [`SyncError`]. The
//! engine catches these at component boundaries; callers only see them from
//! the explicit push/pull/enqueue APIs, never from a local read or write.

use thiserror::Error;

/// Errors that can occur inside the sync core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The durable queue store could not be opened or written.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Network error while talking to the remote store.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A realtime payload could not be parsed.
    #[error("Malformed realtime message: {0}")]
    MalformedMessage(String),

    /// The remote store refused the request (validation, auth, ...).
    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    /// Reading or writing a local collection failed.
    #[error("Local store error for '{collection}': {message}")]
    LocalStore { collection: String, message: String },

    /// A record or collection name failed validation.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl SyncError {
    pub(crate) fn local_store(collection: &str, message: impl ToString) -> Self {
        SyncError::LocalStore {
            collection: collection.to_string(),
            message: message.to_string(),
        }
    }

    /// Returns true for failures that a later retry may fix on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransportFailure(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::StorageUnavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        SyncError::StorageUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() => SyncError::RemoteRejected(e.to_string()),
            _ => SyncError::TransportFailure(e.to_string()),
        }
    }
}
