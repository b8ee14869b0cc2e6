//! Renova Sync Core Library
//!
//! Offline-first synchronization between local record collections and a
//! remote authoritative store: durable sync queue, cloud mirror, realtime
//! ingestion, conflict resolution and cross-context coordination.

pub mod conflict;
pub mod cross_tab;
pub mod engine;
pub mod error;
pub mod events;
pub mod mirror;
pub mod queue;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod status;
pub mod store;

pub use conflict::{
    last_write_wins, merge, resolve_list, ConflictDecision, ConflictPolicy, ConflictStrategy,
    ParseStrategyError, DEFAULT_CONFLICT_WINDOW,
};
pub use cross_tab::CrossTabCoordinator;
pub use engine::{SyncEngine, SyncEngineBuilder, SyncOptions, WriteReceipt};
pub use error::SyncError;
pub use events::{EventBus, SyncEvent};
pub use mirror::{CloudMirror, PushReport};
pub use queue::{OperationKind, QueueItem, SyncQueue};
pub use realtime::RealtimeIngestion;
pub use record::{Record, RecordId};
pub use remote::{
    check_server, HttpRemoteStore, MemoryRemoteStore, RealtimeMessage, RemoteFeed, RemoteStore,
};
pub use status::{Connectivity, StatusReporter, SyncStatus};
pub use store::{JsonFileStore, LocalStore, MemoryStore, RecordStore, SharedStorage};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
