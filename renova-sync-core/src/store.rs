//! Local record store.
//!
//! Collections are stored one file per collection:
//! ```text
//! <DATA_DIR>/
//!   clientes.json
//!   produtos.json
//!   queue.db
//! ```
//!
//! Several contexts (the equivalent of browser tabs) can share one backing
//! store through [`SharedStorage`]. Every write is announced on a change
//! channel that siblings listen to; see [`crate::cross_tab`]. File-backed
//! storage also watches its directory, so writes made by other processes on
//! the same data directory are announced too.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::SyncError;
use crate::record::{Record, RecordId};

const CHANGE_BUFFER: usize = 64;

/// Durable backing for collections.
///
/// Reads and writes are synchronous and always replace a whole collection.
pub trait LocalStore: Send + Sync + std::fmt::Debug {
    fn load(&self, collection: &str) -> Result<Vec<Record>, SyncError>;
    fn save(&self, collection: &str, records: &[Record]) -> Result<(), SyncError>;
}

/// Validates a collection name to prevent path traversal.
pub fn validate_collection(collection: &str) -> Result<(), SyncError> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(SyncError::local_store(collection, "invalid collection name"));
    }
    Ok(())
}

/// Collections stored as JSON arrays on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", collection))
    }
}

impl LocalStore for JsonFileStore {
    fn load(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        validate_collection(collection)?;
        let path = self.collection_path(collection);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::local_store(
                    collection,
                    format!("{}: {}", path.display(), e),
                ))
            }
        };

        let values: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::local_store(collection, format!("{}: {}", path.display(), e))
        })?;

        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match Record::from_value(value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping entry in {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    fn save(&self, collection: &str, records: &[Record]) -> Result<(), SyncError> {
        validate_collection(collection)?;

        fs::create_dir_all(&self.data_dir).map_err(|e| {
            SyncError::local_store(collection, format!("{}: {}", self.data_dir.display(), e))
        })?;

        let path = self.collection_path(collection);
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|e| SyncError::local_store(collection, e.to_string()))?;

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("json.tmp");
        let io_err = |e: io::Error| {
            SyncError::local_store(collection, format!("{}: {}", temp_path.display(), e))
        };

        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        fs::rename(&temp_path, &path).map_err(|e| {
            SyncError::local_store(collection, format!("{}: {}", path.display(), e))
        })?;

        Ok(())
    }
}

/// Volatile backing store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        validate_collection(collection)?;
        let collections = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    fn save(&self, collection: &str, records: &[Record]) -> Result<(), SyncError> {
        validate_collection(collection)?;
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), records.to_vec());
        Ok(())
    }
}

/// Identifies one context writing to a shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification that a collection was rewritten.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub origin: ContextId,
    pub collection: String,
    pub records: Vec<Record>,
}

/// A backing store shared by any number of contexts.
#[derive(Debug, Clone)]
pub struct SharedStorage {
    backend: Arc<dyn LocalStore>,
    changes: broadcast::Sender<StorageChange>,
    write_lock: Arc<Mutex<()>>,
    disk: Option<Arc<DiskWatch>>,
}

impl SharedStorage {
    pub fn new(backend: Arc<dyn LocalStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            backend,
            changes,
            write_lock: Arc::new(Mutex::new(())),
            disk: None,
        }
    }

    /// JSON files in `data_dir`, watched for writes by other processes.
    ///
    /// If the directory cannot be watched the storage still works; only
    /// in-process contexts are notified then.
    pub fn json_files(data_dir: impl Into<PathBuf>) -> Self {
        let files = JsonFileStore::new(data_dir);
        let mut storage = Self::new(Arc::new(files.clone()));
        match DiskWatch::start(files, storage.changes.clone()) {
            Ok(disk) => storage.disk = Some(Arc::new(disk)),
            Err(e) => tracing::warn!("Not watching data directory for other processes: {}", e),
        }
        storage
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Opens a new context on this storage.
    pub fn context(&self) -> RecordStore {
        RecordStore {
            storage: self.clone(),
            context: ContextId::new(),
        }
    }

    /// True when writes from other processes are announced.
    pub fn watches_disk(&self) -> bool {
        self.disk.is_some()
    }
}

/// Last known contents per collection, as written or observed by this process.
type SeenContents = Arc<Mutex<HashMap<String, Vec<Record>>>>;

/// Relays file changes made by other processes onto the change channel.
///
/// A file whose contents match what this process last wrote or announced is
/// its own write (or a repeated event) and is skipped.
struct DiskWatch {
    seen: SeenContents,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for DiskWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskWatch").finish_non_exhaustive()
    }
}

impl DiskWatch {
    fn start(
        files: JsonFileStore,
        changes: broadcast::Sender<StorageChange>,
    ) -> Result<Self, SyncError> {
        let dir = files.data_dir().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| SyncError::local_store("*", format!("{}: {}", dir.display(), e)))?;

        let seen: SeenContents = Arc::new(Mutex::new(HashMap::new()));
        let relay = DiskRelay {
            files,
            changes,
            seen: seen.clone(),
            origin: ContextId::new(),
        };

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => relay.handle(event),
                Err(e) => tracing::warn!("Data directory watch error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| SyncError::local_store("*", e))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| SyncError::local_store("*", e))?;

        tracing::debug!("Watching {} for changes by other processes", dir.display());
        Ok(Self {
            seen,
            _watcher: watcher,
        })
    }

    fn remember(&self, collection: &str, records: &[Record]) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), records.to_vec());
    }
}

struct DiskRelay {
    files: JsonFileStore,
    changes: broadcast::Sender<StorageChange>,
    seen: SeenContents,
    /// Stands for every context outside this process.
    origin: ContextId,
}

impl DiskRelay {
    fn handle(&self, event: Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }

        for path in &event.paths {
            let Some(collection) = collection_of(path) else {
                continue;
            };
            let records = match self.files.load(&collection) {
                Ok(records) => records,
                Err(e) => {
                    tracing::debug!("Ignoring unreadable {}: {}", path.display(), e);
                    continue;
                }
            };

            {
                let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
                if seen.get(&collection) == Some(&records) {
                    continue;
                }
                seen.insert(collection.clone(), records.clone());
            }

            tracing::debug!("{} changed on disk in another process", collection);
            // Nobody listening is fine
            let _ = self.changes.send(StorageChange {
                origin: self.origin,
                collection,
                records,
            });
        }
    }
}

/// Collection name for `<DATA_DIR>/<collection>.json`; temp files and the
/// queue database do not match.
fn collection_of(path: &Path) -> Option<String> {
    if path.extension()? != "json" {
        return None;
    }
    let name = path.file_stem()?.to_str()?;
    validate_collection(name).ok()?;
    Some(name.to_string())
}

/// One context's view of the shared storage.
///
/// Writes made here are announced to every other context; the announcing
/// context is identified by [`StorageChange::origin`].
#[derive(Debug, Clone)]
pub struct RecordStore {
    storage: SharedStorage,
    context: ContextId,
}

impl RecordStore {
    /// A store with its own private in-memory backing.
    pub fn in_memory() -> Self {
        SharedStorage::in_memory().context()
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn get(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        self.storage.backend.load(collection)
    }

    pub fn find(&self, collection: &str, id: &RecordId) -> Result<Option<Record>, SyncError> {
        Ok(self.get(collection)?.into_iter().find(|r| r.id() == id))
    }

    /// Replaces a collection and notifies sibling contexts.
    ///
    /// Duplicate ids collapse to the last occurrence, kept at the position
    /// of the first.
    pub fn set(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Record>, SyncError> {
        let _guard = self
            .storage
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.write(collection, records)
    }

    /// Read-modify-write of a collection under the storage write lock.
    ///
    /// Returns the closure's result together with the stored records.
    pub fn modify<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Vec<Record>) -> T,
    ) -> Result<(T, Vec<Record>), SyncError> {
        let _guard = self
            .storage
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut records = self.storage.backend.load(collection)?;
        let out = f(&mut records);
        let stored = self.write(collection, records)?;
        Ok((out, stored))
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StorageChange> {
        self.storage.changes.subscribe()
    }

    fn write(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Record>, SyncError> {
        let records = dedupe_by_id(records);
        // Before saving, so the watcher never mistakes this write for a foreign one
        if let Some(disk) = &self.storage.disk {
            disk.remember(collection, &records);
        }
        self.storage.backend.save(collection, &records)?;

        // Nobody listening is fine
        let _ = self.storage.changes.send(StorageChange {
            origin: self.context,
            collection: collection.to_string(),
            records: records.clone(),
        });

        Ok(records)
    }
}

fn dedupe_by_id(records: Vec<Record>) -> Vec<Record> {
    let mut index: HashMap<RecordId, usize> = HashMap::new();
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(record.id()) {
            Some(&pos) => out[pos] = record,
            None => {
                index.insert(record.id().clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}
