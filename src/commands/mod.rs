mod config_cmd;
mod queue_cmd;
mod records;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use queue_cmd::QueueCommand;
pub use records::{DeleteCommand, ListCommand, PutCommand};
pub use sync_cmd::{StatusCommand, SyncCommand, WatchCommand};

use std::sync::Arc;

use clap::ValueEnum;
use renova_sync_core::{
    check_server, HttpRemoteStore, MemoryRemoteStore, RemoteStore, SharedStorage, SyncEngine,
    SyncError,
};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Builds an engine over the configured data directory.
///
/// The engine is online only when a remote is configured and answers its
/// health check; otherwise every command works against local data.
pub async fn open_engine(config: &Config, realtime: bool) -> Result<SyncEngine, CommandError> {
    let (remote, online): (Arc<dyn RemoteStore>, bool) =
        match (&config.remote.server_url, &config.remote.api_key) {
            (Some(url), Some(key)) => {
                let remote = HttpRemoteStore::new(url.clone(), key.clone())?;
                let online = check_server(url).await;
                if !online {
                    tracing::info!("Server {} unreachable, working offline", url);
                }
                (Arc::new(remote), online)
            }
            _ => (Arc::new(MemoryRemoteStore::new()), false),
        };

    let mut options = config.sync_options();
    options.realtime = options.realtime && realtime;

    let engine = SyncEngine::builder(SharedStorage::json_files(&config.data_dir.value), remote)
        .queue_path(config.queue_path())
        .options(options)
        .build()
        .await;
    engine.start(online).await;

    Ok(engine)
}

/// Errors from CLI commands
#[derive(Debug)]
pub enum CommandError {
    /// Sync core error
    Sync(SyncError),
    /// Bad command-line input
    InvalidInput(String),
    /// Operation needs a configured remote
    NotConfigured,
    /// Output serialization error
    Output(serde_json::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Sync(e) => write!(f, "{}", e),
            CommandError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            CommandError::NotConfigured => write!(
                f,
                "Remote not configured. Add remote.server_url and remote.api_key to config."
            ),
            CommandError::Output(e) => write!(f, "Failed to format output: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Sync(e) => Some(e),
            CommandError::Output(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SyncError> for CommandError {
    fn from(e: SyncError) -> Self {
        CommandError::Sync(e)
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Output(e)
    }
}
