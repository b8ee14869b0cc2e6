//! Sync CLI commands: manual sync, status and live event stream.

use clap::Args;
use renova_sync_core::{Connectivity, SyncEngine};
use tokio::sync::broadcast::error::RecvError;

use super::{CommandError, OutputFormat};
use crate::config::Config;

/// Push pending changes and pull every configured collection
#[derive(Args)]
pub struct SyncCommand;

impl SyncCommand {
    pub async fn run(&self, engine: &SyncEngine, config: &Config) -> Result<(), CommandError> {
        if !config.remote.is_configured() {
            return Err(CommandError::NotConfigured);
        }

        if !engine.is_online() {
            let pending = engine.status().await.pending_count;
            println!("✗ Server unreachable; {} change(s) stay queued.", pending);
            return Ok(());
        }

        println!("Syncing with server...");
        println!();

        let pushed = engine.push_all().await?;
        println!(
            "  ✓ pushed {} upsert(s), {} delete(s)",
            pushed.upserted, pushed.deleted
        );

        let pulled = engine.pull_all().await?;
        println!("  ✓ pulled {} collection(s)", pulled);

        println!();
        println!("Sync complete.");
        Ok(())
    }
}

/// Show sync status
#[derive(Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(&self, engine: &SyncEngine, config: &Config) -> Result<(), CommandError> {
        let status = engine.status().await;

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            OutputFormat::Text => {
                println!("Sync Status");
                println!("===========");
                println!();

                match &config.remote.server_url {
                    Some(url) => println!("Server:       {}", url),
                    None => println!("Server:       not configured"),
                }
                let marker = match status.connectivity {
                    Connectivity::Online => "✓",
                    Connectivity::Syncing => "…",
                    Connectivity::Offline => "✗",
                };
                println!("Connectivity: {} {}", marker, status.connectivity);
                println!("Pending:      {}", status.pending_count);
                match status.last_sync_at {
                    Some(at) => println!("Last sync:    {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                    None => println!("Last sync:    never"),
                }
                println!("Conflicts:    {}", status.conflict_count);
                println!("Strategy:     {}", engine.strategy());
            }
        }
        Ok(())
    }
}

/// Stream sync events until Ctrl-C
#[derive(Args)]
pub struct WatchCommand;

impl WatchCommand {
    pub async fn run(&self, engine: &SyncEngine, config: &Config) -> Result<(), CommandError> {
        if !config.remote.is_configured() {
            return Err(CommandError::NotConfigured);
        }

        let mut events = engine.subscribe_events();
        println!(
            "Watching {} (Ctrl-C to stop)",
            engine.options().collections.join(", ")
        );
        if !engine.is_online() {
            println!("✗ Server unreachable; only local changes will show.");
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => println!("{} {}", event.name(), serde_json::to_string(&event)?),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Skipped {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        engine.shutdown();
        Ok(())
    }
}
