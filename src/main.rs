use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;

use commands::{
    open_engine, ConfigCommand, DeleteCommand, ListCommand, PutCommand, QueueCommand,
    StatusCommand, SyncCommand, WatchCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "renova")]
#[command(version)]
#[command(about = "Offline-first record sync for Renova", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or replace a record
    Put(PutCommand),

    /// Delete a record
    Delete(DeleteCommand),

    /// List the records of a collection
    List(ListCommand),

    /// Show sync status
    Status(StatusCommand),

    /// Push queued changes and pull from the server
    Sync(SyncCommand),

    /// Stream realtime changes until interrupted
    Watch(WatchCommand),

    /// Inspect and maintain the sync queue
    Queue(QueueCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "renova=warn,renova_sync_core=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Put(cmd)) => {
            let engine = open_engine(&config, false).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Delete(cmd)) => {
            let engine = open_engine(&config, false).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::List(cmd)) => {
            let engine = open_engine(&config, false).await?;
            cmd.run(&engine)?;
        }
        Some(Commands::Status(cmd)) => {
            let engine = open_engine(&config, false).await?;
            cmd.run(&engine, &config).await?;
        }
        Some(Commands::Sync(cmd)) => {
            let engine = open_engine(&config, false).await?;
            cmd.run(&engine, &config).await?;
        }
        Some(Commands::Watch(cmd)) => {
            let engine = open_engine(&config, true).await?;
            cmd.run(&engine, &config).await?;
        }
        Some(Commands::Queue(cmd)) => {
            let engine = open_engine(&config, false).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
