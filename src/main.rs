//! tgdrive - streaming server for a Telegram-backed drive
//!
//! Usage:
//!   tgdrive --config config.json serve   - Run the streaming server
//!   tgdrive --config config.json check   - Validate the configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tgdrive::metadata::MemoryStore;
use tgdrive::server::{serve, AppState};
use tgdrive::telegram::TgConnector;
use tgdrive::{Config, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tgdrive")]
#[command(version = "0.1.0")]
#[command(about = "File-streaming server for a Telegram-backed drive")]
struct Cli {
    /// Configuration file path (environment variables only if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming server
    Serve {
        /// Metadata snapshot file to serve from
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Commands::Check => {
            info!("configuration ok");
            Ok(())
        }
        Commands::Serve { metadata, port } => {
            if let Some(port) = port {
                config.server.port = port;
            }

            let store = match metadata {
                Some(path) => {
                    info!("loading metadata snapshot from {:?}", path);
                    MemoryStore::load(path)?
                }
                None => MemoryStore::new(),
            };

            let connector = TgConnector::new(&config.telegram);
            let state = Arc::new(AppState::new(config, Arc::new(store), connector));
            serve(state).await
        }
    }
}
