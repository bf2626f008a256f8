//! Sorel Bridge - Main entry point
//!
//! Subscribes to Sorel Connect controllers over MQTT, decodes their registers
//! and serves the results over REST and WebSocket.

mod api;
mod config;
mod metadata_fetch;
mod mqtt;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use sorel_core::{BlobStore, FileBlobStore};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sorel-bridge")]
#[command(about = "Sorel Connect telemetry bridge")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sorel.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Delete the persisted metadata cache and exit
    #[arg(long)]
    clear_cache: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Sorel Bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        api_server = %config.metadata.api_server,
        cache_dir = %config.metadata.cache_dir.display(),
        "Configuration loaded"
    );

    if args.clear_cache {
        let store = FileBlobStore::new(config.metadata.cache_dir.clone());
        let keys = store.keys().await?;
        for key in &keys {
            store.delete(key).await?;
        }
        println!(
            "Removed {} cached metadata entries from {}",
            keys.len(),
            config.metadata.cache_dir.display()
        );
        return Ok(());
    }

    let state = state::AppState::new(config.clone()).await?;
    server::run(state, &config.daemon.bind).await?;

    Ok(())
}
