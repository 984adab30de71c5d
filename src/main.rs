//! StreamVault service entry point
//!
//! Connects the bot, the metadata database, and the HTTP server inside a
//! single runtime: the upstream client's background tasks keep running
//! while HTTP requests stream, and shutdown is deterministic - stop
//! accepting requests, cancel in-flight streams, close the handle.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use streamvault::config::Config;
use streamvault::db::{FileRepo, MongoFileRepo};
use streamvault::ingest::Ingest;
use streamvault::server::{self, AppState};
use streamvault::stream::StreamEngine;
use streamvault::upstream::{TelegramUpstream, Upstream};
use streamvault::Result;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "streamvault")]
#[command(version = "0.1.0")]
#[command(about = "Telegram archive channel served as seekable HTTP streams")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the HTTP bind port from the environment
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

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

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if let Err(e) = run(config).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let repo = Arc::new(MongoFileRepo::connect(&config.database).await?);
    repo.ensure_indexes().await;
    let repo_dyn: Arc<dyn FileRepo> = repo.clone();

    let upstream = TelegramUpstream::connect(config.telegram.clone()).await?;
    let upstream_dyn: Arc<dyn Upstream> = upstream.clone();

    let engine = StreamEngine::new(
        upstream_dyn.clone(),
        Duration::from_secs(config.telegram.getfile_timeout_secs),
    );
    let state = Arc::new(AppState {
        upstream: upstream_dyn,
        repo: repo_dyn.clone(),
        engine,
    });

    let ingest = Ingest::new(upstream.clone(), repo_dyn, config.clone());

    // the bot's update loop and the HTTP server share this runtime; the
    // first to fail (or a shutdown signal) ends the process
    let result = tokio::select! {
        r = server::serve(&config.server, state) => r,
        r = ingest.run() => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    upstream.shutdown().await;
    result
}
