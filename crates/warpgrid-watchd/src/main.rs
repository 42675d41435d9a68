//! warpgrid-watchd: the WarpGrid deployment watcher daemon.
//!
//! Runs the deployments watcher against a local state store as the sole
//! (and therefore leading) node:
//! - State store (redb, on disk or in memory)
//! - Store-backed reader and consensus writer
//! - Deployments watcher, enabled until shutdown
//!
//! # Usage
//!
//! ```text
//! warpgrid-watchd --config /etc/warpgrid/watchd.toml --data-dir /var/lib/warpgrid
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use warpgrid_deploywatch::{DeploymentsWatcher, StoreBackend};
use warpgrid_state::StateStore;

use crate::config::WatchdConfig;

#[derive(Parser)]
#[command(name = "warpgrid-watchd", about = "WarpGrid deployment watcher daemon")]
struct Cli {
    /// Path to a watchd.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for persistent state (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep state in memory only.
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,warpgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WatchdConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WatchdConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    config.in_memory |= cli.in_memory;

    run(config).await
}

async fn run(config: WatchdConfig) -> anyhow::Result<()> {
    info!("deployment watcher daemon starting");

    // ── State store ────────────────────────────────────────────

    let store = if config.in_memory {
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.db_path();
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    // ── Deployments watcher ────────────────────────────────────

    let backend = Arc::new(StoreBackend::new(store, config.max_query_wait()));
    let watcher = DeploymentsWatcher::new(config.watcher.clone(), backend.clone(), backend);

    // A single node is always the leader.
    watcher.set_enabled(true).await;
    info!(
        eval_batch_ms = config.watcher.eval_batch_ms,
        query_rate = config.watcher.query_rate_per_second,
        "deployments watcher running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    watcher.set_enabled(false).await;

    info!("deployment watcher daemon stopped");
    Ok(())
}
