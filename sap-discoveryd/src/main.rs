use std::path::PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::store::InventoryDb;
use sap_discoveryd::config::Config;
use sap_discoveryd::inventory_manager::{self, DiscoveryContext, InventoryHandle, ReactorExit};
use sap_discoveryd::listener::SapListener;
use sap_discoveryd::lock::InstanceLock;

/// Listen for SAP announcements and keep an inventory of live AES67 streams
#[derive(Parser, Debug)]
#[command(name = "sap-discoveryd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to join the SAP group on (all IPv4 interfaces by default)
    #[arg(short, long)]
    interface: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long, env = "SAP_DISCOVERY_CONFIG")]
    config: Option<PathBuf>,

    /// Inventory database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "sap_discoveryd=debug,shared=debug"
    } else {
        "sap_discoveryd=info,shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter))
        )
        .init();

    tracing::info!("Starting sap-discoveryd");

    let mut config = match &args.config {
        Some(path) => {
            let config = Config::load(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };
    if args.interface.is_some() {
        config.listener.interface = args.interface.clone();
    }

    let working_dir = shared::paths::working_dir()?;
    let _lock = InstanceLock::acquire(&working_dir)?;

    let db_path = match args.db.clone().or_else(|| config.inventory.db_path.clone()) {
        Some(path) => path,
        None => shared::paths::default_db_path()?,
    };
    let db = InventoryDb::open(&db_path)?;
    tracing::info!("Opened database at {}", db_path.display());

    let inventory = InventoryHandle::spawn(db);
    match inventory.count().await {
        Ok(count) => tracing::info!("Inventory holds {} stream(s) from a previous run", count),
        Err(e) => tracing::error!("Failed to count inventory: {:#}", e),
    }
    let ctx = DiscoveryContext::new(inventory.clone(), &config.inventory)?;

    let mut listener = SapListener::new();
    listener.bind(config.listener.port)?;
    listener.join(config.listener.group, config.listener.interface.as_deref())?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal_cancel.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signals: {:#}", e),
        }
    });

    let result = inventory_manager::run(&mut listener, ctx, cancel).await;
    signal_handle.abort();

    match &result {
        Ok(ReactorExit::Cancelled) => {}
        Ok(exit) => tracing::warn!("Reactor stopped: {:?}", exit),
        Err(e) => tracing::error!("Reactor error: {:#}", e),
    }

    if let Err(e) = inventory.shutdown().await {
        tracing::error!("Failed to shutdown inventory: {}", e);
    }

    tracing::info!("Shutdown complete");
    result.map(|_| ())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
