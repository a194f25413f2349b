mod logging;
mod paths;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use ayria_network::{AyriaConfig, AyriaNode, Identity, SqliteStore, events};

#[tokio::main]
async fn main() -> Result<()> {
    paths::ensure_dirs()?;
    let quiet = std::env::args().skip(1).any(|arg| arg == "--quiet");
    let _log_guard = if quiet {
        logging::init_logging_to_dir(&paths::logs_dir()?, logging::DEFAULT_FILTER)?
    } else {
        logging::init_logging(&paths::logs_dir()?)?
    };

    let config_path = paths::config_path()?;
    let config = AyriaConfig::load_or_default(&config_path);
    if !config_path.exists() {
        config
            .save_to_file(&config_path)
            .context("Failed to write default config")?;
    }

    let identity = Arc::new(Identity::load_or_generate(&paths::identity_path()?));
    let store = Arc::new(SqliteStore::open(&paths::db_path()?).context("Failed to open message store")?);

    info!(
        "Starting Ayria {} as {} (bus {}, LAN {})",
        env!("CARGO_PKG_VERSION"),
        identity.long_id(),
        config.bus_group(),
        config.lan_group()
    );

    let mut node = AyriaNode::start(config, identity, store);
    node.subscribe(
        events::CLIENT_JOINED,
        Arc::new(|client| info!("LAN peer joined: {client}")),
    );
    node.subscribe(
        events::CLIENT_LEFT,
        Arc::new(|client| info!("LAN peer left: {client}")),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C, shutting down: {e}");
        } else {
            info!("Ctrl-C received, shutting down");
        }
        let _ = shutdown_tx.send(());
    });

    node.run(shutdown_rx).await;
    Ok(())
}
