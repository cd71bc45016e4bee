//! `run`: every engine loop until Ctrl+C

use anyhow::Result;
use tokio::signal;
use tracing::{error, warn};

use trade_sentinel::service::{shutdown_channel, ShutdownSender};

use super::{build_engine, load_config};

pub fn run(config_path: String) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(config_path))
}

/// Flip the shutdown channel on Ctrl+C
pub fn spawn_ctrl_c(shutdown: ShutdownSender) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Ctrl+C received - initiating graceful shutdown");
                let _ = shutdown.send(true);
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });
}

async fn run_async(config_path: String) -> Result<()> {
    let config = load_config(&config_path)?;
    let engine = build_engine(config)?;

    let (tx, rx) = shutdown_channel();
    spawn_ctrl_c(tx);

    engine.run(rx).await
}
