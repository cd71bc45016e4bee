//! Subcommand implementations and the wiring they share

pub mod flag;
pub mod reconcile;
pub mod risk_check;
pub mod rollback_check;
pub mod run;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use trade_sentinel::bitget::{BitgetFactory, ClientConfig};
use trade_sentinel::notify::{LogNotifier, Notifier, OutboxNotifier};
use trade_sentinel::service::Engine;
use trade_sentinel::store::SqliteStore;
use trade_sentinel::Config;

/// Config file when present, otherwise defaults plus environment
pub fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        let config = Config::from_file(path)?;
        info!("Loaded configuration from: {}", path);
        Ok(config)
    } else {
        warn!("Config file {} not found; using defaults and environment", path);
        Config::from_env()
    }
}

pub fn open_store(config: &Config) -> Result<SqliteStore> {
    let state_dir = &config.service.state_dir;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
    let db_path = config.service.db_path();
    let store = SqliteStore::open(&db_path)?;
    info!("State database: {}", db_path.display());
    Ok(store)
}

pub fn build_engine(config: Config) -> Result<Engine> {
    let store = open_store(&config)?;
    let factory = Arc::new(BitgetFactory::new(ClientConfig::from(&config.exchange)));
    let notifier: Arc<dyn Notifier> = if config.service.notify_outbox {
        Arc::new(OutboxNotifier::new(store.clone()))
    } else {
        Arc::new(LogNotifier)
    };
    Ok(Engine::new(config, store, factory, notifier))
}
