//! Long-running engine: reconciliation, balance sync and rollback loops
//!
//! Each loop owns its cadence and stops on the shared `watch` shutdown
//! channel. A tick that is already running finishes first; the engine waits
//! for the loops up to the configured shutdown timeout, then aborts
//! whatever is left and exports the store.

use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::balance::BalanceSync;
use crate::config::Config;
use crate::exchange::AdapterFactory;
use crate::notify::Notifier;
use crate::reconcile::Reconciler;
use crate::risk::PortfolioRiskManager;
use crate::rollback::RollbackManager;
use crate::store::SqliteStore;

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

/// Resolves once shutdown was requested or the sender is gone
pub async fn wait_for_shutdown(rx: &mut ShutdownReceiver) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Runs `tick` every `period` until shutdown
async fn run_periodic<F, Fut>(name: &'static str, period: Duration, mut shutdown: ShutdownReceiver, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("{} loop started (every {:?})", name, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    info!("{} loop stopped", name);
}

/// Every long-lived component, explicitly constructed
pub struct Engine {
    config: Config,
    store: SqliteStore,
    reconciler: Arc<Reconciler>,
    balance: Arc<BalanceSync>,
    rollback: Arc<RollbackManager>,
    risk: Arc<PortfolioRiskManager>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: SqliteStore,
        factory: Arc<dyn AdapterFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let default_credentials = config.exchange.default_credentials();

        let reconciler = Reconciler::new(
            store.clone(),
            Arc::clone(&factory),
            Arc::clone(&notifier),
            config.reconcile.clone(),
        )
        .with_default_credentials(default_credentials.clone());
        let balance = BalanceSync::new(store.clone(), factory)
            .with_default_credentials(default_credentials)
            .with_user_timeout(config.balance_sync.user_timeout());
        let rollback = RollbackManager::new(store.clone(), notifier, config.rollback.clone());
        let risk = PortfolioRiskManager::new(store.clone(), config.risk.clone());

        Self {
            config,
            store,
            reconciler: Arc::new(reconciler),
            balance: Arc::new(balance),
            rollback: Arc::new(rollback),
            risk: Arc::new(risk),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn rollback(&self) -> &RollbackManager {
        &self.rollback
    }

    pub fn risk(&self) -> &PortfolioRiskManager {
        &self.risk
    }

    fn spawn_loops(&self, shutdown: &ShutdownReceiver) -> Vec<(&'static str, JoinHandle<()>)> {
        let mut loops = Vec::new();

        let reconciler = Arc::clone(&self.reconciler);
        loops.push((
            "reconcile",
            tokio::spawn(run_periodic(
                "reconcile",
                self.config.reconcile.interval(),
                shutdown.clone(),
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    async move {
                        // Store failures abort only this cycle
                        if let Err(e) = reconciler.run_cycle(Utc::now()).await {
                            error!("Reconciliation cycle failed: {:#}", e);
                        }
                    }
                },
            )),
        ));

        if self.config.balance_sync.enabled {
            let balance = Arc::clone(&self.balance);
            loops.push((
                "balance-sync",
                tokio::spawn(run_periodic(
                    "balance-sync",
                    self.config.balance_sync.interval(),
                    shutdown.clone(),
                    move || {
                        let balance = Arc::clone(&balance);
                        async move {
                            if let Err(e) = balance.sync_all().await {
                                warn!("Balance sync failed: {:#}", e);
                            }
                        }
                    },
                )),
            ));
        }

        let rollback = Arc::clone(&self.rollback);
        loops.push((
            "rollback",
            tokio::spawn(run_periodic(
                "rollback",
                self.config.rollback.check_interval(),
                shutdown.clone(),
                move || {
                    let rollback = Arc::clone(&rollback);
                    async move {
                        match rollback.run_check(Utc::now()).await {
                            Ok(report) => debug!("Rollback check: {:?}", report),
                            Err(e) => error!("Rollback check failed: {:#}", e),
                        }
                    }
                },
            )),
        ));

        loops
    }

    /// Run all loops until shutdown is signalled
    pub async fn run(&self, mut shutdown: ShutdownReceiver) -> Result<()> {
        info!("🚀 Engine starting");
        let loops = self.spawn_loops(&shutdown);

        wait_for_shutdown(&mut shutdown).await;
        info!("🛑 Shutdown requested, waiting up to {:?} for loops", self.config.service.shutdown_timeout());

        let deadline = tokio::time::Instant::now() + self.config.service.shutdown_timeout();
        for (name, handle) in loops {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} loop ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} loop did not stop in time; aborting", name);
                    abort.abort();
                }
            }
        }

        let export_path = self.config.service.export_path();
        if let Err(e) = self.store.export_json(&export_path) {
            warn!("State export failed: {:#}", e);
        }
        info!("✅ Shutdown complete");
        Ok(())
    }
}
