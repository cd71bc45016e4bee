//! Periodic deposit sync for auto-mode users

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::exchange::AdapterFactory;
use crate::store::SqliteStore;
use crate::types::{ExchangeCredentials, UserId, UserMode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceSyncReport {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

pub struct BalanceSync {
    store: SqliteStore,
    factory: Arc<dyn AdapterFactory>,
    default_credentials: Option<ExchangeCredentials>,
    user_timeout: Duration,
}

impl BalanceSync {
    pub fn new(store: SqliteStore, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            store,
            factory,
            default_credentials: None,
            user_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_user_timeout(mut self, timeout: Duration) -> Self {
        self.user_timeout = timeout;
        self
    }

    pub fn with_default_credentials(mut self, credentials: Option<ExchangeCredentials>) -> Self {
        self.default_credentials = credentials.filter(ExchangeCredentials::is_valid);
        self
    }

    /// Returns whether the stored deposit was updated
    pub async fn sync_user(&self, user_id: UserId) -> Result<bool> {
        let credentials = self
            .store
            .get_credentials(user_id)?
            .filter(ExchangeCredentials::is_valid)
            .or_else(|| self.default_credentials.clone());
        let Some(credentials) = credentials else {
            return Ok(false);
        };

        let adapter = self.factory.connect(user_id, &credentials)?;
        let balance = adapter.fetch_balance().await?;
        if balance.total <= Decimal::ZERO {
            debug!(user = user_id, "Exchange reported empty balance; keeping stored deposit");
            return Ok(false);
        }

        self.store.update_user_balance(user_id, &balance)?;
        debug!(
            user = user_id,
            "Balance synced: total={} free={} used={}", balance.total, balance.free, balance.used
        );
        Ok(true)
    }

    /// One task per user under a shared deadline; a hung user only costs
    /// its own update
    pub async fn sync_all(self: &Arc<Self>) -> Result<BalanceSyncReport> {
        let mut report = BalanceSyncReport::default();

        let handles: Vec<_> = self
            .store
            .get_users_by_mode(UserMode::Auto)?
            .into_iter()
            .map(|user_id| {
                let this = Arc::clone(self);
                (user_id, tokio::spawn(async move { this.sync_user(user_id).await }))
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.user_timeout;
        for (user_id, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(true))) => report.updated += 1,
                Ok(Ok(Ok(false))) => report.skipped += 1,
                Ok(Ok(Err(e))) => {
                    debug!(user = user_id, "Balance sync failed: {:#}", e);
                    report.failed += 1;
                }
                Ok(Err(e)) => {
                    warn!(user = user_id, "Balance sync task panicked: {}", e);
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(user = user_id, "Balance sync timed out after {:?}", self.user_timeout);
                    abort.abort();
                    report.timed_out += 1;
                }
            }
        }

        if report.updated > 0 {
            info!("Balances synced for {} users", report.updated);
        }
        Ok(report)
    }
}
