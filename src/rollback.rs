//! Autonomous configuration rollback
//!
//! Watches the trade ledger on its own cadence. An abnormal loss window
//! restores the latest stable configuration snapshot; a sustained good
//! window records the current configuration as a new stable snapshot. Never
//! touches positions or orders.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::RollbackConfig;
use crate::notify::Notifier;
use crate::store::{format_ts, SqliteStore};
use crate::types::{parse_timestamp, ConfigSnapshot, TradeRecord};

const LAST_ROLLBACK_KEY: &str = "rollback_last_executed_at";
const LAST_SNAPSHOT_CHECK_KEY: &str = "rollback_last_snapshot_check_at";

/// Result of the loss-window check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbnormalCheck {
    pub abnormal: bool,
    pub reason: Option<String>,
    pub trades: usize,
    pub cumulative_pnl_pct: f64,
}

/// Classify a window of trades (oldest first)
///
/// The most recent `consecutive_losses` trades all losing wins over the
/// cumulative threshold so the reason names the streak.
pub fn detect_abnormal(trades: &[TradeRecord], cfg: &RollbackConfig) -> AbnormalCheck {
    let cumulative_pnl_pct: f64 = trades
        .iter()
        .map(|t| t.pnl_pct.to_f64().unwrap_or(0.0))
        .sum();

    let streak = cfg.consecutive_losses;
    let reason = if streak > 0
        && trades.len() >= streak
        && trades[trades.len() - streak..].iter().all(TradeRecord::is_loss)
    {
        Some(format!("{} consecutive losses", streak))
    } else if !trades.is_empty() && cumulative_pnl_pct <= cfg.loss_threshold_pct {
        Some(format!(
            "cumulative PnL {:.2}% over {}h (threshold {:.2}%)",
            cumulative_pnl_pct, cfg.loss_window_hours, cfg.loss_threshold_pct
        ))
    } else {
        None
    };

    AbnormalCheck {
        abnormal: reason.is_some(),
        reason,
        trades: trades.len(),
        cumulative_pnl_pct,
    }
}

/// `(win_rate_pct, cumulative_pnl_pct)` when the window qualifies for a
/// stable snapshot
pub fn snapshot_eligibility(trades: &[TradeRecord], cfg: &RollbackConfig) -> Option<(f64, f64)> {
    if trades.is_empty() || trades.len() < cfg.snapshot_min_trades {
        return None;
    }
    let wins = trades.iter().filter(|t| !t.is_loss()).count();
    let win_rate = wins as f64 / trades.len() as f64 * 100.0;
    if win_rate < cfg.snapshot_min_win_rate {
        return None;
    }
    let pnl_pct = trades
        .iter()
        .map(|t| t.pnl_pct.to_f64().unwrap_or(0.0))
        .sum();
    Some((win_rate, pnl_pct))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RollbackOutcome {
    /// A rollback ran recently; the window is left alone until `until`
    CoolingDown { until: DateTime<Utc> },
    /// Nothing to roll back to; only alerted
    NoSnapshot,
    RolledBack { snapshot_id: Option<i64>, restored_keys: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SnapshotOutcome {
    TooSoon,
    NotEligible { trades: usize },
    Saved { snapshot_id: i64, win_rate: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    pub check: AbnormalCheck,
    pub rollback: Option<RollbackOutcome>,
    pub snapshot: Option<SnapshotOutcome>,
}

pub struct RollbackManager {
    store: SqliteStore,
    notifier: Arc<dyn Notifier>,
    cfg: RollbackConfig,
}

impl RollbackManager {
    pub fn new(store: SqliteStore, notifier: Arc<dyn Notifier>, cfg: RollbackConfig) -> Self {
        Self { store, notifier, cfg }
    }

    pub fn check_abnormal(&self, now: DateTime<Utc>) -> Result<AbnormalCheck> {
        let since = now - Duration::hours(self.cfg.loss_window_hours);
        let trades = self.store.trades_since(since)?;
        Ok(detect_abnormal(&trades, &self.cfg))
    }

    fn stored_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get_state(key)?
            .as_deref()
            .and_then(parse_timestamp))
    }

    async fn notify_all(&self, message: &str) -> Result<()> {
        for user_id in self.store.all_users()? {
            self.notifier.notify_user(user_id, message).await;
        }
        Ok(())
    }

    /// Restore the latest stable snapshot; without one, only alert
    pub async fn perform_rollback(&self, reason: &str, now: DateTime<Utc>) -> Result<RollbackOutcome> {
        let Some(snapshot) = self.store.get_latest_stable_snapshot()? else {
            error!("Abnormal losses ({}) but no stable snapshot to roll back to", reason);
            self.notify_all(&format!(
                "Abnormal losses detected ({}). No stable configuration is available; \
                 trading continues on the current settings.",
                reason
            ))
            .await?;
            return Ok(RollbackOutcome::NoSnapshot);
        };

        let restored_keys = self.store.apply_settings(&snapshot.config)?;
        self.store
            .record_rollback_audit(snapshot.id, reason, restored_keys, now)?;
        self.store.set_state(LAST_ROLLBACK_KEY, &format_ts(now))?;

        warn!(
            "Emergency rollback: restored {} settings from snapshot {:?} ({})",
            restored_keys, snapshot.id, reason
        );
        self.notify_all(&format!(
            "Emergency rollback executed ({}). Configuration restored to the snapshot of {}.",
            reason,
            snapshot.created_at.format("%Y-%m-%d %H:%M UTC")
        ))
        .await?;

        Ok(RollbackOutcome::RolledBack {
            snapshot_id: snapshot.id,
            restored_keys,
        })
    }

    /// Record the current configuration as stable when the trailing window
    /// qualifies; evaluated at most once per snapshot interval
    pub fn maybe_snapshot(&self, now: DateTime<Utc>) -> Result<SnapshotOutcome> {
        if let Some(last) = self.stored_time(LAST_SNAPSHOT_CHECK_KEY)? {
            if now - last < Duration::hours(self.cfg.snapshot_interval_hours) {
                return Ok(SnapshotOutcome::TooSoon);
            }
        }

        let since = now - Duration::days(self.cfg.snapshot_window_days);
        let trades = self.store.trades_since(since)?;
        self.store.set_state(LAST_SNAPSHOT_CHECK_KEY, &format_ts(now))?;

        let Some((win_rate, pnl_pct)) = snapshot_eligibility(&trades, &self.cfg) else {
            debug!("No stable snapshot: {} trades in window", trades.len());
            return Ok(SnapshotOutcome::NotEligible { trades: trades.len() });
        };

        let snapshot_id = self.store.append_config_snapshot(&ConfigSnapshot {
            id: None,
            config: self.store.all_settings()?,
            win_rate,
            pnl_pct,
            is_stable: true,
            created_at: now,
        })?;
        info!(
            "Stable snapshot {} saved (win rate {:.1}%, PnL {:.2}% over {} trades)",
            snapshot_id,
            win_rate,
            pnl_pct,
            trades.len()
        );
        Ok(SnapshotOutcome::Saved { snapshot_id, win_rate })
    }

    /// One scheduled evaluation
    pub async fn run_check(&self, now: DateTime<Utc>) -> Result<RollbackReport> {
        let check = self.check_abnormal(now)?;

        if let Some(reason) = check.reason.clone() {
            let cooling_until = self
                .stored_time(LAST_ROLLBACK_KEY)?
                .map(|at| at + Duration::hours(self.cfg.cooldown_hours))
                .filter(|until| *until > now);

            let outcome = match cooling_until {
                Some(until) => {
                    info!("Abnormal window ({}) but rollback cooling down until {}", reason, until);
                    RollbackOutcome::CoolingDown { until }
                }
                None => self.perform_rollback(&reason, now).await?,
            };
            return Ok(RollbackReport {
                check,
                rollback: Some(outcome),
                snapshot: None,
            });
        }

        let snapshot = self.maybe_snapshot(now)?;
        Ok(RollbackReport {
            check,
            rollback: None,
            snapshot: Some(snapshot),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::OutboxNotifier;
    use crate::types::{Direction, Symbol, TradeMode, UserAccount, UserMode};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn trade(pnl_pct: Decimal, at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: None,
            user_id: 1,
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            quantity: dec!(1),
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl_pct,
            fees: Decimal::ZERO,
            net_pnl: pnl_pct,
            pnl_pct,
            exit_reason: "TP1".into(),
            trade_mode: TradeMode::Futures,
            exit_time: at,
        }
    }

    fn manager() -> (RollbackManager, SqliteStore) {
        let store = SqliteStore::open_in_memory().unwrap();
        for user_id in [1, 2] {
            store
                .upsert_user(&UserAccount {
                    user_id,
                    mode: UserMode::Auto,
                    trade_mode: TradeMode::Futures,
                    deposit: dec!(1000),
                    balance: dec!(1000),
                    free_deposit: dec!(1000),
                })
                .unwrap();
        }
        let notifier = Arc::new(OutboxNotifier::new(store.clone()));
        (
            RollbackManager::new(store.clone(), notifier, RollbackConfig::default()),
            store,
        )
    }

    #[test]
    fn test_three_losses_are_abnormal() {
        let now = Utc::now();
        let trades: Vec<_> = (0..3)
            .map(|i| trade(dec!(-2), now - Duration::hours(3 - i)))
            .collect();
        let check = detect_abnormal(&trades, &RollbackConfig::default());
        assert!(check.abnormal);
        assert!(check.reason.unwrap().contains("3 consecutive losses"));
    }

    #[test]
    fn test_cumulative_threshold() {
        let now = Utc::now();
        let trades = vec![
            trade(dec!(-4), now - Duration::hours(3)),
            trade(dec!(1), now - Duration::hours(2)),
            trade(dec!(-3), now - Duration::hours(1)),
        ];
        let check = detect_abnormal(&trades, &RollbackConfig::default());
        assert!(check.abnormal);
        assert!(check.reason.unwrap().starts_with("cumulative PnL"));

        let healthy = vec![trade(dec!(-1), now), trade(dec!(2), now)];
        assert!(!detect_abnormal(&healthy, &RollbackConfig::default()).abnormal);
        assert!(!detect_abnormal(&[], &RollbackConfig::default()).abnormal);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_only_alerts() {
        let (rm, store) = manager();
        store.set_setting("max_leverage", "10").unwrap();
        let before = store.all_settings().unwrap();

        let outcome = rm.perform_rollback("3 consecutive losses", Utc::now()).await.unwrap();
        assert_eq!(outcome, RollbackOutcome::NoSnapshot);
        assert_eq!(store.all_settings().unwrap(), before);
        assert_eq!(store.rollback_audit_count().unwrap(), 0);
        assert_eq!(store.pending_notifications(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot_and_cools_down() {
        let (rm, store) = manager();
        let now = Utc::now();
        store
            .append_config_snapshot(&ConfigSnapshot {
                id: None,
                config: HashMap::from([("max_leverage".to_string(), "3".to_string())]),
                win_rate: 70.0,
                pnl_pct: 8.0,
                is_stable: true,
                created_at: now - Duration::days(2),
            })
            .unwrap();
        store.set_setting("max_leverage", "20").unwrap();
        for i in 0..3 {
            store
                .record_trade(&trade(dec!(-2), now - Duration::hours(3 - i)))
                .unwrap();
        }

        let report = rm.run_check(now).await.unwrap();
        assert!(matches!(
            report.rollback,
            Some(RollbackOutcome::RolledBack { restored_keys: 1, .. })
        ));
        assert_eq!(store.get_setting("max_leverage").unwrap().as_deref(), Some("3"));
        assert_eq!(store.rollback_audit_count().unwrap(), 1);
        assert_eq!(store.pending_notifications(2).unwrap().len(), 1);

        let again = rm.run_check(now + Duration::hours(1)).await.unwrap();
        assert!(matches!(again.rollback, Some(RollbackOutcome::CoolingDown { .. })));
        assert_eq!(store.rollback_audit_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_saved_once_per_interval() {
        let (rm, store) = manager();
        let now = Utc::now();
        store.set_setting("risk_per_trade", "0.02").unwrap();
        for (i, pnl) in [dec!(2), dec!(1.5), dec!(-1), dec!(3), dec!(0.5)].into_iter().enumerate() {
            store
                .record_trade(&trade(pnl, now - Duration::days(5) + Duration::hours(i as i64)))
                .unwrap();
        }

        let report = rm.run_check(now).await.unwrap();
        assert!(report.rollback.is_none());
        assert!(matches!(report.snapshot, Some(SnapshotOutcome::Saved { .. })));
        let snapshot = store.get_latest_stable_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.config.get("risk_per_trade").map(String::as_str), Some("0.02"));
        assert!((snapshot.win_rate - 80.0).abs() < 1e-9);

        assert_eq!(
            rm.maybe_snapshot(now + Duration::hours(2)).unwrap(),
            SnapshotOutcome::TooSoon
        );
    }

    #[test]
    fn test_small_sample_not_eligible() {
        let now = Utc::now();
        let trades = vec![trade(dec!(2), now), trade(dec!(1), now)];
        assert!(snapshot_eligibility(&trades, &RollbackConfig::default()).is_none());
    }
}
