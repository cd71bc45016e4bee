//! Position reconciliation loop
//!
//! Each cycle makes the locally tracked OPEN positions of every user agree
//! with the exchange. Per user, strictly in order:
//!
//! 1. resolve hedge conflicts, then re-fetch positions
//! 2. adopt/update positions that match a known signal and drive their
//!    protective state
//! 3. close local positions the exchange no longer reports, subject to the
//!    minimum-age guard
//!
//! Users run as independent tasks. A per-user async mutex keeps at most one
//! pass in flight per user; a user still busy from the previous cycle is
//! skipped.

pub mod hedge;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::AdapterError;
use crate::exchange::{normalize_symbol, AdapterFactory, ExchangeAdapter};
use crate::notify::Notifier;
use crate::protection::{PositionView, ProtectionDriver, ProtectionOutcome, ProtectiveState};
use crate::store::{SqliteStore, UpsertOutcome};
use crate::types::{
    ExchangeCredentials, PositionRecord, PositionStatus, Symbol, TradeMode, UserId, UserMode,
};

/// In-memory state of one user, owned by whichever pass holds its lock
#[derive(Default)]
pub struct UserTracker {
    adapter: Option<Arc<dyn ExchangeAdapter>>,
    states: HashMap<Symbol, ProtectiveState>,
    /// Closed by an engine market order but possibly still reported by the
    /// exchange; never re-adopted until the exchange drops them
    engine_closed: HashSet<Symbol>,
}

impl UserTracker {
    pub fn state(&self, symbol: &Symbol) -> Option<&ProtectiveState> {
        self.states.get(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassStatus {
    #[default]
    Reconciled,
    SkippedBusy,
    SkippedNoCredentials,
    SkippedSpot,
}

/// What one user's pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserReport {
    pub status: PassStatus,
    pub adopted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Remote positions refused (no signal or direction mismatch)
    pub ignored: usize,
    pub closed: usize,
    /// Missing remotely but held back by the age guard
    pub deferred: usize,
    pub hedges_resolved: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub users: usize,
    pub reconciled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub adopted: usize,
    pub closed: usize,
    pub ignored: usize,
}

impl CycleReport {
    fn absorb(&mut self, report: &UserReport) {
        match report.status {
            PassStatus::Reconciled => self.reconciled += 1,
            _ => self.skipped += 1,
        }
        self.adopted += report.adopted;
        self.closed += report.closed;
        self.ignored += report.ignored;
    }
}

/// Whether a locally OPEN position missing remotely may be closed now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseGuard {
    Allow,
    TooYoung { age_secs: i64 },
    /// Open time missing or unparsable; never closed
    UnknownAge,
}

pub fn close_guard(pos: &PositionRecord, now: DateTime<Utc>, min_age_secs: i64) -> CloseGuard {
    match pos.entry_time_utc() {
        None => CloseGuard::UnknownAge,
        Some(opened) => {
            let age = now - opened;
            if age < Duration::seconds(min_age_secs) {
                CloseGuard::TooYoung {
                    age_secs: age.num_seconds(),
                }
            } else {
                CloseGuard::Allow
            }
        }
    }
}

pub struct Reconciler {
    store: SqliteStore,
    factory: Arc<dyn AdapterFactory>,
    notifier: Arc<dyn Notifier>,
    cfg: ReconcileConfig,
    default_credentials: Option<ExchangeCredentials>,
    trackers: std::sync::Mutex<HashMap<UserId, Arc<AsyncMutex<UserTracker>>>>,
}

impl Reconciler {
    pub fn new(
        store: SqliteStore,
        factory: Arc<dyn AdapterFactory>,
        notifier: Arc<dyn Notifier>,
        cfg: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            factory,
            notifier,
            cfg,
            default_credentials: None,
            trackers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Credentials used for users without stored keys
    pub fn with_default_credentials(mut self, credentials: Option<ExchangeCredentials>) -> Self {
        self.default_credentials = credentials.filter(ExchangeCredentials::is_valid);
        self
    }

    pub fn tracker(&self, user_id: UserId) -> Arc<AsyncMutex<UserTracker>> {
        let mut trackers = self
            .trackers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(trackers.entry(user_id).or_default())
    }

    /// Auto-mode users plus every user with stored keys
    pub fn users_to_reconcile(&self) -> Result<Vec<UserId>> {
        let mut users = self.store.get_users_by_mode(UserMode::Auto)?;
        users.extend(self.store.users_with_credentials()?);
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    /// One pass over all users; per-user failures never abort the cycle
    pub async fn run_cycle(self: &Arc<Self>, now: DateTime<Utc>) -> Result<CycleReport> {
        let users = self.users_to_reconcile()?;
        let mut report = CycleReport {
            users: users.len(),
            ..Default::default()
        };
        info!("Reconciling positions for {} users", users.len());

        let handles: Vec<_> = users
            .into_iter()
            .map(|user_id| {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.reconcile_user(user_id, now).await });
                (user_id, handle)
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.cfg.user_timeout();
        for (user_id, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(user_report))) => report.absorb(&user_report),
                Ok(Ok(Err(e))) => {
                    warn!(user = user_id, "Reconciliation failed: {:#}", e);
                    report.failed += 1;
                }
                Ok(Err(e)) => {
                    error!(user = user_id, "Reconciliation task panicked: {}", e);
                    report.failed += 1;
                }
                Err(_) => {
                    // The task keeps running and holds the user lock, so the
                    // next cycle skips this user instead of overlapping it
                    warn!(user = user_id, "Reconciliation still running after timeout");
                    report.timed_out += 1;
                }
            }
        }

        info!(
            "Cycle done: {} reconciled, {} skipped, {} failed, {} timed out | adopted {} closed {} ignored {}",
            report.reconciled,
            report.skipped,
            report.failed,
            report.timed_out,
            report.adopted,
            report.closed,
            report.ignored
        );
        Ok(report)
    }

    fn credentials_for(&self, user_id: UserId) -> Result<Option<ExchangeCredentials>> {
        let stored = self
            .store
            .get_credentials(user_id)?
            .filter(ExchangeCredentials::is_valid);
        Ok(stored.or_else(|| self.default_credentials.clone()))
    }

    /// One user's pass; skipped when a previous pass still holds the lock
    pub async fn reconcile_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<UserReport> {
        let tracker = self.tracker(user_id);
        let Ok(mut tracker) = tracker.try_lock_owned() else {
            debug!(user = user_id, "Previous pass still running; skipping");
            return Ok(UserReport {
                status: PassStatus::SkippedBusy,
                ..Default::default()
            });
        };

        let account = self.store.get_user(user_id)?;
        let mode = account.as_ref().map(|a| a.mode).unwrap_or_default();
        let trade_mode = account.as_ref().map(|a| a.trade_mode).unwrap_or_default();

        if trade_mode == TradeMode::Spot {
            debug!(user = user_id, "Spot user: positions tracked locally only");
            return Ok(UserReport {
                status: PassStatus::SkippedSpot,
                ..Default::default()
            });
        }

        let Some(credentials) = self.credentials_for(user_id)? else {
            debug!(user = user_id, "No exchange credentials; skipping");
            return Ok(UserReport {
                status: PassStatus::SkippedNoCredentials,
                ..Default::default()
            });
        };

        let adapter = match &tracker.adapter {
            Some(adapter) => Arc::clone(adapter),
            None => {
                let adapter = self.factory.connect(user_id, &credentials)?;
                tracker.adapter = Some(Arc::clone(&adapter));
                adapter
            }
        };

        let result = self
            .reconcile_with(&mut tracker, adapter.as_ref(), user_id, mode, trade_mode, now)
            .await;

        if let Err(e) = &result {
            if matches!(e.downcast_ref::<AdapterError>(), Some(AdapterError::Auth(_))) {
                // Reconnect with fresh credentials next cycle
                tracker.adapter = None;
            }
        }
        result
    }

    async fn reconcile_with(
        &self,
        tracker: &mut UserTracker,
        adapter: &dyn ExchangeAdapter,
        user_id: UserId,
        mode: UserMode,
        trade_mode: TradeMode,
        now: DateTime<Utc>,
    ) -> Result<UserReport> {
        let mut report = UserReport::default();

        // 1. Hedge conflicts first; they change what the exchange reports
        let mut remote = adapter.fetch_positions().await?;
        let conflicts = hedge::detect_conflicts(&remote, trade_mode);
        if !conflicts.is_empty() {
            warn!(user = user_id, "{} hedge conflicts detected", conflicts.len());
            let resolution = hedge::resolve_conflicts(adapter, &conflicts).await;
            report.hedges_resolved = conflicts.len();
            for conflict in &conflicts {
                tracker.states.remove(&conflict.symbol);
                self.notifier
                    .notify_user(
                        user_id,
                        &format!(
                            "{}: opposite LONG and SHORT positions were closed",
                            conflict.symbol
                        ),
                    )
                    .await;
            }
            info!(
                user = user_id,
                "Hedge resolution: {} legs closed, {} failed",
                resolution.closed_legs,
                resolution.failed_legs
            );
            remote = adapter.fetch_positions().await?;
        }

        debug!(user = user_id, "{} positions reported by exchange", remote.len());

        // 2. Adopt/update
        let mut remote_symbols: HashSet<Symbol> = HashSet::new();
        let driver = ProtectionDriver {
            cfg: &self.cfg,
            adapter,
            store: &self.store,
            notifier: self.notifier.as_ref(),
        };

        for rp in remote.iter().filter(|p| p.size() > Decimal::ZERO) {
            let symbol = normalize_symbol(&rp.raw_symbol, trade_mode);
            let direction = rp.direction();
            // Reported positions are never closed locally, adopted or not
            remote_symbols.insert(symbol.clone());

            if tracker.engine_closed.contains(&symbol) {
                debug!(user = user_id, symbol = %symbol, "Closed by engine, awaiting exchange");
                continue;
            }

            let Some(signal) = self.store.get_signal(user_id, &symbol)? else {
                info!(
                    user = user_id,
                    symbol = %symbol,
                    "Untracked/manual position ({} {}); not adopting",
                    direction,
                    rp.size()
                );
                report.ignored += 1;
                continue;
            };

            if signal.direction != direction {
                warn!(
                    user = user_id,
                    symbol = %symbol,
                    "Exchange reports {} but signal says {}; not adopting",
                    direction,
                    signal.direction
                );
                report.ignored += 1;
                continue;
            }

            let existing = self.store.get_position(user_id, &symbol)?;
            if existing.as_ref().is_some_and(|e| e.direction != direction) {
                tracker.states.remove(&symbol);
            }

            let entry_price = if rp.entry_price > Decimal::ZERO {
                rp.entry_price
            } else {
                signal.entry_price
            };
            let record = PositionRecord {
                id: None,
                user_id,
                symbol: symbol.clone(),
                direction,
                entry_price,
                quantity: rp.size(),
                status: PositionStatus::Open,
                entry_time: None,
                trade_mode,
            };

            match self.store.upsert_position(&record, now)? {
                UpsertOutcome::Inserted => {
                    info!(
                        user = user_id,
                        symbol = %symbol,
                        "Adopted {} {} @ {}", direction, rp.size(), entry_price
                    );
                    report.adopted += 1;
                }
                UpsertOutcome::Updated => report.updated += 1,
                UpsertOutcome::Unchanged => report.unchanged += 1,
            }

            let Some(position) = self.store.get_position(user_id, &symbol)? else {
                continue;
            };

            let view = PositionView {
                position: &position,
                remote: rp,
                signal: Some(&signal),
            };
            let state = tracker.states.entry(symbol.clone()).or_default();
            match driver.drive(&view, state, now).await {
                ProtectionOutcome::Tracking => {}
                ProtectionOutcome::FullyClosed => {
                    tracker.states.remove(&symbol);
                }
                ProtectionOutcome::ClosedByEngine => {
                    tracker.states.remove(&symbol);
                    tracker.engine_closed.insert(symbol.clone());
                    if self.store.close_position(user_id, &symbol, now)? {
                        report.closed += 1;
                    }
                }
            }
        }

        // 3. Close detection
        for pos in self.store.open_positions(user_id)? {
            if remote_symbols.contains(&pos.symbol) {
                continue;
            }
            if mode == UserMode::Manual {
                debug!(
                    user = user_id,
                    symbol = %pos.symbol,
                    "Missing on exchange; manual user, not closing"
                );
                continue;
            }
            if pos.trade_mode == TradeMode::Spot {
                continue;
            }

            match close_guard(&pos, now, self.cfg.min_position_age_secs) {
                CloseGuard::TooYoung { age_secs } => {
                    debug!(
                        user = user_id,
                        symbol = %pos.symbol,
                        "Missing on exchange but only {}s old; keeping", age_secs
                    );
                    report.deferred += 1;
                }
                CloseGuard::UnknownAge => {
                    warn!(
                        user = user_id,
                        symbol = %pos.symbol,
                        "Missing on exchange with unknown open time {:?}; not closing",
                        pos.entry_time
                    );
                    report.deferred += 1;
                }
                CloseGuard::Allow => {
                    if self.store.close_position(user_id, &pos.symbol, now)? {
                        info!(
                            user = user_id,
                            symbol = %pos.symbol,
                            "Closed by exchange: {} {}", pos.direction, pos.quantity
                        );
                        report.closed += 1;
                        tracker.states.remove(&pos.symbol);
                        self.notifier
                            .notify_user(
                                user_id,
                                &format!(
                                    "{} {} was closed on the exchange",
                                    pos.symbol, pos.direction
                                ),
                            )
                            .await;
                    }
                }
            }
        }

        tracker.states.retain(|symbol, _| remote_symbols.contains(symbol));
        tracker.engine_closed.retain(|symbol| remote_symbols.contains(symbol));

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_position;
    use crate::types::Direction;
    use rust_decimal_macros::dec;

    #[test]
    fn test_close_guard_age_threshold() {
        let now = Utc::now();
        let young = open_position(
            1,
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(1),
            Some(now - Duration::minutes(2)),
            TradeMode::Futures,
        );
        assert!(matches!(close_guard(&young, now, 180), CloseGuard::TooYoung { .. }));

        let old = PositionRecord {
            entry_time: open_position(
                1,
                "BTCUSDT",
                Direction::Long,
                dec!(100),
                dec!(1),
                Some(now - Duration::minutes(6)),
                TradeMode::Futures,
            )
            .entry_time,
            ..young.clone()
        };
        assert_eq!(close_guard(&old, now, 180), CloseGuard::Allow);
    }

    #[test]
    fn test_close_guard_refuses_unknown_age() {
        let now = Utc::now();
        let mut pos = open_position(1, "ETHUSDT", Direction::Short, dec!(10), dec!(1), None, TradeMode::Futures);
        assert_eq!(close_guard(&pos, now, 180), CloseGuard::UnknownAge);
        pos.entry_time = Some("not a date".into());
        assert_eq!(close_guard(&pos, now, 180), CloseGuard::UnknownAge);
    }
}
