//! Portfolio risk gate
//!
//! Every new position is checked against portfolio-level limits before it
//! reaches the exchange. Checks run in a fixed order and the first failing one
//! decides:
//!
//! ```text
//! size <= 0            -> allowed   ZERO_SIZE_NO_CHECK
//! risk flag active     -> rejected  EMERGENCY_STOP_ACTIVE / WEAK_SETUP_STOP_ACTIVE
//! drawdown >= limit    -> rejected  MAX_DRAWDOWN_EXCEEDED
//! daily loss >= limit  -> rejected  DAILY_LOSS_LIMIT_EXCEEDED
//! open count >= limit  -> rejected  MAX_POSITIONS_EXCEEDED
//! size% > limit        -> rejected  POSITION_SIZE_TOO_LARGE
//! otherwise            -> allowed   RISK_WITHIN_LIMITS
//! ```
//!
//! Metrics are derived from the store on every check:
//! `equity = deposit + realized + unrealized`. Peak equity and the daily
//! baseline live in `runtime_state` so they survive restarts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RiskLimits;
use crate::store::{decimal_text, SqliteStore};
use crate::types::{Direction, ParseEnumError, PositionRecord, Symbol, UserId};

const FLAG_KEY_PREFIX: &str = "risk_flag:";

fn peak_key(user_id: UserId) -> String {
    format!("portfolio_peak_equity:{}", user_id)
}

fn daily_equity_key(user_id: UserId) -> String {
    format!("portfolio_daily_start_equity:{}", user_id)
}

fn daily_date_key(user_id: UserId) -> String {
    format!("portfolio_daily_start_date:{}", user_id)
}

/// Global kill switches consulted before any limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskFlag {
    EmergencyStop,
    WeakSetupStop,
}

impl RiskFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskFlag::EmergencyStop => "emergency_stop",
            RiskFlag::WeakSetupStop => "weak_setup_stop",
        }
    }

    fn state_key(self) -> String {
        format!("{}{}", FLAG_KEY_PREFIX, self.as_str())
    }
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskFlag {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency_stop" => Ok(RiskFlag::EmergencyStop),
            "weak_setup_stop" => Ok(RiskFlag::WeakSetupStop),
            other => Err(ParseEnumError {
                kind: "risk flag",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskFlags {
    pub emergency_stop: bool,
    pub weak_setup_stop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReason {
    ZeroSizeNoCheck,
    EmergencyStopActive,
    WeakSetupStopActive,
    MaxDrawdownExceeded,
    DailyLossLimitExceeded,
    MaxPositionsExceeded,
    PositionSizeTooLarge,
    RiskWithinLimits,
    ErrorFallback,
}

impl RiskReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskReason::ZeroSizeNoCheck => "ZERO_SIZE_NO_CHECK",
            RiskReason::EmergencyStopActive => "EMERGENCY_STOP_ACTIVE",
            RiskReason::WeakSetupStopActive => "WEAK_SETUP_STOP_ACTIVE",
            RiskReason::MaxDrawdownExceeded => "MAX_DRAWDOWN_EXCEEDED",
            RiskReason::DailyLossLimitExceeded => "DAILY_LOSS_LIMIT_EXCEEDED",
            RiskReason::MaxPositionsExceeded => "MAX_POSITIONS_EXCEEDED",
            RiskReason::PositionSizeTooLarge => "POSITION_SIZE_TOO_LARGE",
            RiskReason::RiskWithinLimits => "RISK_WITHIN_LIMITS",
            RiskReason::ErrorFallback => "ERROR_FALLBACK",
        }
    }
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived portfolio state; never the source of truth
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioMetrics {
    pub deposit: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_equity: Decimal,
    pub peak_equity: Decimal,
    pub current_drawdown_pct: Decimal,
    pub daily_start_equity: Decimal,
    /// `total_equity - daily_start_equity`, clamped to `<= 0`
    pub daily_loss: Decimal,
    pub open_positions_count: usize,
    pub used_capital: Decimal,
    pub free_capital: Decimal,
}

impl PortfolioMetrics {
    pub fn daily_loss_pct(&self) -> Decimal {
        if self.daily_start_equity > Decimal::ZERO && self.daily_loss < Decimal::ZERO {
            self.daily_loss.abs() / self.daily_start_equity * dec!(100)
        } else {
            Decimal::ZERO
        }
    }
}

/// Structured outcome of a risk check; rejections are values, not errors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: RiskReason,
    pub risk_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_size_pct: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_max_size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RiskDecision {
    fn allow(reason: RiskReason, risk_score: f64) -> Self {
        Self {
            allowed: true,
            reason,
            risk_score,
            position_size_pct: None,
            suggested_max_size: None,
            error: None,
        }
    }

    fn reject(reason: RiskReason, risk_score: f64) -> Self {
        Self {
            allowed: false,
            ..Self::allow(reason, risk_score)
        }
    }
}

/// Caller-supplied inputs for one check
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    /// Overrides the stored deposit when set
    pub deposit: Option<Decimal>,
    /// Current prices for unrealized PnL; positions without one count as flat
    pub mark_prices: HashMap<Symbol, Decimal>,
}

impl UserContext {
    pub fn with_deposit(mut self, deposit: Decimal) -> Self {
        self.deposit = Some(deposit);
        self
    }

    pub fn with_mark_price(mut self, symbol: impl AsRef<str>, price: Decimal) -> Self {
        self.mark_prices.insert(Symbol::new(symbol), price);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RiskStatistics {
    pub total_checks: u64,
    pub blocked_by_flag: u64,
    pub blocked_by_drawdown: u64,
    pub blocked_by_daily_loss: u64,
    pub blocked_by_position_limit: u64,
    pub blocked_by_capital_limit: u64,
    pub fallbacks: u64,
}

impl RiskStatistics {
    fn record(&mut self, reason: RiskReason) {
        match reason {
            RiskReason::EmergencyStopActive | RiskReason::WeakSetupStopActive => {
                self.blocked_by_flag += 1
            }
            RiskReason::MaxDrawdownExceeded => self.blocked_by_drawdown += 1,
            RiskReason::DailyLossLimitExceeded => self.blocked_by_daily_loss += 1,
            RiskReason::MaxPositionsExceeded => self.blocked_by_position_limit += 1,
            RiskReason::PositionSizeTooLarge => self.blocked_by_capital_limit += 1,
            RiskReason::ErrorFallback => self.fallbacks += 1,
            RiskReason::ZeroSizeNoCheck | RiskReason::RiskWithinLimits => {}
        }
    }
}

fn ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator <= Decimal::ZERO {
        return 0.0;
    }
    (numerator / denominator).to_f64().unwrap_or(0.0)
}

/// Weighted portfolio risk in `[0, 1]`: drawdown 40%, daily loss 30%,
/// position count 20%, capital utilization 10%
pub fn risk_score(limits: &RiskLimits, metrics: &PortfolioMetrics) -> f64 {
    let drawdown = ratio(metrics.current_drawdown_pct, limits.max_portfolio_drawdown_pct);
    let daily = ratio(metrics.daily_loss_pct(), limits.max_daily_loss_pct);
    let positions = if limits.max_open_positions > 0 {
        metrics.open_positions_count as f64 / limits.max_open_positions as f64
    } else {
        0.0
    };
    let utilization = ratio(metrics.used_capital, metrics.total_equity);

    let score = drawdown * 0.40 + daily * 0.30 + positions * 0.20 + utilization * 0.10;
    score.clamp(0.0, 1.0)
}

/// Advisory size multiplier; never above 1
pub fn size_multiplier(risk_score: f64) -> Decimal {
    if risk_score > 0.8 {
        dec!(0.5)
    } else if risk_score > 0.6 {
        dec!(0.7)
    } else if risk_score > 0.4 {
        dec!(0.85)
    } else {
        Decimal::ONE
    }
}

/// The gate itself; a pure function of its inputs
pub fn evaluate(
    limits: &RiskLimits,
    flags: RiskFlags,
    metrics: &PortfolioMetrics,
    proposed_size: Decimal,
) -> RiskDecision {
    if proposed_size <= Decimal::ZERO {
        return RiskDecision::allow(RiskReason::ZeroSizeNoCheck, 0.0);
    }

    if flags.emergency_stop {
        return RiskDecision::reject(RiskReason::EmergencyStopActive, 1.0);
    }
    if flags.weak_setup_stop {
        return RiskDecision::reject(RiskReason::WeakSetupStopActive, 1.0);
    }

    if metrics.total_equity > Decimal::ZERO
        && metrics.peak_equity > Decimal::ZERO
        && metrics.current_drawdown_pct >= limits.max_portfolio_drawdown_pct
    {
        return RiskDecision::reject(RiskReason::MaxDrawdownExceeded, 1.0);
    }

    if metrics.daily_loss_pct() >= limits.max_daily_loss_pct {
        return RiskDecision::reject(RiskReason::DailyLossLimitExceeded, 1.0);
    }

    if metrics.open_positions_count >= limits.max_open_positions {
        return RiskDecision::reject(RiskReason::MaxPositionsExceeded, 0.9);
    }

    let position_size_pct = if metrics.total_equity > Decimal::ZERO {
        proposed_size / metrics.total_equity * dec!(100)
    } else {
        Decimal::ZERO
    };
    if position_size_pct > limits.max_capital_per_position_pct {
        return RiskDecision {
            position_size_pct: Some(position_size_pct),
            suggested_max_size: Some(
                metrics.total_equity * limits.max_capital_per_position_pct / dec!(100),
            ),
            ..RiskDecision::reject(RiskReason::PositionSizeTooLarge, 0.8)
        };
    }

    RiskDecision {
        position_size_pct: Some(position_size_pct),
        ..RiskDecision::allow(RiskReason::RiskWithinLimits, risk_score(limits, metrics))
    }
}

/// Unrealized PnL of open positions at the supplied mark prices
pub fn unrealized_pnl(positions: &[PositionRecord], mark_prices: &HashMap<Symbol, Decimal>) -> Decimal {
    positions
        .iter()
        .filter(|p| p.quantity > Decimal::ZERO)
        .filter_map(|p| {
            let mark = mark_prices.get(&p.symbol).copied()?;
            if mark <= Decimal::ZERO {
                return None;
            }
            Some(match p.direction {
                Direction::Long => (mark - p.entry_price) * p.quantity,
                Direction::Short => (p.entry_price - mark) * p.quantity,
            })
        })
        .sum()
}

/// Portfolio risk manager backed by the store
pub struct PortfolioRiskManager {
    store: SqliteStore,
    limits: RiskLimits,
    /// Last metrics per user
    cache: Mutex<HashMap<UserId, PortfolioMetrics>>,
    stats: Mutex<RiskStatistics>,
}

impl PortfolioRiskManager {
    pub fn new(store: SqliteStore, limits: RiskLimits) -> Self {
        Self {
            store,
            limits,
            cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(RiskStatistics::default()),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Gate a proposed position of `proposed_size` (quote currency)
    ///
    /// Internal failures fail open with `ERROR_FALLBACK`.
    pub fn check(
        &self,
        user_id: UserId,
        proposed_size: Decimal,
        ctx: &UserContext,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        let decision = if proposed_size <= Decimal::ZERO {
            RiskDecision::allow(RiskReason::ZeroSizeNoCheck, 0.0)
        } else {
            match self.evaluate_user(user_id, proposed_size, ctx, now) {
                Ok(decision) => decision,
                Err(e) => {
                    error!(user = user_id, "Risk evaluation failed, allowing: {:#}", e);
                    RiskDecision {
                        error: Some(format!("{:#}", e)),
                        ..RiskDecision::allow(RiskReason::ErrorFallback, 0.5)
                    }
                }
            }
        };

        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.total_checks += 1;
            stats.record(decision.reason);
        }

        if decision.allowed {
            debug!(
                user = user_id,
                "Risk check passed: {} (score {:.2})", decision.reason, decision.risk_score
            );
        } else {
            warn!(
                user = user_id,
                "Risk check blocked {}: {} (score {:.2})",
                proposed_size,
                decision.reason,
                decision.risk_score
            );
        }
        decision
    }

    fn evaluate_user(
        &self,
        user_id: UserId,
        proposed_size: Decimal,
        ctx: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<RiskDecision> {
        let flags = self.flags()?;
        let metrics = self.compute_metrics(user_id, ctx, now)?;
        Ok(evaluate(&self.limits, flags, &metrics, proposed_size))
    }

    pub fn flags(&self) -> Result<RiskFlags> {
        Ok(RiskFlags {
            emergency_stop: self.is_flag_active(RiskFlag::EmergencyStop)?,
            weak_setup_stop: self.is_flag_active(RiskFlag::WeakSetupStop)?,
        })
    }

    pub fn is_flag_active(&self, flag: RiskFlag) -> Result<bool> {
        Ok(matches!(
            self.store.get_state(&flag.state_key())?.as_deref(),
            Some("1") | Some("true")
        ))
    }

    pub fn set_flag(&self, flag: RiskFlag, active: bool) -> Result<()> {
        if active {
            self.store.set_state(&flag.state_key(), "1")?;
            warn!("Risk flag {} set", flag);
        } else {
            self.store.delete_state(&flag.state_key())?;
            info!("Risk flag {} cleared", flag);
        }
        Ok(())
    }

    fn stored_decimal(&self, key: &str) -> Result<Option<Decimal>> {
        Ok(match self.store.get_state(key)? {
            Some(raw) => match Decimal::from_str(raw.trim()) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring unparsable runtime value {}={:?}", key, raw);
                    None
                }
            },
            None => None,
        })
    }

    /// Recompute metrics for `user_id`, updating the persisted peak and
    /// daily baseline
    pub fn compute_metrics(
        &self,
        user_id: UserId,
        ctx: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<PortfolioMetrics> {
        let deposit = match ctx.deposit {
            Some(deposit) => deposit,
            None => self
                .store
                .get_user(user_id)?
                .map(|u| u.deposit)
                .unwrap_or_default(),
        };
        let realized_pnl = self.store.get_realized_pnl(user_id, None)?;
        let open = self.store.open_positions(user_id)?;
        let unrealized = unrealized_pnl(&open, &ctx.mark_prices);
        let exposure = self.store.open_exposure(user_id)?;

        let mut total_equity = deposit + realized_pnl + unrealized;
        if total_equity <= Decimal::ZERO && deposit > Decimal::ZERO {
            total_equity = deposit;
        }
        let baseline = deposit + realized_pnl;

        // Peak: seeded from the baseline, then a high-water mark
        let stored_peak = self.stored_decimal(&peak_key(user_id))?;
        let mut peak_equity = stored_peak.unwrap_or(baseline).max(total_equity);
        if peak_equity < Decimal::ZERO {
            peak_equity = Decimal::ZERO;
        }
        if stored_peak != Some(peak_equity) {
            self.store.set_state(&peak_key(user_id), &decimal_text(peak_equity))?;
        }

        let current_drawdown_pct = if peak_equity > Decimal::ZERO {
            ((peak_equity - total_equity) / peak_equity * dec!(100)).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let daily_start_equity = self.sync_daily_baseline(user_id, baseline, now)?;
        let daily_loss = (total_equity - daily_start_equity).min(Decimal::ZERO);

        let metrics = PortfolioMetrics {
            deposit,
            realized_pnl,
            unrealized_pnl: unrealized,
            total_equity,
            peak_equity,
            current_drawdown_pct,
            daily_start_equity,
            daily_loss,
            open_positions_count: exposure.count,
            used_capital: exposure.used_capital,
            free_capital: (total_equity - exposure.used_capital).max(Decimal::ZERO),
        };

        debug!(
            user = user_id,
            "Portfolio: equity={} peak={} dd={}% open={} used={}",
            metrics.total_equity.round_dp(4),
            metrics.peak_equity.round_dp(4),
            metrics.current_drawdown_pct.round_dp(2),
            metrics.open_positions_count,
            metrics.used_capital.round_dp(4)
        );

        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id, metrics.clone());
        Ok(metrics)
    }

    /// Baseline for today's loss; captured once per UTC day
    fn sync_daily_baseline(&self, user_id: UserId, baseline: Decimal, now: DateTime<Utc>) -> Result<Decimal> {
        let today = now.date_naive().to_string();
        let stored_date = self.store.get_state(&daily_date_key(user_id))?;
        let stored_equity = self.stored_decimal(&daily_equity_key(user_id))?;

        match (stored_date, stored_equity) {
            (Some(date), Some(equity)) if date == today && equity > Decimal::ZERO => Ok(equity),
            _ => {
                self.store
                    .set_state(&daily_equity_key(user_id), &decimal_text(baseline))?;
                self.store.set_state(&daily_date_key(user_id), &today)?;
                debug!(user = user_id, "Daily baseline set to {} for {}", baseline, today);
                Ok(baseline)
            }
        }
    }

    /// Start a new daily window at the current equity
    pub fn reset_daily_baseline(&self, user_id: UserId, ctx: &UserContext, now: DateTime<Utc>) -> Result<()> {
        let metrics = self.compute_metrics(user_id, ctx, now)?;
        self.store.set_state(
            &daily_equity_key(user_id),
            &decimal_text(metrics.total_equity),
        )?;
        self.store
            .set_state(&daily_date_key(user_id), &now.date_naive().to_string())?;
        info!(user = user_id, "Daily baseline reset to {}", metrics.total_equity);
        Ok(())
    }

    pub fn cached_metrics(&self, user_id: UserId) -> Option<PortfolioMetrics> {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&user_id)
            .cloned()
    }

    /// Shrink `base_size` by the user's last known risk score
    pub fn get_position_size_adjustment(&self, user_id: UserId, base_size: Decimal) -> Decimal {
        let Some(metrics) = self.cached_metrics(user_id) else {
            return base_size;
        };
        let score = risk_score(&self.limits, &metrics);
        let multiplier = size_multiplier(score);
        let adjusted = base_size * multiplier;
        if multiplier < Decimal::ONE {
            info!(
                user = user_id,
                "Position size adjusted {} -> {} (risk score {:.2})", base_size, adjusted, score
            );
        }
        adjusted
    }

    pub fn statistics(&self) -> RiskStatistics {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_position;
    use crate::types::{TradeMode, TradeRecord, UserAccount, UserMode};
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn manager_with_deposit(deposit: Decimal) -> (PortfolioRiskManager, SqliteStore) {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_user(&UserAccount {
                user_id: 1,
                mode: UserMode::Auto,
                trade_mode: TradeMode::Futures,
                deposit,
                balance: deposit,
                free_deposit: deposit,
            })
            .unwrap();
        (PortfolioRiskManager::new(store.clone(), RiskLimits::default()), store)
    }

    fn loss(user_id: UserId, net: Decimal, at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: None,
            user_id,
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            quantity: dec!(1),
            entry_price: dec!(100),
            exit_price: dec!(90),
            fees: Decimal::ZERO,
            net_pnl: net,
            pnl_pct: dec!(-10),
            exit_reason: "SL".into(),
            trade_mode: TradeMode::Futures,
            exit_time: at,
        }
    }

    #[test]
    fn test_internal_error_fails_open() {
        let path = std::env::temp_dir().join(format!("sentinel-risk-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let store = SqliteStore::open(&path).unwrap();
        store
            .upsert_user(&UserAccount {
                user_id: 1,
                mode: UserMode::Auto,
                trade_mode: TradeMode::Futures,
                deposit: dec!(1000),
                balance: dec!(1000),
                free_deposit: dec!(1000),
            })
            .unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute("UPDATE users SET deposit = 'not-a-number' WHERE user_id = 1", [])
            .unwrap();

        let rm = PortfolioRiskManager::new(store, RiskLimits::default());
        let decision = rm.check(1, dec!(100), &UserContext::default(), Utc::now());

        assert!(decision.allowed);
        assert_eq!(decision.reason, RiskReason::ErrorFallback);
        assert_relative_eq!(decision.risk_score, 0.5);
        assert!(decision.error.is_some());
        let stats = rm.statistics();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.total_checks, 1);

        drop(rm);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_oversized_position_rejected_on_fresh_account() {
        let (rm, _) = manager_with_deposit(dec!(1000));
        let now = Utc::now();

        let decision = rm.check(1, dec!(200), &UserContext::default(), now);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, RiskReason::PositionSizeTooLarge);
        assert_eq!(decision.suggested_max_size, Some(dec!(150)));

        let metrics = rm.cached_metrics(1).unwrap();
        assert_eq!(metrics.total_equity, dec!(1000));
        assert_eq!(metrics.peak_equity, dec!(1000));
        assert_eq!(metrics.current_drawdown_pct, Decimal::ZERO);

        let ok = rm.check(1, dec!(100), &UserContext::default(), now);
        assert!(ok.allowed);
        assert_eq!(ok.reason, RiskReason::RiskWithinLimits);
    }

    #[test]
    fn test_zero_size_skips_everything() {
        let (rm, _) = manager_with_deposit(dec!(1000));
        rm.set_flag(RiskFlag::EmergencyStop, true).unwrap();
        let decision = rm.check(1, Decimal::ZERO, &UserContext::default(), Utc::now());
        assert!(decision.allowed);
        assert_eq!(decision.reason, RiskReason::ZeroSizeNoCheck);
    }

    #[test]
    fn test_flags_block_and_clear() {
        let (rm, _) = manager_with_deposit(dec!(1000));
        let now = Utc::now();

        rm.set_flag(RiskFlag::WeakSetupStop, true).unwrap();
        let decision = rm.check(1, dec!(10), &UserContext::default(), now);
        assert_eq!(decision.reason, RiskReason::WeakSetupStopActive);
        assert_relative_eq!(decision.risk_score, 1.0);

        rm.set_flag(RiskFlag::EmergencyStop, true).unwrap();
        let decision = rm.check(1, dec!(10), &UserContext::default(), now);
        assert_eq!(decision.reason, RiskReason::EmergencyStopActive);

        rm.set_flag(RiskFlag::EmergencyStop, false).unwrap();
        rm.set_flag(RiskFlag::WeakSetupStop, false).unwrap();
        assert!(rm.check(1, dec!(10), &UserContext::default(), now).allowed);

        let stats = rm.statistics();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.blocked_by_flag, 2);
    }

    #[test]
    fn test_daily_loss_limit_resets_next_day() {
        let (rm, store) = manager_with_deposit(dec!(1000));
        let day1 = Utc::now();

        // Baseline captured at 1000
        assert!(rm.check(1, dec!(10), &UserContext::default(), day1).allowed);

        store.record_trade(&loss(1, dec!(-60), day1)).unwrap();
        let decision = rm.check(1, dec!(10), &UserContext::default(), day1);
        assert_eq!(decision.reason, RiskReason::DailyLossLimitExceeded);

        let day2 = day1 + Duration::days(1);
        let decision = rm.check(1, dec!(10), &UserContext::default(), day2);
        assert!(decision.allowed, "{:?}", decision);
        assert_eq!(rm.cached_metrics(1).unwrap().daily_start_equity, dec!(940));
    }

    #[test]
    fn test_drawdown_uses_persisted_peak() {
        let (rm, store) = manager_with_deposit(dec!(1000));
        let now = Utc::now();
        store.set_state(&peak_key(1), "1200").unwrap();

        let decision = rm.check(1, dec!(10), &UserContext::default(), now);
        assert_eq!(decision.reason, RiskReason::MaxDrawdownExceeded);
        let metrics = rm.cached_metrics(1).unwrap();
        assert_eq!(metrics.peak_equity, dec!(1200));
        assert!(metrics.current_drawdown_pct > dec!(16));
    }

    #[test]
    fn test_open_position_limit() {
        let (_, store) = manager_with_deposit(dec!(100000));
        let rm = PortfolioRiskManager::new(
            store.clone(),
            RiskLimits::default().with_max_open_positions(2),
        );
        let now = Utc::now();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let pos = open_position(1, symbol, Direction::Long, dec!(10), dec!(1), Some(now), TradeMode::Futures);
            store.upsert_position(&pos, now).unwrap();
        }
        let decision = rm.check(1, dec!(10), &UserContext::default(), now);
        assert_eq!(decision.reason, RiskReason::MaxPositionsExceeded);
        assert_relative_eq!(decision.risk_score, 0.9);
    }

    #[test]
    fn test_unrealized_pnl_from_marks() {
        let now = Utc::now();
        let positions = vec![
            open_position(1, "BTCUSDT", Direction::Long, dec!(100), dec!(2), Some(now), TradeMode::Futures),
            open_position(1, "ETHUSDT", Direction::Short, dec!(50), dec!(4), Some(now), TradeMode::Futures),
            open_position(1, "SOLUSDT", Direction::Long, dec!(10), dec!(1), Some(now), TradeMode::Futures),
        ];
        let ctx = UserContext::default()
            .with_mark_price("BTCUSDT", dec!(110))
            .with_mark_price("ETHUSDT", dec!(45));
        assert_eq!(unrealized_pnl(&positions, &ctx.mark_prices), dec!(40));
    }

    #[test]
    fn test_evaluate_is_pure() {
        let limits = RiskLimits::default();
        let metrics = PortfolioMetrics {
            total_equity: dec!(1000),
            peak_equity: dec!(1100),
            current_drawdown_pct: dec!(9.09),
            daily_start_equity: dec!(1020),
            daily_loss: dec!(-20),
            open_positions_count: 4,
            used_capital: dec!(300),
            ..Default::default()
        };
        let first = evaluate(&limits, RiskFlags::default(), &metrics, dec!(50));
        let second = evaluate(&limits, RiskFlags::default(), &metrics, dec!(50));
        assert_eq!(first, second);
        assert!(first.allowed);
        assert!(first.risk_score > 0.4 && first.risk_score < 0.7);
    }

    #[test]
    fn test_drawdown_ignored_without_baseline() {
        let metrics = PortfolioMetrics {
            current_drawdown_pct: dec!(50),
            ..Default::default()
        };
        let decision = evaluate(&RiskLimits::default(), RiskFlags::default(), &metrics, dec!(10));
        assert!(decision.allowed);
    }

    #[test]
    fn test_size_adjustment_bands() {
        assert_eq!(size_multiplier(0.9), dec!(0.5));
        assert_eq!(size_multiplier(0.7), dec!(0.7));
        assert_eq!(size_multiplier(0.5), dec!(0.85));
        assert_eq!(size_multiplier(0.1), Decimal::ONE);

        let (rm, _) = manager_with_deposit(dec!(1000));
        assert_eq!(rm.get_position_size_adjustment(1, dec!(100)), dec!(100));
    }

    #[test]
    fn test_flag_parsing() {
        assert_eq!("emergency_stop".parse::<RiskFlag>().unwrap(), RiskFlag::EmergencyStop);
        assert_eq!("WEAK_SETUP_STOP".parse::<RiskFlag>().unwrap(), RiskFlag::WeakSetupStop);
        assert!("panic".parse::<RiskFlag>().is_err());
    }
}
