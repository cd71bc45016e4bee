//! Configuration management
//!
//! Handles loading and parsing of the JSON configuration file with environment
//! variable support for API credentials. Every section has defaults, so a
//! partial file (or none at all) is valid.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ExchangeCredentials;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub reconcile: ReconcileConfig,
    pub risk: RiskLimits,
    pub rollback: RollbackConfig,
    pub balance_sync: BalanceSyncConfig,
    pub service: ServiceConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file {}", path.as_ref().display())
        })?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, used when no config file exists
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var("BITGET_API_KEY") {
            self.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BITGET_API_SECRET") {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Ok(passphrase) = std::env::var("BITGET_PASSPHRASE") {
            self.exchange.passphrase = Some(passphrase);
        }
        if let Ok(dir) = std::env::var("SENTINEL_STATE_DIR") {
            self.service.state_dir = PathBuf::from(dir);
        }
    }

    /// Reject combinations that would make the state machine ambiguous
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconcile;
        if r.tp1_shrink_min_pct >= r.tp1_shrink_max_pct {
            bail!(
                "reconcile.tp1_shrink_min_pct ({}) must be below tp1_shrink_max_pct ({})",
                r.tp1_shrink_min_pct,
                r.tp1_shrink_max_pct
            );
        }
        if r.tp1_shrink_max_pct >= r.full_close_shrink_pct {
            bail!(
                "reconcile.tp1_shrink_max_pct ({}) must be below full_close_shrink_pct ({})",
                r.tp1_shrink_max_pct,
                r.full_close_shrink_pct
            );
        }
        if r.tp1_close_fraction <= Decimal::ZERO || r.tp1_close_fraction >= Decimal::ONE {
            bail!("reconcile.tp1_close_fraction must be in (0, 1)");
        }
        if r.interval_secs == 0 || self.rollback.check_interval_secs == 0 {
            bail!("loop intervals must be positive");
        }
        if self.risk.max_open_positions == 0 {
            bail!("risk.max_open_positions must be positive");
        }
        Ok(())
    }
}

/// Exchange connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    pub base_url: String,
    pub product_type: String,
    pub margin_coin: String,
    /// Account uses hedge (dual-side) position mode
    pub hedge_mode: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub rate_limit: usize,
    pub circuit_breaker_threshold: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            passphrase: None,
            base_url: "https://api.bitget.com".to_string(),
            product_type: "USDT-FUTURES".to_string(),
            margin_coin: "USDT".to_string(),
            hedge_mode: true,
            timeout_secs: 15,
            max_retries: 2,
            rate_limit: 10,
            circuit_breaker_threshold: 5,
        }
    }
}

impl ExchangeConfig {
    /// Process-wide credentials from the environment, if complete
    pub fn default_credentials(&self) -> Option<ExchangeCredentials> {
        let creds = ExchangeCredentials {
            api_key: self.api_key.clone()?,
            api_secret: self.api_secret.clone()?,
            passphrase: self.passphrase.clone().unwrap_or_default(),
        };
        creds.is_valid().then_some(creds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reconciliation loop and protective order thresholds
///
/// Percentages are expressed in percent (2 = 2%), fractions in `0..1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Upper bound a cycle waits for one user's pass before moving on
    pub user_timeout_secs: u64,
    /// Positions younger than this are never closed by reconciliation
    pub min_position_age_secs: i64,
    /// Fraction of the entry-to-TP1 distance that arms breakeven
    pub breakeven_trigger_progress: Decimal,
    /// Fee buffer added to the entry price for the breakeven stop
    pub breakeven_fee_buffer_pct: Decimal,
    /// Share of the position closed by TP1
    pub tp1_close_fraction: Decimal,
    pub tp1_shrink_min_pct: Decimal,
    pub tp1_shrink_max_pct: Decimal,
    pub full_close_shrink_pct: Decimal,
    pub fallback_tp1_pct: Decimal,
    pub fallback_tp2_pct: Decimal,
    pub fallback_sl_pct: Decimal,
    /// Adverse PnL that forces a market close under manual protection
    pub emergency_stop_pct: Decimal,
    /// Fee rate used to estimate ledger fees on engine-initiated closes
    pub taker_fee_rate: Decimal,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            interval_secs: 120,
            user_timeout_secs: 60,
            min_position_age_secs: 180,
            breakeven_trigger_progress: dec!(0.5),
            breakeven_fee_buffer_pct: dec!(0.1),
            tp1_close_fraction: dec!(0.5),
            tp1_shrink_min_pct: dec!(40),
            tp1_shrink_max_pct: dec!(60),
            full_close_shrink_pct: dec!(80),
            fallback_tp1_pct: dec!(2),
            fallback_tp2_pct: dec!(4),
            fallback_sl_pct: dec!(2),
            emergency_stop_pct: dec!(5),
            taker_fee_rate: dec!(0.0005),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_secs(self.user_timeout_secs)
    }
}

/// Portfolio risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_portfolio_drawdown_pct: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub max_open_positions: usize,
    pub max_capital_per_position_pct: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        RiskLimits {
            max_portfolio_drawdown_pct: dec!(10),
            max_daily_loss_pct: dec!(5),
            max_open_positions: 10,
            max_capital_per_position_pct: dec!(15),
        }
    }
}

impl RiskLimits {
    pub fn with_max_drawdown_pct(mut self, pct: Decimal) -> Self {
        self.max_portfolio_drawdown_pct = pct;
        self
    }

    pub fn with_max_daily_loss_pct(mut self, pct: Decimal) -> Self {
        self.max_daily_loss_pct = pct;
        self
    }

    pub fn with_max_open_positions(mut self, max: usize) -> Self {
        self.max_open_positions = max;
        self
    }

    pub fn with_max_capital_per_position_pct(mut self, pct: Decimal) -> Self {
        self.max_capital_per_position_pct = pct;
        self
    }
}

/// Autonomous rollback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub check_interval_secs: u64,
    pub loss_window_hours: i64,
    /// Cumulative trade PnL% over the loss window at or below which the
    /// window is abnormal
    pub loss_threshold_pct: f64,
    pub consecutive_losses: usize,
    pub snapshot_window_days: i64,
    pub snapshot_min_trades: usize,
    pub snapshot_min_win_rate: f64,
    pub snapshot_interval_hours: i64,
    pub cooldown_hours: i64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        RollbackConfig {
            check_interval_secs: 3600,
            loss_window_hours: 24,
            loss_threshold_pct: -5.0,
            consecutive_losses: 3,
            snapshot_window_days: 7,
            snapshot_min_trades: 5,
            snapshot_min_win_rate: 60.0,
            snapshot_interval_hours: 24,
            cooldown_hours: 6,
        }
    }
}

impl RollbackConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Balance synchronization loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Upper bound a sync round waits for one user's balance
    pub user_timeout_secs: u64,
}

impl Default for BalanceSyncConfig {
    fn default() -> Self {
        BalanceSyncConfig {
            enabled: true,
            interval_secs: 300,
            user_timeout_secs: 30,
        }
    }
}

impl BalanceSyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_secs(self.user_timeout_secs.max(1))
    }
}

/// Process level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub state_dir: PathBuf,
    pub shutdown_timeout_secs: u64,
    /// Queue notifications in the database; `false` only logs them
    pub notify_outbox: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            state_dir: PathBuf::from("state"),
            shutdown_timeout_secs: 15,
            notify_outbox: true,
        }
    }
}

impl ServiceConfig {
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("sentinel.db")
    }

    /// JSON dump written on shutdown
    pub fn export_path(&self) -> PathBuf {
        self.state_dir.join("sentinel_state.json")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "risk": { "max_open_positions": 4 } }"#).unwrap();
        assert_eq!(config.risk.max_open_positions, 4);
        assert_eq!(config.risk.max_daily_loss_pct, dec!(5));
        assert_eq!(config.reconcile.interval_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_decimal_fields_accept_numbers_and_strings() {
        let config: Config = serde_json::from_str(
            r#"{ "reconcile": { "breakeven_trigger_progress": 0.6, "fallback_sl_pct": "1.5" } }"#,
        )
        .unwrap();
        assert_eq!(config.reconcile.breakeven_trigger_progress, dec!(0.6));
        assert_eq!(config.reconcile.fallback_sl_pct, dec!(1.5));
    }

    #[test]
    fn test_overlapping_shrink_bands_rejected() {
        let mut config = Config::default();
        config.reconcile.tp1_shrink_max_pct = dec!(85);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_credentials_require_key_and_secret() {
        let mut exchange = ExchangeConfig::default();
        assert!(exchange.default_credentials().is_none());
        exchange.api_key = Some("k".into());
        exchange.api_secret = Some("s".into());
        assert!(exchange.default_credentials().is_some());
    }
}
