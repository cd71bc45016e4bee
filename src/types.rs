//! Core data types shared by the reconciliation, risk and rollback engines

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Numeric user identifier (chat user id upstream)
pub type UserId = i64;

/// Canonical trading symbol, e.g. `BTCUSDT`
///
/// Symbols are cloned into every position key, order and log line, so the
/// backing string is reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a stored enum column holds an unknown value
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Order side that reduces/closes a position in this direction
    pub fn exit_side(self) -> Side {
        match self {
            Direction::Long => Side::Sell,
            Direction::Short => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ParseEnumError;

    /// Accepts both position vocabulary (LONG/SHORT) and signal vocabulary (BUY/SELL)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            _ => Err(ParseEnumError {
                kind: "direction",
                value: s.to_string(),
            }),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(ParseEnumError {
                kind: "side",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a local position record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            _ => Err(ParseEnumError {
                kind: "position status",
                value: s.to_string(),
            }),
        }
    }
}

/// Market a user trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    #[default]
    Futures,
    Spot,
}

impl TradeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeMode::Futures => "futures",
            TradeMode::Spot => "spot",
        }
    }
}

impl FromStr for TradeMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "futures" | "live" => Ok(TradeMode::Futures),
            "spot" => Ok(TradeMode::Spot),
            _ => Err(ParseEnumError {
                kind: "trade mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether the engine executes for the user or only provides signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserMode {
    #[default]
    Auto,
    Manual,
}

impl UserMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UserMode::Auto => "auto",
            UserMode::Manual => "manual",
        }
    }
}

impl FromStr for UserMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(UserMode::Auto),
            "manual" => Ok(UserMode::Manual),
            _ => Err(ParseEnumError {
                kind: "user mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Locally tracked position, one OPEN row per `(user, symbol)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub status: PositionStatus,
    /// Raw stored open time; kept as text so an unparsable value can be
    /// detected by the close guard instead of being silently defaulted.
    pub entry_time: Option<String>,
    pub trade_mode: TradeMode,
}

impl PositionRecord {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn entry_time_utc(&self) -> Option<DateTime<Utc>> {
        self.entry_time.as_deref().and_then(parse_timestamp)
    }
}

/// Parses the timestamp formats found in the positions table
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Trade signal accepted upstream; the target levels are optional because
/// older signal rows were stored without them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub user_id: UserId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub tp1_price: Option<Decimal>,
    pub tp2_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub signal_token: String,
}

/// Position as reported by the exchange, already translated into canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePosition {
    /// Symbol exactly as the exchange reported it
    pub raw_symbol: String,
    /// `long`/`short` hold side in hedge mode, absent in one-way mode
    pub hold_side: Option<Direction>,
    /// Signed size; negative means short in one-way mode
    pub contracts: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
}

impl RemotePosition {
    /// Direction from the side field when present, else from the size sign
    pub fn direction(&self) -> Direction {
        match self.hold_side {
            Some(direction) => direction,
            None if self.contracts < Decimal::ZERO => Direction::Short,
            None => Direction::Long,
        }
    }

    pub fn size(&self) -> Decimal {
        self.contracts.abs()
    }
}

/// What a resting order protects against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectiveKind {
    TakeProfit,
    StopLoss,
}

/// Resting order reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub side: Side,
    pub price: Decimal,
    /// Set when the exchange tags the order as a TP/SL plan
    pub kind: Option<ProtectiveKind>,
}

/// Handle to an accepted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub id: String,
}

/// Account balance in the margin coin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Balance {
    pub total: Decimal,
    pub free: Decimal,
    pub used: Decimal,
}

/// API credentials of one user
#[derive(Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl ExchangeCredentials {
    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.api_secret.trim().is_empty()
    }
}

impl fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

/// Per-user account row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub mode: UserMode,
    pub trade_mode: TradeMode,
    pub deposit: Decimal,
    pub balance: Decimal,
    pub free_deposit: Decimal,
}

/// Realized trade appended to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
    pub pnl_pct: Decimal,
    pub exit_reason: String,
    pub trade_mode: TradeMode,
    pub exit_time: DateTime<Utc>,
}

impl TradeRecord {
    pub fn is_loss(&self) -> bool {
        self.net_pnl < Decimal::ZERO
    }
}

/// Saved configuration with the performance it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub id: Option<i64>,
    pub config: HashMap<String, String>,
    pub win_rate: f64,
    pub pnl_pct: f64,
    pub is_stable: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_direction_parses_both_vocabularies() {
        assert_eq!("BUY".parse::<Direction>().unwrap(), Direction::Long);
        assert_eq!("short".parse::<Direction>().unwrap(), Direction::Short);
        assert!("flat".parse::<Direction>().is_err());
    }

    #[test]
    fn test_remote_direction_prefers_hold_side() {
        let mut pos = RemotePosition {
            raw_symbol: "BTC/USDT:USDT".into(),
            hold_side: Some(Direction::Short),
            contracts: dec!(3),
            entry_price: dec!(100),
            mark_price: None,
        };
        assert_eq!(pos.direction(), Direction::Short);

        pos.hold_side = None;
        assert_eq!(pos.direction(), Direction::Long);
        pos.contracts = dec!(-3);
        assert_eq!(pos.direction(), Direction::Short);
        assert_eq!(pos.size(), dec!(3));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2025-01-02T03:04:05Z").is_some());
        assert!(parse_timestamp("2025-01-02 03:04:05").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = ExchangeCredentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            passphrase: "pass".into(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("\"secret\""));
        assert!(!rendered.contains("\"key\""));
        assert!(creds.is_valid());
    }
}
