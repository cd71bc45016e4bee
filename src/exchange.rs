//! Exchange adapter abstraction
//!
//! The reconciliation loop only talks to an exchange through
//! [`ExchangeAdapter`]. Implementations translate wire shapes into the
//! canonical types in [`crate::types`] before anything else sees them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::error::AdapterResult;
use crate::types::{
    Balance, Direction, ExchangeCredentials, OpenOrder, OrderHandle, RemotePosition, Side, Symbol,
    TradeMode, UserId,
};

/// Per-user exchange session
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Open positions; an empty list when flat
    async fn fetch_positions(&self) -> AdapterResult<Vec<RemotePosition>>;

    /// Resting orders for one symbol
    async fn fetch_open_orders(&self, symbol: &Symbol) -> AdapterResult<Vec<OpenOrder>>;

    /// `Ok(None)` means the exchange refused the order
    async fn place_take_profit(
        &self,
        symbol: &Symbol,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
        tag: &str,
    ) -> AdapterResult<Option<OrderHandle>>;

    async fn place_stop_loss(
        &self,
        symbol: &Symbol,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
    ) -> AdapterResult<Option<OrderHandle>>;

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> AdapterResult<bool>;

    /// Reduce-only market order; `side` is the closing side
    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: Decimal,
    ) -> AdapterResult<Option<OrderHandle>>;

    async fn fetch_balance(&self) -> AdapterResult<Balance>;

    async fn fetch_ticker_price(&self, symbol: &Symbol) -> AdapterResult<Decimal>;
}

/// Builds one adapter per user from that user's credentials
pub trait AdapterFactory: Send + Sync {
    fn connect(
        &self,
        user_id: UserId,
        credentials: &ExchangeCredentials,
    ) -> AdapterResult<Arc<dyn ExchangeAdapter>>;
}

/// Canonical symbol for an exchange-reported one
///
/// Futures symbols arrive in unified form (`BTC/USDT:USDT`) or already flat
/// (`BTCUSDT`); spot symbols as `BTC/USDT`. Both collapse to `BTCUSDT`. The
/// adopt and close-detection paths must both go through here.
pub fn normalize_symbol(raw: &str, mode: TradeMode) -> Symbol {
    let upper = raw.trim().to_ascii_uppercase();

    let flat = match mode {
        TradeMode::Futures if upper.contains("/USDT:USDT") => upper.replace("/USDT:USDT", "USDT"),
        _ if upper.contains("/USDT") && !upper.ends_with("USDT:USDT") => {
            upper.replace("/USDT", "USDT")
        }
        _ => upper,
    };

    Symbol::new(flat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_futures_forms() {
        assert_eq!(normalize_symbol("BTC/USDT:USDT", TradeMode::Futures).as_str(), "BTCUSDT");
        assert_eq!(normalize_symbol(" eth/usdt:usdt ", TradeMode::Futures).as_str(), "ETHUSDT");
        assert_eq!(normalize_symbol("SOLUSDT", TradeMode::Futures).as_str(), "SOLUSDT");
        assert_eq!(normalize_symbol("XRP/USDT", TradeMode::Futures).as_str(), "XRPUSDT");
    }

    #[test]
    fn test_normalize_spot_forms() {
        assert_eq!(normalize_symbol("BTC/USDT", TradeMode::Spot).as_str(), "BTCUSDT");
        assert_eq!(normalize_symbol("adausdt", TradeMode::Spot).as_str(), "ADAUSDT");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["BTC/USDT:USDT", "BTCUSDT", "DOGE/USDT"] {
            let once = normalize_symbol(raw, TradeMode::Futures);
            let twice = normalize_symbol(once.as_str(), TradeMode::Futures);
            assert_eq!(once, twice);
        }
    }
}
