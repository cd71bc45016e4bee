//! Hedge conflict detection and resolution
//!
//! A hedge conflict is a LONG and a SHORT position open on the same symbol
//! at the same time. Both legs are closed with reduce-side market orders.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::exchange::{normalize_symbol, ExchangeAdapter};
use crate::types::{Direction, RemotePosition, Symbol, TradeMode};

#[derive(Debug, Clone, PartialEq)]
pub struct HedgeConflict {
    pub symbol: Symbol,
    pub long_size: Decimal,
    pub short_size: Decimal,
}

impl HedgeConflict {
    pub fn net_exposure(&self) -> Decimal {
        self.long_size - self.short_size
    }
}

/// Legs closed while resolving one conflict
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HedgeResolution {
    pub closed_legs: usize,
    pub failed_legs: usize,
}

/// Groups non-zero positions by canonical symbol and reports symbols held
/// in both directions, sorted by symbol
pub fn detect_conflicts(positions: &[RemotePosition], mode: TradeMode) -> Vec<HedgeConflict> {
    let mut sizes: BTreeMap<Symbol, (Decimal, Decimal)> = BTreeMap::new();

    for pos in positions.iter().filter(|p| !p.size().is_zero()) {
        let entry = sizes
            .entry(normalize_symbol(&pos.raw_symbol, mode))
            .or_default();
        match pos.direction() {
            Direction::Long => entry.0 += pos.size(),
            Direction::Short => entry.1 += pos.size(),
        }
    }

    sizes
        .into_iter()
        .filter(|(_, (long, short))| !long.is_zero() && !short.is_zero())
        .map(|(symbol, (long_size, short_size))| {
            let conflict = HedgeConflict {
                symbol,
                long_size,
                short_size,
            };
            warn!(
                symbol = %conflict.symbol,
                "Hedge detected: LONG {} + SHORT {} = NET {}",
                long_size,
                short_size,
                conflict.net_exposure()
            );
            conflict
        })
        .collect()
}

/// Closes both legs of every conflict; failures are logged per leg
pub async fn resolve_conflicts(
    adapter: &dyn ExchangeAdapter,
    conflicts: &[HedgeConflict],
) -> HedgeResolution {
    let mut resolution = HedgeResolution::default();

    for conflict in conflicts {
        for (direction, size) in [
            (Direction::Long, conflict.long_size),
            (Direction::Short, conflict.short_size),
        ] {
            match adapter
                .create_market_order(&conflict.symbol, direction.exit_side(), size)
                .await
            {
                Ok(Some(order)) => {
                    info!(
                        symbol = %conflict.symbol,
                        "Hedge leg {} {} closed (order {})", direction, size, order.id
                    );
                    resolution.closed_legs += 1;
                }
                Ok(None) => {
                    error!(symbol = %conflict.symbol, "Hedge leg {} close refused", direction);
                    resolution.failed_legs += 1;
                }
                Err(e) => {
                    error!(symbol = %conflict.symbol, "Hedge leg {} close failed: {}", direction, e);
                    resolution.failed_legs += 1;
                }
            }
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn remote(symbol: &str, side: Option<Direction>, contracts: Decimal) -> RemotePosition {
        RemotePosition {
            raw_symbol: symbol.into(),
            hold_side: side,
            contracts,
            entry_price: dec!(100),
            mark_price: None,
        }
    }

    #[test]
    fn test_detects_both_legs_across_symbol_forms() {
        let positions = vec![
            remote("BTC/USDT:USDT", Some(Direction::Long), dec!(0.5)),
            remote("BTCUSDT", Some(Direction::Short), dec!(0.2)),
            remote("ETHUSDT", Some(Direction::Long), dec!(1)),
        ];
        let conflicts = detect_conflicts(&positions, TradeMode::Futures);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].symbol.as_str(), "BTCUSDT");
        assert_eq!(conflicts[0].net_exposure(), dec!(0.3));
    }

    #[test]
    fn test_one_way_sign_and_zero_sizes() {
        let positions = vec![
            remote("SOLUSDT", None, dec!(-3)),
            remote("SOLUSDT", Some(Direction::Long), Decimal::ZERO),
        ];
        assert!(detect_conflicts(&positions, TradeMode::Futures).is_empty());
    }
}
