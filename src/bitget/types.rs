//! Bitget v2 wire types and their translation into canonical values

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::types::{Balance, Direction, OpenOrder, ProtectiveKind, RemotePosition, Side};

/// Success code of the response envelope
pub const SUCCESS_CODE: &str = "00000";

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Bitget sends numbers as strings and uses `""` for "not set"
fn de_opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match raw {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Decimal::from_str(s.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(serde_json::Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected decimal, got {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub symbol: String,
    #[serde(default)]
    pub hold_side: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub total: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub open_price_avg: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub mark_price: Option<Decimal>,
}

impl WirePosition {
    /// `None` for flat or malformed rows
    pub fn into_remote(self) -> Option<RemotePosition> {
        let hold_side = self.hold_side.as_deref().and_then(|s| match s {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        });
        let contracts = self.total?;
        if contracts.is_zero() {
            return None;
        }
        Some(RemotePosition {
            raw_symbol: self.symbol,
            hold_side,
            contracts,
            entry_price: self.open_price_avg.unwrap_or_default(),
            mark_price: self.mark_price,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOrderList {
    #[serde(default)]
    pub entrusted_list: Option<Vec<WirePlanOrder>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePlanOrder {
    pub order_id: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub trigger_price: Option<Decimal>,
}

impl WirePlanOrder {
    pub fn into_open_order(self) -> Option<OpenOrder> {
        let side = Side::from_str(self.side.as_deref()?).ok()?;
        let kind = match self.plan_type.as_deref() {
            Some("profit_plan" | "pos_profit") => Some(ProtectiveKind::TakeProfit),
            Some("loss_plan" | "pos_loss") => Some(ProtectiveKind::StopLoss),
            _ => None,
        };
        Some(OpenOrder {
            id: self.order_id,
            side,
            price: self.trigger_price.unwrap_or_default(),
            kind,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: Option<String>,
    #[serde(default)]
    pub client_oid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    #[serde(default)]
    pub success_list: Vec<serde_json::Value>,
    #[serde(default)]
    pub failure_list: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAccount {
    pub margin_coin: String,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub account_equity: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub usdt_equity: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub available: Option<Decimal>,
}

impl WireAccount {
    pub fn to_balance(&self) -> Balance {
        let total = self
            .account_equity
            .or(self.usdt_equity)
            .unwrap_or_default();
        let free = self.available.unwrap_or_default().min(total.max(Decimal::ZERO));
        Balance {
            total,
            free,
            used: (total - free).max(Decimal::ZERO),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTicker {
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub last_pr: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub mark_price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_translation() {
        let json = r#"{"code":"00000","msg":"success","data":[
            {"symbol":"BTCUSDT","holdSide":"short","total":"0.02","openPriceAvg":"64000.5","markPrice":""},
            {"symbol":"ETHUSDT","holdSide":"long","total":"0","openPriceAvg":"3000"}
        ]}"#;
        let env: Envelope<Vec<WirePosition>> = serde_json::from_str(json).unwrap();
        assert_eq!(env.code, SUCCESS_CODE);
        let positions: Vec<_> = env
            .data
            .unwrap()
            .into_iter()
            .filter_map(WirePosition::into_remote)
            .collect();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].direction(), Direction::Short);
        assert_eq!(positions[0].size(), dec!(0.02));
        assert_eq!(positions[0].entry_price, dec!(64000.5));
        assert!(positions[0].mark_price.is_none());
    }

    #[test]
    fn test_plan_order_translation() {
        let json = r#"{"entrustedList":[
            {"orderId":"1","side":"sell","planType":"loss_plan","triggerPrice":"95.5"},
            {"orderId":"2","side":"sell","planType":"profit_plan","triggerPrice":"104"}
        ]}"#;
        let list: PlanOrderList = serde_json::from_str(json).unwrap();
        let orders: Vec<_> = list
            .entrusted_list
            .unwrap()
            .into_iter()
            .filter_map(WirePlanOrder::into_open_order)
            .collect();
        assert_eq!(orders[0].kind, Some(ProtectiveKind::StopLoss));
        assert_eq!(orders[1].kind, Some(ProtectiveKind::TakeProfit));
        assert_eq!(orders[0].price, dec!(95.5));

        let empty: PlanOrderList = serde_json::from_str(r#"{"entrustedList":null}"#).unwrap();
        assert!(empty.entrusted_list.is_none());
    }

    #[test]
    fn test_account_balance() {
        let account: WireAccount = serde_json::from_str(
            r#"{"marginCoin":"USDT","accountEquity":"1200.5","available":"900.5"}"#,
        )
        .unwrap();
        let balance = account.to_balance();
        assert_eq!(balance.total, dec!(1200.5));
        assert_eq!(balance.free, dec!(900.5));
        assert_eq!(balance.used, dec!(300));
    }
}
