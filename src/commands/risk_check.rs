//! `risk-check`: print the gate decision for a proposed position

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;

use trade_sentinel::risk::{PortfolioRiskManager, UserContext};

use super::{load_config, open_store};

pub fn run(config_path: String, user_id: i64, size: String, deposit: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    let store = open_store(&config)?;
    let manager = PortfolioRiskManager::new(store, config.risk.clone());

    let size = Decimal::from_str(size.trim()).with_context(|| format!("Invalid size: {}", size))?;
    let mut ctx = UserContext::default();
    if let Some(deposit) = deposit {
        let deposit = Decimal::from_str(deposit.trim())
            .with_context(|| format!("Invalid deposit: {}", deposit))?;
        ctx = ctx.with_deposit(deposit);
    }

    let decision = manager.check(user_id, size, &ctx, Utc::now());
    println!("{}", serde_json::to_string_pretty(&decision)?);

    if let Some(metrics) = manager.cached_metrics(user_id) {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        let adjusted = manager.get_position_size_adjustment(user_id, size);
        if adjusted < size {
            println!("suggested size after risk adjustment: {}", adjusted.round_dp(2));
        }
    }
    Ok(())
}
