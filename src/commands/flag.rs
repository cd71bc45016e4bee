//! `flag set|clear`: toggle a global risk flag

use anyhow::Result;

use trade_sentinel::risk::{PortfolioRiskManager, RiskFlag};

use super::{load_config, open_store};

pub fn run(config_path: String, name: String, active: bool) -> Result<()> {
    let flag: RiskFlag = name.parse()?;
    let config = load_config(&config_path)?;
    let store = open_store(&config)?;
    let manager = PortfolioRiskManager::new(store, config.risk.clone());

    manager.set_flag(flag, active)?;
    let flags = manager.flags()?;
    println!(
        "emergency_stop={} weak_setup_stop={}",
        flags.emergency_stop, flags.weak_setup_stop
    );
    Ok(())
}
