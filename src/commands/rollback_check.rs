//! `rollback-check`: one rollback/snapshot evaluation

use anyhow::Result;
use chrono::Utc;

use super::{build_engine, load_config};

pub fn run(config_path: String) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let config = load_config(&config_path)?;
        let engine = build_engine(config)?;
        let report = engine.rollback().run_check(Utc::now()).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok::<(), anyhow::Error>(())
    })
}
