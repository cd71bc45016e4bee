//! `reconcile`: one pass, or the reconciliation loop alone

use anyhow::Result;
use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use trade_sentinel::service::{shutdown_channel, wait_for_shutdown};

use super::run::spawn_ctrl_c;
use super::{build_engine, load_config};

pub fn run(config_path: String, once: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(config_path, once))
}

async fn run_async(config_path: String, once: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    let engine = build_engine(config)?;
    let reconciler = engine.reconciler();

    if once {
        let report = reconciler.run_cycle(Utc::now()).await?;
        println!("users:       {}", report.users);
        println!("reconciled:  {}", report.reconciled);
        println!("skipped:     {}", report.skipped);
        println!("failed:      {}", report.failed);
        println!("timed out:   {}", report.timed_out);
        println!("adopted:     {}", report.adopted);
        println!("closed:      {}", report.closed);
        println!("ignored:     {}", report.ignored);
        return Ok(());
    }

    let (tx, mut rx) = shutdown_channel();
    spawn_ctrl_c(tx);

    let mut ticker = interval(engine.config().reconcile.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.run_cycle(Utc::now()).await {
                    error!("Reconciliation cycle failed: {:#}", e);
                }
            }
            _ = wait_for_shutdown(&mut rx) => {
                info!("Reconciliation stopped");
                break;
            }
        }
    }
    Ok(())
}
