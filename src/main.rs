//! Trade Sentinel - main entry point
//!
//! Subcommands:
//! - run: start the reconciliation, balance-sync and rollback loops
//! - reconcile: a single reconciliation pass over all users
//! - risk-check: print the risk decision for a proposed position
//! - rollback-check: run one rollback/snapshot evaluation
//! - flag: set or clear a global risk flag

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "trade-sentinel")]
#[command(about = "Position reconciliation and risk-gated execution engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults plus environment when missing)
    #[arg(short, long, global = true, default_value = "configs/sentinel.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all engine loops until Ctrl+C
    Run,

    /// Reconcile positions for every user
    Reconcile {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Check whether a new position would pass the portfolio risk gate
    RiskCheck {
        /// User ID
        #[arg(short, long)]
        user: i64,

        /// Proposed position size in quote currency
        #[arg(short, long)]
        size: String,

        /// Deposit override
        #[arg(long)]
        deposit: Option<String>,
    },

    /// Evaluate the rollback manager once
    RollbackCheck,

    /// Set or clear a global risk flag (emergency_stop, weak_setup_stop)
    Flag {
        #[command(subcommand)]
        action: FlagAction,
    },
}

#[derive(Subcommand, Debug)]
enum FlagAction {
    /// Activate a flag
    Set { name: String },
    /// Deactivate a flag
    Clear { name: String },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run => "run",
        Commands::Reconcile { .. } => "reconcile",
        Commands::RiskCheck { .. } => "risk_check",
        Commands::RollbackCheck => "rollback_check",
        Commands::Flag { .. } => "flag",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run => commands::run::run(cli.config),
        Commands::Reconcile { once } => commands::reconcile::run(cli.config, once),
        Commands::RiskCheck {
            user,
            size,
            deposit,
        } => commands::risk_check::run(cli.config, user, size, deposit),
        Commands::RollbackCheck => commands::rollback_check::run(cli.config),
        Commands::Flag { action } => match action {
            FlagAction::Set { name } => commands::flag::run(cli.config, name, true),
            FlagAction::Clear { name } => commands::flag::run(cli.config, name, false),
        },
    }
}
