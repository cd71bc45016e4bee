//! Trade Sentinel
//!
//! Keeps an automated futures operator's local view of open positions in
//! agreement with the exchange, manages take-profit/stop-loss protection for
//! adopted positions, gates new positions through portfolio risk limits and
//! rolls configuration back after abnormal losses.

pub mod balance;
pub mod bitget;
pub mod common;
pub mod config;
pub mod error;
pub mod exchange;
pub mod notify;
pub mod protection;
pub mod reconcile;
pub mod risk;
pub mod rollback;
pub mod service;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{AdapterError, AdapterResult};
pub use types::*;
