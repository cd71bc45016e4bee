//! Bitget USDT-M futures adapter
//!
//! REST v2 client implementing [`crate::exchange::ExchangeAdapter`] with
//! request signing, retries, pacing and a circuit breaker.

pub mod auth;
pub mod client;
pub mod types;

pub use client::{BitgetClient, BitgetFactory, ClientConfig};
