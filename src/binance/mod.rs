//! Binance USDT-M futures integration

pub mod auth;
pub mod client;
pub mod provider;
pub mod types;

pub use auth::Credentials;
pub use client::{BinanceFuturesClient, ClientConfig, FUTURES_BASE_URL, FUTURES_TESTNET_URL};
pub use provider::{BinanceFuturesInstrumentProvider, InstrumentProvider, StaticInstrumentProvider};
pub use types::*;
