//! VWAP Trader
//!
//! A VWAP multi-timeframe strategy for Binance USDT-margined perpetual
//! futures, with a deterministic backtest engine over a local data catalog,
//! a polling live node, and tooling to download and import klines.

pub mod aggregation;
pub mod backtest;
pub mod binance;
pub mod catalog;
pub mod common;
pub mod config;
pub mod data;
pub mod identifiers;
pub mod indicators;
pub mod instrument;
pub mod live;
pub mod orders;
pub mod portfolio;
pub mod risk;
pub mod strategies;
pub mod types;

pub use identifiers::{BarType, InstrumentId};
pub use instrument::Instrument;
pub use types::*;
