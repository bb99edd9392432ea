//! Live trading against Binance futures

pub mod cache;
pub mod execution;
pub mod node;

pub use cache::{LiveCache, StrategySnapshot};
pub use execution::{fill_from_response, BinanceExecution};
pub use node::{closed_bars_since, run_live, LiveNode};
