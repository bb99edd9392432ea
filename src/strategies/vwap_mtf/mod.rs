//! VWAP Multi-Timeframe Strategy
//!
//! 4-hour VWAP gives the trend, 15-minute VWAP crossovers with a volume spike
//! give entries, and standard deviation bands around the 15-minute VWAP give
//! exits. Both higher timeframes are aggregated from 1-minute bars.

mod config;
mod strategy;

pub use config::VwapStrategyConfig;
pub use strategy::{PositionTracking, TradeStatistics, VwapMultiTimeframeStrategy};

use crate::strategies::Strategy;
use anyhow::Result;

/// Create strategy from its JSON parameters (called by registry)
pub fn create(params: &serde_json::Value) -> Result<Box<dyn Strategy>> {
    let config: VwapStrategyConfig = serde_json::from_value(params.clone())
        .map_err(|e| anyhow::anyhow!("Failed to parse vwap_multi_timeframe config: {}", e))?;
    Ok(Box::new(VwapMultiTimeframeStrategy::new(config)?))
}
