//! VWAP Multi-Timeframe Strategy Configuration

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::identifiers::{BarType, InstrumentId};

/// VWAP Multi-Timeframe Strategy Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VwapStrategyConfig {
    /// Instrument to trade, e.g. `ADAUSDT-PERP.BINANCE`
    pub instrument_id: InstrumentId,
    /// External 1-minute bar type the 15-minute and 4-hour bars are built from
    pub bar_type_1min: BarType,

    // === Bands ===
    /// Number of 15-minute bars used for the band width (default: 100)
    #[serde(default = "default_vwap_period_15min")]
    pub vwap_period_15min: usize,
    /// Number of 4-hour bars kept for reference (default: 30)
    #[serde(default = "default_vwap_period_4h")]
    pub vwap_period_4h: usize,
    /// Standard deviation multiplier for the VWAP bands (default: 2.0)
    #[serde(default = "default_std_dev_multiplier")]
    pub std_dev_multiplier: f64,

    // === Entry ===
    /// Volume relative to its 20-bar average required to enter (default: 1.5)
    #[serde(default = "default_entry_volume_threshold")]
    pub entry_volume_threshold: f64,

    // === Risk ===
    /// Fraction of the account balance risked per trade (default: 0.02)
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    /// Close any position older than this many hours (default: 168)
    #[serde(default = "default_time_exit_hours")]
    pub time_exit_hours: u64,

    /// Suffix of the strategy id (default: "000")
    #[serde(default = "default_order_id_tag")]
    pub order_id_tag: String,
}

fn default_vwap_period_15min() -> usize {
    100
}

fn default_vwap_period_4h() -> usize {
    30
}

fn default_std_dev_multiplier() -> f64 {
    2.0
}

fn default_entry_volume_threshold() -> f64 {
    1.5
}

fn default_risk_per_trade() -> f64 {
    0.02
}

fn default_time_exit_hours() -> u64 {
    24 * 7
}

fn default_order_id_tag() -> String {
    "000".to_string()
}

impl VwapStrategyConfig {
    /// Config with default parameters for the given instrument and 1-minute bar type
    pub fn new(instrument_id: InstrumentId, bar_type_1min: BarType) -> Self {
        VwapStrategyConfig {
            instrument_id,
            bar_type_1min,
            vwap_period_15min: default_vwap_period_15min(),
            vwap_period_4h: default_vwap_period_4h(),
            std_dev_multiplier: default_std_dev_multiplier(),
            entry_volume_threshold: default_entry_volume_threshold(),
            risk_per_trade: default_risk_per_trade(),
            time_exit_hours: default_time_exit_hours(),
            order_id_tag: default_order_id_tag(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vwap_period_15min == 0 || self.vwap_period_4h == 0 {
            bail!("VWAP periods must be positive");
        }
        if !(self.std_dev_multiplier >= 0.0) {
            bail!("std_dev_multiplier must be >= 0, got {}", self.std_dev_multiplier);
        }
        if !(self.entry_volume_threshold >= 0.0) {
            bail!(
                "entry_volume_threshold must be >= 0, got {}",
                self.entry_volume_threshold
            );
        }
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade <= 1.0) {
            bail!("risk_per_trade must be in (0, 1], got {}", self.risk_per_trade);
        }
        if self.time_exit_hours == 0 {
            bail!("time_exit_hours must be positive");
        }
        if self.bar_type_1min.instrument_id() != &self.instrument_id {
            bail!(
                "bar_type_1min {} does not belong to {}",
                self.bar_type_1min,
                self.instrument_id
            );
        }
        Ok(())
    }
}
