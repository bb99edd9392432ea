//! Configuration management
//!
//! Backtest and live runs are configured with JSON files
//! (`configs/backtest.json`, `configs/live.json`). API credentials never live in
//! these files; they come from the environment (`.env` is loaded at startup).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backtest::{
    base_asset, BacktestDataConfig, BacktestEngineConfig, BacktestRunConfig, VenueConfig,
};
use crate::binance::ClientConfig;
use crate::identifiers::{InstrumentId, TraderId};
use crate::risk::RiskEngineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// =============================================================================
// Strategy section
// =============================================================================

/// Registered strategy name plus its parameters.
///
/// `instrument_id` and `bar_type_1min` are filled in per instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn default_strategy_name() -> String {
    "vwap_multi_timeframe".to_string()
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Default for StrategySpec {
    fn default() -> Self {
        StrategySpec {
            strategy_name: default_strategy_name(),
            params: empty_params(),
        }
    }
}

/// `{instrument_id}-1-MINUTE-LAST-EXTERNAL`
pub fn one_minute_bar_type(instrument_id: &InstrumentId) -> String {
    format!("{}-1-MINUTE-LAST-EXTERNAL", instrument_id)
}

impl StrategySpec {
    pub fn for_instrument(&self, instrument_id: &InstrumentId) -> Result<StrategySpec, ConfigError> {
        let mut params = match &self.params {
            serde_json::Value::Null => serde_json::Map::new(),
            serde_json::Value::Object(map) => map.clone(),
            other => {
                return Err(ConfigError::Invalid(format!(
                    "strategy params must be an object, got {}",
                    other
                )))
            }
        };
        params.insert("instrument_id".into(), instrument_id.to_string().into());
        params
            .entry("bar_type_1min")
            .or_insert_with(|| one_minute_bar_type(instrument_id).into());
        Ok(StrategySpec {
            strategy_name: self.strategy_name.clone(),
            params: serde_json::Value::Object(params),
        })
    }
}

// =============================================================================
// Backtest configuration
// =============================================================================

/// Picks a catalog instrument by position (negative counts from the end) or id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunSelector {
    Index(i64),
    Id(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestFileConfig {
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    /// Inclusive, `YYYY-MM-DD` or datetime
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub engine: BacktestEngineConfig,
    #[serde(default)]
    pub strategy: StrategySpec,
    /// Instruments to run; empty runs every catalog instrument
    #[serde(default)]
    pub runs: Vec<RunSelector>,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("./data/binance/catalog")
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}

impl BacktestFileConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: BacktestFileConfig = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.venue
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("venue: {}", e)))?;
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            let start = crate::catalog::parse_time_bound(start, false)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            let end = crate::catalog::parse_time_bound(end, true)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if start > end {
                return Err(ConfigError::Invalid(format!(
                    "start {} is after end {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    /// Resolve run selectors against the catalog's sorted instrument ids
    pub fn select_instruments(
        &self,
        available: &[InstrumentId],
    ) -> Result<Vec<InstrumentId>, ConfigError> {
        if self.runs.is_empty() {
            return Ok(available.to_vec());
        }
        self.runs
            .iter()
            .map(|selector| match selector {
                RunSelector::Index(i) => {
                    let len = available.len() as i64;
                    let idx = if *i < 0 { len + i } else { *i };
                    if (0..len).contains(&idx) {
                        Ok(available[idx as usize].clone())
                    } else {
                        Err(ConfigError::Invalid(format!(
                            "run index {} out of range for {} instruments",
                            i, len
                        )))
                    }
                }
                RunSelector::Id(id) => available
                    .iter()
                    .find(|a| a.to_string() == *id)
                    .cloned()
                    .ok_or_else(|| ConfigError::Invalid(format!("instrument {} not in catalog", id))),
            })
            .collect()
    }

    /// One run per instrument, id `BT-{BASE}`
    pub fn run_configs(
        &self,
        instruments: &[InstrumentId],
    ) -> Result<Vec<BacktestRunConfig>, ConfigError> {
        instruments
            .iter()
            .map(|instrument_id| {
                let bar_type = one_minute_bar_type(instrument_id)
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("{}", e)))?;
                Ok(BacktestRunConfig {
                    engine: BacktestEngineConfig {
                        run_id: format!("BT-{}", base_asset(instrument_id)),
                        ..self.engine.clone()
                    },
                    venue: self.venue.clone(),
                    data: BacktestDataConfig {
                        catalog_path: self.catalog_path.clone(),
                        instrument_id: instrument_id.clone(),
                        bar_types: vec![bar_type],
                        start_time: self.start.clone(),
                        end_time: self.end.clone(),
                    },
                    strategy: self.strategy.for_instrument(instrument_id)?,
                })
            })
            .collect()
    }
}

// =============================================================================
// Live configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_level_file: String,
    pub log_directory: PathBuf,
    pub log_file_name: String,
    /// `json` or `plain`
    pub log_file_format: String,
    pub log_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: "INFO".to_string(),
            log_level_file: "DEBUG".to_string(),
            log_directory: PathBuf::from("./logs"),
            log_file_name: "vwap-strategy.json".to_string(),
            log_file_format: "json".to_string(),
            log_colors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecEngineConfig {
    pub reconciliation: bool,
    pub reconciliation_lookback_mins: u32,
    /// Ignore venue positions on other instruments
    pub filter_position_reports: bool,
}

impl Default for ExecEngineConfig {
    fn default() -> Self {
        ExecEngineConfig {
            reconciliation: true,
            reconciliation_lookback_mins: 1440,
            filter_position_reports: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub database_path: PathBuf,
    pub flush_on_start: bool,
    pub timestamps_as_iso8601: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            database_path: PathBuf::from("./data/live_cache.db"),
            flush_on_start: false,
            timestamps_as_iso8601: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinanceClientSection {
    pub account_type: String,
    pub testnet: bool,
    pub max_retries: u32,
    /// Seconds
    pub retry_delay: f64,
}

impl Default for BinanceClientSection {
    fn default() -> Self {
        BinanceClientSection {
            account_type: "USDT_FUTURE".to_string(),
            testnet: false,
            max_retries: 3,
            retry_delay: 1.0,
        }
    }
}

/// All values in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connection: f64,
    pub reconciliation: f64,
    pub portfolio: f64,
    pub disconnection: f64,
    pub post_stop: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connection: 30.0,
            reconciliation: 10.0,
            portfolio: 10.0,
            disconnection: 10.0,
            post_stop: 5.0,
        }
    }
}

pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_live_trader_id")]
    pub trader_id: TraderId,
    pub instrument_id: InstrumentId,
    #[serde(default)]
    pub strategy: StrategySpec,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub exec_engine: ExecEngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub client: BinanceClientSection,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub risk: RiskEngineConfig,
    /// Leverage to set on the venue at startup; unchanged when absent
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
}

fn default_live_trader_id() -> TraderId {
    TraderId::new("VWAP-TRADER-001")
}

fn default_poll_interval() -> f64 {
    5.0
}

impl LiveConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: LiveConfig = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.account_type != "USDT_FUTURE" {
            return Err(ConfigError::Invalid(format!(
                "unsupported account type {}, only USDT_FUTURE",
                self.client.account_type
            )));
        }
        if !(self.poll_interval_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_secs must be positive, got {}",
                self.poll_interval_secs
            )));
        }
        if !(self.client.retry_delay >= 0.0) {
            return Err(ConfigError::Invalid("retry_delay must be >= 0".to_string()));
        }
        Ok(())
    }

    pub fn strategy_spec(&self) -> Result<StrategySpec, ConfigError> {
        self.strategy.for_instrument(&self.instrument_id)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_testnet(self.client.testnet)
            .with_retries(self.client.max_retries, secs(self.client.retry_delay))
            .with_timeout(secs(self.timeouts.connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(values: &[&str]) -> Vec<InstrumentId> {
        values.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn test_run_selectors() {
        let config: BacktestFileConfig = serde_json::from_value(json!({
            "runs": [0, "LTCUSDT-PERP.BINANCE", -1]
        }))
        .unwrap();
        let available = ids(&[
            "ADAUSDT-PERP.BINANCE",
            "BTCUSDT-PERP.BINANCE",
            "LTCUSDT-PERP.BINANCE",
            "SUIUSDT-PERP.BINANCE",
        ]);
        let selected = config.select_instruments(&available).unwrap();
        assert_eq!(
            selected,
            ids(&["ADAUSDT-PERP.BINANCE", "LTCUSDT-PERP.BINANCE", "SUIUSDT-PERP.BINANCE"])
        );

        let bad: BacktestFileConfig = serde_json::from_value(json!({ "runs": [7] })).unwrap();
        assert!(bad.select_instruments(&available).is_err());
    }

    #[test]
    fn test_run_configs_fill_strategy_params() {
        let config: BacktestFileConfig = serde_json::from_value(json!({
            "start": "2024-01-01",
            "end": "2024-12-31",
            "venue": { "name": "BINANCE", "starting_balances": ["100 USDT"] },
            "strategy": {
                "strategy_name": "vwap_multi_timeframe",
                "params": { "risk_per_trade": 0.1 }
            }
        }))
        .unwrap();
        config.validate().unwrap();

        let runs = config.run_configs(&ids(&["ADAUSDT-PERP.BINANCE"])).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id(), "BT-ADA");
        assert_eq!(runs[0].data.start_time.as_deref(), Some("2024-01-01"));
        let params = &runs[0].strategy.params;
        assert_eq!(params["instrument_id"], "ADAUSDT-PERP.BINANCE");
        assert_eq!(params["bar_type_1min"], "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL");
        assert_eq!(params["risk_per_trade"], 0.1);
    }

    #[test]
    fn test_backtest_rejects_inverted_range() {
        let config: BacktestFileConfig =
            serde_json::from_value(json!({ "start": "2024-02-01", "end": "2024-01-01" })).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_live_defaults() {
        let config: LiveConfig =
            serde_json::from_value(json!({ "instrument_id": "ADAUSDT-PERP.BINANCE" })).unwrap();
        config.validate().unwrap();
        assert_eq!(config.trader_id.as_str(), "VWAP-TRADER-001");
        assert_eq!(config.exec_engine.reconciliation_lookback_mins, 1440);
        assert!(!config.cache.flush_on_start);
        assert_eq!(config.timeouts.post_stop, 5.0);
        assert_eq!(config.client.max_retries, 3);
        assert_eq!(config.client_config().retry_delay, Duration::from_secs(1));

        let spec = config.strategy_spec().unwrap();
        assert_eq!(spec.strategy_name, "vwap_multi_timeframe");
        assert_eq!(spec.params["instrument_id"], "ADAUSDT-PERP.BINANCE");
    }

    #[test]
    fn test_params_must_be_object() {
        let spec = StrategySpec {
            strategy_name: "vwap_multi_timeframe".to_string(),
            params: json!([1, 2]),
        };
        assert!(spec
            .for_instrument(&"ADAUSDT-PERP.BINANCE".parse().unwrap())
            .is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = LiveConfig::from_file("/nonexistent/live.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
