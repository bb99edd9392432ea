//! Backtest node: runs independent backtest configurations in parallel
//!
//! Each run owns its engine, venue and data, so runs share nothing and are
//! spread over the rayon thread pool.

use anyhow::{anyhow, Context, Result};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info};

use super::engine::{BacktestEngine, BacktestEngineConfig, BacktestResult};
use super::exchange::VenueConfig;
use crate::catalog::{parse_time_bound, DataCatalog};
use crate::config::StrategySpec;
use crate::identifiers::{BarType, InstrumentId};
use crate::instrument::Instrument;
use crate::strategies::create_strategy;
use crate::types::Bar;

/// Which bars to replay for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestDataConfig {
    pub catalog_path: PathBuf,
    pub instrument_id: InstrumentId,
    pub bar_types: Vec<BarType>,
    /// Inclusive; `YYYY-MM-DD` or a datetime
    #[serde(default)]
    pub start_time: Option<String>,
    /// Inclusive; a bare date covers the whole day
    #[serde(default)]
    pub end_time: Option<String>,
}

impl BacktestDataConfig {
    /// Instrument definition and every requested bar in the time range
    pub fn load(&self) -> Result<(Instrument, Vec<Bar>)> {
        let catalog = DataCatalog::new(&self.catalog_path);
        let instrument = catalog
            .instrument(&self.instrument_id)?
            .ok_or_else(|| {
                anyhow!(
                    "Instrument {} not found in catalog {}",
                    self.instrument_id,
                    self.catalog_path.display()
                )
            })?;

        let start = self
            .start_time
            .as_deref()
            .map(|s| parse_time_bound(s, false))
            .transpose()?;
        let end = self
            .end_time
            .as_deref()
            .map(|s| parse_time_bound(s, true))
            .transpose()?;

        let mut bars = Vec::new();
        for bar_type in &self.bar_types {
            let loaded = catalog
                .query_bars(bar_type, start, end)
                .with_context(|| format!("Failed to query {}", bar_type))?;
            info!("Loaded {} bars for {}", loaded.len(), bar_type);
            bars.extend(loaded);
        }
        Ok((instrument, bars))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRunConfig {
    #[serde(default)]
    pub engine: BacktestEngineConfig,
    #[serde(default)]
    pub venue: VenueConfig,
    pub data: BacktestDataConfig,
    pub strategy: StrategySpec,
}

/// Base asset of a USDT instrument, `ADAUSDT-PERP.BINANCE` -> `ADA`
pub fn base_asset(instrument_id: &InstrumentId) -> &str {
    let symbol = instrument_id.symbol();
    let pair = symbol.split('-').next().unwrap_or(symbol);
    pair.strip_suffix("USDT").unwrap_or(pair)
}

impl BacktestRunConfig {
    /// Run id `BT-{BASE}` unless one was configured
    pub fn id(&self) -> String {
        if self.engine.run_id.is_empty() {
            format!("BT-{}", base_asset(&self.data.instrument_id))
        } else {
            self.engine.run_id.clone()
        }
    }

    pub fn run(&self) -> Result<BacktestResult> {
        let (instrument, bars) = self.data.load()?;
        let strategy = create_strategy(&self.strategy.strategy_name, &self.strategy.params)?;
        let engine_config = BacktestEngineConfig {
            run_id: self.id(),
            ..self.engine.clone()
        };
        let engine = BacktestEngine::new(engine_config, self.venue.clone(), vec![instrument], strategy)?;
        engine.run(bars)
    }
}

pub struct BacktestNode {
    configs: Vec<BacktestRunConfig>,
}

impl BacktestNode {
    pub fn new(configs: Vec<BacktestRunConfig>) -> Self {
        BacktestNode { configs }
    }

    pub fn configs(&self) -> &[BacktestRunConfig] {
        &self.configs
    }

    /// Run every configuration; results keep the configuration order
    pub fn run(&self) -> Vec<(String, Result<BacktestResult>)> {
        info!("Running {} backtest(s)", self.configs.len());

        let pb = ProgressBar::new(self.configs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█░ "),
        );

        let results: Vec<(String, Result<BacktestResult>)> = self
            .configs
            .par_iter()
            .progress_with(pb.clone())
            .map(|config| {
                let id = config.id();
                let result = config.run();
                if let Err(e) = &result {
                    error!("[{}] Backtest failed: {:#}", id, e);
                }
                (id, result)
            })
            .collect();

        pb.finish_with_message("done");
        results
    }
}

/// Print one row per run followed by trade details
pub fn print_summary(results: &[&BacktestResult]) {
    println!("\n{}", "=".repeat(110));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(110));
    println!(
        "{:<10} {:>12} {:>12} {:>9} {:>8} {:>8} {:>8} {:>7} {:>8} {:>10}",
        "Run", "Start", "Final", "Return%", "Sharpe", "MaxDD%", "WinRate", "Trades", "PF", "Commission"
    );
    println!("{}", "-".repeat(110));
    for result in results {
        let m = &result.metrics;
        println!(
            "{:<10} {:>12.2} {:>12.2} {:>9.2} {:>8.2} {:>8.2} {:>7.1}% {:>7} {:>8.2} {:>10.4}",
            result.run_id,
            result.starting_balance,
            result.final_balance,
            m.total_return,
            m.sharpe_ratio,
            m.max_drawdown,
            m.win_rate,
            m.total_trades,
            m.profit_factor,
            m.total_commission
        );
    }
    println!("{}", "=".repeat(110));

    for result in results {
        let m = &result.metrics;
        println!(
            "{}: won {} / lost {}, avg win {:.4}, avg loss {:.4}, largest win {:.4}, largest loss {:.4}, calmar {:.2}",
            result.run_id,
            m.winning_trades,
            m.losing_trades,
            m.avg_win,
            m.avg_loss,
            m.largest_win,
            m.largest_loss,
            m.calmar_ratio
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(instrument: &str) -> BacktestDataConfig {
        BacktestDataConfig {
            catalog_path: PathBuf::from("./data/catalog"),
            instrument_id: instrument.parse().unwrap(),
            bar_types: vec![format!("{}-1-MINUTE-LAST-EXTERNAL", instrument).parse().unwrap()],
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_base_asset() {
        assert_eq!(base_asset(&"ADAUSDT-PERP.BINANCE".parse().unwrap()), "ADA");
        assert_eq!(base_asset(&"1000PEPEUSDT-PERP.BINANCE".parse().unwrap()), "1000PEPE");
        assert_eq!(base_asset(&"BTCBUSD.BINANCE".parse().unwrap()), "BTCBUSD");
    }

    #[test]
    fn test_run_id_derived_from_instrument() {
        let config = BacktestRunConfig {
            engine: BacktestEngineConfig {
                run_id: String::new(),
                ..Default::default()
            },
            venue: VenueConfig::default(),
            data: data("SOLUSDT-PERP.BINANCE"),
            strategy: StrategySpec {
                strategy_name: "vwap_multi_timeframe".to_string(),
                params: serde_json::Value::Null,
            },
        };
        assert_eq!(config.id(), "BT-SOL");
    }

    #[test]
    fn test_missing_instrument_fails_run() {
        let mut config = data("ADAUSDT-PERP.BINANCE");
        config.catalog_path = std::env::temp_dir().join("vwap-trader-node-missing-catalog");
        let err = config.load().unwrap_err();
        assert!(err.to_string().contains("not found in catalog"));
    }
}
