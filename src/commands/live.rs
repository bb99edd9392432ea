//! Live trading command

use anyhow::{Context, Result};
use tracing::{info, warn};
use vwap_trader::config::LiveConfig;
use vwap_trader::live::run_live;

pub fn run(config: LiveConfig, testnet: bool) -> Result<()> {
    let mut config = config;
    if testnet {
        config.client.testnet = true;
    }

    info!("{}", "=".repeat(60));
    info!("VWAP TRADER - {}", if config.client.testnet { "TESTNET" } else { "LIVE" });
    info!("{}", "=".repeat(60));
    info!("Trader:     {}", config.trader_id);
    info!("Instrument: {}", config.instrument_id);
    info!("Strategy:   {}", config.strategy.strategy_name);
    info!("Cache:      {}", config.cache.database_path.display());
    info!("{}", "=".repeat(60));

    if !config.client.testnet {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_live(config))?;
    info!("Live trading session ended.");
    Ok(())
}
