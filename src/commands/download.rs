//! Download command - fetch historical futures klines from Binance

use anyhow::{Context, Result};
use tracing::info;
use vwap_trader::binance::{BinanceFuturesClient, ClientConfig};
use vwap_trader::data::{download_klines, load_raw_csv};

pub fn run(symbols: String, interval: String, days: i64, output: String) -> Result<()> {
    info!("Starting data download from Binance futures");

    let symbols: Vec<String> = symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOADING HISTORICAL DATA FROM BINANCE FUTURES");
    println!("{}", "=".repeat(60));
    println!("  Symbols:  {:?}", symbols);
    println!("  Interval: {}", interval);
    println!("  Days:     {}", days);
    println!("  Output:   {}", output);
    println!("{}\n", "=".repeat(60));

    let client = BinanceFuturesClient::new(ClientConfig::default(), None)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to build tokio runtime")?;
    let files = runtime.block_on(download_klines(&client, &symbols, &interval, days, &output))?;

    let mut total_candles = 0;
    for path in &files {
        let candles = load_raw_csv(path)?;
        println!("  {} ✓ {} candles", path.display(), candles.len());
        total_candles += candles.len();
    }

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOAD COMPLETE");
    println!("{}", "=".repeat(60));
    println!("  Successful: {}/{}", files.len(), symbols.len());
    println!("  Total candles: {}", total_candles);
    println!("{}", "=".repeat(60));

    Ok(())
}
