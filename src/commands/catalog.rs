//! Catalog commands: import raw klines and verify catalog contents

use anyhow::{bail, Context, Result};
use tracing::info;
use vwap_trader::binance::{BinanceFuturesClient, BinanceFuturesInstrumentProvider, ClientConfig};
use vwap_trader::data::{process_raw_data, verify_catalog};

pub fn import(raw: String, processed: String, catalog: String) -> Result<()> {
    info!("Importing raw data from {} into {}", raw, catalog);

    let client = BinanceFuturesClient::new(ClientConfig::default(), None)?;
    let mut provider = BinanceFuturesInstrumentProvider::new();
    let runtime = tokio::runtime::Runtime::new().context("Failed to build tokio runtime")?;
    runtime
        .block_on(provider.load_all(&client))
        .context("Failed to load instrument definitions from Binance")?;

    let summary = process_raw_data(&raw, &processed, &catalog, &provider)?;

    println!("\n{}", "=".repeat(60));
    println!("IMPORT SUMMARY");
    println!("{}", "=".repeat(60));
    for (bar_type, count) in &summary.imported {
        println!("  {:<55} {:>10} bars", bar_type.to_string(), count);
    }
    for name in &summary.skipped {
        println!("  skipped (unknown instrument): {}", name);
    }
    for (name, reason) in &summary.failed {
        println!("  FAILED {}: {}", name, reason);
    }
    println!("{}", "-".repeat(60));
    println!(
        "  Imported {} files, {} bars",
        summary.imported.len(),
        summary.total_bars()
    );
    println!("{}", "=".repeat(60));

    if !summary.failed.is_empty() {
        bail!("{} files failed to import", summary.failed.len());
    }
    Ok(())
}

pub fn verify(catalog: String, spec: String) -> Result<()> {
    let entries = verify_catalog(&catalog, &spec)?;

    println!("\n{}", "=".repeat(60));
    println!("CATALOG {}", catalog);
    println!("{}", "=".repeat(60));
    println!("Found {} instruments", entries.len());

    for entry in &entries {
        println!("\n{}", entry.instrument_id);
        println!("  Bar type: {}", entry.bar_type);
        println!("  Bars:     {}", entry.bar_count);
        if let (Some(first), Some(last)) = (&entry.first, &entry.last) {
            println!(
                "  First:    {} O={} H={} L={} C={} V={}",
                first.ts_event, first.open, first.high, first.low, first.close, first.volume
            );
            println!(
                "  Last:     {} O={} H={} L={} C={} V={}",
                last.ts_event, last.open, last.high, last.low, last.close, last.volume
            );
        } else {
            println!("  No {} bars", spec);
        }
    }
    println!("{}", "=".repeat(60));
    Ok(())
}
