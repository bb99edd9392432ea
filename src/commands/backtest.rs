//! Backtest command implementation

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use vwap_trader::backtest::{print_summary, write_reports, BacktestNode, BacktestResult};
use vwap_trader::catalog::DataCatalog;
use vwap_trader::config::BacktestFileConfig;

pub fn run(config_path: String) -> Result<()> {
    info!("Starting backtest");

    let config = BacktestFileConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    info!("Loaded configuration from: {}", config_path);

    let catalog = DataCatalog::new(&config.catalog_path);
    let mut available: Vec<_> = catalog
        .instruments()
        .with_context(|| format!("Failed to read catalog {}", config.catalog_path.display()))?
        .into_iter()
        .map(|i| i.id)
        .collect();
    available.sort_by_key(|id| id.to_string());

    if available.is_empty() {
        bail!(
            "No instruments in catalog {}; run `catalog import` first",
            config.catalog_path.display()
        );
    }
    info!("Catalog has {} instruments", available.len());

    let selected = config.select_instruments(&available)?;
    let run_configs = config.run_configs(&selected)?;
    for run in &run_configs {
        info!(
            "  {} -> {} [{} .. {}]",
            run.id(),
            run.data.instrument_id,
            run.data.start_time.as_deref().unwrap_or("start"),
            run.data.end_time.as_deref().unwrap_or("end")
        );
    }

    let node = BacktestNode::new(run_configs);
    let results = node.run();

    let mut succeeded: Vec<&BacktestResult> = Vec::new();
    let mut failures = 0;
    for (id, result) in &results {
        match result {
            Ok(result) => {
                let written = write_reports(&config.reports_dir, &result.label, result)
                    .with_context(|| format!("[{}] Failed to write reports", id))?;
                info!("[{}] Wrote {} reports", id, written.len());
                succeeded.push(result);
            }
            Err(e) => {
                error!("[{}] {:#}", id, e);
                failures += 1;
            }
        }
    }

    if !succeeded.is_empty() {
        print_summary(&succeeded);
        println!("Reports saved to {}", config.reports_dir.display());
    }

    if failures > 0 {
        bail!("{} of {} backtests failed", failures, results.len());
    }
    Ok(())
}
