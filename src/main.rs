//! VWAP trader - main entry point
//!
//! Subcommands:
//! - backtest: Replay catalog bars through the strategy
//! - live: Trade Binance USDT futures
//! - download: Download historical klines from Binance futures
//! - catalog: Import raw klines into the catalog, or verify it

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vwap_trader::config::{LiveConfig, LoggingConfig};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "vwap-trader")]
#[command(about = "VWAP multi-timeframe strategy for Binance USDT futures", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run backtests over the data catalog
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/backtest.json")]
        config: String,
    },

    /// Run live trading on Binance futures
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/live.json")]
        config: String,

        /// Use the Binance futures testnet
        #[arg(long)]
        testnet: bool,
    },

    /// Download historical futures klines from Binance
    Download {
        /// Symbols to download (comma-separated). E.g., "ADA,SOL,BTCUSDT"
        #[arg(short, long, default_value = "ADA,SOL,LTC,SUI")]
        symbols: String,

        /// Kline interval. E.g., "1m", "15m", "4h"
        #[arg(short, long, default_value = "1m")]
        interval: String,

        /// Number of days of history to fetch
        #[arg(short, long, default_value = "30")]
        days: i64,

        /// Output directory
        #[arg(short, long, default_value = "data/binance/raw")]
        output: String,
    },

    /// Manage the data catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand, Debug)]
enum CatalogAction {
    /// Import raw `*-futures.csv` files into a fresh catalog
    Import {
        #[arg(long, default_value = "data/binance/raw")]
        raw: String,

        #[arg(long, default_value = "data/binance/processed")]
        processed: String,

        #[arg(long, default_value = "data/binance/catalog")]
        catalog: String,
    },

    /// Print bar counts and first/last bars per instrument
    Verify {
        #[arg(long, default_value = "data/binance/catalog")]
        catalog: String,

        /// Bar specification, e.g. "1-MINUTE"
        #[arg(long, default_value = "1-MINUTE")]
        spec: String,
    },
}

const NOISY_CRATES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn";

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", level.to_lowercase(), NOISY_CRATES)))
}

/// Console plus a plain text file `logs/{command}_{timestamp}.log`
fn setup_logging(verbose: bool, command_name: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);
    let level = if verbose { "debug" } else { "info" };

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never("logs", &log_filename));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(guard)
}

/// Live logging from the config: console at `log_level`, file at `log_level_file`
fn setup_live_logging(verbose: bool, logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.log_directory).with_context(|| {
        format!("Failed to create log directory {}", logging.log_directory.display())
    })?;

    let console_level = if verbose { "debug" } else { logging.log_level.as_str() };
    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        &logging.log_directory,
        &logging.log_file_name,
    ));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(logging.log_colors)
        .with_filter(env_filter(console_level));

    let file_layer = if logging.log_file_format.eq_ignore_ascii_case("json") {
        fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_current_span(false)
            .with_filter(env_filter(&logging.log_level_file))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(env_filter(&logging.log_level_file))
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "Log file: {}",
        Path::new(&logging.log_directory).join(&logging.log_file_name).display()
    );
    Ok(guard)
}

fn run(cli: Cli) -> Result<()> {
    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Live { .. } => "live",
        Commands::Download { .. } => "download",
        Commands::Catalog { .. } => "catalog",
    };

    match cli.command {
        Commands::Backtest { config } => {
            let _guard = setup_logging(cli.verbose, command_name)?;
            commands::backtest::run(config)
        }

        Commands::Live { config, testnet } => {
            let live_config = LiveConfig::from_file(&config)
                .with_context(|| format!("Failed to load config from {}", config))?;
            let _guard = setup_live_logging(cli.verbose, &live_config.logging)?;
            info!("Loaded configuration from: {}", config);
            commands::live::run(live_config, testnet)
        }

        Commands::Download {
            symbols,
            interval,
            days,
            output,
        } => {
            let _guard = setup_logging(cli.verbose, command_name)?;
            commands::download::run(symbols, interval, days, output)
        }

        Commands::Catalog { action } => {
            let _guard = setup_logging(cli.verbose, command_name)?;
            match action {
                CatalogAction::Import {
                    raw,
                    processed,
                    catalog,
                } => commands::catalog::import(raw, processed, catalog),
                CatalogAction::Verify { catalog, spec } => commands::catalog::verify(catalog, spec),
            }
        }
    }
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
