//! Raw kline files: download from Binance, import into the catalog, verify
//!
//! Raw files are named `{BASE}_{QUOTE}_{SETTLE}-{N}{unit}-{kind}.csv`, for
//! example `ADA_USDT_USDT-1m-futures.csv`, with header
//! `date,open,high,low,close,volume`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::binance::{BinanceFuturesClient, BinanceKline, InstrumentProvider};
use crate::catalog::DataCatalog;
use crate::identifiers::{BarType, InstrumentId};
use crate::instrument::BINANCE_VENUE;
use crate::types::{Bar, Candle};

// =============================================================================
// File names and bar types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileName {
    pub base_pair: String,
    pub quote_pair: String,
    pub settle_pair: String,
    /// Step and unit, e.g. `1m`, `4h`
    pub timeframe: String,
    pub instrument_type: String,
    pub processed: bool,
}

const FILENAME_PATTERN: &str = r"^(?P<base>[A-Z0-9]+)_(?P<quote>[A-Z]+)_(?P<settle>[A-Z]+)-(?P<timeframe>\d+[a-zA-Z]+)-(?P<kind>[a-z]+)(?P<processed>-processed)?\.csv$";

pub fn parse_instrument_filename(name: &str) -> Result<RawFileName> {
    let pattern = Regex::new(FILENAME_PATTERN)?;
    let Some(caps) = pattern.captures(name) else {
        bail!("Unrecognized raw data file name: {}", name);
    };
    Ok(RawFileName {
        base_pair: caps["base"].to_string(),
        quote_pair: caps["quote"].to_string(),
        settle_pair: caps["settle"].to_string(),
        timeframe: caps["timeframe"].to_string(),
        instrument_type: caps["kind"].to_string(),
        processed: caps.name("processed").is_some(),
    })
}

/// `ADA_USDT_USDT-1m-futures` -> `ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL`
pub fn construct_bar_type_string(parsed: &RawFileName) -> Result<String> {
    let split = parsed
        .timeframe
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(parsed.timeframe.len());
    let (step, unit) = parsed.timeframe.split_at(split);
    let aggregation = match unit {
        "m" | "M" => "MINUTE",
        "h" | "H" => "HOUR",
        "d" | "D" => "DAY",
        other => bail!("Unsupported timeframe unit '{}' in {}", other, parsed.timeframe),
    };
    let kind = if parsed.instrument_type == "futures" {
        "PERP"
    } else {
        "SPOT"
    };
    Ok(format!(
        "{}{}-{}.{}-{}-{}-LAST-EXTERNAL",
        parsed.base_pair, parsed.quote_pair, kind, BINANCE_VENUE, step, aggregation
    ))
}

/// Futures instrument the raw file belongs to, `{BASE}USDT-PERP.BINANCE`
pub fn futures_instrument_id(parsed: &RawFileName) -> InstrumentId {
    InstrumentId::new(format!("{}USDT-PERP", parsed.base_pair), BINANCE_VENUE)
}

pub fn raw_filename(base: &str, interval: &str) -> String {
    format!("{}_USDT_USDT-{}-futures.csv", base, interval)
}

// =============================================================================
// Raw CSV files
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(alias = "timestamp", alias = "datetime")]
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Serialize)]
struct RawOutRow<'a> {
    date: &'a str,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// RFC3339, `YYYY-MM-DD HH:MM:SS` or epoch milliseconds
fn parse_raw_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = value.parse::<DateTime<Utc>>() {
        return Some(dt);
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(ndt.and_utc());
    }
    value.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

/// Load a raw kline file sorted by open time; invalid rows are skipped
pub fn load_raw_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles = Vec::new();
    for (row_idx, result) in reader.deserialize::<RawRow>().enumerate() {
        let row = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        let Some(datetime) = parse_raw_time(&row.date) else {
            warn!("Skipping row {}: bad date '{}'", row_idx + 1, row.date);
            continue;
        };
        match Candle::new(datetime, row.open, row.high, row.low, row.close, row.volume) {
            Ok(candle) => candles.push(candle),
            Err(e) => warn!("Skipping row {} in {}: {}", row_idx + 1, path.display(), e),
        }
    }
    candles.sort_by_key(|c| c.datetime);
    Ok(candles)
}

/// Write candles in the raw layout (`date,open,high,low,close,volume`)
pub fn save_raw_csv(path: impl AsRef<Path>, candles: &[Candle]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for candle in candles {
        let date = candle.datetime.format("%Y-%m-%d %H:%M:%S").to_string();
        writer.serialize(RawOutRow {
            date: &date,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        })?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Import
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub imported: Vec<(BarType, usize)>,
    /// Files whose instrument the provider does not know
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ImportSummary {
    pub fn total_bars(&self) -> usize {
        self.imported.iter().map(|(_, n)| n).sum()
    }
}

enum FileOutcome {
    Imported(BarType, usize),
    Skipped,
}

fn import_file(
    file_path: &Path,
    processed_dir: &Path,
    catalog: &DataCatalog,
    provider: &dyn InstrumentProvider,
) -> Result<FileOutcome> {
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Non UTF-8 file name")?;

    let candles = load_raw_csv(file_path)?;

    let processed_name = file_name.replace(".csv", "-processed.csv");
    save_raw_csv(processed_dir.join(&processed_name), &candles)?;

    let parsed = parse_instrument_filename(&processed_name)?;
    let bar_type: BarType = construct_bar_type_string(&parsed)?.parse()?;

    let instrument_id = futures_instrument_id(&parsed);
    let Some(instrument) = provider.find(&instrument_id) else {
        warn!("Instrument {} not found, skipping {}", instrument_id, file_name);
        return Ok(FileOutcome::Skipped);
    };

    catalog.write_instruments(std::slice::from_ref(&instrument))?;
    let count = catalog.write_bars(&bar_type, &candles)?;
    Ok(FileOutcome::Imported(bar_type, count))
}

/// Import every `*-futures.csv` under `raw_dir` into a fresh catalog
pub fn process_raw_data(
    raw_dir: impl AsRef<Path>,
    processed_dir: impl AsRef<Path>,
    catalog_path: impl AsRef<Path>,
    provider: &dyn InstrumentProvider,
) -> Result<ImportSummary> {
    let raw_dir = raw_dir.as_ref();
    let processed_dir = processed_dir.as_ref();

    if !raw_dir.exists() {
        bail!("Raw data directory does not exist: {}", raw_dir.display());
    }
    fs::create_dir_all(processed_dir)
        .with_context(|| format!("Failed to create {}", processed_dir.display()))?;

    let catalog = DataCatalog::new(catalog_path.as_ref());
    catalog.reset()?;

    let mut files: Vec<PathBuf> = fs::read_dir(raw_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("-futures.csv"))
        })
        .collect();
    files.sort();

    let mut summary = ImportSummary::default();
    for file_path in &files {
        let name = file_path.display().to_string();
        info!("Processing {}", name);
        match import_file(file_path, processed_dir, &catalog, provider) {
            Ok(FileOutcome::Imported(bar_type, count)) => {
                info!("Imported {} bars as {}", count, bar_type);
                summary.imported.push((bar_type, count));
            }
            Ok(FileOutcome::Skipped) => summary.skipped.push(name),
            Err(e) => {
                error!("Failed to process {}: {:#}", name, e);
                summary.failed.push((name, format!("{:#}", e)));
            }
        }
    }

    info!(
        "Import finished: {} imported, {} skipped, {} failed",
        summary.imported.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(summary)
}

// =============================================================================
// Verification
// =============================================================================

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub instrument_id: InstrumentId,
    pub bar_type: BarType,
    pub bar_count: usize,
    pub first: Option<Bar>,
    pub last: Option<Bar>,
}

/// Count `{id}-{spec}-LAST-EXTERNAL` bars for every catalog instrument
pub fn verify_catalog(catalog_path: impl AsRef<Path>, spec: &str) -> Result<Vec<CatalogEntry>> {
    let catalog = DataCatalog::new(catalog_path.as_ref());
    let instruments = catalog.instruments()?;
    info!("Found {} instruments", instruments.len());

    let mut entries = Vec::with_capacity(instruments.len());
    for instrument in instruments {
        let bar_type: BarType = format!("{}-{}-LAST-EXTERNAL", instrument.id, spec).parse()?;
        let bars = catalog.query_bars(&bar_type, None, None)?;
        entries.push(CatalogEntry {
            instrument_id: instrument.id,
            bar_type,
            bar_count: bars.len(),
            first: bars.first().cloned(),
            last: bars.last().cloned(),
        });
    }
    Ok(entries)
}

// =============================================================================
// Download
// =============================================================================

/// `ada`, `ADAUSDT` -> `ADA`
pub fn normalize_base(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    upper.strip_suffix("USDT").unwrap_or(&upper).to_string()
}

fn klines_to_candles(klines: &[BinanceKline]) -> Vec<Candle> {
    klines
        .iter()
        .filter_map(|k| match k.to_candle() {
            Ok(candle) => Some(candle),
            Err(e) => {
                warn!("Skipping kline at {}: {}", k.open_time, e);
                None
            }
        })
        .collect()
}

/// Download the last `days` of closed futures klines per symbol into `output_dir`
pub async fn download_klines(
    client: &BinanceFuturesClient,
    symbols: &[String],
    interval: &str,
    days: i64,
    output_dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>> {
    if !crate::binance::is_valid_interval(interval) {
        bail!(
            "Invalid interval '{}'. Valid: {}",
            interval,
            crate::binance::FUTURES_INTERVALS.join(", ")
        );
    }
    if days <= 0 {
        bail!("days must be positive, got {}", days);
    }

    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)?;

    let end = Utc::now();
    let start = end - Duration::days(days);
    let mut written = Vec::new();

    for symbol in symbols {
        let base = normalize_base(symbol);
        let pair = format!("{}USDT", base);
        let klines = client
            .fetch_history(&pair, interval, start, end)
            .await
            .with_context(|| format!("Failed to download {}", pair))?;
        let closed: Vec<BinanceKline> = klines.into_iter().filter(|k| k.is_closed(end)).collect();
        let candles = klines_to_candles(&closed);

        if candles.is_empty() {
            warn!("No klines returned for {}", pair);
            continue;
        }

        let path = output_dir.join(raw_filename(&base, interval));
        save_raw_csv(&path, &candles)?;
        info!("Saved {} candles to {}", candles.len(), path.display());
        written.push(path);
    }

    Ok(written)
}
