//! File-based data catalog
//!
//! Layout under the catalog root:
//! ```text
//! data/instrument/{instrument_id}.json
//! data/bar/{bar_type}.csv      timestamp,open,high,low,close,volume
//! ```
//! Bar rows are keyed by open time (RFC3339) and kept sorted and unique.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identifiers::{BarType, IdentifierError, InstrumentId};
use crate::instrument::Instrument;
use crate::types::{Bar, Candle};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error("invalid time bound '{0}': use YYYY-MM-DD, YYYY-MM-DD HH:MM:SS or RFC3339")]
    InvalidTime(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CatalogError + '_ {
    move |source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> CatalogError + '_ {
    move |source| CatalogError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> CatalogError + '_ {
    move |source| CatalogError::Json {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BarRow {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl From<&Candle> for BarRow {
    fn from(c: &Candle) -> Self {
        BarRow {
            timestamp: c.datetime,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

/// Parse a start/end bound.
///
/// A bare date as an end bound covers the whole day.
pub fn parse_time_bound(value: &str, is_end: bool) -> Result<DateTime<Utc>, CatalogError> {
    if let Ok(dt) = value.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let time = if is_end {
            date.and_hms_milli_opt(23, 59, 59, 999)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        if let Some(ndt) = time {
            return Ok(ndt.and_utc());
        }
    }
    Err(CatalogError::InvalidTime(value.to_string()))
}

#[derive(Debug, Clone)]
pub struct DataCatalog {
    root: PathBuf,
}

impl DataCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DataCatalog { root: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn instrument_dir(&self) -> PathBuf {
        self.root.join("data").join("instrument")
    }

    fn bar_dir(&self) -> PathBuf {
        self.root.join("data").join("bar")
    }

    fn bar_path(&self, bar_type: &BarType) -> PathBuf {
        self.bar_dir().join(format!("{}.csv", bar_type.standard()))
    }

    /// Delete everything and recreate an empty catalog
    pub fn reset(&self) -> Result<(), CatalogError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(io_err(&self.root))?;
        }
        for dir in [self.instrument_dir(), self.bar_dir()] {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        info!("Catalog reset at {}", self.root.display());
        Ok(())
    }

    pub fn write_instruments(&self, instruments: &[Instrument]) -> Result<(), CatalogError> {
        let dir = self.instrument_dir();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        for instrument in instruments {
            let path = dir.join(format!("{}.json", instrument.id));
            let json = serde_json::to_string_pretty(instrument).map_err(json_err(&path))?;
            fs::write(&path, json).map_err(io_err(&path))?;
            debug!("Wrote instrument {}", instrument.id);
        }
        Ok(())
    }

    /// All instruments sorted by id
    pub fn instruments(&self) -> Result<Vec<Instrument>, CatalogError> {
        let dir = self.instrument_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut instruments = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let text = fs::read_to_string(&path).map_err(io_err(&path))?;
                let instrument: Instrument =
                    serde_json::from_str(&text).map_err(json_err(&path))?;
                instruments.push(instrument);
            }
        }
        instruments.sort_by_key(|i| i.id.to_string());
        Ok(instruments)
    }

    pub fn instrument(&self, id: &InstrumentId) -> Result<Option<Instrument>, CatalogError> {
        let path = self.instrument_dir().join(format!("{}.json", id));
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        let instrument = serde_json::from_str(&text).map_err(json_err(&path))?;
        Ok(Some(instrument))
    }

    /// Stored candles for `bar_type` in time order; empty when none stored
    pub fn read_candles(&self, bar_type: &BarType) -> Result<Vec<Candle>, CatalogError> {
        let path = self.bar_path(bar_type);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path).map_err(csv_err(&path))?;
        let mut candles = Vec::new();
        for (row_idx, row) in reader.deserialize::<BarRow>().enumerate() {
            let row = row.map_err(csv_err(&path))?;
            match Candle::new(row.timestamp, row.open, row.high, row.low, row.close, row.volume) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(
                    "Skipping invalid bar at row {} in {}: {}",
                    row_idx + 2,
                    path.display(),
                    e
                ),
            }
        }
        Ok(candles)
    }

    /// Merge `candles` into the stored bars; returns the number of rows stored
    pub fn write_bars(&self, bar_type: &BarType, candles: &[Candle]) -> Result<usize, CatalogError> {
        let dir = self.bar_dir();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let mut merged = self.read_candles(bar_type)?;
        merged.extend_from_slice(candles);
        // Stable sort keeps the newest write last within a timestamp
        merged.sort_by_key(|c| c.datetime);
        let merged: Vec<Candle> = merged
            .into_iter()
            .rev()
            .unique_by(|c| c.datetime)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let path = self.bar_path(bar_type);
        let mut writer = csv::Writer::from_path(&path).map_err(csv_err(&path))?;
        for candle in &merged {
            writer.serialize(BarRow::from(candle)).map_err(csv_err(&path))?;
        }
        writer.flush().map_err(io_err(&path))?;

        debug!("Wrote {} bars for {}", merged.len(), bar_type);
        Ok(merged.len())
    }

    /// Bars whose open time lies within `[start, end]`
    pub fn query_bars(
        &self,
        bar_type: &BarType,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, CatalogError> {
        let standard = bar_type.standard();
        Ok(self
            .read_candles(&standard)?
            .into_iter()
            .filter(|c| start.map_or(true, |s| c.datetime >= s) && end.map_or(true, |e| c.datetime <= e))
            .map(|c| c.into_bar(standard.clone()))
            .collect())
    }

    pub fn bar_types(&self) -> Result<Vec<BarType>, CatalogError> {
        let dir = self.bar_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut bar_types = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    bar_types.push(stem.parse()?);
                }
            }
        }
        bar_types.sort_by_key(|b: &BarType| b.to_string());
        Ok(bar_types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn temp_catalog(name: &str) -> DataCatalog {
        let dir = std::env::temp_dir().join(format!("vwap_catalog_{}_{}", name, std::process::id()));
        let catalog = DataCatalog::new(dir);
        catalog.reset().unwrap();
        catalog
    }

    fn candle(minute: i64, close: f64) -> Candle {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Candle::new(start + Duration::minutes(minute), close, close + 0.1, close - 0.1, close, 10.0)
            .unwrap()
    }

    fn one_minute() -> BarType {
        "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL".parse().unwrap()
    }

    #[test]
    fn test_parse_time_bound() {
        let start = parse_time_bound("2024-01-02", false).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        let end = parse_time_bound("2024-01-02", true).unwrap();
        assert!(end > Utc.with_ymd_and_hms(2024, 1, 2, 23, 59, 59).unwrap());
        assert_eq!(
            parse_time_bound("2024-01-02 10:30:00", false).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 30, 0).unwrap()
        );
        assert!(parse_time_bound("yesterday", false).is_err());
    }

    #[test]
    fn test_instruments_round_trip_sorted() {
        let catalog = temp_catalog("instruments");
        let ltc = Instrument::usdt_perpetual("LTC", 2, 3);
        let ada = Instrument::usdt_perpetual("ADA", 4, 0);
        catalog.write_instruments(&[ltc.clone(), ada.clone()]).unwrap();

        let all = catalog.instruments().unwrap();
        assert_eq!(all, vec![ada.clone(), ltc]);
        assert_eq!(catalog.instrument(&ada.id).unwrap(), Some(ada));
        assert!(catalog
            .instrument(&"XRPUSDT-PERP.BINANCE".parse().unwrap())
            .unwrap()
            .is_none());
        fs::remove_dir_all(catalog.path()).ok();
    }

    #[test]
    fn test_write_bars_merges_and_dedups() {
        let catalog = temp_catalog("bars");
        let bt = one_minute();
        catalog
            .write_bars(&bt, &[candle(2, 1.2), candle(0, 1.0)])
            .unwrap();
        let stored = catalog
            .write_bars(&bt, &[candle(1, 1.1), candle(2, 1.25)])
            .unwrap();
        assert_eq!(stored, 3);

        let candles = catalog.read_candles(&bt).unwrap();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![1.0, 1.1, 1.25]);
        assert_eq!(catalog.bar_types().unwrap(), vec![bt.clone()]);

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let bars = catalog.query_bars(&bt, Some(start), None).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].ts_event, start + Duration::minutes(1));
        fs::remove_dir_all(catalog.path()).ok();
    }
}
