//! Binance USDT-M futures REST payloads

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifiers::InstrumentId;
use crate::instrument::{Instrument, BINANCE_VENUE};
use crate::types::{Candle, CandleValidationError};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Binance API error {status} (code {code}): {msg}")]
    Api { status: u16, code: i64, msg: String },

    #[error("circuit breaker is open, request refused")]
    CircuitOpen,

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("missing credentials: {0} is not set")]
    MissingCredentials(&'static str),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl ExchangeError {
    /// Client errors other than rate limiting will fail again on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Api { status, .. } => *status == 429 || *status >= 500,
            ExchangeError::Http(_) | ExchangeError::Parse(_) => true,
            _ => false,
        }
    }

    /// The request may have reached the venue and been executed anyway
    pub fn order_may_exist(&self) -> bool {
        match self {
            ExchangeError::Http(_) | ExchangeError::Parse(_) => true,
            ExchangeError::Api { status, code, .. } => {
                *status >= 500 || *code == DUPLICATE_CLIENT_ORDER_ID
            }
            _ => false,
        }
    }

    pub fn is_unknown_order(&self) -> bool {
        matches!(self, ExchangeError::Api { code, .. } if *code == UNKNOWN_ORDER)
    }
}

/// `ClientOrderId is duplicated`
pub const DUPLICATE_CLIENT_ORDER_ID: i64 = -4116;
/// `Order does not exist`
pub const UNKNOWN_ORDER: i64 = -2013;

/// Kline array: `[open_time, open, high, low, close, volume, close_time, quote_volume,
/// trades, taker_buy_base, taker_buy_quote, ignore]`
#[derive(Debug, Clone)]
pub struct BinanceKline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub trades: u64,
}

impl BinanceKline {
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 9 {
            return None;
        }
        let num = |v: &serde_json::Value| v.as_str()?.parse::<f64>().ok();
        Some(BinanceKline {
            open_time: raw[0].as_i64()?,
            open: num(&raw[1])?,
            high: num(&raw[2])?,
            low: num(&raw[3])?,
            close: num(&raw[4])?,
            volume: num(&raw[5])?,
            close_time: raw[6].as_i64()?,
            trades: raw[8].as_u64()?,
        })
    }

    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.open_time)
    }

    /// The kline stops changing once its close time has passed
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.close_time < now.timestamp_millis()
    }

    pub fn to_candle(&self) -> Result<Candle, CandleValidationError> {
        let datetime = self.open_time().unwrap_or(DateTime::<Utc>::MIN_UTC);
        Candle::new(datetime, self.open, self.high, self.low, self.close, self.volume)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub contract_type: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub margin_asset: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
    #[serde(default)]
    pub maint_margin_percent: Option<Decimal>,
    #[serde(default)]
    pub required_margin_percent: Option<Decimal>,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    fn filter(&self, filter_type: &str) -> Option<&serde_json::Value> {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))
    }

    fn filter_decimal(&self, filter_type: &str, field: &str) -> Option<Decimal> {
        self.filter(filter_type)?
            .get(field)?
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .map(|d| d.normalize())
    }

    /// Perpetual contracts become `{symbol}-PERP.BINANCE` instruments
    pub fn to_instrument(&self) -> Option<Instrument> {
        if self.contract_type != "PERPETUAL" {
            return None;
        }
        let mut instrument = Instrument::usdt_perpetual(
            &self.base_asset,
            self.price_precision,
            self.quantity_precision,
        );
        instrument.id = InstrumentId::new(format!("{}-PERP", self.symbol), BINANCE_VENUE);
        instrument.raw_symbol = self.symbol.clone();
        instrument.quote_currency = self.quote_asset.clone();
        if !self.margin_asset.is_empty() {
            instrument.settlement_currency = self.margin_asset.clone();
        }
        if let Some(tick) = self.filter_decimal("PRICE_FILTER", "tickSize") {
            instrument.price_increment = tick;
        }
        if let Some(step) = self.filter_decimal("LOT_SIZE", "stepSize") {
            instrument.size_increment = step;
        }
        instrument.min_quantity = self.filter_decimal("LOT_SIZE", "minQty");
        instrument.max_quantity = self.filter_decimal("LOT_SIZE", "maxQty");
        if let Some(init) = self.required_margin_percent {
            instrument.margin_init = init / Decimal::ONE_HUNDRED;
        }
        if let Some(maint) = self.maint_margin_percent {
            instrument.margin_maint = maint / Decimal::ONE_HUNDRED;
        }
        Some(instrument)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesBalance {
    pub asset: String,
    pub balance: Decimal,
    pub available_balance: Decimal,
    #[serde(default)]
    pub cross_un_pnl: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub un_realized_profit: Decimal,
    #[serde(default)]
    pub position_side: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub symbol: String,
    pub id: i64,
    pub order_id: i64,
    pub side: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub realized_pnl: Decimal,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub side: String,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
    #[serde(default)]
    pub cum_quote: Decimal,
    pub update_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Kline intervals accepted by the futures API
pub const FUTURES_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

pub fn is_valid_interval(interval: &str) -> bool {
    FUTURES_INTERVALS.contains(&interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_kline_from_raw() {
        let raw = json!([
            1704067200000i64, "0.5900", "0.5950", "0.5880", "0.5920", "123456.0",
            1704067259999i64, "72990.1", 420, "60000", "35500.2", "0"
        ]);
        let kline = BinanceKline::from_raw(raw.as_array().unwrap()).unwrap();
        assert_eq!(kline.open, 0.59);
        assert_eq!(kline.trades, 420);

        let candle = kline.to_candle().unwrap();
        assert_eq!(candle.datetime.timestamp_millis(), 1704067200000);
        assert!(kline.is_closed(DateTime::from_timestamp_millis(1704067260000).unwrap()));
        assert!(!kline.is_closed(DateTime::from_timestamp_millis(1704067230000).unwrap()));
    }

    #[test]
    fn test_symbol_info_to_instrument() {
        let info: SymbolInfo = serde_json::from_value(json!({
            "symbol": "ADAUSDT",
            "pair": "ADAUSDT",
            "contractType": "PERPETUAL",
            "status": "TRADING",
            "baseAsset": "ADA",
            "quoteAsset": "USDT",
            "marginAsset": "USDT",
            "pricePrecision": 4,
            "quantityPrecision": 0,
            "maintMarginPercent": "2.5000",
            "requiredMarginPercent": "5.0000",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.00010", "minPrice": "0.01"},
                {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "10000000"}
            ]
        }))
        .unwrap();

        let instrument = info.to_instrument().unwrap();
        assert_eq!(instrument.id.to_string(), "ADAUSDT-PERP.BINANCE");
        assert_eq!(instrument.price_increment, dec!(0.0001));
        assert_eq!(instrument.min_quantity, Some(dec!(1)));
        assert_eq!(instrument.max_quantity, Some(dec!(10000000)));
        assert_eq!(instrument.margin_init, dec!(0.05));

        let mut quarterly = info;
        quarterly.contract_type = "CURRENT_QUARTER".to_string();
        assert!(quarterly.to_instrument().is_none());
    }

    #[test]
    fn test_retryable_errors() {
        let rate_limited = ExchangeError::Api { status: 429, code: -1003, msg: "too many".into() };
        let bad_request = ExchangeError::Api { status: 400, code: -2019, msg: "margin".into() };
        assert!(rate_limited.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!ExchangeError::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_order_may_exist_after_ambiguous_failure() {
        let duplicate = ExchangeError::Api {
            status: 400,
            code: DUPLICATE_CLIENT_ORDER_ID,
            msg: "ClientOrderId is duplicated".into(),
        };
        let server = ExchangeError::Api { status: 503, code: -1001, msg: "disconnected".into() };
        let margin = ExchangeError::Api { status: 400, code: -2019, msg: "margin".into() };
        assert!(duplicate.order_may_exist());
        assert!(server.order_may_exist());
        assert!(ExchangeError::Parse("truncated".into()).order_may_exist());
        assert!(!margin.order_may_exist());
        assert!(!ExchangeError::CircuitOpen.order_may_exist());

        let unknown = ExchangeError::Api { status: 400, code: UNKNOWN_ORDER, msg: "none".into() };
        assert!(unknown.is_unknown_order());
        assert!(!margin.is_unknown_order());
    }
}
