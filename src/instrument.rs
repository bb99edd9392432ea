//! Tradable instrument definitions
//!
//! Only linear USDT-margined perpetuals are modelled. Quantities are kept as
//! `Decimal` rounded to the instrument's size precision, prices as `f64`.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::identifiers::InstrumentId;

/// Binance futures venue name used in instrument ids
pub const BINANCE_VENUE: &str = "BINANCE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub raw_symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub settlement_currency: String,
    pub is_inverse: bool,
    pub price_precision: u32,
    pub size_precision: u32,
    pub price_increment: Decimal,
    pub size_increment: Decimal,
    #[serde(default)]
    pub min_quantity: Option<Decimal>,
    #[serde(default)]
    pub max_quantity: Option<Decimal>,
    pub margin_init: Decimal,
    pub margin_maint: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
}

impl Instrument {
    /// USDT-margined perpetual with Binance default fees (0.02% maker, 0.04% taker)
    pub fn usdt_perpetual(base: &str, price_precision: u32, size_precision: u32) -> Self {
        let raw_symbol = format!("{}USDT", base);
        let size_increment = Decimal::new(1, size_precision);
        Instrument {
            id: InstrumentId::new(format!("{}-PERP", raw_symbol), BINANCE_VENUE),
            raw_symbol,
            base_currency: base.to_string(),
            quote_currency: "USDT".to_string(),
            settlement_currency: "USDT".to_string(),
            is_inverse: false,
            price_precision,
            size_precision,
            price_increment: Decimal::new(1, price_precision),
            size_increment,
            min_quantity: Some(size_increment),
            max_quantity: None,
            margin_init: dec!(0.10),
            margin_maint: dec!(0.05),
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0004),
        }
    }

    /// Round a raw quantity to the size precision.
    ///
    /// Non-finite or negative input yields zero.
    pub fn make_qty(&self, value: f64) -> Decimal {
        if !value.is_finite() || value <= 0.0 {
            return Decimal::ZERO;
        }
        Decimal::from_f64(value)
            .map(|d| {
                d.round_dp_with_strategy(self.size_precision, RoundingStrategy::MidpointNearestEven)
            })
            .unwrap_or(Decimal::ZERO)
    }

    /// Round a raw price to the price precision
    pub fn make_price(&self, value: f64) -> f64 {
        Decimal::from_f64(value)
            .map(|d| {
                d.round_dp_with_strategy(self.price_precision, RoundingStrategy::MidpointNearestEven)
            })
            .and_then(|d| d.to_f64())
            .unwrap_or(value)
    }

    /// Smallest tradable quantity
    pub fn min_qty(&self) -> Decimal {
        self.min_quantity.unwrap_or(self.size_increment)
    }

    /// Notional value in the quote currency for linear contracts
    pub fn notional_value(&self, quantity: Decimal, price: f64) -> f64 {
        quantity.to_f64().unwrap_or(0.0) * price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usdt_perpetual_defaults() {
        let ada = Instrument::usdt_perpetual("ADA", 4, 0);
        assert_eq!(ada.id.to_string(), "ADAUSDT-PERP.BINANCE");
        assert_eq!(ada.raw_symbol, "ADAUSDT");
        assert_eq!(ada.size_increment, dec!(1));
        assert_eq!(ada.price_increment, dec!(0.0001));
        assert_eq!(ada.min_qty(), dec!(1));
    }

    #[test]
    fn test_make_qty_rounds_to_precision() {
        let ltc = Instrument::usdt_perpetual("LTC", 2, 3);
        assert_eq!(ltc.make_qty(1.23456), dec!(1.235));
        assert_eq!(ltc.make_qty(0.0004), dec!(0.000));
        assert_eq!(ltc.make_qty(-1.0), Decimal::ZERO);
        assert_eq!(ltc.make_qty(f64::NAN), Decimal::ZERO);

        let ada = Instrument::usdt_perpetual("ADA", 4, 0);
        assert_eq!(ada.make_qty(2499.6), dec!(2500));
    }

    #[test]
    fn test_make_price_and_notional() {
        let ada = Instrument::usdt_perpetual("ADA", 4, 0);
        assert!((ada.make_price(0.123456) - 0.1235).abs() < 1e-12);
        assert!((ada.notional_value(dec!(100), 0.5) - 50.0).abs() < 1e-12);
    }
}
