//! Simulated venue for backtests
//!
//! Market orders fill completely at the close of the current 1-minute bar,
//! moved against the taker by `slippage_bps`, and pay the instrument's taker
//! fee. Orders that would grow a position beyond the free margin are rejected.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::identifiers::{TradeId, VenueOrderId};
use crate::instrument::Instrument;
use crate::orders::{to_f64, Fill, MarketOrder};
use crate::portfolio::Portfolio;
use crate::types::{Money, OrderSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OmsType {
    /// One position per instrument
    Netting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Margin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    #[serde(default = "default_oms_type")]
    pub oms_type: OmsType,
    #[serde(default = "default_account_type")]
    pub account_type: AccountType,
    pub starting_balances: Vec<Money>,
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    #[serde(default = "default_leverage")]
    pub default_leverage: f64,
    /// Fill price adjustment against the taker in basis points
    #[serde(default)]
    pub slippage_bps: f64,
}

fn default_oms_type() -> OmsType {
    OmsType::Netting
}

fn default_account_type() -> AccountType {
    AccountType::Margin
}

fn default_base_currency() -> String {
    "USDT".to_string()
}

fn default_leverage() -> f64 {
    10.0
}

impl Default for VenueConfig {
    fn default() -> Self {
        VenueConfig {
            name: "BINANCE".to_string(),
            oms_type: default_oms_type(),
            account_type: default_account_type(),
            starting_balances: vec![Money::new(Decimal::ONE_HUNDRED, "USDT")],
            base_currency: default_base_currency(),
            default_leverage: default_leverage(),
            slippage_bps: 0.0,
        }
    }
}

impl VenueConfig {
    /// Starting balance in the base currency
    pub fn starting_balance(&self) -> Result<f64> {
        let Some(money) = self
            .starting_balances
            .iter()
            .find(|m| m.currency == self.base_currency)
        else {
            bail!(
                "venue {} has no starting balance in {}",
                self.name,
                self.base_currency
            );
        };
        Ok(money.amount.to_f64().unwrap_or(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        if self.starting_balance()? <= 0.0 {
            bail!("venue {} starting balance must be positive", self.name);
        }
        if !(self.default_leverage >= 1.0) {
            bail!("default_leverage must be >= 1, got {}", self.default_leverage);
        }
        if !(self.slippage_bps >= 0.0) {
            bail!("slippage_bps must be >= 0, got {}", self.slippage_bps);
        }
        Ok(())
    }
}

pub struct SimulatedExchange {
    config: VenueConfig,
    order_count: u64,
    trade_count: u64,
}

impl SimulatedExchange {
    pub fn new(config: VenueConfig) -> Self {
        SimulatedExchange {
            config,
            order_count: 0,
            trade_count: 0,
        }
    }

    pub fn config(&self) -> &VenueConfig {
        &self.config
    }

    /// Price a taker gets for `side` when the market trades at `price`
    pub fn fill_price(&self, side: OrderSide, price: f64, instrument: &Instrument) -> f64 {
        let adjustment = self.config.slippage_bps / 10_000.0;
        let raw = match side {
            OrderSide::Buy => price * (1.0 + adjustment),
            OrderSide::Sell => price * (1.0 - adjustment),
        };
        instrument.make_price(raw)
    }

    /// Execute a market order against the current price.
    ///
    /// Returns the fill, or `None` when the order was rejected (the order
    /// carries the reason).
    pub fn execute(
        &mut self,
        order: &mut MarketOrder,
        instrument: &Instrument,
        price: f64,
        portfolio: &Portfolio,
        ts: DateTime<Utc>,
    ) -> Option<Fill> {
        order.submit(ts);
        self.order_count += 1;
        let venue_order_id = VenueOrderId::new(format!("{}-{}", self.config.name, self.order_count));
        order.venue_order_id = Some(venue_order_id.clone());

        let fill_price = self.fill_price(order.side, price, instrument);

        // Only the part of the order that grows the position needs margin
        let net = portfolio.net_position(&order.instrument_id);
        let increasing_qty = if net.is_zero() || (net > Decimal::ZERO) == (order.side == OrderSide::Buy) {
            order.quantity
        } else {
            (order.quantity - net.abs()).max(Decimal::ZERO)
        };

        if order.reduce_only && increasing_qty > Decimal::ZERO {
            let reason = "reduce-only order would increase position".to_string();
            warn!("Order {} rejected: {}", order.client_order_id, reason);
            order.reject(reason, ts);
            return None;
        }

        let commission = instrument.notional_value(order.quantity, fill_price) * to_f64(instrument.taker_fee);

        if increasing_qty > Decimal::ZERO {
            let required = portfolio
                .account()
                .margin_for(instrument.notional_value(increasing_qty, fill_price));
            let free = portfolio.account().balance_free();
            if required + commission > free {
                let reason = format!(
                    "insufficient margin: required {:.4} {} free {:.4}",
                    required + commission,
                    self.config.base_currency,
                    free
                );
                warn!("Order {} rejected: {}", order.client_order_id, reason);
                order.reject(reason, ts);
                return None;
            }
        }

        self.trade_count += 1;
        let fill = Fill {
            client_order_id: order.client_order_id.clone(),
            venue_order_id,
            trade_id: TradeId::new(format!("{}-{}", self.config.name, self.trade_count)),
            instrument_id: order.instrument_id.clone(),
            strategy_id: order.strategy_id.clone(),
            side: order.side,
            quantity: order.quantity,
            price: fill_price,
            commission,
            commission_currency: self.config.base_currency.clone(),
            ts_event: ts,
        };
        order.apply_fill(&fill);
        debug!(
            "Filled {} {} {} @ {} (commission {:.6})",
            order.client_order_id, fill.side, fill.quantity, fill.price, fill.commission
        );
        Some(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{StrategyId, TraderId};
    use crate::orders::{OrderFactory, OrderStatus, TimeInForce};
    use crate::portfolio::MarginAccount;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn order(side: OrderSide, qty: Decimal) -> MarketOrder {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        OrderFactory::new(TraderId::new("BACKTESTER-001"), StrategyId::new("S-000")).market(
            instrument.id,
            side,
            qty,
            TimeInForce::Gtc,
            false,
            ts(),
        )
    }

    fn portfolio() -> Portfolio {
        Portfolio::new(MarginAccount::new("BINANCE-001", "USDT", 100.0, 10.0, ts()))
    }

    #[test]
    fn test_venue_config_from_json() {
        let config: VenueConfig = serde_json::from_value(serde_json::json!({
            "name": "BINANCE",
            "oms_type": "NETTING",
            "account_type": "MARGIN",
            "starting_balances": ["100 USDT"],
            "base_currency": "USDT"
        }))
        .unwrap();
        assert_eq!(config.starting_balance().unwrap(), 100.0);
        assert_eq!(config.default_leverage, 10.0);
        assert!(config.validate().is_ok());

        let mut bad = config;
        bad.base_currency = "BTC".to_string();
        assert!(bad.starting_balance().is_err());
    }

    #[test]
    fn test_fill_with_slippage_and_commission() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let mut exchange = SimulatedExchange::new(VenueConfig {
            slippage_bps: 10.0,
            ..VenueConfig::default()
        });
        let mut o = order(OrderSide::Buy, dec!(100));
        let fill = exchange
            .execute(&mut o, &instrument, 0.5, &portfolio(), ts())
            .unwrap();

        assert_relative_eq!(fill.price, 0.5005);
        assert_relative_eq!(fill.commission, 100.0 * 0.5005 * 0.0004, epsilon = 1e-12);
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(fill.venue_order_id.as_str(), "BINANCE-1");

        let mut o = order(OrderSide::Sell, dec!(100));
        let fill = exchange
            .execute(&mut o, &instrument, 0.5, &portfolio(), ts())
            .unwrap();
        assert_relative_eq!(fill.price, 0.4995);
    }

    #[test]
    fn test_margin_rejection() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let mut exchange = SimulatedExchange::new(VenueConfig::default());

        // 3000 * 0.5 / 10 = 150 margin > 100 free
        let mut o = order(OrderSide::Buy, dec!(3000));
        assert!(exchange
            .execute(&mut o, &instrument, 0.5, &portfolio(), ts())
            .is_none());
        assert_eq!(o.status, OrderStatus::Rejected);
        assert!(o.reason.as_deref().unwrap().contains("insufficient margin"));
    }

    #[test]
    fn test_reducing_order_needs_no_margin() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let mut exchange = SimulatedExchange::new(VenueConfig::default());
        let mut p = portfolio();

        let mut entry = order(OrderSide::Buy, dec!(1900));
        let fill = exchange.execute(&mut entry, &instrument, 0.5, &p, ts()).unwrap();
        p.apply_fill(&fill);

        // Price collapse leaves little free balance; closing still fills
        let mut exit = order(OrderSide::Sell, dec!(1900));
        assert!(exchange.execute(&mut exit, &instrument, 0.46, &p, ts()).is_some());
    }
}
