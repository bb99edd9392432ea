//! Market orders, fills and client order id generation

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identifiers::{
    ClientOrderId, InstrumentId, StrategyId, TradeId, TraderId, VenueOrderId,
};
use crate::types::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Initialized,
    Submitted,
    Filled,
    /// Refused by the venue (e.g. insufficient margin)
    Rejected,
    /// Refused by pre-trade risk checks before reaching the venue
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrder {
    pub client_order_id: ClientOrderId,
    pub trader_id: TraderId,
    pub strategy_id: StrategyId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub venue_order_id: Option<VenueOrderId>,
    pub filled_qty: Decimal,
    pub avg_px: Option<f64>,
    pub commission: f64,
    pub reason: Option<String>,
    pub ts_init: DateTime<Utc>,
    pub ts_last: DateTime<Utc>,
}

impl MarketOrder {
    pub fn is_closed(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Denied
        )
    }

    pub fn submit(&mut self, ts: DateTime<Utc>) {
        self.status = OrderStatus::Submitted;
        self.ts_last = ts;
    }

    pub fn apply_fill(&mut self, fill: &Fill) {
        let prev_qty = self.filled_qty;
        let total_qty = prev_qty + fill.quantity;
        let prev_px = self.avg_px.unwrap_or(0.0);
        let prev_f = to_f64(prev_qty);
        let fill_f = to_f64(fill.quantity);
        if total_qty > Decimal::ZERO {
            self.avg_px = Some((prev_px * prev_f + fill.price * fill_f) / (prev_f + fill_f));
        }
        self.filled_qty = total_qty;
        self.commission += fill.commission;
        self.venue_order_id = Some(fill.venue_order_id.clone());
        self.ts_last = fill.ts_event;
        if self.filled_qty >= self.quantity {
            self.status = OrderStatus::Filled;
        }
    }

    pub fn reject(&mut self, reason: impl Into<String>, ts: DateTime<Utc>) {
        self.status = OrderStatus::Rejected;
        self.reason = Some(reason.into());
        self.ts_last = ts;
    }

    pub fn deny(&mut self, reason: impl Into<String>, ts: DateTime<Utc>) {
        self.status = OrderStatus::Denied;
        self.reason = Some(reason.into());
        self.ts_last = ts;
    }
}

/// Execution of (part of) an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub client_order_id: ClientOrderId,
    pub venue_order_id: VenueOrderId,
    pub trade_id: TradeId,
    pub instrument_id: InstrumentId,
    pub strategy_id: StrategyId,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: f64,
    pub commission: f64,
    pub commission_currency: String,
    pub ts_event: DateTime<Utc>,
}

pub(crate) fn to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

/// Creates orders with ids of the form `O-{yyyymmdd}-{HHMMSS}-{trader}-{strategy}-{count}`
#[derive(Debug, Clone)]
pub struct OrderFactory {
    trader_id: TraderId,
    strategy_id: StrategyId,
    count: u64,
}

impl OrderFactory {
    pub fn new(trader_id: TraderId, strategy_id: StrategyId) -> Self {
        OrderFactory {
            trader_id,
            strategy_id,
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Continue numbering after a restart
    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    pub fn strategy_id(&self) -> &StrategyId {
        &self.strategy_id
    }

    fn next_id(&mut self, now: DateTime<Utc>) -> ClientOrderId {
        self.count += 1;
        ClientOrderId::new(format!(
            "O-{}-{}-{}-{}",
            now.format("%Y%m%d-%H%M%S"),
            self.trader_id.tag(),
            self.strategy_id.tag(),
            self.count
        ))
    }

    pub fn market(
        &mut self,
        instrument_id: InstrumentId,
        side: OrderSide,
        quantity: Decimal,
        time_in_force: TimeInForce,
        reduce_only: bool,
        now: DateTime<Utc>,
    ) -> MarketOrder {
        MarketOrder {
            client_order_id: self.next_id(now),
            trader_id: self.trader_id.clone(),
            strategy_id: self.strategy_id.clone(),
            instrument_id,
            side,
            quantity,
            time_in_force,
            reduce_only,
            status: OrderStatus::Initialized,
            venue_order_id: None,
            filled_qty: Decimal::ZERO,
            avg_px: None,
            commission: 0.0,
            reason: None,
            ts_init: now,
            ts_last: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn factory() -> OrderFactory {
        OrderFactory::new(
            TraderId::new("BACKTESTER-001"),
            StrategyId::new("VWAPMultiTimeframe-000"),
        )
    }

    #[test]
    fn test_client_order_id_format() {
        let now = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        let mut f = factory();
        let id: InstrumentId = "ADAUSDT-PERP.BINANCE".parse().unwrap();
        let first = f.market(id.clone(), OrderSide::Buy, dec!(10), TimeInForce::Gtc, false, now);
        let second = f.market(id, OrderSide::Sell, dec!(10), TimeInForce::Gtc, false, now);
        assert_eq!(first.client_order_id.as_str(), "O-20240203-040506-001-000-1");
        assert_eq!(second.client_order_id.as_str(), "O-20240203-040506-001-000-2");
        assert_eq!(first.status, OrderStatus::Initialized);
    }

    #[test]
    fn test_fill_completes_order() {
        let now = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        let id: InstrumentId = "ADAUSDT-PERP.BINANCE".parse().unwrap();
        let mut order = factory().market(id.clone(), OrderSide::Buy, dec!(10), TimeInForce::Gtc, false, now);
        order.submit(now);
        let fill = Fill {
            client_order_id: order.client_order_id.clone(),
            venue_order_id: VenueOrderId::new("1"),
            trade_id: TradeId::new("T-1"),
            instrument_id: id,
            strategy_id: order.strategy_id.clone(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            price: 0.5,
            commission: 0.002,
            commission_currency: "USDT".to_string(),
            ts_event: now,
        };
        order.apply_fill(&fill);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_px, Some(0.5));
        assert!(order.is_closed());
    }
}
