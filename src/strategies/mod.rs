//! Trading Strategies Module
//!
//! Strategies are event driven: the engine feeds them bars and position/order
//! events and they answer by submitting orders through a `StrategyContext`.
//! The same strategy runs unchanged in backtests and live trading.

pub mod vwap_mtf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::identifiers::{BarType, ClientOrderId, InstrumentId, StrategyId};
use crate::instrument::Instrument;
use crate::orders::{MarketOrder, OrderFactory, TimeInForce};
use crate::portfolio::{Portfolio, Position, PositionEvent};
use crate::types::{Bar, OrderSide};

// =============================================================================
// Strategy Context - what a strategy may see and do during a callback
// =============================================================================

/// Read access to instruments and the portfolio plus an outbox for orders.
///
/// Orders submitted during a callback are processed by the engine after the
/// callback returns, in submission order.
pub struct StrategyContext<'a> {
    now: DateTime<Utc>,
    instruments: &'a HashMap<InstrumentId, Instrument>,
    portfolio: &'a Portfolio,
    order_factory: &'a mut OrderFactory,
    orders: Vec<MarketOrder>,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        now: DateTime<Utc>,
        instruments: &'a HashMap<InstrumentId, Instrument>,
        portfolio: &'a Portfolio,
        order_factory: &'a mut OrderFactory,
    ) -> Self {
        StrategyContext {
            now,
            instruments,
            portfolio,
            order_factory,
            orders: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn instrument(&self, instrument_id: &InstrumentId) -> Option<&Instrument> {
        self.instruments.get(instrument_id)
    }

    /// Total balance of the account held at `venue`
    pub fn account_balance(&self, venue: &str) -> Option<f64> {
        let account = self.portfolio.account();
        (account.venue() == venue).then(|| account.balance_total())
    }

    /// Signed net position, zero when flat
    pub fn net_position(&self, instrument_id: &InstrumentId) -> Decimal {
        self.portfolio.net_position(instrument_id)
    }

    pub fn submit_market_order(
        &mut self,
        instrument_id: InstrumentId,
        side: OrderSide,
        quantity: Decimal,
        time_in_force: TimeInForce,
        reduce_only: bool,
    ) -> ClientOrderId {
        let order = self.order_factory.market(
            instrument_id,
            side,
            quantity,
            time_in_force,
            reduce_only,
            self.now,
        );
        let id = order.client_order_id.clone();
        self.orders.push(order);
        id
    }

    /// Orders submitted during the callback
    pub fn into_orders(self) -> Vec<MarketOrder> {
        self.orders
    }
}

// =============================================================================
// Strategy Trait - The contract all strategies must implement
// =============================================================================

pub trait Strategy: Send {
    /// Strategy identifier (must match config's strategy_name)
    fn name(&self) -> &'static str;

    /// Identifier used for positions and client order ids
    fn id(&self) -> StrategyId;

    /// Bar types to deliver; composite bar types are aggregated by the engine
    fn subscriptions(&self) -> Vec<BarType>;

    /// Called once before the first bar
    fn on_start(&mut self, ctx: &mut StrategyContext) -> Result<()>;

    fn on_bar(&mut self, bar: &Bar, ctx: &mut StrategyContext);

    fn on_position_opened(&mut self, _position: &Position) {}

    fn on_position_changed(&mut self, _position: &Position) {}

    fn on_position_closed(&mut self, _position: &Position) {}

    fn on_order_filled(&mut self, order: &MarketOrder) {
        tracing::debug!(
            client_order_id = %order.client_order_id,
            side = %order.side,
            quantity = %order.filled_qty,
            avg_px = order.avg_px.unwrap_or_default(),
            "Order filled"
        );
    }

    fn on_order_rejected(&mut self, order: &MarketOrder) {
        tracing::warn!(
            client_order_id = %order.client_order_id,
            reason = order.reason.as_deref().unwrap_or(""),
            "Order rejected"
        );
    }

    fn on_order_denied(&mut self, order: &MarketOrder) {
        tracing::warn!(
            client_order_id = %order.client_order_id,
            reason = order.reason.as_deref().unwrap_or(""),
            "Order denied"
        );
    }

    fn on_stop(&mut self, _ctx: &mut StrategyContext) {}

    /// Tracking state to persist between live sessions
    fn save_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn load_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Route a portfolio position event to the matching strategy callback
pub fn dispatch_position_event(strategy: &mut dyn Strategy, event: &PositionEvent) {
    match event {
        PositionEvent::Opened(position) => strategy.on_position_opened(position),
        PositionEvent::Changed(position) => strategy.on_position_changed(position),
        PositionEvent::Closed(position) => strategy.on_position_closed(position),
    }
}

// =============================================================================
// Strategy Factory - Type alias for strategy constructor functions
// =============================================================================

/// Factory function type for creating strategies from their JSON parameters
pub type StrategyFactory = fn(&serde_json::Value) -> Result<Box<dyn Strategy>>;

// =============================================================================
// Strategy Registry - Dynamic registration without hardcoding
// =============================================================================

static REGISTRY: OnceLock<RwLock<HashMap<&'static str, StrategyFactory>>> = OnceLock::new();

fn get_registry() -> &'static RwLock<HashMap<&'static str, StrategyFactory>> {
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            "vwap_multi_timeframe",
            vwap_mtf::create as StrategyFactory,
        );
        RwLock::new(map)
    })
}

/// Create a strategy by registered name
pub fn create_strategy(name: &str, params: &serde_json::Value) -> Result<Box<dyn Strategy>> {
    let registry = get_registry().read().unwrap();

    let factory = registry.get(name).ok_or_else(|| {
        let mut available: Vec<_> = registry.keys().copied().collect();
        available.sort_unstable();
        anyhow::anyhow!(
            "Unknown strategy: '{}'. Available: {}",
            name,
            available.join(", ")
        )
    })?;

    factory(params)
}

/// Get list of available strategy names
pub fn available_strategies() -> Vec<&'static str> {
    get_registry().read().unwrap().keys().copied().collect()
}

/// Register a new strategy (for plugins or testing)
pub fn register_strategy(name: &'static str, factory: StrategyFactory) {
    get_registry().write().unwrap().insert(name, factory);
}
