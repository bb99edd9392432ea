//! Netting positions and the margin account
//!
//! One position per instrument. Fills in the position's direction increase
//! it at a weighted average price; opposite fills reduce it, realizing PnL,
//! and a fill larger than the open quantity closes the position and opens a
//! new one in the other direction with the remainder.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::identifiers::{ClientOrderId, InstrumentId, PositionId, StrategyId};
use crate::orders::{to_f64, Fill};
use crate::types::{OrderSide, PositionSide};

// =============================================================================
// Position
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub instrument_id: InstrumentId,
    pub strategy_id: StrategyId,
    pub opening_order_id: ClientOrderId,
    pub entry: OrderSide,
    pub side: PositionSide,
    /// Positive for long, negative for short
    pub signed_qty: Decimal,
    pub peak_qty: Decimal,
    pub avg_px_open: f64,
    pub avg_px_close: Option<f64>,
    closed_qty: Decimal,
    /// Net of commissions
    pub realized_pnl: f64,
    pub realized_return: f64,
    pub commissions: f64,
    pub ts_opened: DateTime<Utc>,
    pub ts_closed: Option<DateTime<Utc>>,
}

impl Position {
    fn open(id: PositionId, fill: &Fill, quantity: Decimal, commission: f64) -> Self {
        let side = match fill.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };
        Position {
            id,
            instrument_id: fill.instrument_id.clone(),
            strategy_id: fill.strategy_id.clone(),
            opening_order_id: fill.client_order_id.clone(),
            entry: fill.side,
            side,
            signed_qty: quantity * fill.side.sign(),
            peak_qty: quantity,
            avg_px_open: fill.price,
            avg_px_close: None,
            closed_qty: Decimal::ZERO,
            realized_pnl: -commission,
            realized_return: 0.0,
            commissions: commission,
            ts_opened: fill.ts_event,
            ts_closed: None,
        }
    }

    /// Position as reported by the venue, with no fill history
    pub fn from_venue(
        instrument_id: InstrumentId,
        strategy_id: StrategyId,
        signed_qty: Decimal,
        entry_price: f64,
        ts: DateTime<Utc>,
    ) -> Self {
        let entry = if signed_qty >= Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        Position {
            id: PositionId::netting(&instrument_id, &strategy_id),
            instrument_id,
            strategy_id,
            opening_order_id: ClientOrderId::new("EXTERNAL"),
            entry,
            side: if signed_qty > Decimal::ZERO {
                PositionSide::Long
            } else if signed_qty < Decimal::ZERO {
                PositionSide::Short
            } else {
                PositionSide::Flat
            },
            signed_qty,
            peak_qty: signed_qty.abs(),
            avg_px_open: entry_price,
            avg_px_close: None,
            closed_qty: Decimal::ZERO,
            realized_pnl: 0.0,
            realized_return: 0.0,
            commissions: 0.0,
            ts_opened: ts,
            ts_closed: None,
        }
    }

    pub fn quantity(&self) -> Decimal {
        self.signed_qty.abs()
    }

    pub fn is_open(&self) -> bool {
        !self.signed_qty.is_zero()
    }

    pub fn is_closed(&self) -> bool {
        self.signed_qty.is_zero()
    }

    fn direction(&self) -> f64 {
        match self.side {
            PositionSide::Short => -1.0,
            _ => 1.0,
        }
    }

    /// Mark-to-market PnL of the open quantity
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if self.is_closed() {
            return 0.0;
        }
        (price - self.avg_px_open) * to_f64(self.quantity()) * self.direction()
    }

    pub fn notional(&self) -> f64 {
        to_f64(self.quantity()) * self.avg_px_open
    }

    fn increase(&mut self, quantity: Decimal, price: f64, commission: f64) {
        let old = to_f64(self.quantity());
        let add = to_f64(quantity);
        self.avg_px_open = (self.avg_px_open * old + price * add) / (old + add);
        self.signed_qty += quantity * self.entry.sign();
        self.peak_qty = self.peak_qty.max(self.quantity());
        self.commissions += commission;
        self.realized_pnl -= commission;
    }

    /// Reduce by `quantity` (not more than open); returns the gross PnL realized
    fn reduce(&mut self, quantity: Decimal, price: f64, commission: f64, ts: DateTime<Utc>) -> f64 {
        let qty = to_f64(quantity);
        let pnl = (price - self.avg_px_open) * qty * self.direction();

        let prev_closed = to_f64(self.closed_qty);
        let prev_close_px = self.avg_px_close.unwrap_or(0.0);
        self.avg_px_close = Some((prev_close_px * prev_closed + price * qty) / (prev_closed + qty));
        self.closed_qty += quantity;

        self.signed_qty -= quantity * self.entry.sign();
        self.realized_pnl += pnl - commission;
        self.commissions += commission;
        if let Some(close_px) = self.avg_px_close {
            if self.avg_px_open > 0.0 {
                self.realized_return = (close_px / self.avg_px_open - 1.0) * self.direction();
            }
        }

        if self.signed_qty.is_zero() {
            self.side = PositionSide::Flat;
            self.ts_closed = Some(ts);
        }
        pnl
    }
}

#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened(Position),
    Changed(Position),
    Closed(Position),
}

impl PositionEvent {
    pub fn position(&self) -> &Position {
        match self {
            PositionEvent::Opened(p) | PositionEvent::Changed(p) | PositionEvent::Closed(p) => p,
        }
    }
}

// =============================================================================
// Margin account
// =============================================================================

/// Snapshot of the account after each balance change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub ts_event: DateTime<Utc>,
    pub account_id: String,
    pub currency: String,
    pub total: f64,
    pub locked: f64,
    pub free: f64,
    /// True when the balance came from the venue rather than local accounting
    pub reported: bool,
}

#[derive(Debug, Clone)]
pub struct MarginAccount {
    pub account_id: String,
    pub base_currency: String,
    pub leverage: f64,
    balance_total: f64,
    margin_locked: f64,
    states: Vec<AccountState>,
}

impl MarginAccount {
    pub fn new(
        account_id: impl Into<String>,
        base_currency: impl Into<String>,
        starting_balance: f64,
        leverage: f64,
        ts: DateTime<Utc>,
    ) -> Self {
        let mut account = MarginAccount {
            account_id: account_id.into(),
            base_currency: base_currency.into(),
            leverage: if leverage > 0.0 { leverage } else { 1.0 },
            balance_total: starting_balance,
            margin_locked: 0.0,
            states: Vec::new(),
        };
        account.snapshot(ts, false);
        account
    }

    /// Venue part of an account id such as `BINANCE-001`
    pub fn venue(&self) -> &str {
        self.account_id
            .rsplit_once('-')
            .map(|(venue, _)| venue)
            .unwrap_or(&self.account_id)
    }

    pub fn balance_total(&self) -> f64 {
        self.balance_total
    }

    pub fn balance_locked(&self) -> f64 {
        self.margin_locked
    }

    pub fn balance_free(&self) -> f64 {
        self.balance_total - self.margin_locked
    }

    /// Initial margin required to hold `notional`
    pub fn margin_for(&self, notional: f64) -> f64 {
        notional / self.leverage
    }

    pub fn states(&self) -> &[AccountState] {
        &self.states
    }

    fn snapshot(&mut self, ts: DateTime<Utc>, reported: bool) {
        self.states.push(AccountState {
            ts_event: ts,
            account_id: self.account_id.clone(),
            currency: self.base_currency.clone(),
            total: self.balance_total,
            locked: self.margin_locked,
            free: self.balance_free(),
            reported,
        });
    }
}

// =============================================================================
// Portfolio
// =============================================================================

#[derive(Debug, Clone)]
pub struct Portfolio {
    account: MarginAccount,
    positions: HashMap<InstrumentId, Position>,
    closed: Vec<Position>,
    last_prices: HashMap<InstrumentId, f64>,
}

impl Portfolio {
    pub fn new(account: MarginAccount) -> Self {
        Portfolio {
            account,
            positions: HashMap::new(),
            closed: Vec::new(),
            last_prices: HashMap::new(),
        }
    }

    pub fn account(&self) -> &MarginAccount {
        &self.account
    }

    pub fn balance_total(&self) -> f64 {
        self.account.balance_total()
    }

    /// Signed open quantity, zero when flat
    pub fn net_position(&self, instrument_id: &InstrumentId) -> Decimal {
        self.positions
            .get(instrument_id)
            .map(|p| p.signed_qty)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn position(&self, instrument_id: &InstrumentId) -> Option<&Position> {
        self.positions.get(instrument_id)
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    /// Closed position cycles followed by positions still open
    pub fn all_positions(&self) -> Vec<Position> {
        let mut all = self.closed.clone();
        let mut open: Vec<Position> = self.positions.values().cloned().collect();
        open.sort_by(|a, b| a.ts_opened.cmp(&b.ts_opened));
        all.extend(open);
        all
    }

    pub fn update_price(&mut self, instrument_id: &InstrumentId, price: f64) {
        self.last_prices.insert(instrument_id.clone(), price);
    }

    pub fn last_price(&self, instrument_id: &InstrumentId) -> Option<f64> {
        self.last_prices.get(instrument_id).copied()
    }

    pub fn unrealized_pnl(&self, instrument_id: &InstrumentId) -> f64 {
        match (self.positions.get(instrument_id), self.last_price(instrument_id)) {
            (Some(position), Some(price)) => position.unrealized_pnl(price),
            _ => 0.0,
        }
    }

    /// Balance plus unrealized PnL across open positions
    pub fn equity(&self) -> f64 {
        let unrealized: f64 = self
            .positions
            .keys()
            .map(|id| self.unrealized_pnl(id))
            .sum();
        self.account.balance_total() + unrealized
    }

    /// Whether an order of `side` would grow the absolute position
    pub fn is_increasing(&self, instrument_id: &InstrumentId, side: OrderSide) -> bool {
        let net = self.net_position(instrument_id);
        net.is_zero() || (net > Decimal::ZERO) == (side == OrderSide::Buy)
    }

    /// Overwrite the balance with a venue-reported value
    pub fn set_balance(&mut self, total: f64, ts: DateTime<Utc>) {
        self.account.balance_total = total;
        self.account.snapshot(ts, true);
    }

    /// Install a position reported by the venue (startup reconciliation)
    pub fn restore_position(&mut self, position: Position) {
        self.positions
            .insert(position.instrument_id.clone(), position);
        self.recompute_margin();
    }

    fn recompute_margin(&mut self) {
        let notional: f64 = self.positions.values().map(|p| p.notional()).sum();
        self.account.margin_locked = self.account.margin_for(notional);
    }

    /// Apply a fill and return the resulting position events
    pub fn apply_fill(&mut self, fill: &Fill) -> Vec<PositionEvent> {
        let mut events = Vec::new();
        let position_id = PositionId::netting(&fill.instrument_id, &fill.strategy_id);
        let fill_qty = fill.quantity;
        let mut pnl_delta = 0.0;

        match self.positions.remove(&fill.instrument_id) {
            None => {
                let position = Position::open(position_id, fill, fill_qty, fill.commission);
                events.push(PositionEvent::Opened(position.clone()));
                self.positions.insert(fill.instrument_id.clone(), position);
            }
            Some(mut position) if position.entry == fill.side => {
                position.increase(fill_qty, fill.price, fill.commission);
                events.push(PositionEvent::Changed(position.clone()));
                self.positions.insert(fill.instrument_id.clone(), position);
            }
            Some(mut position) => {
                let open_qty = position.quantity();
                let close_qty = fill_qty.min(open_qty);
                let remainder = fill_qty - close_qty;
                let close_share = if fill_qty.is_zero() {
                    1.0
                } else {
                    to_f64(close_qty) / to_f64(fill_qty)
                };
                let close_commission = fill.commission * close_share;

                pnl_delta += position.reduce(close_qty, fill.price, close_commission, fill.ts_event);

                if position.is_closed() {
                    debug!(
                        "Position {} closed: realized_pnl={:.4}",
                        position.id, position.realized_pnl
                    );
                    events.push(PositionEvent::Closed(position.clone()));
                    self.closed.push(position);

                    if remainder > Decimal::ZERO {
                        let flipped = Position::open(
                            position_id,
                            fill,
                            remainder,
                            fill.commission - close_commission,
                        );
                        events.push(PositionEvent::Opened(flipped.clone()));
                        self.positions.insert(fill.instrument_id.clone(), flipped);
                    }
                } else {
                    events.push(PositionEvent::Changed(position.clone()));
                    self.positions.insert(fill.instrument_id.clone(), position);
                }
            }
        }

        self.account.balance_total += pnl_delta - fill.commission;
        self.recompute_margin();
        self.account.snapshot(fill.ts_event, false);
        self.update_price(&fill.instrument_id, fill.price);

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{TradeId, VenueOrderId};
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn instrument() -> InstrumentId {
        "ADAUSDT-PERP.BINANCE".parse().unwrap()
    }

    fn fill(side: OrderSide, qty: Decimal, price: f64, commission: f64) -> Fill {
        Fill {
            client_order_id: ClientOrderId::new("O-1"),
            venue_order_id: VenueOrderId::new("V-1"),
            trade_id: TradeId::new("T-1"),
            instrument_id: instrument(),
            strategy_id: StrategyId::new("VWAPMultiTimeframe-000"),
            side,
            quantity: qty,
            price,
            commission,
            commission_currency: "USDT".to_string(),
            ts_event: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn portfolio() -> Portfolio {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Portfolio::new(MarginAccount::new("BINANCE-001", "USDT", 100.0, 10.0, ts))
    }

    #[test]
    fn test_open_increase_and_close_long() {
        let mut p = portfolio();
        let events = p.apply_fill(&fill(OrderSide::Buy, dec!(100), 1.0, 0.04));
        assert!(matches!(events[0], PositionEvent::Opened(_)));
        assert_eq!(p.net_position(&instrument()), dec!(100));
        assert_relative_eq!(p.account().balance_locked(), 10.0);

        let events = p.apply_fill(&fill(OrderSide::Buy, dec!(100), 2.0, 0.0));
        assert!(matches!(events[0], PositionEvent::Changed(_)));
        assert_relative_eq!(p.position(&instrument()).unwrap().avg_px_open, 1.5);

        let events = p.apply_fill(&fill(OrderSide::Sell, dec!(200), 2.0, 0.0));
        let PositionEvent::Closed(closed) = &events[0] else {
            panic!("expected close");
        };
        // (2.0 - 1.5) * 200 - 0.04
        assert_relative_eq!(closed.realized_pnl, 99.96, epsilon = 1e-9);
        assert_eq!(p.net_position(&instrument()), Decimal::ZERO);
        assert_relative_eq!(p.balance_total(), 199.96, epsilon = 1e-9);
        assert_relative_eq!(p.account().balance_locked(), 0.0);
        assert_eq!(p.closed_positions().len(), 1);
    }

    #[test]
    fn test_short_loss() {
        let mut p = portfolio();
        p.apply_fill(&fill(OrderSide::Sell, dec!(10), 1.0, 0.0));
        assert_eq!(p.net_position(&instrument()), dec!(-10));
        assert!(!p.is_increasing(&instrument(), OrderSide::Buy));
        assert!(p.is_increasing(&instrument(), OrderSide::Sell));

        p.update_price(&instrument(), 1.5);
        assert_relative_eq!(p.unrealized_pnl(&instrument()), -5.0);
        assert_relative_eq!(p.equity(), 95.0);

        let events = p.apply_fill(&fill(OrderSide::Buy, dec!(10), 1.5, 0.0));
        assert!(events[0].position().realized_pnl < 0.0);
        assert_relative_eq!(p.balance_total(), 95.0);
    }

    #[test]
    fn test_flip_closes_then_opens() {
        let mut p = portfolio();
        p.apply_fill(&fill(OrderSide::Buy, dec!(10), 1.0, 0.0));
        let events = p.apply_fill(&fill(OrderSide::Sell, dec!(15), 1.2, 0.0));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PositionEvent::Closed(_)));
        let PositionEvent::Opened(opened) = &events[1] else {
            panic!("expected open");
        };
        assert_eq!(opened.side, PositionSide::Short);
        assert_eq!(p.net_position(&instrument()), dec!(-5));
        assert_relative_eq!(p.balance_total(), 102.0, epsilon = 1e-9);
    }

    #[test]
    fn test_partial_reduce_and_account_states() {
        let mut p = portfolio();
        p.apply_fill(&fill(OrderSide::Buy, dec!(10), 1.0, 0.0));
        let events = p.apply_fill(&fill(OrderSide::Sell, dec!(4), 1.5, 0.0));
        assert!(matches!(events[0], PositionEvent::Changed(_)));
        assert_eq!(p.net_position(&instrument()), dec!(6));
        assert_relative_eq!(p.balance_total(), 102.0, epsilon = 1e-9);
        // initial + two fills
        assert_eq!(p.account().states().len(), 3);

        p.set_balance(250.0, Utc::now());
        assert!(p.account().states().last().unwrap().reported);
        assert_relative_eq!(p.balance_total(), 250.0);
    }
}
