//! VWAP Multi-Timeframe Strategy Implementation
//!
//! Entry (flat, on each 15-minute bar):
//! - Long: close above 4h VWAP, 15m cross above VWAP, volume >= threshold x average
//! - Short: close below 4h VWAP, 15m cross below VWAP, volume >= threshold x average
//!
//! Exit (in position, on each 15-minute bar):
//! - Time: position older than `time_exit_hours`
//! - Long: take profit at the upper band, stop when close drops below 15m VWAP
//! - Short: take profit at the lower band, stop when close rises above 15m VWAP
//!
//! Position size risks `risk_per_trade` of the balance between the close and
//! the opposite band.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

use super::config::VwapStrategyConfig;
use crate::identifiers::{BarType, ClientOrderId, PositionId, StrategyId};
use crate::indicators::{population_std_dev, VolumeAverage, VolumeWeightedAveragePrice};
use crate::instrument::Instrument;
use crate::orders::{to_f64, MarketOrder, TimeInForce};
use crate::portfolio::Position;
use crate::strategies::{Strategy, StrategyContext};
use crate::types::{Bar, OrderSide};

/// Bars averaged for the volume filter
const VOLUME_WINDOW: usize = 20;

/// What the strategy believes about its own position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionTracking {
    pub in_position: bool,
    pub position_side: Option<OrderSide>,
    pub entry_time: Option<DateTime<Utc>>,
    pub current_position_id: Option<PositionId>,
    /// Closing order in flight; prevents a second exit for the same position
    pub exit_order_id: Option<ClientOrderId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub total: u64,
    pub won: u64,
    pub lost: u64,
}

impl TradeStatistics {
    pub fn win_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.won as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    tracking: PositionTracking,
    statistics: TradeStatistics,
}

pub struct VwapMultiTimeframeStrategy {
    config: VwapStrategyConfig,
    id: StrategyId,
    bar_type_15min: BarType,
    bar_type_4h: BarType,
    instrument: Option<Instrument>,

    vwap_15min: VolumeWeightedAveragePrice,
    vwap_4h: VolumeWeightedAveragePrice,
    bars_15min: VecDeque<Bar>,
    bars_4h: VecDeque<Bar>,
    volumes_15min: VolumeAverage,

    last_15min_price: f64,
    last_15min_vwap: f64,
    upper_band_15min: f64,
    lower_band_15min: f64,

    tracking: PositionTracking,
    statistics: TradeStatistics,
}

impl VwapMultiTimeframeStrategy {
    pub fn new(config: VwapStrategyConfig) -> Result<Self> {
        config.validate()?;

        let bar_type_15min: BarType =
            format!("{}-15-MINUTE-LAST-INTERNAL", config.instrument_id).parse()?;
        let bar_type_4h: BarType =
            format!("{}-4-HOUR-LAST-INTERNAL", config.instrument_id).parse()?;

        Ok(VwapMultiTimeframeStrategy {
            id: StrategyId::new(format!("VWAPMultiTimeframe-{}", config.order_id_tag)),
            bar_type_15min,
            bar_type_4h,
            instrument: None,
            vwap_15min: VolumeWeightedAveragePrice::new(),
            vwap_4h: VolumeWeightedAveragePrice::new(),
            bars_15min: VecDeque::with_capacity(config.vwap_period_15min + 1),
            bars_4h: VecDeque::with_capacity(config.vwap_period_4h + 1),
            volumes_15min: VolumeAverage::new(VOLUME_WINDOW)?,
            last_15min_price: 0.0,
            last_15min_vwap: 0.0,
            upper_band_15min: 0.0,
            lower_band_15min: 0.0,
            tracking: PositionTracking::default(),
            statistics: TradeStatistics::default(),
            config,
        })
    }

    pub fn config(&self) -> &VwapStrategyConfig {
        &self.config
    }

    pub fn tracking(&self) -> &PositionTracking {
        &self.tracking
    }

    pub fn statistics(&self) -> TradeStatistics {
        self.statistics
    }

    /// (lower, upper) band around the 15-minute VWAP
    pub fn bands(&self) -> (f64, f64) {
        (self.lower_band_15min, self.upper_band_15min)
    }

    /// 15-minute bar type aggregated from the configured 1-minute bars
    fn composite(&self, bar_type: &BarType) -> BarType {
        let source = &self.config.bar_type_1min;
        bar_type.clone().aggregated_from(
            source.spec().step,
            source.spec().aggregation,
            source.source(),
        )
    }

    fn reset_tracking(&mut self) {
        self.tracking = PositionTracking::default();
    }

    fn process_15min_bar(&mut self, bar: &Bar, ctx: &mut StrategyContext) {
        self.bars_15min.push_back(bar.clone());
        while self.bars_15min.len() > self.config.vwap_period_15min {
            self.bars_15min.pop_front();
        }
        self.volumes_15min.update(bar.volume);

        let current_price = bar.close;
        self.last_15min_price = current_price;

        if !self.vwap_15min.initialized() || !self.vwap_4h.initialized() {
            info!("Waiting for VWAP indicators to initialize...");
            return;
        }

        let current_15min_vwap = self.vwap_15min.value();
        let current_4h_vwap = self.vwap_4h.value();

        if self.bars_15min.len() >= self.config.vwap_period_15min {
            let prices: Vec<f64> = self.bars_15min.iter().map(|b| b.typical_price()).collect();
            let std_dev = population_std_dev(&prices);
            self.upper_band_15min = current_15min_vwap + std_dev * self.config.std_dev_multiplier;
            self.lower_band_15min = current_15min_vwap - std_dev * self.config.std_dev_multiplier;

            info!(
                "15min VWAP: {:.5}, Upper band: {:.5}, Lower band: {:.5}",
                current_15min_vwap, self.upper_band_15min, self.lower_band_15min
            );
        }

        if self.last_15min_vwap != 0.0 {
            let avg_volume = self.volumes_15min.value();
            let volume_ratio = if avg_volume != 0.0 {
                bar.volume / avg_volume
            } else {
                0.0
            };

            info!(
                "Volume: {:.2}, Avg Volume: {:.2}, Ratio: {:.2}, Threshold: {:.2}",
                bar.volume, avg_volume, volume_ratio, self.config.entry_volume_threshold
            );

            if self.tracking.in_position {
                if let Some(entry_time) = self.tracking.entry_time {
                    let elapsed = bar.ts_event - entry_time;
                    let limit_secs = self.config.time_exit_hours as i64 * 3600;
                    if elapsed.num_seconds() > limit_secs {
                        info!(
                            "Time-based exit triggered after {:.1} hours",
                            elapsed.num_seconds() as f64 / 3600.0
                        );
                        self.exit_position(ctx);
                    }
                }
            }

            if self.tracking.in_position {
                match self.tracking.position_side {
                    Some(OrderSide::Buy) => {
                        if current_price >= self.upper_band_15min {
                            info!(
                                "Take profit triggered: Price {:.5} >= Upper band {:.5}",
                                current_price, self.upper_band_15min
                            );
                            self.exit_position(ctx);
                        } else if current_price < current_15min_vwap {
                            info!(
                                "Stop loss triggered: Price {:.5} < VWAP {:.5}",
                                current_price, current_15min_vwap
                            );
                            self.exit_position(ctx);
                        }
                    }
                    Some(OrderSide::Sell) => {
                        if current_price <= self.lower_band_15min {
                            info!(
                                "Take profit triggered: Price {:.5} <= Lower band {:.5}",
                                current_price, self.lower_band_15min
                            );
                            self.exit_position(ctx);
                        } else if current_price > current_15min_vwap {
                            info!(
                                "Stop loss triggered: Price {:.5} > VWAP {:.5}",
                                current_price, current_15min_vwap
                            );
                            self.exit_position(ctx);
                        }
                    }
                    None => {}
                }
            } else {
                let uptrend_4h = current_price > current_4h_vwap;
                let downtrend_4h = current_price < current_4h_vwap;

                // last_15min_price already holds this bar's close
                let cross_above = self.last_15min_price > current_15min_vwap
                    && self.last_15min_price <= self.last_15min_vwap;
                let cross_below = self.last_15min_price < current_15min_vwap
                    && self.last_15min_price >= self.last_15min_vwap;

                let volume_check = volume_ratio >= self.config.entry_volume_threshold;

                if uptrend_4h && cross_above && volume_check {
                    info!("LONG SIGNAL: 4h uptrend + 15min cross above VWAP + high volume");
                    self.enter_position(OrderSide::Buy, bar, ctx);
                } else if downtrend_4h && cross_below && volume_check {
                    info!("SHORT SIGNAL: 4h downtrend + 15min cross below VWAP + high volume");
                    self.enter_position(OrderSide::Sell, bar, ctx);
                }
            }
        }

        self.last_15min_vwap = current_15min_vwap;
    }

    fn process_4h_bar(&mut self, bar: &Bar) {
        self.bars_4h.push_back(bar.clone());
        while self.bars_4h.len() > self.config.vwap_period_4h {
            self.bars_4h.pop_front();
        }

        if self.vwap_4h.initialized() {
            info!(
                "4h VWAP updated: {:.5} at {}",
                self.vwap_4h.value(),
                bar.ts_event
            );
        }
    }

    fn enter_position(&mut self, side: OrderSide, bar: &Bar, ctx: &mut StrategyContext) {
        if self.tracking.in_position {
            warn!("Already in position, cannot enter new position.");
            return;
        }

        let Some(instrument) = self.instrument.as_ref() else {
            error!("Instrument {} not loaded, cannot enter.", self.config.instrument_id);
            return;
        };

        let Some(balance) = ctx.account_balance(instrument.id.venue()) else {
            error!("Unable to determine account balance.");
            return;
        };

        let current_price = bar.close;
        let stop_price = match side {
            OrderSide::Buy => self.lower_band_15min,
            OrderSide::Sell => self.upper_band_15min,
        };

        let risk_amount = balance * self.config.risk_per_trade;
        let price_distance = (current_price - stop_price).abs();
        if !(price_distance > 0.0) {
            error!("Invalid price distance: {}. Aborting trade.", price_distance);
            return;
        }

        let mut quantity = instrument.make_qty(risk_amount / price_distance);
        let min_qty = instrument.min_qty();
        if quantity < min_qty {
            quantity = min_qty;
            warn!("Position size adjusted to minimum quantity: {}", quantity);
        }

        let client_order_id = ctx.submit_market_order(
            instrument.id.clone(),
            side,
            quantity,
            TimeInForce::Gtc,
            false,
        );
        info!(
            "Submitted {} order: {} qty={} risk={:.4} stop={:.5}",
            side, client_order_id, quantity, risk_amount, stop_price
        );

        self.tracking.in_position = true;
        self.tracking.position_side = Some(side);
        self.tracking.entry_time = Some(bar.ts_event);
        self.statistics.total += 1;
    }

    fn exit_position(&mut self, ctx: &mut StrategyContext) {
        let Some(position_side) = self.tracking.position_side.filter(|_| self.tracking.in_position)
        else {
            warn!("No position to exit.");
            return;
        };

        if let Some(pending) = &self.tracking.exit_order_id {
            debug!("Exit order {} already pending", pending);
            return;
        }

        let instrument_id = self.config.instrument_id.clone();
        let exit_side = position_side.opposite();

        let net = ctx.net_position(&instrument_id);
        if net.is_zero() {
            warn!("No position to exit.");
            self.reset_tracking();
            return;
        }

        let Some(instrument) = self.instrument.as_ref() else {
            error!("Instrument {} not loaded, cannot exit.", instrument_id);
            return;
        };
        let quantity = instrument.make_qty(to_f64(net.abs()));
        if quantity.is_zero() {
            warn!("Position {} rounds to zero at size precision, cannot exit.", net);
            return;
        }

        let client_order_id =
            ctx.submit_market_order(instrument_id, exit_side, quantity, TimeInForce::Gtc, false);
        info!("Submitted exit {} order: {} qty={}", exit_side, client_order_id, quantity);

        // Tracking resets once the position closed event arrives
        self.tracking.exit_order_id = Some(client_order_id);
    }

    fn clear_pending_exit(&mut self, order: &MarketOrder) {
        if self.tracking.exit_order_id.as_ref() == Some(&order.client_order_id) {
            self.tracking.exit_order_id = None;
        }
    }
}

impl Strategy for VwapMultiTimeframeStrategy {
    fn name(&self) -> &'static str {
        "vwap_multi_timeframe"
    }

    fn id(&self) -> StrategyId {
        self.id.clone()
    }

    fn subscriptions(&self) -> Vec<BarType> {
        vec![
            self.config.bar_type_1min.clone(),
            self.composite(&self.bar_type_15min),
            self.composite(&self.bar_type_4h),
        ]
    }

    fn on_start(&mut self, ctx: &mut StrategyContext) -> Result<()> {
        info!("VWAP Multi-Timeframe Strategy starting...");
        let instrument = ctx
            .instrument(&self.config.instrument_id)
            .cloned()
            .ok_or_else(|| anyhow!("Instrument {} not found", self.config.instrument_id))?;
        self.instrument = Some(instrument);

        info!(
            "15-minute bars aggregated from {}: {}",
            self.config.bar_type_1min,
            self.composite(&self.bar_type_15min)
        );
        info!(
            "4-hour bars aggregated from {}: {}",
            self.config.bar_type_1min,
            self.composite(&self.bar_type_4h)
        );
        info!("Subscribed to 15-minute bars: {}", self.bar_type_15min);
        info!("Subscribed to 4-hour bars: {}", self.bar_type_4h);
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar, ctx: &mut StrategyContext) {
        if bar.bar_type == self.bar_type_15min {
            self.vwap_15min.handle_bar(bar);
            self.process_15min_bar(bar, ctx);
        } else if bar.bar_type == self.bar_type_4h {
            self.vwap_4h.handle_bar(bar);
            self.process_4h_bar(bar);
        }
    }

    fn on_position_opened(&mut self, position: &Position) {
        if position.instrument_id != self.config.instrument_id {
            return;
        }
        info!(
            "Position opened: {} {} {} @ {:.5}",
            position.id,
            position.side,
            position.quantity(),
            position.avg_px_open
        );
        self.tracking.current_position_id = Some(position.id.clone());
    }

    fn on_position_closed(&mut self, position: &Position) {
        if position.instrument_id != self.config.instrument_id {
            return;
        }
        info!(
            "Position closed: {} realized_pnl={:.4} return={:.2}%",
            position.id,
            position.realized_pnl,
            position.realized_return * 100.0
        );

        if self.tracking.current_position_id.as_ref() == Some(&position.id) {
            if position.realized_pnl >= 0.0 {
                self.statistics.won += 1;
                info!("Trade won: Realized P&L = {:.4}", position.realized_pnl);
            } else {
                self.statistics.lost += 1;
                info!("Trade lost: Realized P&L = {:.4}", position.realized_pnl);
            }

            self.reset_tracking();

            info!(
                "Trade statistics: Won={}, Lost={}, Total={}, Win rate={:.2}%",
                self.statistics.won,
                self.statistics.lost,
                self.statistics.total,
                self.statistics.win_rate()
            );
        }
    }

    fn on_order_rejected(&mut self, order: &MarketOrder) {
        warn!(
            "Order {} rejected: {}",
            order.client_order_id,
            order.reason.as_deref().unwrap_or("unknown")
        );
        self.clear_pending_exit(order);
    }

    fn on_order_denied(&mut self, order: &MarketOrder) {
        warn!(
            "Order {} denied: {}",
            order.client_order_id,
            order.reason.as_deref().unwrap_or("unknown")
        );
        self.clear_pending_exit(order);
    }

    fn on_stop(&mut self, _ctx: &mut StrategyContext) {
        info!("VWAP Multi-Timeframe Strategy stopped.");
        info!("Total trades: {}", self.statistics.total);
        info!("Won trades: {}", self.statistics.won);
        info!("Lost trades: {}", self.statistics.lost);
        info!("Win rate: {:.2}%", self.statistics.win_rate());
    }

    fn save_state(&self) -> serde_json::Value {
        serde_json::to_value(SavedState {
            tracking: self.tracking.clone(),
            statistics: self.statistics,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        if state.is_null() {
            return Ok(());
        }
        let saved: SavedState = serde_json::from_value(state)?;
        self.tracking = saved.tracking;
        self.statistics = saved.statistics;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{InstrumentId, TradeId, TraderId, VenueOrderId};
    use crate::orders::{Fill, OrderFactory};
    use crate::portfolio::{MarginAccount, Portfolio, PositionEvent};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct Harness {
        strategy: VwapMultiTimeframeStrategy,
        instruments: HashMap<InstrumentId, Instrument>,
        portfolio: Portfolio,
        factory: OrderFactory,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap()
    }

    fn instrument_id() -> InstrumentId {
        "ADAUSDT-PERP.BINANCE".parse().unwrap()
    }

    impl Harness {
        fn new(configure: impl FnOnce(&mut VwapStrategyConfig)) -> Self {
            let mut config = VwapStrategyConfig::new(
                instrument_id(),
                "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL".parse().unwrap(),
            );
            config.vwap_period_15min = 2;
            configure(&mut config);

            let strategy = VwapMultiTimeframeStrategy::new(config).unwrap();
            let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
            let mut instruments = HashMap::new();
            instruments.insert(instrument.id.clone(), instrument);
            let portfolio =
                Portfolio::new(MarginAccount::new("BINANCE-001", "USDT", 100.0, 10.0, t0()));
            let factory = OrderFactory::new(TraderId::new("BACKTESTER-001"), strategy.id());

            let mut harness = Harness {
                strategy,
                instruments,
                portfolio,
                factory,
            };
            let mut ctx = StrategyContext::new(
                t0(),
                &harness.instruments,
                &harness.portfolio,
                &mut harness.factory,
            );
            harness.strategy.on_start(&mut ctx).unwrap();
            harness
        }

        fn bar(&mut self, bar_type: &BarType, hlc: (f64, f64, f64), volume: f64, ts: DateTime<Utc>) -> Vec<MarketOrder> {
            let bar = Bar {
                bar_type: bar_type.clone(),
                open: hlc.2,
                high: hlc.0,
                low: hlc.1,
                close: hlc.2,
                volume,
                ts_event: ts,
            };
            let mut ctx =
                StrategyContext::new(ts, &self.instruments, &self.portfolio, &mut self.factory);
            self.strategy.on_bar(&bar, &mut ctx);
            ctx.into_orders()
        }

        fn fifteen(&mut self, hlc: (f64, f64, f64), volume: f64, ts: DateTime<Utc>) -> Vec<MarketOrder> {
            let bt = self.strategy.bar_type_15min.clone();
            self.bar(&bt, hlc, volume, ts)
        }

        fn four_hour(&mut self, hlc: (f64, f64, f64), volume: f64, ts: DateTime<Utc>) {
            let bt = self.strategy.bar_type_4h.clone();
            assert!(self.bar(&bt, hlc, volume, ts).is_empty());
        }

        fn fill(&mut self, order: &MarketOrder, price: f64, ts: DateTime<Utc>) {
            let fill = Fill {
                client_order_id: order.client_order_id.clone(),
                venue_order_id: VenueOrderId::new("V"),
                trade_id: TradeId::new("T"),
                instrument_id: order.instrument_id.clone(),
                strategy_id: order.strategy_id.clone(),
                side: order.side,
                quantity: order.quantity,
                price,
                commission: 0.0,
                commission_currency: "USDT".to_string(),
                ts_event: ts,
            };
            for event in self.portfolio.apply_fill(&fill) {
                match event {
                    PositionEvent::Opened(p) => self.strategy.on_position_opened(&p),
                    PositionEvent::Changed(p) => self.strategy.on_position_changed(&p),
                    PositionEvent::Closed(p) => self.strategy.on_position_closed(&p),
                }
            }
        }

        /// 4h VWAP at 1.0, then a heavy bar that pulls 15m VWAP below the close
        fn enter_long(&mut self) -> MarketOrder {
            self.four_hour((1.0, 1.0, 1.0), 1.0, t0());
            assert!(self
                .fifteen((1.1, 1.1, 1.1), 100.0, t0() + Duration::minutes(15))
                .is_empty());
            let orders = self.fifteen((1.09, 0.5, 1.08), 300.0, t0() + Duration::minutes(30));
            assert_eq!(orders.len(), 1);
            orders.into_iter().next().unwrap()
        }

        /// 4h VWAP at 1.2, then a heavy bar that lifts 15m VWAP above the close
        fn enter_short(&mut self) -> MarketOrder {
            self.four_hour((1.2, 1.2, 1.2), 1.0, t0());
            assert!(self
                .fifteen((0.9, 0.9, 0.9), 100.0, t0() + Duration::minutes(15))
                .is_empty());
            let orders = self.fifteen((1.6, 0.91, 0.92), 300.0, t0() + Duration::minutes(30));
            assert_eq!(orders.len(), 1);
            orders.into_iter().next().unwrap()
        }
    }

    #[test]
    fn test_waits_for_both_vwaps() {
        let mut h = Harness::new(|_| {});
        let orders = h.fifteen((1.1, 1.0, 1.05), 100.0, t0() + Duration::minutes(15));
        assert!(orders.is_empty());
        assert_eq!(h.strategy.last_15min_vwap, 0.0);
        assert_eq!(h.strategy.last_15min_price, 1.05);
    }

    #[test]
    fn test_subscriptions_are_composites_of_one_minute() {
        let h = Harness::new(|_| {});
        let subs: Vec<String> = h.strategy.subscriptions().iter().map(|b| b.to_string()).collect();
        assert_eq!(
            subs,
            vec![
                "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL",
                "ADAUSDT-PERP.BINANCE-15-MINUTE-LAST-INTERNAL@1-MINUTE-EXTERNAL",
                "ADAUSDT-PERP.BINANCE-4-HOUR-LAST-INTERNAL@1-MINUTE-EXTERNAL",
            ]
        );
    }

    #[test]
    fn test_long_entry_sizing() {
        let mut h = Harness::new(|_| {});
        let order = h.enter_long();

        assert_eq!(order.side, OrderSide::Buy);
        assert!(!order.reduce_only);
        assert_eq!(order.time_in_force, TimeInForce::Gtc);

        // vwap = (1.1*100 + 0.89*300) / 400, std of [1.1, 0.89] = 0.105
        let (lower, upper) = h.strategy.bands();
        assert!((upper - (0.9425 + 0.21)).abs() < 1e-9);
        assert!((lower - (0.9425 - 0.21)).abs() < 1e-9);

        // risk 2.0 / distance (1.08 - 0.7325) = 5.76 -> 6
        assert_eq!(order.quantity, dec!(6));
        assert!(h.strategy.tracking().in_position);
        assert_eq!(h.strategy.tracking().position_side, Some(OrderSide::Buy));
        assert_eq!(h.strategy.statistics().total, 1);
    }

    #[test]
    fn test_no_entry_without_volume() {
        let mut h = Harness::new(|c| c.entry_volume_threshold = 1.6);
        h.four_hour((1.0, 1.0, 1.0), 1.0, t0());
        h.fifteen((1.1, 1.1, 1.1), 100.0, t0() + Duration::minutes(15));
        let orders = h.fifteen((1.09, 0.5, 1.08), 300.0, t0() + Duration::minutes(30));
        assert!(orders.is_empty());
        assert!(!h.strategy.tracking().in_position);
    }

    #[test]
    fn test_stop_loss_exit_and_statistics() {
        let mut h = Harness::new(|_| {});
        let entry = h.enter_long();
        h.fill(&entry, 1.08, t0() + Duration::minutes(31));
        assert!(h.strategy.tracking().current_position_id.is_some());

        // Close below the 15m VWAP
        let orders = h.fifteen((0.9, 0.8, 0.85), 100.0, t0() + Duration::minutes(45));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].quantity, dec!(6));

        h.fill(&orders[0], 0.85, t0() + Duration::minutes(46));
        assert!(!h.strategy.tracking().in_position);
        assert_eq!(h.strategy.statistics().lost, 1);
        assert_eq!(h.strategy.statistics().won, 0);
        assert_eq!(h.strategy.statistics().win_rate(), 0.0);
    }

    #[test]
    fn test_take_profit_exit_counts_win() {
        let mut h = Harness::new(|c| c.std_dev_multiplier = 1.0);
        let entry = h.enter_long();
        h.fill(&entry, 1.08, t0() + Duration::minutes(31));

        // vwap 1.054, std of [0.89, 1.5] = 0.305, upper band 1.359
        let orders = h.fifteen((1.6, 1.4, 1.5), 100.0, t0() + Duration::minutes(45));
        assert_eq!(orders.len(), 1);
        h.fill(&orders[0], 1.5, t0() + Duration::minutes(46));
        assert_eq!(h.strategy.statistics().won, 1);
        assert_eq!(h.strategy.statistics().win_rate(), 100.0);
    }

    #[test]
    fn test_short_entry_sizing() {
        let mut h = Harness::new(|c| c.std_dev_multiplier = 1.0);
        let order = h.enter_short();

        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(h.strategy.tracking().position_side, Some(OrderSide::Sell));

        // vwap = (0.9*100 + 1.14333*300) / 400, std of [0.9, 1.14333] = 0.121667
        let (lower, upper) = h.strategy.bands();
        assert!((upper - (1.0825 + 0.121_666_666_666_7)).abs() < 1e-9);
        assert!((lower - (1.0825 - 0.121_666_666_666_7)).abs() < 1e-9);

        // risk 2.0 / distance (1.204167 - 0.92) = 7.04 -> 7
        assert_eq!(order.quantity, dec!(7));
    }

    #[test]
    fn test_short_take_profit_at_lower_band() {
        let mut h = Harness::new(|c| c.std_dev_multiplier = 1.0);
        let entry = h.enter_short();
        h.fill(&entry, 0.92, t0() + Duration::minutes(31));

        // vwap 0.936, std of [1.14333, 0.35] = 0.396667, lower band 0.539
        let orders = h.fifteen((0.36, 0.34, 0.35), 100.0, t0() + Duration::minutes(45));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].quantity, dec!(7));

        h.fill(&orders[0], 0.35, t0() + Duration::minutes(46));
        assert!(!h.strategy.tracking().in_position);
        assert_eq!(
            h.strategy.statistics(),
            TradeStatistics { total: 1, won: 1, lost: 0 }
        );
    }

    #[test]
    fn test_short_stop_above_vwap() {
        let mut h = Harness::new(|c| c.std_dev_multiplier = 1.0);
        let entry = h.enter_short();
        h.fill(&entry, 0.92, t0() + Duration::minutes(31));

        // vwap 1.096, close 1.15 is above it and above the lower band
        let orders = h.fifteen((1.2, 1.1, 1.15), 100.0, t0() + Duration::minutes(45));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);

        h.fill(&orders[0], 1.15, t0() + Duration::minutes(46));
        assert_eq!(
            h.strategy.statistics(),
            TradeStatistics { total: 1, won: 0, lost: 1 }
        );
    }

    #[test]
    fn test_exit_quantity_uses_size_precision() {
        let mut h = Harness::new(|_| {});
        let entry = h.enter_long();
        // Position restored from the venue off the instrument's lot size
        let mut restored = entry.clone();
        restored.quantity = dec!(6.4);
        h.fill(&restored, 1.08, t0() + Duration::minutes(31));

        let orders = h.fifteen((0.9, 0.8, 0.85), 100.0, t0() + Duration::minutes(45));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, dec!(6));
    }

    #[test]
    fn test_time_exit_submits_single_order() {
        let mut h = Harness::new(|c| c.time_exit_hours = 1);
        let entry = h.enter_long();
        h.fill(&entry, 1.08, t0() + Duration::minutes(31));

        // Time limit passed and close is also below VWAP: still one exit
        let orders = h.fifteen((0.9, 0.8, 0.85), 100.0, t0() + Duration::hours(2));
        assert_eq!(orders.len(), 1);

        // Exit still pending on the next bar
        let orders = h.fifteen((0.9, 0.8, 0.85), 100.0, t0() + Duration::hours(2) + Duration::minutes(15));
        assert!(orders.is_empty());
    }

    #[test]
    fn test_exit_without_position_resets_tracking() {
        let mut h = Harness::new(|_| {});
        let _entry = h.enter_long();
        // Entry never filled, then a stop condition appears
        let orders = h.fifteen((0.9, 0.8, 0.85), 100.0, t0() + Duration::minutes(45));
        assert!(orders.is_empty());
        assert_eq!(h.strategy.tracking(), &PositionTracking::default());
    }

    #[test]
    fn test_state_round_trip() {
        let mut h = Harness::new(|_| {});
        let entry = h.enter_long();
        h.fill(&entry, 1.08, t0() + Duration::minutes(31));
        let saved = h.strategy.save_state();

        let mut restored = Harness::new(|_| {});
        restored.strategy.load_state(saved).unwrap();
        assert_eq!(restored.strategy.tracking(), h.strategy.tracking());
        assert_eq!(restored.strategy.statistics().total, 1);
    }
}
