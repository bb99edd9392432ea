//! Backtest engine
//!
//! Replays 1-minute bars through the data engine, the strategy, the risk
//! engine and a simulated venue. One engine runs one strategy on one venue
//! and is fully deterministic.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::exchange::{SimulatedExchange, VenueConfig};
use super::metrics::calculate_metrics;
use crate::aggregation::DataEngine;
use crate::identifiers::{InstrumentId, TraderId};
use crate::instrument::Instrument;
use crate::orders::{MarketOrder, OrderFactory};
use crate::portfolio::{AccountState, MarginAccount, Portfolio, Position};
use crate::risk::{RiskEngine, RiskEngineConfig};
use crate::strategies::{dispatch_position_event, Strategy, StrategyContext};
use crate::types::{Bar, PerformanceMetrics};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestEngineConfig {
    #[serde(default = "default_trader_id")]
    pub trader_id: TraderId,
    /// Run id such as `BT-ADA`; the part after `BT-` labels the reports
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub risk: RiskEngineConfig,
}

fn default_trader_id() -> TraderId {
    TraderId::new("BACKTESTER-001")
}

impl Default for BacktestEngineConfig {
    fn default() -> Self {
        BacktestEngineConfig {
            trader_id: default_trader_id(),
            run_id: String::new(),
            risk: RiskEngineConfig::default(),
        }
    }
}

impl BacktestEngineConfig {
    pub fn label(&self) -> &str {
        self.run_id.strip_prefix("BT-").unwrap_or(&self.run_id)
    }
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub run_id: String,
    pub label: String,
    pub instrument_id: Option<InstrumentId>,
    /// Every order the strategy submitted, in submission order
    pub orders: Vec<MarketOrder>,
    /// Closed position cycles followed by positions still open
    pub positions: Vec<Position>,
    pub account_states: Vec<AccountState>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub metrics: PerformanceMetrics,
    pub starting_balance: f64,
    pub final_balance: f64,
    pub bars_processed: usize,
    pub strategy_state: serde_json::Value,
}

fn open_account(venue: &VenueConfig, balance: f64, ts: DateTime<Utc>) -> MarginAccount {
    MarginAccount::new(
        format!("{}-001", venue.name),
        venue.base_currency.clone(),
        balance,
        venue.default_leverage,
        ts,
    )
}

pub struct BacktestEngine {
    config: BacktestEngineConfig,
    exchange: SimulatedExchange,
    instruments: HashMap<InstrumentId, Instrument>,
    portfolio: Portfolio,
    risk: RiskEngine,
    data_engine: DataEngine,
    strategy: Box<dyn Strategy>,
    order_factory: OrderFactory,
    orders: Vec<MarketOrder>,
    equity_curve: Vec<(DateTime<Utc>, f64)>,
    starting_balance: f64,
}

impl BacktestEngine {
    pub fn new(
        config: BacktestEngineConfig,
        venue: VenueConfig,
        instruments: Vec<Instrument>,
        strategy: Box<dyn Strategy>,
    ) -> Result<Self> {
        venue.validate()?;
        let starting_balance = venue.starting_balance()?;

        let account = open_account(&venue, starting_balance, DateTime::<Utc>::UNIX_EPOCH);

        let data_engine = DataEngine::new(&strategy.subscriptions())
            .with_context(|| format!("Invalid subscriptions for {}", strategy.id()))?;
        let order_factory = OrderFactory::new(config.trader_id.clone(), strategy.id());

        Ok(BacktestEngine {
            risk: RiskEngine::new(config.risk.clone(), starting_balance),
            config,
            exchange: SimulatedExchange::new(venue),
            instruments: instruments.into_iter().map(|i| (i.id.clone(), i)).collect(),
            portfolio: Portfolio::new(account),
            data_engine,
            strategy,
            order_factory,
            orders: Vec::new(),
            equity_curve: Vec::new(),
            starting_balance,
        })
    }

    /// Run over 1-minute bars; bars are replayed in `ts_event` order
    pub fn run(mut self, mut bars: Vec<Bar>) -> Result<BacktestResult> {
        bars.sort_by_key(|b| b.ts_event);
        let sources = self.data_engine.source_bar_types();
        let start = bars.first().map(|b| b.ts_event).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.portfolio = Portfolio::new(open_account(
            self.exchange.config(),
            self.starting_balance,
            start,
        ));

        info!(
            "[{}] Starting backtest: {} bars, strategy {}",
            self.config.run_id,
            bars.len(),
            self.strategy.id()
        );

        let mut ctx = StrategyContext::new(
            start,
            &self.instruments,
            &self.portfolio,
            &mut self.order_factory,
        );
        self.strategy
            .on_start(&mut ctx)
            .with_context(|| format!("[{}] strategy failed to start", self.config.run_id))?;
        let pending = ctx.into_orders();
        self.process_orders(pending, start);

        let mut bars_processed = 0;
        for bar in &bars {
            if !sources.contains(&bar.bar_type) {
                continue;
            }
            bars_processed += 1;
            self.portfolio
                .update_price(bar.bar_type.instrument_id(), bar.close);

            for delivered in self.data_engine.process(bar) {
                let mut ctx = StrategyContext::new(
                    bar.ts_event,
                    &self.instruments,
                    &self.portfolio,
                    &mut self.order_factory,
                );
                self.strategy.on_bar(&delivered, &mut ctx);
                let pending = ctx.into_orders();
                self.process_orders(pending, bar.ts_event);
            }

            let equity = self.portfolio.equity();
            self.risk.update_equity(equity);
            self.equity_curve.push((bar.ts_event, equity));
        }

        let end = bars.last().map(|b| b.ts_event).unwrap_or(start);
        let mut ctx = StrategyContext::new(
            end,
            &self.instruments,
            &self.portfolio,
            &mut self.order_factory,
        );
        self.strategy.on_stop(&mut ctx);
        let pending = ctx.into_orders();
        self.process_orders(pending, end);

        let metrics = calculate_metrics(
            self.starting_balance,
            self.portfolio.closed_positions(),
            &self.equity_curve,
        );

        info!(
            "[{}] Backtest finished: {} orders, {} closed positions, return {:.2}%",
            self.config.run_id,
            self.orders.len(),
            self.portfolio.closed_positions().len(),
            metrics.total_return
        );

        let instrument_id = self
            .strategy
            .subscriptions()
            .first()
            .map(|bt| bt.instrument_id().clone());

        Ok(BacktestResult {
            run_id: self.config.run_id.clone(),
            label: self.config.label().to_string(),
            instrument_id,
            positions: self.portfolio.all_positions(),
            account_states: self.portfolio.account().states().to_vec(),
            final_balance: self.portfolio.balance_total(),
            strategy_state: self.strategy.save_state(),
            orders: self.orders,
            equity_curve: self.equity_curve,
            metrics,
            starting_balance: self.starting_balance,
            bars_processed,
        })
    }

    /// Risk check, execute and settle orders at the latest bar close
    fn process_orders(&mut self, orders: Vec<MarketOrder>, ts: DateTime<Utc>) {
        for mut order in orders {
            let Some(instrument) = self.instruments.get(&order.instrument_id) else {
                order.deny(format!("no instrument {}", order.instrument_id), ts);
                self.strategy.on_order_denied(&order);
                self.orders.push(order);
                continue;
            };
            let Some(price) = self.portfolio.last_price(&order.instrument_id) else {
                order.deny("no market price yet", ts);
                self.strategy.on_order_denied(&order);
                self.orders.push(order);
                continue;
            };

            let increases = self
                .portfolio
                .is_increasing(&order.instrument_id, order.side);
            if let Err(reason) = self.risk.check_order(&order, instrument, price, increases) {
                warn!("Order {} denied: {}", order.client_order_id, reason);
                order.deny(reason, ts);
                self.strategy.on_order_denied(&order);
                self.orders.push(order);
                continue;
            }

            match self
                .exchange
                .execute(&mut order, instrument, price, &self.portfolio, ts)
            {
                Some(fill) => {
                    let events = self.portfolio.apply_fill(&fill);
                    self.strategy.on_order_filled(&order);
                    for event in &events {
                        debug!("Position event: {:?}", event.position().side);
                        dispatch_position_event(self.strategy.as_mut(), event);
                    }
                }
                None => self.strategy.on_order_rejected(&order),
            }
            self.orders.push(order);
        }
    }
}
