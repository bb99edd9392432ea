//! Live trading node
//!
//! Polls closed 1-minute klines from Binance futures, runs them through the
//! data engine and the strategy, and executes the resulting orders over REST.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::cache::LiveCache;
use super::execution::BinanceExecution;
use crate::aggregation::DataEngine;
use crate::binance::{
    BinanceFuturesClient, BinanceFuturesInstrumentProvider, BinanceKline, Credentials,
    InstrumentProvider,
};
use crate::config::{one_minute_bar_type, secs, LiveConfig};
use crate::identifiers::{BarType, InstrumentId};
use crate::instrument::{Instrument, BINANCE_VENUE};
use crate::orders::{MarketOrder, OrderFactory};
use crate::portfolio::{MarginAccount, Portfolio};
use crate::risk::RiskEngine;
use crate::strategies::{create_strategy, dispatch_position_event, Strategy, StrategyContext};
use crate::types::Bar;

/// Klines requested per poll; enough to bridge a few missed cycles
const POLL_KLINES: u32 = 5;
const DEFAULT_LEVERAGE: u32 = 10;

/// Closed klines opened after `last_open_ms`, as bars in open-time order
pub fn closed_bars_since(
    klines: &[BinanceKline],
    last_open_ms: Option<i64>,
    now: DateTime<Utc>,
    bar_type: &BarType,
) -> Vec<Bar> {
    let mut fresh: Vec<&BinanceKline> = klines
        .iter()
        .filter(|k| k.is_closed(now))
        .filter(|k| last_open_ms.map_or(true, |last| k.open_time > last))
        .collect();
    fresh.sort_by_key(|k| k.open_time);

    fresh
        .into_iter()
        .filter_map(|k| match k.to_candle() {
            Ok(candle) => Some(candle.into_bar(bar_type.clone())),
            Err(e) => {
                warn!("Skipping invalid kline at {}: {}", k.open_time, e);
                None
            }
        })
        .collect()
}

pub struct LiveNode {
    config: LiveConfig,
    execution: BinanceExecution,
    instrument: Instrument,
    instruments: HashMap<InstrumentId, Instrument>,
    bar_type: BarType,
    portfolio: Portfolio,
    risk: RiskEngine,
    data_engine: DataEngine,
    strategy: Box<dyn Strategy>,
    order_factory: OrderFactory,
    cache: LiveCache,
    last_open_ms: Option<i64>,
    shutdown: Arc<AtomicBool>,
}

impl LiveNode {
    /// Create client, instrument, strategy and cache
    pub async fn build(config: LiveConfig) -> Result<Self> {
        let credentials = Credentials::from_env().context("Binance credentials not configured")?;
        let client = BinanceFuturesClient::new(config.client_config(), Some(credentials))?;
        info!(
            "Binance futures client ready ({}{})",
            client.base_url(),
            if config.client.testnet { ", testnet" } else { "" }
        );

        let mut provider = BinanceFuturesInstrumentProvider::new();
        timeout(secs(config.timeouts.connection), provider.load_all(&client))
            .await
            .map_err(|_| anyhow!("Timed out loading instruments"))??;
        let instrument = provider
            .find(&config.instrument_id)
            .ok_or_else(|| anyhow!("Instrument {} not available on Binance futures", config.instrument_id))?;
        info!(
            "Instrument {}: price precision {}, size precision {}, min qty {}",
            instrument.id,
            instrument.price_precision,
            instrument.size_precision,
            instrument.min_qty()
        );

        let spec = config.strategy_spec()?;
        let strategy = create_strategy(&spec.strategy_name, &spec.params)?;
        let data_engine = DataEngine::new(&strategy.subscriptions())
            .with_context(|| format!("Invalid subscriptions for {}", strategy.id()))?;
        let bar_type: BarType = one_minute_bar_type(&instrument.id).parse()?;

        let cache = LiveCache::open(&config.cache)?;
        let order_factory = OrderFactory::new(config.trader_id.clone(), strategy.id());

        let leverage = config.leverage.unwrap_or(DEFAULT_LEVERAGE) as f64;
        let portfolio = Portfolio::new(MarginAccount::new(
            format!("{}-001", BINANCE_VENUE),
            instrument.settlement_currency.clone(),
            0.0,
            leverage,
            Utc::now(),
        ));

        Ok(LiveNode {
            risk: RiskEngine::new(config.risk.clone(), 0.0),
            execution: BinanceExecution::new(client),
            instruments: HashMap::from([(instrument.id.clone(), instrument.clone())]),
            instrument,
            bar_type,
            portfolio,
            data_engine,
            strategy,
            order_factory,
            cache,
            last_open_ms: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    async fn connect(&self) -> Result<()> {
        let client = self.execution.client();
        timeout(secs(self.config.timeouts.connection), client.ping())
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", client.base_url()))??;
        info!("Connected to {}", client.base_url());

        if let Some(leverage) = self.config.leverage {
            client
                .change_leverage(&self.instrument.raw_symbol, leverage)
                .await
                .with_context(|| format!("Failed to set leverage {}x", leverage))?;
            info!("Leverage set to {}x on {}", leverage, self.instrument.raw_symbol);
        }
        Ok(())
    }

    async fn refresh_balance(&mut self) -> Result<f64> {
        let currency = self.instrument.settlement_currency.clone();
        let balance = timeout(
            secs(self.config.timeouts.portfolio),
            self.execution.balance(&currency),
        )
        .await
        .map_err(|_| anyhow!("Timed out loading account balance"))??
        .ok_or_else(|| anyhow!("No {} balance in futures account", currency))?;
        self.portfolio.set_balance(balance, Utc::now());
        Ok(balance)
    }

    /// Adopt the venue position and log recent fills
    async fn reconcile(&mut self) -> Result<()> {
        if !self.config.exec_engine.reconciliation {
            info!("Reconciliation disabled");
            return Ok(());
        }
        let limit = secs(self.config.timeouts.reconciliation);
        let strategy_id = self.strategy.id();

        let position = timeout(limit, self.execution.position(&self.instrument, &strategy_id))
            .await
            .map_err(|_| anyhow!("Timed out reconciling positions"))??;
        match position {
            Some(position) => {
                info!(
                    "Reconciled open position {} {} @ {:.6}",
                    position.instrument_id, position.signed_qty, position.avg_px_open
                );
                self.cache.save_position(&position)?;
                self.portfolio.restore_position(position);
            }
            None => info!("No open position on {}", self.instrument.id),
        }

        let lookback = ChronoDuration::minutes(self.config.exec_engine.reconciliation_lookback_mins as i64);
        match timeout(limit, self.execution.recent_trades(&self.instrument, lookback)).await {
            Ok(Ok(trades)) => {
                info!(
                    "{} fills on {} in the last {} minutes",
                    trades.len(),
                    self.instrument.raw_symbol,
                    lookback.num_minutes()
                );
                for trade in &trades {
                    debug!(
                        "Fill {} order {} {} {} @ {} pnl {}",
                        trade.id, trade.order_id, trade.side, trade.qty, trade.price, trade.realized_pnl
                    );
                }
            }
            Ok(Err(e)) => warn!("Could not load recent fills: {}", e),
            Err(_) => warn!("Timed out loading recent fills"),
        }
        Ok(())
    }

    fn restore_state(&mut self) -> Result<()> {
        if self.config.cache.flush_on_start {
            return Ok(());
        }
        let strategy_id = self.strategy.id();
        let Some(snapshot) = self.cache.load_strategy_state(&strategy_id)? else {
            info!("No cached state for {}", strategy_id);
            return Ok(());
        };
        self.strategy
            .load_state(snapshot.state)
            .with_context(|| format!("Failed to restore state for {}", strategy_id))?;
        self.order_factory.set_count(snapshot.order_count);
        info!(
            "Restored state for {} saved at {} ({} orders)",
            strategy_id, snapshot.updated_at, snapshot.order_count
        );
        Ok(())
    }

    fn persist_state(&self) -> Result<()> {
        self.cache.save_strategy_state(
            &self.strategy.id(),
            &self.strategy.save_state(),
            self.order_factory.count(),
            Utc::now(),
        )
    }

    /// Start up, poll until shutdown, then stop
    pub async fn run(mut self) -> Result<()> {
        self.connect().await?;
        let balance = self.refresh_balance().await?;
        info!("Account balance: {:.4} {}", balance, self.instrument.settlement_currency);
        self.risk = RiskEngine::new(self.config.risk.clone(), self.portfolio.equity());
        self.reconcile().await?;
        self.restore_state()?;

        let now = Utc::now();
        let mut ctx = StrategyContext::new(now, &self.instruments, &self.portfolio, &mut self.order_factory);
        self.strategy.on_start(&mut ctx).context("Strategy failed to start")?;
        let pending = ctx.into_orders();
        self.process_orders(pending).await;
        self.persist_state()?;

        info!(
            "Trader {} running {} on {} (poll every {:.1}s)",
            self.config.trader_id,
            self.strategy.id(),
            self.instrument.id,
            self.config.poll_interval_secs
        );

        let mut ticker = interval(secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let flag = self.shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, initiating shutdown...");
                    flag.store(true, Ordering::SeqCst);
                }
                Err(e) => error!("Error setting up signal handler: {}", e),
            }
        });

        let stop = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for(&stop) => break,
            }
            if let Err(e) = self.run_cycle().await {
                error!("Trading cycle error: {:#}", e);
            }
        }

        self.stop().await
    }

    /// One poll: new closed bars, balance refresh, orders, persistence
    async fn run_cycle(&mut self) -> Result<()> {
        let klines = self
            .execution
            .client()
            .get_klines(&self.instrument.raw_symbol, "1m", None, None, Some(POLL_KLINES))
            .await?;
        let bars = closed_bars_since(&klines, self.last_open_ms, Utc::now(), &self.bar_type);
        if bars.is_empty() {
            debug!("No new closed bars");
            return Ok(());
        }

        if let Err(e) = self.refresh_balance().await {
            warn!("Balance refresh failed: {:#}", e);
        }

        for bar in bars {
            self.last_open_ms = Some((bar.ts_event - self.bar_type.spec().interval()).timestamp_millis());
            self.portfolio.update_price(bar.bar_type.instrument_id(), bar.close);

            for delivered in self.data_engine.process(&bar) {
                let mut ctx =
                    StrategyContext::new(bar.ts_event, &self.instruments, &self.portfolio, &mut self.order_factory);
                self.strategy.on_bar(&delivered, &mut ctx);
                let pending = ctx.into_orders();
                self.process_orders(pending).await;
            }
            self.risk.update_equity(self.portfolio.equity());
        }

        self.persist_state()
    }

    async fn process_orders(&mut self, orders: Vec<MarketOrder>) {
        for mut order in orders {
            let now = Utc::now();
            let Some(instrument) = self.instruments.get(&order.instrument_id).cloned() else {
                order.deny(format!("no instrument {}", order.instrument_id), now);
                self.strategy.on_order_denied(&order);
                self.save_order(&order);
                continue;
            };
            let Some(price) = self.portfolio.last_price(&order.instrument_id) else {
                order.deny("no market price yet", now);
                self.strategy.on_order_denied(&order);
                self.save_order(&order);
                continue;
            };

            let increases = self.portfolio.is_increasing(&order.instrument_id, order.side);
            if let Err(reason) = self.risk.check_order(&order, &instrument, price, increases) {
                warn!("Order {} denied: {}", order.client_order_id, reason);
                order.deny(reason, now);
                self.strategy.on_order_denied(&order);
                self.save_order(&order);
                continue;
            }

            match self.execution.execute(&mut order, &instrument).await {
                Some(fill) => {
                    let events = self.portfolio.apply_fill(&fill);
                    self.strategy.on_order_filled(&order);
                    if let Err(e) = self.cache.save_fill(&fill) {
                        error!("Failed to cache fill {}: {:#}", fill.trade_id, e);
                    }
                    for event in &events {
                        if let Err(e) = self.cache.save_position(event.position()) {
                            error!("Failed to cache position: {:#}", e);
                        }
                        dispatch_position_event(self.strategy.as_mut(), event);
                    }
                }
                None => self.strategy.on_order_rejected(&order),
            }
            self.save_order(&order);
        }
    }

    fn save_order(&self, order: &MarketOrder) {
        if let Err(e) = self.cache.save_order(order) {
            error!("Failed to cache order {}: {:#}", order.client_order_id, e);
        }
    }

    /// Stop the strategy and persist; open positions stay on the venue
    async fn stop(mut self) -> Result<()> {
        info!("Stopping {}", self.strategy.id());
        let now = Utc::now();
        let mut ctx = StrategyContext::new(now, &self.instruments, &self.portfolio, &mut self.order_factory);
        self.strategy.on_stop(&mut ctx);
        let pending = ctx.into_orders();

        if !pending.is_empty() {
            let limit = secs(self.config.timeouts.disconnection);
            if timeout(limit, self.process_orders(pending)).await.is_err() {
                warn!("Timed out sending stop orders");
            }
        }

        self.persist_state()?;
        if let Some(position) = self.portfolio.position(&self.instrument.id) {
            if position.is_open() {
                warn!(
                    "Position {} {} left open on the venue",
                    position.instrument_id, position.signed_qty
                );
            }
        }

        tokio::time::sleep(secs(self.config.timeouts.post_stop)).await;
        info!("Live node stopped");
        Ok(())
    }
}

async fn wait_for(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Build and run a node until Ctrl+C
pub async fn run_live(config: LiveConfig) -> Result<()> {
    if config.instrument_id.venue() != BINANCE_VENUE {
        bail!("Only {} instruments are supported, got {}", BINANCE_VENUE, config.instrument_id);
    }
    let node = LiveNode::build(config).await?;
    node.run().await
}
