//! Order execution and account queries against Binance futures

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::*;
use tracing::{debug, error, info, warn};

use crate::binance::{BinanceFuturesClient, ExchangeError, OrderResponse, UserTrade};
use crate::identifiers::{StrategyId, TradeId, VenueOrderId};
use crate::instrument::Instrument;
use crate::orders::{to_f64, Fill, MarketOrder};
use crate::portfolio::Position;

pub struct BinanceExecution {
    client: BinanceFuturesClient,
}

/// Commission paid in `currency` across the trades of one order
fn commission_in(trades: &[UserTrade], currency: &str) -> Option<f64> {
    if trades.is_empty() || trades.iter().any(|t| t.commission_asset != currency) {
        return None;
    }
    Some(trades.iter().map(|t| to_f64(t.commission)).sum())
}

/// Build the fill for a market order response; `None` when nothing executed
pub fn fill_from_response(
    order: &MarketOrder,
    response: &OrderResponse,
    instrument: &Instrument,
    trades: &[UserTrade],
) -> Option<Fill> {
    if response.executed_qty <= Decimal::ZERO {
        return None;
    }
    let price = to_f64(response.avg_price);
    let commission = commission_in(trades, &instrument.settlement_currency).unwrap_or_else(|| {
        instrument.notional_value(response.executed_qty, price) * to_f64(instrument.taker_fee)
    });
    let trade_id = trades
        .first()
        .map(|t| t.id.to_string())
        .unwrap_or_else(|| response.order_id.to_string());

    Some(Fill {
        client_order_id: order.client_order_id.clone(),
        venue_order_id: VenueOrderId::new(response.order_id.to_string()),
        trade_id: TradeId::new(trade_id),
        instrument_id: order.instrument_id.clone(),
        strategy_id: order.strategy_id.clone(),
        side: order.side,
        quantity: response.executed_qty,
        price,
        commission,
        commission_currency: instrument.settlement_currency.clone(),
        ts_event: DateTime::from_timestamp_millis(response.update_time).unwrap_or_else(Utc::now),
    })
}

/// Order endpoints used to place a market order and confirm its outcome
pub(crate) trait OrderVenue {
    async fn submit(&self, order: &MarketOrder, symbol: &str) -> Result<OrderResponse, ExchangeError>;

    async fn query(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse, ExchangeError>;

    async fn trades_since(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserTrade>, ExchangeError>;
}

impl OrderVenue for BinanceFuturesClient {
    async fn submit(&self, order: &MarketOrder, symbol: &str) -> Result<OrderResponse, ExchangeError> {
        self.new_market_order(
            symbol,
            order.side,
            order.quantity,
            order.client_order_id.as_str(),
            order.reduce_only,
        )
        .await
    }

    async fn query(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse, ExchangeError> {
        self.query_order(symbol, client_order_id).await
    }

    async fn trades_since(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserTrade>, ExchangeError> {
        self.user_trades(symbol, Some(since)).await
    }
}

/// Submit, and when the outcome is ambiguous look the order up by its client id
pub(crate) async fn place_market_order<V: OrderVenue>(
    venue: &V,
    order: &mut MarketOrder,
    instrument: &Instrument,
) -> Option<Fill> {
    let now = Utc::now();
    order.submit(now);
    let symbol = instrument.raw_symbol.as_str();

    let response = match venue.submit(order, symbol).await {
        Ok(response) => response,
        Err(e) if e.order_may_exist() => {
            warn!(
                "Order {} submit failed ({}), checking venue",
                order.client_order_id, e
            );
            match venue.query(symbol, order.client_order_id.as_str()).await {
                Ok(response) => {
                    info!("Order {} found on venue", order.client_order_id);
                    response
                }
                Err(q) if q.is_unknown_order() => {
                    order.reject(e.to_string(), Utc::now());
                    return None;
                }
                Err(q) => {
                    error!(
                        "Order {} state unknown after {}: {}; reconcile before trading",
                        order.client_order_id, e, q
                    );
                    order.reject(format!("state unknown: {}", e), Utc::now());
                    return None;
                }
            }
        }
        Err(e) => {
            match &e {
                ExchangeError::Api { .. } => warn!("Order {} rejected: {}", order.client_order_id, e),
                _ => error!("Order {} failed: {}", order.client_order_id, e),
            }
            order.reject(e.to_string(), Utc::now());
            return None;
        }
    };

    info!(
        "Order {} -> {} status={} executed={} avg={}",
        order.client_order_id,
        response.order_id,
        response.status,
        response.executed_qty,
        response.avg_price
    );

    let trades = match venue.trades_since(symbol, now - Duration::minutes(1)).await {
        Ok(trades) => trades
            .into_iter()
            .filter(|t| t.order_id == response.order_id)
            .collect(),
        Err(e) => {
            debug!("Could not fetch trades for {}: {}", response.order_id, e);
            Vec::new()
        }
    };

    match fill_from_response(order, &response, instrument, &trades) {
        Some(fill) => {
            order.apply_fill(&fill);
            Some(fill)
        }
        None => {
            order.reject(format!("order not executed, status {}", response.status), Utc::now());
            None
        }
    }
}

impl BinanceExecution {
    pub fn new(client: BinanceFuturesClient) -> Self {
        BinanceExecution { client }
    }

    pub fn client(&self) -> &BinanceFuturesClient {
        &self.client
    }

    /// Send a market order and wait for its result.
    ///
    /// Venue rejections and failed requests mark the order rejected.
    pub async fn execute(&self, order: &mut MarketOrder, instrument: &Instrument) -> Option<Fill> {
        place_market_order(&self.client, order, instrument).await
    }

    /// Balance of `currency` in the futures wallet
    pub async fn balance(&self, currency: &str) -> Result<Option<f64>, ExchangeError> {
        let balances = self.client.balances().await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == currency)
            .map(|b| to_f64(b.balance)))
    }

    /// Open one-way position on the instrument, as a local netting position
    pub async fn position(
        &self,
        instrument: &Instrument,
        strategy_id: &StrategyId,
    ) -> Result<Option<Position>, ExchangeError> {
        let risks = self.client.position_risk(&instrument.raw_symbol).await?;
        Ok(risks
            .iter()
            .filter(|r| r.symbol == instrument.raw_symbol)
            .filter(|r| r.position_side.is_empty() || r.position_side == "BOTH")
            .find(|r| !r.position_amt.is_zero())
            .map(|r| {
                Position::from_venue(
                    instrument.id.clone(),
                    strategy_id.clone(),
                    r.position_amt,
                    to_f64(r.entry_price),
                    Utc::now(),
                )
            }))
    }

    /// Fills of the last `lookback` on the instrument
    pub async fn recent_trades(
        &self,
        instrument: &Instrument,
        lookback: Duration,
    ) -> Result<Vec<UserTrade>, ExchangeError> {
        self.client
            .user_trades(&instrument.raw_symbol, Some(Utc::now() - lookback))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::UNKNOWN_ORDER;
    use crate::identifiers::TraderId;
    use crate::orders::{OrderFactory, OrderStatus, TimeInForce};
    use std::cell::Cell;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    fn order() -> MarketOrder {
        let mut factory = OrderFactory::new(
            TraderId::new("VWAP-TRADER-001"),
            StrategyId::new("VWAPMultiTimeframe-000"),
        );
        factory.market(
            "ADAUSDT-PERP.BINANCE".parse().unwrap(),
            OrderSide::Buy,
            dec!(100),
            TimeInForce::Gtc,
            false,
            Utc::now(),
        )
    }

    fn response(executed: Decimal) -> OrderResponse {
        OrderResponse {
            order_id: 42,
            client_order_id: "x".to_string(),
            symbol: "ADAUSDT".to_string(),
            status: if executed.is_zero() { "EXPIRED" } else { "FILLED" }.to_string(),
            side: "BUY".to_string(),
            executed_qty: executed,
            avg_price: dec!(0.5),
            cum_quote: executed * dec!(0.5),
            update_time: 1_709_294_400_000,
        }
    }

    fn trade(commission: Decimal, asset: &str) -> UserTrade {
        UserTrade {
            symbol: "ADAUSDT".to_string(),
            id: 7,
            order_id: 42,
            side: "BUY".to_string(),
            price: dec!(0.5),
            qty: dec!(100),
            commission,
            commission_asset: asset.to_string(),
            realized_pnl: Decimal::ZERO,
            time: 1_709_294_400_000,
        }
    }

    #[test]
    fn test_fill_uses_trade_commission() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let fill =
            fill_from_response(&order(), &response(dec!(100)), &instrument, &[trade(dec!(0.01), "USDT")])
                .unwrap();
        assert_eq!(fill.quantity, dec!(100));
        assert_eq!(fill.price, 0.5);
        assert_eq!(fill.commission, 0.01);
        assert_eq!(fill.trade_id.as_str(), "7");
        assert_eq!(fill.venue_order_id.as_str(), "42");
    }

    #[test]
    fn test_fill_estimates_commission_without_trades() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let fill = fill_from_response(&order(), &response(dec!(100)), &instrument, &[]).unwrap();
        // 50 USDT notional at the 0.04% taker fee
        assert!((fill.commission - 0.02).abs() < 1e-12);

        let bnb = [trade(dec!(0.0001), "BNB")];
        let fill = fill_from_response(&order(), &response(dec!(100)), &instrument, &bnb).unwrap();
        assert!((fill.commission - 0.02).abs() < 1e-12);
    }

    /// Venue whose order submission fails in a configurable way
    struct ScriptedVenue {
        submit: fn() -> Result<OrderResponse, ExchangeError>,
        on_venue: Option<OrderResponse>,
        trades: Vec<UserTrade>,
        queries: Cell<usize>,
    }

    impl ScriptedVenue {
        fn new(submit: fn() -> Result<OrderResponse, ExchangeError>) -> Self {
            ScriptedVenue {
                submit,
                on_venue: None,
                trades: Vec::new(),
                queries: Cell::new(0),
            }
        }
    }

    impl OrderVenue for ScriptedVenue {
        async fn submit(&self, _: &MarketOrder, _: &str) -> Result<OrderResponse, ExchangeError> {
            (self.submit)()
        }

        async fn query(&self, _: &str, _: &str) -> Result<OrderResponse, ExchangeError> {
            self.queries.set(self.queries.get() + 1);
            self.on_venue.clone().ok_or(ExchangeError::Api {
                status: 400,
                code: UNKNOWN_ORDER,
                msg: "Order does not exist.".to_string(),
            })
        }

        async fn trades_since(&self, _: &str, _: DateTime<Utc>) -> Result<Vec<UserTrade>, ExchangeError> {
            Ok(self.trades.clone())
        }
    }

    fn lost_response() -> Result<OrderResponse, ExchangeError> {
        Err(ExchangeError::Parse("/fapi/v1/order: EOF while parsing".to_string()))
    }

    #[tokio::test]
    async fn test_lost_response_recovers_fill_from_venue() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let mut venue = ScriptedVenue::new(lost_response);
        venue.on_venue = Some(response(dec!(100)));
        venue.trades = vec![trade(dec!(0.01), "USDT")];

        let mut order = order();
        let fill = place_market_order(&venue, &mut order, &instrument).await.unwrap();

        assert_eq!(venue.queries.get(), 1);
        assert_eq!(fill.quantity, dec!(100));
        assert_eq!(fill.commission, 0.01);
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_lost_response_without_venue_order_rejects() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let venue = ScriptedVenue::new(lost_response);

        let mut order = order();
        assert!(place_market_order(&venue, &mut order, &instrument).await.is_none());
        assert_eq!(venue.queries.get(), 1);
        assert_eq!(order.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_venue_rejection_skips_lookup() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        let venue = ScriptedVenue::new(|| {
            Err(ExchangeError::Api {
                status: 400,
                code: -2019,
                msg: "Margin is insufficient.".to_string(),
            })
        });

        let mut order = order();
        assert!(place_market_order(&venue, &mut order, &instrument).await.is_none());
        assert_eq!(venue.queries.get(), 0);
        assert_eq!(order.status, OrderStatus::Rejected);
    }

    #[test]
    fn test_unexecuted_order_has_no_fill() {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        assert!(fill_from_response(&order(), &response(Decimal::ZERO), &instrument, &[]).is_none());
    }
}
