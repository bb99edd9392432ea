//! Pre-trade risk checks
//!
//! Every order passes through the `RiskEngine` before it reaches the venue.
//! Denied orders never leave the process; the strategy is told why.
//!
//! Drawdown control works on equity (balance plus unrealized PnL):
//! ```text
//! drawdown = (peak_equity - equity) / peak_equity
//! ```
//! Once drawdown reaches `max_drawdown` the engine switches to `Reducing`
//! and only orders that shrink an open position are allowed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::instrument::Instrument;
use crate::orders::MarketOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingState {
    Active,
    /// Only position-reducing orders pass
    Reducing,
    Halted,
}

/// Configuration for RiskEngine using builder pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskEngineConfig {
    /// Skip all checks (default: false)
    pub bypass: bool,
    /// Largest notional allowed for a single order in the quote currency (default: none)
    pub max_notional_per_order: Option<f64>,
    /// Drawdown fraction that switches trading to reducing-only (default: 0.5)
    pub max_drawdown: f64,
    /// Drawdown fraction that logs a warning (default: 0.3)
    pub drawdown_warning: f64,
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        RiskEngineConfig {
            bypass: false,
            max_notional_per_order: None,
            max_drawdown: 0.5,
            drawdown_warning: 0.3,
        }
    }
}

impl RiskEngineConfig {
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_max_notional(mut self, notional: f64) -> Self {
        self.max_notional_per_order = Some(notional);
        self
    }

    pub fn with_drawdown_levels(mut self, warning: f64, max: f64) -> Self {
        self.drawdown_warning = warning;
        self.max_drawdown = max;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskEngineConfig,
    trading_state: TradingState,
    peak_equity: f64,
    current_equity: f64,
    warned: bool,
}

impl RiskEngine {
    pub fn new(config: RiskEngineConfig, initial_equity: f64) -> Self {
        RiskEngine {
            config,
            trading_state: TradingState::Active,
            peak_equity: initial_equity,
            current_equity: initial_equity,
            warned: false,
        }
    }

    pub fn trading_state(&self) -> TradingState {
        self.trading_state
    }

    pub fn set_trading_state(&mut self, state: TradingState) {
        if state != self.trading_state {
            info!("Trading state changed: {:?} -> {:?}", self.trading_state, state);
            self.trading_state = state;
        }
    }

    pub fn current_drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.current_equity) / self.peak_equity).max(0.0)
    }

    /// Track equity; may move trading into `Reducing`
    pub fn update_equity(&mut self, equity: f64) {
        self.current_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }

        let drawdown = self.current_drawdown();
        if drawdown >= self.config.drawdown_warning && !self.warned {
            warn!("Drawdown warning: {:.2}% from peak", drawdown * 100.0);
            self.warned = true;
        } else if drawdown < self.config.drawdown_warning {
            self.warned = false;
        }

        if drawdown >= self.config.max_drawdown && self.trading_state == TradingState::Active {
            warn!(
                "Max drawdown {:.2}% reached, only reducing orders allowed",
                drawdown * 100.0
            );
            self.set_trading_state(TradingState::Reducing);
        }
    }

    /// Check an order; `Err` carries the denial reason
    pub fn check_order(
        &self,
        order: &MarketOrder,
        instrument: &Instrument,
        price: f64,
        increases_position: bool,
    ) -> Result<(), String> {
        if self.config.bypass {
            return Ok(());
        }

        if order.quantity <= Decimal::ZERO {
            return Err(format!("quantity {} is not positive", order.quantity));
        }

        if let Some(max_qty) = instrument.max_quantity {
            if order.quantity > max_qty {
                return Err(format!(
                    "quantity {} exceeds maximum {} for {}",
                    order.quantity, max_qty, instrument.id
                ));
            }
        }

        if let Some(max_notional) = self.config.max_notional_per_order {
            let notional = instrument.notional_value(order.quantity, price);
            if notional > max_notional {
                return Err(format!(
                    "notional {:.2} exceeds max per order {:.2}",
                    notional, max_notional
                ));
            }
        }

        match self.trading_state {
            TradingState::Active => Ok(()),
            TradingState::Reducing if !increases_position => Ok(()),
            TradingState::Reducing => Err("trading state is REDUCING".to_string()),
            TradingState::Halted => Err("trading state is HALTED".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{StrategyId, TraderId};
    use crate::orders::{OrderFactory, TimeInForce};
    use crate::types::OrderSide;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(qty: Decimal) -> MarketOrder {
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        OrderFactory::new(TraderId::new("BACKTESTER-001"), StrategyId::new("S-000")).market(
            instrument.id,
            OrderSide::Buy,
            qty,
            TimeInForce::Gtc,
            false,
            Utc::now(),
        )
    }

    #[test]
    fn test_drawdown_calculation() {
        let mut engine = RiskEngine::new(RiskEngineConfig::default(), 100.0);
        assert_eq!(engine.current_drawdown(), 0.0);

        engine.update_equity(90.0);
        assert!((engine.current_drawdown() - 0.10).abs() < 1e-12);

        engine.update_equity(110.0);
        assert_eq!(engine.current_drawdown(), 0.0);
    }

    #[test]
    fn test_max_drawdown_switches_to_reducing() {
        let config = RiskEngineConfig::default().with_drawdown_levels(0.1, 0.2);
        let mut engine = RiskEngine::new(config, 100.0);
        let instrument = Instrument::usdt_perpetual("ADA", 4, 0);

        engine.update_equity(79.0);
        assert_eq!(engine.trading_state(), TradingState::Reducing);
        assert!(engine.check_order(&order(dec!(10)), &instrument, 0.5, true).is_err());
        assert!(engine.check_order(&order(dec!(10)), &instrument, 0.5, false).is_ok());

        engine.set_trading_state(TradingState::Halted);
        assert!(engine.check_order(&order(dec!(10)), &instrument, 0.5, false).is_err());
    }

    #[test]
    fn test_quantity_and_notional_limits() {
        let config = RiskEngineConfig::default().with_max_notional(100.0);
        let engine = RiskEngine::new(config, 100.0);
        let mut instrument = Instrument::usdt_perpetual("ADA", 4, 0);
        instrument.max_quantity = Some(dec!(1000));

        assert!(engine.check_order(&order(dec!(0)), &instrument, 0.5, true).is_err());
        assert!(engine.check_order(&order(dec!(2000)), &instrument, 0.01, true).is_err());
        assert!(engine.check_order(&order(dec!(500)), &instrument, 0.5, true).is_err());
        assert!(engine.check_order(&order(dec!(100)), &instrument, 0.5, true).is_ok());

        let bypass = RiskEngine::new(RiskEngineConfig::default().with_bypass(true), 100.0);
        assert!(bypass.check_order(&order(dec!(0)), &instrument, 0.5, true).is_ok());
    }
}
