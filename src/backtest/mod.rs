//! Backtesting: simulated venue, engine, parallel node, metrics and reports

pub mod engine;
pub mod exchange;
pub mod metrics;
pub mod node;
pub mod reports;

pub use engine::{BacktestEngine, BacktestEngineConfig, BacktestResult};
pub use exchange::{AccountType, OmsType, SimulatedExchange, VenueConfig};
pub use metrics::calculate_metrics;
pub use node::{base_asset, print_summary, BacktestDataConfig, BacktestNode, BacktestRunConfig};
pub use reports::write_reports;
