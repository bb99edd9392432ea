//! JSON reports written after each backtest run
//!
//! Files per run label (base asset, e.g. `ADA`):
//! - `order_fills_report_{label}.json`
//! - `positions_report_{label}.json`
//! - `account_report_{label}.json`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

use super::engine::BacktestResult;
use crate::identifiers::{ClientOrderId, InstrumentId, PositionId, StrategyId, VenueOrderId};
use crate::orders::{MarketOrder, OrderStatus, TimeInForce};
use crate::portfolio::Position;
use crate::types::{OrderSide, PositionSide};

#[derive(Debug, Serialize)]
pub struct OrderFillRow {
    pub client_order_id: ClientOrderId,
    pub venue_order_id: Option<VenueOrderId>,
    pub instrument_id: InstrumentId,
    pub strategy_id: StrategyId,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub quantity: Decimal,
    pub filled_qty: Decimal,
    pub avg_px: Option<f64>,
    pub commission: f64,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub ts_init: DateTime<Utc>,
    pub ts_last: DateTime<Utc>,
}

impl From<&MarketOrder> for OrderFillRow {
    fn from(order: &MarketOrder) -> Self {
        OrderFillRow {
            client_order_id: order.client_order_id.clone(),
            venue_order_id: order.venue_order_id.clone(),
            instrument_id: order.instrument_id.clone(),
            strategy_id: order.strategy_id.clone(),
            side: order.side,
            order_type: "MARKET",
            quantity: order.quantity,
            filled_qty: order.filled_qty,
            avg_px: order.avg_px,
            commission: order.commission,
            time_in_force: order.time_in_force,
            reduce_only: order.reduce_only,
            status: order.status,
            ts_init: order.ts_init,
            ts_last: order.ts_last,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PositionRow {
    pub position_id: PositionId,
    pub instrument_id: InstrumentId,
    pub strategy_id: StrategyId,
    pub opening_order_id: ClientOrderId,
    pub entry: OrderSide,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub peak_qty: Decimal,
    pub avg_px_open: f64,
    pub avg_px_close: Option<f64>,
    pub realized_pnl: f64,
    pub realized_return: f64,
    pub commissions: f64,
    pub ts_opened: DateTime<Utc>,
    pub ts_closed: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

impl From<&Position> for PositionRow {
    fn from(position: &Position) -> Self {
        PositionRow {
            position_id: position.id.clone(),
            instrument_id: position.instrument_id.clone(),
            strategy_id: position.strategy_id.clone(),
            opening_order_id: position.opening_order_id.clone(),
            entry: position.entry,
            side: position.side,
            quantity: position.quantity(),
            peak_qty: position.peak_qty,
            avg_px_open: position.avg_px_open,
            avg_px_close: position.avg_px_close,
            realized_pnl: position.realized_pnl,
            realized_return: position.realized_return,
            commissions: position.commissions,
            ts_opened: position.ts_opened,
            ts_closed: position.ts_closed,
            duration_secs: position
                .ts_closed
                .map(|closed| (closed - position.ts_opened).num_seconds()),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), rows)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write the three reports for one run and return their paths
pub fn write_reports(dir: &Path, label: &str, result: &BacktestResult) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create reports directory {}", dir.display()))?;

    let fills: Vec<OrderFillRow> = result
        .orders
        .iter()
        .filter(|o| o.status == OrderStatus::Filled)
        .map(OrderFillRow::from)
        .collect();
    let positions: Vec<PositionRow> = result.positions.iter().map(PositionRow::from).collect();

    let fills_path = dir.join(format!("order_fills_report_{}.json", label));
    let positions_path = dir.join(format!("positions_report_{}.json", label));
    let account_path = dir.join(format!("account_report_{}.json", label));

    write_json(&fills_path, &fills)?;
    write_json(&positions_path, &positions)?;
    write_json(&account_path, &result.account_states)?;

    info!(
        "Reports for {} written to {} ({} fills, {} positions, {} account states)",
        label,
        dir.display(),
        fills.len(),
        positions.len(),
        result.account_states.len()
    );

    Ok(vec![fills_path, positions_path, account_path])
}
