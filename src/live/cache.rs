//! SQLite cache for the live node
//!
//! Holds the strategy's tracking state, orders, fills and positions so a
//! restarted node resumes where it stopped. Rows keep the full record as JSON
//! next to a few indexed columns.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::identifiers::StrategyId;
use crate::orders::{Fill, MarketOrder};
use crate::portfolio::Position;

/// Strategy state snapshot with the order counter at save time
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySnapshot {
    pub state: serde_json::Value,
    pub order_count: u64,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct LiveCache {
    conn: Arc<Mutex<Connection>>,
    iso_timestamps: bool,
}

impl LiveCache {
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let cache = Self::open_path(&config.database_path, config.timestamps_as_iso8601)?;
        if config.flush_on_start {
            cache.flush()?;
        }
        Ok(cache)
    }

    pub fn open_path(db_path: &Path, iso_timestamps: bool) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL mode for concurrent readers
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let cache = LiveCache {
            conn: Arc::new(Mutex::new(conn)),
            iso_timestamps,
        };
        cache.create_tables()?;
        info!("Live cache opened at {}", db_path.display());
        Ok(cache)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("cache connection lock poisoned"))
    }

    fn timestamp(&self, ts: DateTime<Utc>) -> String {
        if self.iso_timestamps {
            ts.to_rfc3339()
        } else {
            ts.timestamp_nanos_opt().unwrap_or_default().to_string()
        }
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategy_state (
                strategy_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                order_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS orders (
                client_order_id TEXT PRIMARY KEY,
                instrument_id TEXT NOT NULL,
                status TEXT NOT NULL,
                ts_last TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fills (
                trade_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL,
                ts_event TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                instrument_id TEXT NOT NULL,
                is_open INTEGER NOT NULL,
                ts_opened TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(client_order_id);",
        )?;
        Ok(())
    }

    /// Delete every cached row
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "DELETE FROM strategy_state;
             DELETE FROM orders;
             DELETE FROM fills;
             DELETE FROM positions;",
        )?;
        info!("Live cache flushed");
        Ok(())
    }

    pub fn save_strategy_state(
        &self,
        strategy_id: &StrategyId,
        state: &serde_json::Value,
        order_count: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO strategy_state (strategy_id, state, order_count, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                strategy_id.as_str(),
                serde_json::to_string(state)?,
                order_count as i64,
                self.timestamp(now),
            ],
        )?;
        debug!("Saved state for {}", strategy_id);
        Ok(())
    }

    pub fn load_strategy_state(&self, strategy_id: &StrategyId) -> Result<Option<StrategySnapshot>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT state, order_count, updated_at FROM strategy_state WHERE strategy_id = ?1",
                params![strategy_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(state, order_count, updated_at)| -> Result<StrategySnapshot> {
            Ok(StrategySnapshot {
                state: serde_json::from_str(&state)?,
                order_count: order_count.max(0) as u64,
                updated_at,
            })
        })
        .transpose()
    }

    pub fn save_order(&self, order: &MarketOrder) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO orders (client_order_id, instrument_id, status, ts_last, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                order.client_order_id.as_str(),
                order.instrument_id.to_string(),
                format!("{:?}", order.status).to_uppercase(),
                self.timestamp(order.ts_last),
                serde_json::to_string(order)?,
            ],
        )?;
        Ok(())
    }

    pub fn load_orders(&self) -> Result<Vec<MarketOrder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM orders ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str::<MarketOrder>(data).map_err(anyhow::Error::from))
            .collect()
    }

    pub fn save_fill(&self, fill: &Fill) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO fills (trade_id, client_order_id, ts_event, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                fill.trade_id.as_str(),
                fill.client_order_id.as_str(),
                self.timestamp(fill.ts_event),
                serde_json::to_string(fill)?,
            ],
        )?;
        Ok(())
    }

    pub fn load_fills(&self) -> Result<Vec<Fill>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM fills ORDER BY ts_event, rowid")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str::<Fill>(data).map_err(anyhow::Error::from))
            .collect()
    }

    /// Closed cycles share the netting id, so rows are keyed by id and open time
    pub fn save_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn()?;
        let key = format!("{}@{}", position.id, position.ts_opened.timestamp_millis());
        conn.execute(
            "INSERT OR REPLACE INTO positions (position_id, instrument_id, is_open, ts_opened, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key,
                position.instrument_id.to_string(),
                position.is_open(),
                self.timestamp(position.ts_opened),
                serde_json::to_string(position)?,
            ],
        )?;
        Ok(())
    }

    pub fn load_positions(&self, open_only: bool) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let sql = if open_only {
            "SELECT data FROM positions WHERE is_open = 1 ORDER BY rowid"
        } else {
            "SELECT data FROM positions ORDER BY rowid"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str::<Position>(data).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{TradeId, TraderId, VenueOrderId};
    use crate::orders::{OrderFactory, TimeInForce};
    use crate::portfolio::{MarginAccount, Portfolio};
    use crate::types::OrderSide;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn temp_cache(name: &str, flush: bool) -> LiveCache {
        let path = std::env::temp_dir().join(format!("vwap_cache_{}_{}.db", name, std::process::id()));
        LiveCache::open(&CacheConfig {
            database_path: path,
            flush_on_start: flush,
            timestamps_as_iso8601: true,
        })
        .unwrap()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_strategy_state_round_trip_and_flush() {
        let cache = temp_cache("state", true);
        let id = StrategyId::new("VWAPMultiTimeframe-000");
        assert!(cache.load_strategy_state(&id).unwrap().is_none());

        let state = json!({"tracking": {"in_position": true}});
        cache.save_strategy_state(&id, &state, 7, ts()).unwrap();
        let snapshot = cache.load_strategy_state(&id).unwrap().unwrap();
        assert_eq!(snapshot.state, state);
        assert_eq!(snapshot.order_count, 7);
        assert_eq!(snapshot.updated_at, "2024-03-01T12:00:00+00:00");

        cache.flush().unwrap();
        assert!(cache.load_strategy_state(&id).unwrap().is_none());
    }

    #[test]
    fn test_orders_fills_positions() {
        let cache = temp_cache("records", true);
        let strategy_id = StrategyId::new("VWAPMultiTimeframe-000");
        let mut factory = OrderFactory::new(TraderId::new("VWAP-TRADER-001"), strategy_id);
        let instrument_id = "ADAUSDT-PERP.BINANCE".parse().unwrap();
        let mut order = factory.market(instrument_id, OrderSide::Buy, dec!(10), TimeInForce::Gtc, false, ts());
        order.submit(ts());

        let fill = Fill {
            client_order_id: order.client_order_id.clone(),
            venue_order_id: VenueOrderId::new("123"),
            trade_id: TradeId::new("T-1"),
            instrument_id: order.instrument_id.clone(),
            strategy_id: order.strategy_id.clone(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            price: 0.5,
            commission: 0.002,
            commission_currency: "USDT".to_string(),
            ts_event: ts(),
        };
        order.apply_fill(&fill);

        cache.save_order(&order).unwrap();
        cache.save_fill(&fill).unwrap();
        cache.save_fill(&fill).unwrap();

        let mut portfolio = Portfolio::new(MarginAccount::new("BINANCE-001", "USDT", 100.0, 10.0, ts()));
        for event in portfolio.apply_fill(&fill) {
            cache.save_position(event.position()).unwrap();
        }

        let orders = cache.load_orders().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].filled_qty, dec!(10));
        assert_eq!(cache.load_fills().unwrap().len(), 1);
        let open = cache.load_positions(true).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].signed_qty, dec!(10));
    }
}
