//! Embedded SQLite persistence: candles, orders, closed positions and
//! periodic metrics snapshots.
//!
//! All writes happen from the trading loop on the lazy-commit interval;
//! callers log failures and keep trading rather than aborting the tick.

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::candle::Candle;
use crate::metrics::TradeStats;
use crate::order::Order;
use crate::position::Position;

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS candles (
                product TEXT NOT NULL,
                ts INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (product, ts)
            );
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                product TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                request_size REAL NOT NULL,
                filled_size REAL NOT NULL,
                price REAL NOT NULL,
                funds REAL NOT NULL,
                fees REAL NOT NULL,
                create_ts INTEGER NOT NULL,
                update_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                product TEXT NOT NULL,
                status TEXT NOT NULL,
                buy_order_id TEXT NOT NULL,
                sell_order_id TEXT,
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL,
                profit REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                open_ts INTEGER NOT NULL,
                close_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS metrics (
                ts INTEGER NOT NULL,
                product TEXT NOT NULL,
                fund_value REAL NOT NULL,
                asset_size REAL NOT NULL,
                realized_profit REAL NOT NULL,
                unrealized_profit REAL NOT NULL,
                equity REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                num_success_trade INTEGER NOT NULL,
                num_failed_trade INTEGER NOT NULL,
                num_stop_loss_hit INTEGER NOT NULL,
                num_take_profit_hit INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn save_candle(&mut self, product: &str, candle: &Candle) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO candles (product, ts, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                product,
                candle.ts as i64,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            ],
        )?;
        Ok(())
    }

    pub fn save_candles(&mut self, product: &str, candles: &[Candle]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for candle in candles {
            tx.execute(
                "INSERT OR REPLACE INTO candles (product, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    product,
                    candle.ts as i64,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Oldest-first candle history for restart warmup.
    pub fn load_candles(&mut self, product: &str, limit: usize) -> Result<Vec<Candle>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, open, high, low, close, volume FROM
             (SELECT * FROM candles WHERE product = ?1 ORDER BY ts DESC LIMIT ?2)
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![product, limit as i64], |row| {
            Ok(Candle {
                ts: row.get::<_, i64>(0)? as u64,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn save_order(&mut self, order: &Order) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO orders
             (id, product, side, order_type, status, request_size, filled_size,
              price, funds, fees, create_ts, update_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order.id,
                order.product,
                order.side.as_str(),
                order.order_type.as_str(),
                order.status.as_str(),
                order.request_size,
                order.filled_size,
                order.price,
                order.funds,
                order.fees,
                order.create_ts as i64,
                order.update_ts as i64
            ],
        )?;
        Ok(())
    }

    pub fn save_positions(&mut self, product: &str, positions: &[Position]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for pos in positions {
            let status = match pos.status {
                crate::position::PositionStatus::Open => "open",
                crate::position::PositionStatus::ClosePending => "close_pending",
                crate::position::PositionStatus::Closed => "closed",
            };
            tx.execute(
                "INSERT OR REPLACE INTO positions
                 (id, product, status, buy_order_id, sell_order_id, size, entry_price,
                  exit_price, profit, stop_loss, take_profit, open_ts, close_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    pos.id,
                    product,
                    status,
                    pos.buy.id,
                    pos.sell.as_ref().map(|s| s.id.clone()),
                    pos.size(),
                    pos.buy.price,
                    pos.sell.as_ref().map(|s| s.price),
                    pos.profit,
                    pos.stop_loss,
                    pos.take_profit,
                    pos.open_ts as i64,
                    pos.close_ts as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn persist_metrics(
        &mut self,
        ts: u64,
        product: &str,
        fund_value: f64,
        asset_size: f64,
        realized_profit: f64,
        unrealized_profit: f64,
        equity: f64,
        max_drawdown: f64,
        stats: &TradeStats,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metrics
             (ts, product, fund_value, asset_size, realized_profit, unrealized_profit,
              equity, max_drawdown, num_success_trade, num_failed_trade,
              num_stop_loss_hit, num_take_profit_hit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                ts as i64,
                product,
                fund_value,
                asset_size,
                realized_profit,
                unrealized_profit,
                equity,
                max_drawdown,
                stats.num_success_trade as i64,
                stats.num_failed_trade as i64,
                stats.num_stop_loss_hit as i64,
                stats.num_take_profit_hit as i64
            ],
        )?;
        Ok(())
    }
}
