//! Paper-trading simulator.
//!
//! Candles come from an OHLC CSV dataset
//! (`{PAPER_DATA_DIR}/{PRODUCT}.csv`, columns
//! `timestamp,open,high,low,close,volume`) or, when no file exists, from a
//! generated random walk. The first slice of the dataset is served as
//! history for indicator warmup; `fetch_latest_candle` then replays the
//! remainder one bar per call. Orders fill instantly at the current market
//! rate with a taker fee and optional adverse slippage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use serde::Deserialize;

use crate::candle::Candle;
use crate::config::Config;
use crate::exchange::Exchange;
use crate::order::{Order, OrderStatus, OrderType, Side, TradeRequest};

/// Bars handed out as history before live replay starts.
const HISTORY_SPLIT: usize = 200;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: f64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

struct PaperState {
    candles: Vec<Candle>,
    cursor: usize,
    rate: f64,
    seq: u64,
    orders: HashMap<String, Order>,
}

pub struct PaperTrader {
    product: String,
    fee_rate: f64,
    slippage: f64,
    state: Mutex<PaperState>,
}

impl PaperTrader {
    pub fn new(cfg: Config) -> Result<Self> {
        let csv_path = Path::new(&cfg.paper_data_dir).join(format!("{}.csv", cfg.product));
        let candles = if csv_path.exists() {
            Self::load_csv(&csv_path)?
        } else {
            Self::random_walk(
                cfg.paper_random_candles,
                Self::start_price_for(&cfg.product, cfg.paper_start_price),
                cfg.candle_interval,
            )
        };
        if candles.is_empty() {
            bail!("paper dataset is empty: {}", csv_path.display());
        }
        Ok(Self::from_candles(cfg, candles))
    }

    /// Build directly from a candle series; used by backtests and tests.
    pub fn from_candles(cfg: Config, candles: Vec<Candle>) -> Self {
        let rate = candles.first().map(|c| c.close).unwrap_or(0.0);
        Self {
            product: cfg.product,
            fee_rate: cfg.paper_fee_rate,
            slippage: cfg.paper_slippage,
            state: Mutex::new(PaperState {
                candles,
                cursor: 0,
                rate,
                seq: 0,
                orders: HashMap::new(),
            }),
        }
    }

    fn load_csv(path: &Path) -> Result<Vec<Candle>> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let mut out = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            // tolerate the occasional bad row in hand-assembled datasets
            let row = match row {
                Ok(r) => r,
                Err(_) => continue,
            };
            out.push(Candle {
                ts: row.timestamp as u64,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        Ok(out)
    }

    fn start_price_for(product: &str, fallback: f64) -> f64 {
        let upper = product.to_uppercase();
        if upper.contains("BANK") {
            44_500.0
        } else if upper.contains("NIFTY") {
            19_500.0
        } else if upper.contains("BTC") {
            50_000.0
        } else if upper.contains("ETH") {
            3_000.0
        } else {
            fallback
        }
    }

    fn random_walk(num_candles: usize, start_price: f64, interval: u64) -> Vec<Candle> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(num_candles);
        let mut price = start_price;
        let start_ts =
            crate::config::now_ts().saturating_sub(num_candles as u64 * interval);
        for i in 0..num_candles {
            let volatility: f64 = rng.gen_range(0.001..0.015);
            let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            let open = price;
            let close = price + price * volatility * direction;
            let high_offset: f64 = rng.gen_range(0.0005..volatility * 1.5);
            let low_offset: f64 = rng.gen_range(0.0005..volatility * 1.2);
            out.push(Candle {
                ts: start_ts + i as u64 * interval,
                open,
                high: open.max(close) * (1.0 + high_offset),
                low: open.min(close) * (1.0 - low_offset),
                close,
                volume: rng.gen_range(1_000.0..5_000.0),
            });
            price = close;
        }
        out
    }

    /// Pin the rate fills execute at. Backtests call this per bar; the live
    /// paper loop advances it through `fetch_latest_candle` instead.
    pub fn set_market_rate(&self, rate: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.rate = rate;
        }
    }

    fn fill_order(&self, req: &TradeRequest, side: Side) -> Result<Order> {
        let mut state = self.state.lock().map_err(|_| anyhow!("paper state poisoned"))?;
        let rate = if state.rate > 0.0 {
            state.rate
        } else if req.price > 0.0 {
            req.price
        } else {
            bail!("no market rate for paper fill");
        };
        // slippage works against the taker on both sides
        let price = match side {
            Side::Buy => rate * (1.0 + self.slippage),
            Side::Sell => rate * (1.0 - self.slippage),
        };
        state.seq += 1;
        let id = format!("paper-{}-{}", side.as_str().to_lowercase(), state.seq);
        let funds = req.size * price;
        let ts = state
            .candles
            .get(state.cursor.saturating_sub(1))
            .map(|c| c.ts)
            .unwrap_or_else(crate::config::now_ts);
        let order = Order {
            id: id.clone(),
            product: req.product.clone(),
            side,
            order_type: req.order_type,
            status: OrderStatus::Filled,
            request_size: req.size,
            filled_size: req.size,
            remaining_size: 0.0,
            price,
            funds,
            fees: funds * self.fee_rate,
            create_ts: ts,
            update_ts: ts,
            stop: req.stop,
            profit: req.profit,
            position_id: req.position_id.clone(),
        };
        state.orders.insert(id, order.clone());
        Ok(order)
    }
}

#[async_trait::async_trait]
impl Exchange for PaperTrader {
    fn name(&self) -> &'static str {
        "papertrader"
    }

    async fn get_historic_candles(
        &self,
        _product: &str,
        _interval: u64,
        start_ts: u64,
    ) -> Result<Vec<Candle>> {
        let mut state = self.state.lock().map_err(|_| anyhow!("paper state poisoned"))?;
        let split = HISTORY_SPLIT.min(state.candles.len().saturating_sub(1));
        state.cursor = split;
        if let Some(last) = state.candles[..split].last() {
            state.rate = last.close;
        }
        Ok(state.candles[..split].iter().filter(|c| c.ts > start_ts).copied().collect())
    }

    async fn fetch_latest_candle(&self, _product: &str, _interval: u64) -> Result<Candle> {
        let mut state = self.state.lock().map_err(|_| anyhow!("paper state poisoned"))?;
        if state.cursor >= state.candles.len() {
            bail!("paper dataset exhausted");
        }
        let candle = state.candles[state.cursor];
        state.cursor += 1;
        state.rate = candle.close;
        Ok(candle)
    }

    async fn buy(&self, req: &TradeRequest) -> Result<Order> {
        self.fill_order(req, Side::Buy)
    }

    async fn sell(&self, req: &TradeRequest) -> Result<Order> {
        self.fill_order(req, Side::Sell)
    }

    async fn get_order(&self, _product: &str, order_id: &str) -> Result<Order> {
        let state = self.state.lock().map_err(|_| anyhow!("paper state poisoned"))?;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown paper order {}", order_id))
    }

    async fn cancel_order(&self, _product: &str, _order_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.product = "TESTUSDT".to_string();
        cfg.paper_fee_rate = 0.001;
        cfg
    }

    fn series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts: 1_000 + i as u64 * 300,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + i as f64 * 0.1,
                volume: 10.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn history_then_replay() {
        let paper = PaperTrader::from_candles(cfg(), series(300));
        let hist = paper.get_historic_candles("TESTUSDT", 300, 0).await.unwrap();
        assert_eq!(hist.len(), 200);
        let first_live = paper.fetch_latest_candle("TESTUSDT", 300).await.unwrap();
        assert_eq!(first_live.ts, hist.last().unwrap().ts + 300);
    }

    #[tokio::test]
    async fn dataset_exhaustion_errors() {
        let paper = PaperTrader::from_candles(cfg(), series(3));
        for _ in 0..3 {
            paper.fetch_latest_candle("TESTUSDT", 300).await.unwrap();
        }
        assert!(paper.fetch_latest_candle("TESTUSDT", 300).await.is_err());
    }

    #[tokio::test]
    async fn instant_fill_at_market_rate_with_fee() {
        let paper = PaperTrader::from_candles(cfg(), series(10));
        paper.fetch_latest_candle("TESTUSDT", 300).await.unwrap();
        let req = TradeRequest {
            product: "TESTUSDT".to_string(),
            side: Side::Buy,
            size: 2.0,
            fund: 200.0,
            order_type: OrderType::Market,
            price: 0.0,
            stop: 95.0,
            profit: 110.0,
            position_id: None,
        };
        let order = paper.buy(&req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.price, 100.0);
        assert!((order.fees - 0.2).abs() < 1e-9);
        assert_eq!(order.stop, 95.0);
        // retrievable afterwards
        let looked_up = paper.get_order("TESTUSDT", &order.id).await.unwrap();
        assert_eq!(looked_up.price, order.price);
    }

    #[tokio::test]
    async fn slippage_moves_fills_against_the_taker() {
        let mut c = cfg();
        c.paper_slippage = 0.001;
        let paper = PaperTrader::from_candles(c, series(10));
        paper.fetch_latest_candle("TESTUSDT", 300).await.unwrap(); // rate 100.0
        let req = TradeRequest {
            product: "TESTUSDT".to_string(),
            side: Side::Buy,
            size: 1.0,
            fund: 100.0,
            order_type: OrderType::Market,
            price: 0.0,
            stop: 0.0,
            profit: 0.0,
            position_id: None,
        };
        let buy = paper.buy(&req).await.unwrap();
        assert!((buy.price - 100.1).abs() < 1e-9, "buys pay up");
        let sell = paper.sell(&req).await.unwrap();
        assert!((sell.price - 99.9).abs() < 1e-9, "sells give up");
    }

    #[test]
    fn random_walk_shape() {
        let candles = PaperTrader::random_walk(50, 1_000.0, 300);
        assert_eq!(candles.len(), 50);
        for c in &candles {
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
            assert!(c.volume >= 1_000.0);
        }
    }

    #[test]
    fn csv_loading_skips_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TESTUSDT.csv");
        std::fs::write(
            &path,
            "timestamp,open,high,low,close,volume\n\
             1000,100,101,99,100.5,12\n\
             garbage,x,y,z,w,v\n\
             1300,100.5,102,100,101.5,9\n",
        )
        .unwrap();
        let candles = PaperTrader::load_csv(&path).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 101.5);
    }
}
