//! Exchange adapters.
//!
//! Brokers are reached through the [`Exchange`] trait; adapters normalize
//! broker responses into the common [`Order`] record with the simplified
//! `open | filled | canceled` status set. Anything else a broker reports is
//! translated in its adapter.

use anyhow::Result;
use async_trait::async_trait;

use crate::candle::Candle;
use crate::config::Config;
use crate::order::{Order, TradeRequest};

mod binance;
mod openalgo;
mod paper;
pub mod retry;
pub mod signing;

pub use binance::Binance;
pub use openalgo::OpenAlgo;
pub use paper::PaperTrader;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Binance,
    OpenAlgo,
    Paper,
}

impl ExchangeKind {
    pub fn from_env() -> Self {
        match std::env::var("EXCHANGE").unwrap_or_else(|_| "paper".to_string()).as_str() {
            "binance" => ExchangeKind::Binance,
            "openalgo" => ExchangeKind::OpenAlgo,
            _ => ExchangeKind::Paper,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::OpenAlgo => "openalgo",
            ExchangeKind::Paper => "papertrader",
        }
    }

    pub fn build(self, cfg: Config) -> Result<Box<dyn Exchange + Send + Sync>> {
        match self {
            ExchangeKind::Binance => Ok(Box::new(Binance::new(cfg)?)),
            ExchangeKind::OpenAlgo => Ok(Box::new(OpenAlgo::new(cfg)?)),
            ExchangeKind::Paper => Ok(Box::new(PaperTrader::new(cfg)?)),
        }
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candles from `start_ts` (exclusive of anything older) to now.
    async fn get_historic_candles(
        &self,
        product: &str,
        interval: u64,
        start_ts: u64,
    ) -> Result<Vec<Candle>>;

    async fn fetch_latest_candle(&self, product: &str, interval: u64) -> Result<Candle>;

    /// Place a buy order. The returned order may already be filled (market
    /// orders on instant venues) or still open.
    async fn buy(&self, req: &TradeRequest) -> Result<Order>;

    async fn sell(&self, req: &TradeRequest) -> Result<Order>;

    async fn get_order(&self, product: &str, order_id: &str) -> Result<Order>;

    async fn cancel_order(&self, product: &str, order_id: &str) -> Result<()>;
}

/// Kline interval name shared by the Binance REST and websocket APIs.
pub fn kline_interval(granularity: u64) -> &'static str {
    match granularity {
        60 => "1m",
        300 => "5m",
        900 => "15m",
        3600 => "1h",
        86_400 => "1d",
        _ => "1m",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_interval_mapping() {
        assert_eq!(kline_interval(60), "1m");
        assert_eq!(kline_interval(300), "5m");
        assert_eq!(kline_interval(3600), "1h");
        assert_eq!(kline_interval(7), "1m");
    }
}
