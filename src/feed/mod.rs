//! Live market data feeds.
//!
//! Feed tasks push [`FeedEvent`]s into a tokio mpsc channel; the trading
//! loop drains it. When no feed is available the loop falls back to REST
//! polling at candle boundaries.

mod binance_ws;

pub use binance_ws::spawn_binance_kline_feed;

use crate::candle::Candle;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A closed interval candle.
    Candle { product: String, candle: Candle },
    /// An intra-interval price update.
    Tick { product: String, ts: u64, price: f64, size: f64 },
}
