//! Binance kline websocket consumer.
//!
//! Subscribes to `<symbol>@kline_<interval>` and forwards every update as a
//! tick; when the exchange marks the kline closed (`k.x == true`) a candle
//! event follows. Reconnects with a fixed backoff on any stream error.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;

use crate::candle::Candle;
use crate::config::Config;
use crate::exchange::kline_interval;
use crate::feed::FeedEvent;
use crate::logging::{self, obj, v_str, Domain, Level};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct WsKlineMessage {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: u64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

impl WsKline {
    fn to_candle(&self) -> Option<Candle> {
        Some(Candle {
            ts: self.open_time / 1000,
            open: self.open.parse().ok()?,
            high: self.high.parse().ok()?,
            low: self.low.parse().ok()?,
            close: self.close.parse().ok()?,
            volume: self.volume.parse().ok()?,
        })
    }
}

/// Run the kline stream until the channel closes. Returns the task handle.
pub fn spawn_binance_kline_feed(cfg: &Config, tx: mpsc::Sender<FeedEvent>) -> JoinHandle<()> {
    let product = cfg.product.clone();
    let stream_url = format!(
        "{}/ws/{}@kline_{}",
        cfg.binance_ws_base,
        product.to_lowercase(),
        kline_interval(cfg.candle_interval)
    );
    tokio::spawn(async move {
        loop {
            match run_stream(&stream_url, &product, &tx).await {
                Ok(()) => break, // receiver dropped: session over
                Err(err) => {
                    logging::log(
                        Level::Warn,
                        Domain::Feed,
                        "stream_error",
                        obj(&[
                            ("product", v_str(&product)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    })
}

async fn run_stream(
    stream_url: &str,
    product: &str,
    tx: &mpsc::Sender<FeedEvent>,
) -> anyhow::Result<()> {
    let (ws, _) = connect_async(stream_url).await?;
    logging::log(
        Level::Info,
        Domain::Feed,
        "stream_connected",
        obj(&[("product", v_str(product)), ("url", v_str(stream_url))]),
    );
    let (_, mut read) = ws.split();

    while let Some(message) = read.next().await {
        let message = message?;
        if !message.is_text() {
            continue;
        }
        let text = message.into_text()?;
        let parsed: WsKlineMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if parsed.event_type != "kline" {
            continue;
        }
        let candle = match parsed.kline.to_candle() {
            Some(c) => c,
            None => continue,
        };
        let event = if parsed.kline.closed {
            FeedEvent::Candle { product: product.to_string(), candle }
        } else {
            FeedEvent::Tick {
                product: product.to_string(),
                ts: candle.ts,
                price: candle.close,
                size: 0.0,
            }
        };
        if tx.send(event).await.is_err() {
            return Ok(()); // loop shut down
        }
    }
    anyhow::bail!("kline stream ended")
}
