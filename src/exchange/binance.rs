//! Binance spot adapter: kline REST endpoints plus HMAC-signed order calls.

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::Deserialize;

use crate::candle::Candle;
use crate::config::Config;
use crate::exchange::signing::sign_binance;
use crate::exchange::{kline_interval, Exchange};
use crate::order::{Order, OrderStatus, OrderType, Side, TradeRequest};

pub struct Binance {
    client: Client,
    base: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl Binance {
    pub fn new(cfg: Config) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            base: cfg.binance_base,
            api_key: cfg.api_key,
            api_secret: cfg.api_secret,
        })
    }

    fn timestamp_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let key = self.api_key.as_deref().ok_or_else(|| anyhow!("missing API_KEY"))?;
        let secret = self.api_secret.as_deref().ok_or_else(|| anyhow!("missing API_SECRET"))?;
        Ok((key, secret))
    }

    fn parse_kline_row(row: &[serde_json::Value]) -> Option<Candle> {
        Some(Candle {
            ts: row.first()?.as_u64()? / 1000,
            open: row.get(1)?.as_str()?.parse().ok()?,
            high: row.get(2)?.as_str()?.parse().ok()?,
            low: row.get(3)?.as_str()?.parse().ok()?,
            close: row.get(4)?.as_str()?.parse().ok()?,
            volume: row.get(5)?.as_str()?.parse().ok()?,
        })
    }

    fn map_status(status: &str) -> OrderStatus {
        match status {
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "REJECTED" | "EXPIRED" => OrderStatus::Canceled,
            // NEW / PARTIALLY_FILLED / PENDING_CANCEL
            _ => OrderStatus::Open,
        }
    }

    async fn place_order(&self, req: &TradeRequest, side: Side) -> Result<Order> {
        let (api_key, api_secret) = self.credentials()?;
        let timestamp = Self::timestamp_ms();
        let query = format!(
            "symbol={}&side={}&type=MARKET&quantity={:.8}&timestamp={}&recvWindow=5000",
            req.product,
            side.as_str(),
            req.size,
            timestamp
        );
        let signature = sign_binance(&query, api_secret).map_err(|e| anyhow!(e))?;
        let url = format!("{}/api/v3/order?{}&signature={}", self.base, query, signature);

        let resp = self.client.post(&url).header("X-MBX-APIKEY", api_key).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let err: BinanceError = serde_json::from_str(&body)
                .unwrap_or(BinanceError { code: -1, msg: body.clone() });
            bail!("binance order failed: {} - {}", err.code, err.msg);
        }

        let placed: BinanceOrderResponse = serde_json::from_str(&body)?;
        let (fill_size, fill_cost, fees) = placed.fills.iter().fold(
            (0.0f64, 0.0f64, 0.0f64),
            |(q, c, f), fill| {
                let fq: f64 = fill.qty.parse().unwrap_or(0.0);
                let fp: f64 = fill.price.parse().unwrap_or(0.0);
                let fc: f64 = fill.commission.parse().unwrap_or(0.0);
                (q + fq, c + fq * fp, f + fc)
            },
        );
        let avg_price = if fill_size > 0.0 { fill_cost / fill_size } else { 0.0 };
        let request_size: f64 = placed.orig_qty.parse().unwrap_or(req.size);
        let ts = placed.transact_time / 1000;

        Ok(Order {
            id: placed.order_id.to_string(),
            product: placed.symbol,
            side,
            order_type: OrderType::Market,
            status: Self::map_status(&placed.status),
            request_size,
            filled_size: fill_size,
            remaining_size: (request_size - fill_size).max(0.0),
            price: avg_price,
            funds: fill_cost,
            fees,
            create_ts: ts,
            update_ts: ts,
            stop: req.stop,
            profit: req.profit,
            position_id: req.position_id.clone(),
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BinanceOrderResponse {
    symbol: String,
    order_id: u64,
    #[serde(default)]
    transact_time: u64,
    orig_qty: String,
    status: String,
    #[serde(default)]
    fills: Vec<BinanceFill>,
}

#[derive(Deserialize, Debug)]
struct BinanceFill {
    price: String,
    qty: String,
    commission: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BinanceOrderQuery {
    symbol: String,
    order_id: u64,
    status: String,
    orig_qty: String,
    executed_qty: String,
    cummulative_quote_qty: String,
    #[serde(default)]
    time: u64,
    #[serde(default)]
    update_time: u64,
}

#[derive(Deserialize, Debug)]
struct BinanceError {
    code: i64,
    msg: String,
}

#[async_trait::async_trait]
impl Exchange for Binance {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn get_historic_candles(
        &self,
        product: &str,
        interval: u64,
        start_ts: u64,
    ) -> Result<Vec<Candle>> {
        // no anchor: one request for the most recent window (the klines
        // endpoint returns the latest bars when startTime is omitted)
        if start_ts == 0 {
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit=1000",
                self.base,
                product,
                kline_interval(interval)
            );
            let resp = self.client.get(&url).send().await?;
            let data: Vec<Vec<serde_json::Value>> = resp.json().await?;
            return Ok(data.iter().filter_map(|row| Self::parse_kline_row(row)).collect());
        }

        let mut out: Vec<Candle> = Vec::new();
        let mut cursor_ms = start_ts * 1000;
        loop {
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit=1000&startTime={}",
                self.base,
                product,
                kline_interval(interval),
                cursor_ms
            );
            let resp = self.client.get(&url).send().await?;
            let data: Vec<Vec<serde_json::Value>> = resp.json().await?;
            let batch: Vec<Candle> =
                data.iter().filter_map(|row| Self::parse_kline_row(row)).collect();
            let done = batch.len() < 1000;
            if let Some(last) = batch.last() {
                cursor_ms = (last.ts + interval) * 1000;
            }
            out.extend(batch);
            if done {
                break;
            }
        }
        Ok(out)
    }

    async fn fetch_latest_candle(&self, product: &str, interval: u64) -> Result<Candle> {
        // limit=2: the last row is the in-progress candle, the one before it
        // is the last closed interval
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit=2",
            self.base,
            product,
            kline_interval(interval)
        );
        let resp = self.client.get(&url).send().await?;
        let data: Vec<Vec<serde_json::Value>> = resp.json().await?;
        let row = if data.len() > 1 {
            &data[data.len() - 2]
        } else {
            data.first().ok_or_else(|| anyhow!("empty kline response"))?
        };
        Self::parse_kline_row(row).ok_or_else(|| anyhow!("malformed kline row"))
    }

    async fn buy(&self, req: &TradeRequest) -> Result<Order> {
        self.place_order(req, Side::Buy).await
    }

    async fn sell(&self, req: &TradeRequest) -> Result<Order> {
        self.place_order(req, Side::Sell).await
    }

    async fn get_order(&self, product: &str, order_id: &str) -> Result<Order> {
        let (api_key, api_secret) = self.credentials()?;
        let query = format!(
            "symbol={}&orderId={}&timestamp={}&recvWindow=5000",
            product,
            order_id,
            Self::timestamp_ms()
        );
        let signature = sign_binance(&query, api_secret).map_err(|e| anyhow!(e))?;
        let url = format!("{}/api/v3/order?{}&signature={}", self.base, query, signature);
        let resp = self.client.get(&url).header("X-MBX-APIKEY", api_key).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            bail!("binance order query failed: {}", body);
        }
        let q: BinanceOrderQuery = serde_json::from_str(&body)?;
        let request_size: f64 = q.orig_qty.parse().unwrap_or(0.0);
        let filled: f64 = q.executed_qty.parse().unwrap_or(0.0);
        let quote: f64 = q.cummulative_quote_qty.parse().unwrap_or(0.0);
        let price = if filled > 0.0 { quote / filled } else { 0.0 };
        Ok(Order {
            id: q.order_id.to_string(),
            product: q.symbol,
            side: Side::Buy, // caller overwrites from its own records
            order_type: OrderType::Market,
            status: Self::map_status(&q.status),
            request_size,
            filled_size: filled,
            remaining_size: (request_size - filled).max(0.0),
            price,
            funds: quote,
            fees: 0.0,
            create_ts: q.time / 1000,
            update_ts: q.update_time / 1000,
            stop: 0.0,
            profit: 0.0,
            position_id: None,
        })
    }

    async fn cancel_order(&self, product: &str, order_id: &str) -> Result<()> {
        let (api_key, api_secret) = self.credentials()?;
        let query = format!(
            "symbol={}&orderId={}&timestamp={}&recvWindow=5000",
            product,
            order_id,
            Self::timestamp_ms()
        );
        let signature = sign_binance(&query, api_secret).map_err(|e| anyhow!(e))?;
        let url = format!("{}/api/v3/order?{}&signature={}", self.base, query, signature);
        let resp = self.client.delete(&url).header("X-MBX-APIKEY", api_key).send().await?;
        if !resp.status().is_success() {
            bail!("binance cancel failed: {}", resp.text().await?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_collapses_to_three() {
        assert_eq!(Binance::map_status("NEW"), OrderStatus::Open);
        assert_eq!(Binance::map_status("PARTIALLY_FILLED"), OrderStatus::Open);
        assert_eq!(Binance::map_status("FILLED"), OrderStatus::Filled);
        assert_eq!(Binance::map_status("CANCELED"), OrderStatus::Canceled);
        assert_eq!(Binance::map_status("REJECTED"), OrderStatus::Canceled);
        assert_eq!(Binance::map_status("EXPIRED"), OrderStatus::Canceled);
    }

    #[test]
    fn kline_row_parses() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"100.1","101.2","99.3","100.9","12.5",1700000299999,"0",0,"0","0","0"]"#,
        )
        .unwrap();
        let c = Binance::parse_kline_row(&row).unwrap();
        assert_eq!(c.ts, 1_700_000_000);
        assert_eq!(c.open, 100.1);
        assert_eq!(c.close, 100.9);
        assert_eq!(c.volume, 12.5);
    }

    #[test]
    fn order_response_aggregates_fills() {
        let body = r#"{
            "symbol":"BTCUSDT","orderId":42,"transactTime":1700000000500,
            "origQty":"0.002","status":"FILLED",
            "fills":[
                {"price":"50000.0","qty":"0.001","commission":"0.05","commissionAsset":"USDT"},
                {"price":"50010.0","qty":"0.001","commission":"0.05","commissionAsset":"USDT"}
            ]
        }"#;
        let placed: BinanceOrderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(placed.order_id, 42);
        assert_eq!(placed.fills.len(), 2);
    }
}
