//! OpenAlgo adapter: a self-hosted broker gateway reached over JSON REST
//! with the api key in the request body.
//!
//! The gateway exposes no historical-candles endpoint, so history comes
//! back empty and indicator warmup happens from the live feed. The latest
//! candle is synthesized from the quote endpoint.

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::candle::Candle;
use crate::config::{now_ts, Config};
use crate::exchange::Exchange;
use crate::order::{Order, OrderStatus, OrderType, Side, TradeRequest};

pub struct OpenAlgo {
    client: Client,
    base: String,
    api_key: String,
    venue: String,
    order_product: String,
}

impl OpenAlgo {
    pub fn new(cfg: Config) -> Result<Self> {
        let api_key = cfg
            .openalgo_api_key
            .clone()
            .ok_or_else(|| anyhow!("missing OPENALGO_API_KEY"))?;
        Ok(Self {
            client: Client::new(),
            base: cfg.openalgo_base,
            api_key,
            venue: std::env::var("OPENALGO_EXCHANGE").unwrap_or_else(|_| "NSE".to_string()),
            order_product: std::env::var("OPENALGO_PRODUCT").unwrap_or_else(|_| "MIS".to_string()),
        })
    }

    fn map_status(status: &str) -> OrderStatus {
        match status.to_lowercase().as_str() {
            "complete" | "filled" => OrderStatus::Filled,
            "cancelled" | "canceled" | "rejected" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        }
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/api/v1/{}", self.base, endpoint);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let value: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            bail!("openalgo {} failed: {}", endpoint, value);
        }
        if value.get("status").and_then(|s| s.as_str()) == Some("error") {
            bail!(
                "openalgo {} error: {}",
                endpoint,
                value.get("message").and_then(|m| m.as_str()).unwrap_or("unknown")
            );
        }
        Ok(value)
    }

    async fn place_order(&self, req: &TradeRequest, side: Side) -> Result<Order> {
        let body = json!({
            "apikey": self.api_key,
            "strategy": "algoedge",
            "exchange": self.venue,
            "symbol": req.product,
            "action": side.as_str(),
            "product": self.order_product,
            "pricetype": "MARKET",
            "quantity": format!("{}", req.size),
        });
        let value = self.post("placeorder", body).await?;
        let order_id = value
            .get("orderid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("placeorder response missing orderid"))?
            .to_string();
        let ts = now_ts();
        Ok(Order {
            id: order_id,
            product: req.product.clone(),
            side,
            order_type: OrderType::Market,
            status: OrderStatus::Open, // confirmed by order status polling
            request_size: req.size,
            filled_size: 0.0,
            remaining_size: req.size,
            price: 0.0,
            funds: 0.0,
            fees: 0.0,
            create_ts: ts,
            update_ts: ts,
            stop: req.stop,
            profit: req.profit,
            position_id: req.position_id.clone(),
        })
    }
}

#[derive(Deserialize, Debug)]
struct QuoteData {
    #[serde(default)]
    open: f64,
    #[serde(default)]
    high: f64,
    #[serde(default)]
    low: f64,
    #[serde(default)]
    ltp: f64,
    #[serde(default)]
    volume: f64,
}

#[async_trait::async_trait]
impl Exchange for OpenAlgo {
    fn name(&self) -> &'static str {
        "openalgo"
    }

    async fn get_historic_candles(
        &self,
        _product: &str,
        _interval: u64,
        _start_ts: u64,
    ) -> Result<Vec<Candle>> {
        // no historical endpoint on the gateway
        Ok(Vec::new())
    }

    async fn fetch_latest_candle(&self, product: &str, interval: u64) -> Result<Candle> {
        let body = json!({
            "apikey": self.api_key,
            "symbol": product,
            "exchange": self.venue,
        });
        let value = self.post("quotes", body).await?;
        let data: QuoteData = serde_json::from_value(
            value.get("data").cloned().ok_or_else(|| anyhow!("quotes response missing data"))?,
        )?;
        if data.ltp <= 0.0 {
            bail!("quote without last traded price");
        }
        let now = now_ts();
        let ts = now - now % interval;
        Ok(Candle {
            ts,
            open: if data.open > 0.0 { data.open } else { data.ltp },
            high: if data.high > 0.0 { data.high } else { data.ltp },
            low: if data.low > 0.0 { data.low } else { data.ltp },
            close: data.ltp,
            volume: data.volume,
        })
    }

    async fn buy(&self, req: &TradeRequest) -> Result<Order> {
        self.place_order(req, Side::Buy).await
    }

    async fn sell(&self, req: &TradeRequest) -> Result<Order> {
        self.place_order(req, Side::Sell).await
    }

    async fn get_order(&self, product: &str, order_id: &str) -> Result<Order> {
        let body = json!({
            "apikey": self.api_key,
            "strategy": "algoedge",
            "orderid": order_id,
        });
        let value = self.post("orderstatus", body).await?;
        let data = value.get("data").cloned().unwrap_or_default();
        let status = data
            .get("order_status")
            .and_then(|s| s.as_str())
            .unwrap_or("open")
            .to_string();
        let qty = data
            .get("quantity")
            .and_then(|v| v.as_str().map(|s| s.parse().ok()).unwrap_or(v.as_f64()))
            .unwrap_or(0.0);
        let price = data
            .get("average_price")
            .or_else(|| data.get("price"))
            .and_then(|v| v.as_str().map(|s| s.parse().ok()).unwrap_or(v.as_f64()))
            .unwrap_or(0.0);
        let mapped = Self::map_status(&status);
        let filled = if mapped == OrderStatus::Filled { qty } else { 0.0 };
        let ts = now_ts();
        Ok(Order {
            id: order_id.to_string(),
            product: product.to_string(),
            side: Side::Buy, // caller overwrites from its own records
            order_type: OrderType::Market,
            status: mapped,
            request_size: qty,
            filled_size: filled,
            remaining_size: (qty - filled).max(0.0),
            price,
            funds: filled * price,
            fees: 0.0,
            create_ts: ts,
            update_ts: ts,
            stop: 0.0,
            profit: 0.0,
            position_id: None,
        })
    }

    async fn cancel_order(&self, _product: &str, order_id: &str) -> Result<()> {
        let body = json!({
            "apikey": self.api_key,
            "strategy": "algoedge",
            "orderid": order_id,
        });
        self.post("cancelorder", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_case_insensitive() {
        assert_eq!(OpenAlgo::map_status("COMPLETE"), OrderStatus::Filled);
        assert_eq!(OpenAlgo::map_status("complete"), OrderStatus::Filled);
        assert_eq!(OpenAlgo::map_status("Cancelled"), OrderStatus::Canceled);
        assert_eq!(OpenAlgo::map_status("rejected"), OrderStatus::Canceled);
        assert_eq!(OpenAlgo::map_status("trigger pending"), OrderStatus::Open);
    }

    #[test]
    fn quote_data_accepts_partial_payload() {
        let data: QuoteData = serde_json::from_str(r#"{"ltp": 19850.5}"#).unwrap();
        assert_eq!(data.ltp, 19_850.5);
        assert_eq!(data.volume, 0.0);
    }
}
