//! Per-market trading engine.
//!
//! Owns the candle/indicator history, the strategy, the position book and
//! the fund/asset accounting for one product. The loop feeds it ticks and
//! closed candles; it answers with trade requests, which
//! [`Market::execute_requests`] runs through the risk gate, the WAL and the
//! circuit breaker before they reach the exchange adapter. Broker order
//! updates come back through [`Market::order_status_update`], which drives
//! position open/close transitions and P&L.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::json;

use crate::book::{BookEvent, PositionBook};
use crate::candle::{Candle, CandleBuilder};
use crate::config::{Config, StopLossKind, TakeProfitKind};
use crate::exchange::retry::{retry_async, RetryConfig};
use crate::exchange::Exchange;
use crate::indicators::{IndicatorEngine, IndicatorKind, IndicatorSpec};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::metrics::{MetricsEngine, TradeStats};
use crate::order::{Order, OrderEvent, OrderTracker, OrderType, Side, TradeRequest};
use crate::reliability::circuit::CircuitBreaker;
use crate::reliability::wal::{SnapshotData, Wal, WalEntry};
use crate::risk::RiskManager;
use crate::strategy::{Frame, Signal, Strategy};

fn round4(x: f64) -> f64 {
    (x * 1e4).round() / 1e4
}

fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}

/// What a tick produced: possibly a closed candle to process, and sell
/// requests from take-profit targets hit intra-candle.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub closed_candle: Option<Candle>,
    pub requests: Vec<TradeRequest>,
}

pub struct Market {
    cfg: Config,
    pub product: String,
    pub fund: crate::position::Fund,
    pub asset: crate::position::Asset,
    pub book: PositionBook,
    pub stats: TradeStats,
    pub metrics: MetricsEngine,
    pub paused_buy: bool,
    pub paused_sell: bool,

    candles: Vec<Candle>,
    frames: Vec<Frame>,
    indicator_engine: IndicatorEngine,
    strategy: Box<dyn Strategy>,
    builder: CandleBuilder,
    tracker: OrderTracker,
    current_rate: f64,
    start_rate: f64,
    intent_seq: u64,
    intent_by_order: HashMap<String, String>,
}

impl Market {
    pub fn new(cfg: Config, strategy: Box<dyn Strategy>) -> Self {
        let mut specs = strategy.required_indicators();
        if let StopLossKind::Atr(period) = cfg.stop_loss_kind {
            specs.push(IndicatorSpec::new(IndicatorKind::Atr, period));
        }
        let mut fund = crate::position::Fund {
            max_liquidity: cfg.fund_max_liquidity,
            max_per_buy_value: cfg.fund_max_per_buy_value,
            maker_fee_rate: cfg.maker_fee,
            taker_fee_rate: cfg.taker_fee,
            ..Default::default()
        };
        fund.set_initial_value(cfg.initial_fund);
        let mut asset = crate::position::Asset {
            max_per_trade_size: cfg.asset_max_per_trade_size,
            min_per_trade_size: cfg.asset_min_per_trade_size,
            ..Default::default()
        };
        asset.set_initial_size(0.0);
        Self {
            product: cfg.product.clone(),
            fund,
            asset,
            book: PositionBook::new(),
            stats: TradeStats::default(),
            metrics: MetricsEngine::new(),
            paused_buy: false,
            paused_sell: false,
            candles: Vec::new(),
            frames: Vec::new(),
            indicator_engine: IndicatorEngine::new(specs),
            strategy,
            builder: CandleBuilder::new(cfg.candle_interval),
            tracker: OrderTracker::new(),
            current_rate: 0.0,
            start_rate: 0.0,
            intent_seq: 0,
            intent_by_order: HashMap::new(),
            cfg,
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.current_rate
    }

    pub fn candle_count(&self) -> usize {
        self.candles.len()
    }

    pub fn last_candle_ts(&self) -> u64 {
        self.candles.last().map(|c| c.ts).unwrap_or(0)
    }

    pub fn equity(&self) -> f64 {
        self.fund.equity()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Buy-and-hold benchmark over the session, for the summary log.
    pub fn hold_profit(&self) -> f64 {
        if self.start_rate <= 0.0 {
            return 0.0;
        }
        let hold_size = self.fund.initial_value * (self.cfg.fund_max_liquidity
            / self.fund.initial_value.max(1.0))
            / self.start_rate;
        (self.current_rate - self.start_rate) * hold_size
    }

    pub fn pause_trading(&mut self, buy_pause: bool, sell_pause: bool) {
        logging::log(
            Level::Info,
            Domain::Market,
            "pause_trading",
            obj(&[
                ("product", v_str(&self.product)),
                ("buy_pause", json!(buy_pause)),
                ("sell_pause", json!(sell_pause)),
            ]),
        );
        self.paused_buy = buy_pause;
        self.paused_sell = sell_pause;
    }

    // -- setup --------------------------------------------------------------

    /// Warm the candle/indicator history: local store first, then the
    /// exchange from the last stored bar forward.
    pub async fn setup(
        &mut self,
        exchange: &(dyn Exchange + Send + Sync),
        store: Option<&mut crate::storage::StateStore>,
    ) -> Result<()> {
        let mut imported: Vec<Candle> = Vec::new();
        let mut store = store;
        if let Some(store) = store.as_deref_mut() {
            match store.load_candles(&self.product, self.cfg.history_window) {
                Ok(local) => imported.extend(local),
                Err(err) => logging::log(
                    Level::Warn,
                    Domain::Store,
                    "candle_load_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                ),
            }
        }
        let last_ts = imported.last().map(|c| c.ts).unwrap_or(0);
        let fresh = exchange
            .get_historic_candles(&self.product, self.cfg.candle_interval, last_ts)
            .await?;
        // the last stored candle may have been written mid-interval
        if !fresh.is_empty() {
            if let Some(last) = imported.last() {
                if fresh.first().map(|c| c.ts <= last.ts).unwrap_or(false) {
                    imported.pop();
                }
            }
        }
        let fresh_start = imported.len();
        imported.extend(fresh);
        if let Some(store) = store.as_deref_mut() {
            if imported.len() > fresh_start {
                if let Err(err) = store.save_candles(&self.product, &imported[fresh_start..]) {
                    logging::log(
                        Level::Warn,
                        Domain::Store,
                        "candle_save_failed",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }

        for candle in imported {
            if candle.is_flat() {
                continue;
            }
            self.push_frame(candle);
        }
        if let Some(last) = self.candles.last() {
            self.current_rate = last.close;
            self.start_rate = last.close;
        }
        logging::log(
            Level::Info,
            Domain::Market,
            "setup_complete",
            obj(&[
                ("product", v_str(&self.product)),
                ("candles", v_num(self.candles.len() as f64)),
                ("rate", v_num(self.current_rate)),
            ]),
        );
        Ok(())
    }

    /// Restore fund/asset state from a WAL snapshot after a restart.
    pub fn apply_recovery(&mut self, snap: &SnapshotData) {
        self.fund.current_value = snap.fund_value;
        self.asset.current_size = snap.asset_size;
        self.fund.realized_profit = snap.realized_profit;
        logging::log(
            Level::Info,
            Domain::System,
            "wal_recovered",
            obj(&[
                ("product", v_str(&self.product)),
                ("fund_value", v_num(snap.fund_value)),
                ("asset_size", v_num(snap.asset_size)),
                ("realized_profit", v_num(snap.realized_profit)),
                ("snapshot_ts", json!(snap.ts)),
            ]),
        );
    }

    fn push_frame(&mut self, candle: Candle) {
        self.candles.push(candle);
        let row = self.indicator_engine.calculate(&self.candles);
        self.frames.push(Frame { candle, indicators: row });
        // bound memory in long sessions, keeping plenty for indicator warmup
        let keep = self.cfg.history_window.max(self.strategy.warmup() + 100);
        if self.candles.len() > keep * 2 {
            self.candles.drain(..self.candles.len() - keep);
            self.frames.drain(..self.frames.len() - keep);
        }
    }

    // -- tick / candle processing -------------------------------------------

    /// Intra-candle price update. Take-profit targets are checked on every
    /// tick (aggressive, not waiting for candle close); stop losses are
    /// assessed on candle close only.
    pub fn on_tick(&mut self, ts: u64, price: f64, size: f64) -> TickOutcome {
        if price <= 0.0 {
            logging::log(
                Level::Error,
                Domain::Feed,
                "invalid_tick",
                obj(&[("product", v_str(&self.product)), ("price", v_num(price))]),
            );
            return TickOutcome::default();
        }
        self.current_rate = price;
        let closed_candle = self.builder.on_tick(ts, price, size);

        let mut requests = Vec::new();
        if !self.paused_sell && self.cfg.take_profit_enabled {
            let hits = self.book.take_profit_hits(price);
            self.stats.num_take_profit_hit += hits.len() as u64;
            requests.extend(self.close_requests_for(hits));
        }
        // stop-type requests trigger off raw ticks too
        requests.extend(self.triggered_stop_requests(price));

        self.refresh_mark_to_market();
        TickOutcome { closed_candle, requests }
    }

    /// A closed candle: extend history, ratchet trailing stops, check SL/TP
    /// ladders, then run the strategy and turn its signal into requests.
    pub fn on_candle(&mut self, candle: Candle) -> Vec<TradeRequest> {
        if candle.is_flat() {
            // market closed (off-hours feed); skip the bar entirely
            return Vec::new();
        }
        if let Some(last) = self.candles.last() {
            // tick aggregation and explicit feed candles can both close the
            // same interval; history stays strictly monotonic
            if candle.ts <= last.ts {
                return Vec::new();
            }
        }
        logging::log_candle(
            &self.product,
            candle.ts,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume,
        );
        logging::agg_increment("candle");
        self.push_frame(candle);
        self.current_rate = candle.close;
        if self.start_rate <= 0.0 {
            self.start_rate = candle.close;
        }

        if self.cfg.stop_loss_enabled && self.cfg.stop_loss_kind.is_trailing() {
            if let Some(new_stop) = self.trailing_stop_candidate() {
                let moved = self.book.raise_stops(new_stop);
                if moved > 0 {
                    logging::log(
                        Level::Debug,
                        Domain::Book,
                        "trailing_stop_raised",
                        obj(&[
                            ("product", v_str(&self.product)),
                            ("new_stop", v_num(new_stop)),
                            ("positions", v_num(moved as f64)),
                        ]),
                    );
                }
            }
        }

        let signal = if self.frames.len() >= self.strategy.warmup() {
            self.strategy.generate_signal(&self.frames)
        } else {
            Signal::hold()
        };
        if !signal.is_hold() {
            logging::log_signal(
                self.strategy.name(),
                &self.product,
                signal.strength,
                signal.stop,
                signal.profit,
            );
        }
        let mut requests = self.generate_trade_requests(signal);
        requests.extend(self.triggered_stop_requests(self.current_rate));
        self.refresh_mark_to_market();
        requests
    }

    fn trailing_stop_candidate(&self) -> Option<f64> {
        match self.cfg.stop_loss_kind {
            StopLossKind::Trailing => {
                Some(round4(self.current_rate * (1.0 - self.cfg.stop_loss_rate * 0.01)))
            }
            StopLossKind::Atr(period) => {
                let atr = self
                    .frames
                    .last()?
                    .indicators
                    .get(&IndicatorSpec::new(IndicatorKind::Atr, period))
                    .copied()?;
                if atr > 0.0 {
                    Some(round4(self.current_rate - 2.0 * atr))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn stop_price_for(&self, entry_rate: f64, strategy_stop: f64) -> f64 {
        if !self.cfg.stop_loss_enabled {
            return 0.0;
        }
        match self.cfg.stop_loss_kind {
            StopLossKind::Simple | StopLossKind::Trailing => {
                round4(entry_rate * (1.0 - self.cfg.stop_loss_rate * 0.01))
            }
            StopLossKind::Atr(period) => {
                let atr = self
                    .frames
                    .last()
                    .and_then(|f| {
                        f.indicators.get(&IndicatorSpec::new(IndicatorKind::Atr, period))
                    })
                    .copied()
                    .unwrap_or(0.0);
                if atr > 0.0 {
                    round4(entry_rate - 2.0 * atr)
                } else {
                    0.0
                }
            }
            StopLossKind::Strategy => {
                if strategy_stop <= 0.0 {
                    logging::log(
                        Level::Error,
                        Domain::Book,
                        "invalid_strategy_stop",
                        obj(&[("product", v_str(&self.product))]),
                    );
                }
                strategy_stop.max(0.0)
            }
        }
    }

    fn take_profit_price_for(&self, entry_rate: f64, strategy_tp: f64) -> f64 {
        if !self.cfg.take_profit_enabled {
            return 0.0;
        }
        match self.cfg.take_profit_kind {
            TakeProfitKind::Simple => {
                round4(entry_rate * (1.0 + self.cfg.take_profit_rate * 0.01))
            }
            TakeProfitKind::Strategy => {
                if strategy_tp <= 0.0 {
                    logging::log(
                        Level::Error,
                        Domain::Book,
                        "invalid_strategy_take_profit",
                        obj(&[("product", v_str(&self.product))]),
                    );
                }
                strategy_tp.max(0.0)
            }
        }
    }

    // -- signal consumption --------------------------------------------------

    /// Sell requests for positions pulled off the ladders or selected for a
    /// signal-driven close.
    fn close_requests_for(&mut self, position_ids: Vec<String>) -> Vec<TradeRequest> {
        let mut reqs = Vec::new();
        for id in position_ids {
            let size = match self.book.position(&id) {
                Some(pos) => pos.size(),
                None => continue,
            };
            if size <= 0.0 {
                logging::log(
                    Level::Error,
                    Domain::Book,
                    "empty_position_close",
                    obj(&[("position_id", v_str(&id))]),
                );
                self.book.close_failed(&id);
                continue;
            }
            if self.asset.take_for_sell(size) == 0.0 {
                logging::log(
                    Level::Error,
                    Domain::Book,
                    "asset_hold_failed",
                    obj(&[("position_id", v_str(&id)), ("size", v_num(size))]),
                );
                self.book.close_failed(&id);
                continue;
            }
            reqs.push(TradeRequest {
                product: self.product.clone(),
                side: Side::Sell,
                size: round8(size),
                fund: 0.0,
                order_type: OrderType::Market,
                price: 0.0,
                stop: 0.0,
                profit: 0.0,
                position_id: Some(id),
            });
        }
        reqs
    }

    fn triggered_stop_requests(&mut self, rate: f64) -> Vec<TradeRequest> {
        self.book
            .take_triggered_stop_reqs(rate)
            .into_iter()
            .map(|mut req| {
                req.order_type = OrderType::Market;
                req
            })
            .collect()
    }

    /// Turn a signal into trade requests: ladder hits first, then one buy
    /// slice (or one position close) per unit of signal strength.
    pub fn generate_trade_requests(&mut self, signal: Signal) -> Vec<TradeRequest> {
        let rate = self.current_rate;
        let mut reqs = Vec::new();

        if !self.paused_sell && self.cfg.stop_loss_enabled {
            let hits = self.book.stop_loss_hits(rate);
            self.stats.num_stop_loss_hit += hits.len() as u64;
            reqs.extend(self.close_requests_for(hits));
        }
        if !self.paused_sell && self.cfg.take_profit_enabled {
            let hits = self.book.take_profit_hits(rate);
            self.stats.num_take_profit_hit += hits.len() as u64;
            reqs.extend(self.close_requests_for(hits));
        }

        if self.paused_sell && signal.strength < 0 {
            logging::log(
                Level::Info,
                Domain::Market,
                "signal_ignored",
                obj(&[("product", v_str(&self.product)), ("reason", v_str("sell_paused"))]),
            );
            return reqs;
        }
        if self.paused_buy && signal.strength > 0 {
            logging::log(
                Level::Info,
                Domain::Market,
                "signal_ignored",
                obj(&[("product", v_str(&self.product)), ("reason", v_str("buy_paused"))]),
            );
            return reqs;
        }

        for _ in 0..signal.strength.unsigned_abs() {
            if signal.strength > 0 {
                self.stats.num_buy_req += 1;
                let fund = self.fund.take_for_buy(1);
                if fund <= 0.0 {
                    self.stats.num_buy_req_reject += 1;
                    logging::log_risk_check("fund_liquidity", "fail", fund, self.cfg.fund_max_liquidity);
                    continue;
                }
                let size = fund / rate;
                let min = self.asset.min_per_trade_size.max(1e-9);
                let size_norm = round8((size / min).floor() * min);
                if size_norm <= 0.0 {
                    self.stats.num_buy_req_reject += 1;
                    self.fund.buy_fail(1);
                    logging::log_risk_check("min_trade_size", "fail", size, min);
                    continue;
                }
                reqs.push(TradeRequest {
                    product: self.product.clone(),
                    side: Side::Buy,
                    size: size_norm,
                    fund: round8(fund),
                    order_type: OrderType::Market,
                    price: 0.0,
                    stop: signal.stop,
                    profit: signal.profit,
                    position_id: None,
                });
            } else if signal.strength < 0 {
                self.stats.num_sell_req += 1;
                match self.book.closable_position() {
                    Some(id) => {
                        let closes = self.close_requests_for(vec![id]);
                        if closes.is_empty() {
                            self.stats.num_sell_req_reject += 1;
                        }
                        reqs.extend(closes);
                    }
                    None => {
                        self.stats.num_sell_req_reject += 1;
                    }
                }
            }
        }
        reqs
    }

    /// Operator override: a JSON order dropped at
    /// `override/TRADE_<exchange>.<product>` is consumed once and turned
    /// into a trade request. Stop-type requests park until their trigger.
    /// The file is deleted after reading so it fires exactly once.
    pub fn manual_trade_requests(&mut self, exchange_name: &str) -> Vec<TradeRequest> {
        let path = std::path::Path::new(&self.cfg.override_dir)
            .join(format!("TRADE_{}.{}", exchange_name, self.product));
        if !path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let _ = std::fs::remove_file(&path);
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(err) => {
                logging::log(
                    Level::Error,
                    Domain::Market,
                    "manual_order_malformed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                return Vec::new();
            }
        };
        if value.get("product").and_then(|p| p.as_str()) != Some(self.product.as_str()) {
            logging::log(
                Level::Error,
                Domain::Market,
                "manual_order_wrong_product",
                obj(&[("product", v_str(&self.product))]),
            );
            return Vec::new();
        }
        let side = value.get("side").and_then(|s| s.as_str()).unwrap_or("");
        let order_type = match value.get("type").and_then(|t| t.as_str()).unwrap_or("market") {
            "stop" => OrderType::Stop,
            "limit" => OrderType::Limit,
            _ => OrderType::Market,
        };
        let stop = value.get("stop").and_then(|s| s.as_f64()).unwrap_or(0.0);
        let profit = value.get("profit").and_then(|p| p.as_f64()).unwrap_or(0.0);
        let price = value.get("price").and_then(|p| p.as_f64()).unwrap_or(0.0);
        let size = value.get("size").and_then(|s| s.as_f64()).unwrap_or(0.0);

        match side {
            "BUY" => {
                self.stats.num_buy_req += 1;
                if size <= 0.0 || self.fund.take_for_buy(1) <= 0.0 {
                    self.stats.num_buy_req_reject += 1;
                    logging::log(
                        Level::Error,
                        Domain::Market,
                        "manual_order_rejected",
                        obj(&[("product", v_str(&self.product)), ("size", v_num(size))]),
                    );
                    return Vec::new();
                }
                logging::log(
                    Level::Info,
                    Domain::Market,
                    "manual_order",
                    obj(&[
                        ("product", v_str(&self.product)),
                        ("side", v_str("BUY")),
                        ("size", v_num(size)),
                        ("type", v_str(order_type.as_str())),
                    ]),
                );
                vec![TradeRequest {
                    product: self.product.clone(),
                    side: Side::Buy,
                    size: round8(size),
                    fund: round8(size * self.current_rate.max(price)),
                    order_type,
                    price,
                    stop,
                    profit,
                    position_id: None,
                }]
            }
            "SELL" => {
                self.stats.num_sell_req += 1;
                match self.book.closable_position() {
                    Some(id) => {
                        let mut reqs = self.close_requests_for(vec![id]);
                        if reqs.is_empty() {
                            self.stats.num_sell_req_reject += 1;
                        }
                        for req in &mut reqs {
                            req.order_type = order_type;
                            req.stop = stop;
                        }
                        reqs
                    }
                    None => {
                        self.stats.num_sell_req_reject += 1;
                        logging::log(
                            Level::Error,
                            Domain::Market,
                            "manual_order_rejected",
                            obj(&[
                                ("product", v_str(&self.product)),
                                ("reason", v_str("no_open_position")),
                            ]),
                        );
                        Vec::new()
                    }
                }
            }
            other => {
                logging::log(
                    Level::Error,
                    Domain::Market,
                    "manual_order_malformed",
                    obj(&[("side", v_str(other))]),
                );
                Vec::new()
            }
        }
    }

    /// End of session (or emergency): close every open position.
    pub fn close_all_positions(&mut self) -> Vec<TradeRequest> {
        let mut ids = Vec::new();
        while let Some(id) = self.book.closable_position() {
            ids.push(id);
        }
        logging::log(
            Level::Info,
            Domain::Market,
            "close_all",
            obj(&[("product", v_str(&self.product)), ("positions", v_num(ids.len() as f64))]),
        );
        self.close_requests_for(ids)
    }

    // -- execution -----------------------------------------------------------

    fn revert_request(&mut self, req: &TradeRequest) {
        match req.side {
            Side::Buy => self.fund.buy_fail(1),
            Side::Sell => {
                self.asset.sell_fail(req.size);
                if let Some(pos_id) = &req.position_id {
                    self.book.close_failed(pos_id);
                }
            }
        }
    }

    /// Run requests through risk gate -> WAL -> circuit breaker -> broker.
    /// Failures release held funds/assets and re-open close-pending
    /// positions; the loop keeps trading.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_requests(
        &mut self,
        requests: Vec<TradeRequest>,
        exchange: &(dyn Exchange + Send + Sync),
        risk: &mut RiskManager,
        wal: &mut Wal,
        circuit: &mut CircuitBreaker,
        retry_cfg: &RetryConfig,
        now: u64,
    ) -> Result<()> {
        for req in requests {
            if req.order_type == OrderType::Stop {
                logging::log(
                    Level::Debug,
                    Domain::Exec,
                    "stop_request_parked",
                    obj(&[("product", v_str(&req.product)), ("stop", v_num(req.stop))]),
                );
                self.book.add_pending_trade_req(req);
                continue;
            }

            if let Err(reason) =
                risk.can_place_order(&req.product, req.side, req.size, self.current_rate, now)
            {
                logging::log(
                    Level::Warn,
                    Domain::Risk,
                    "order_blocked",
                    obj(&[
                        ("product", v_str(&req.product)),
                        ("side", v_str(req.side.as_str())),
                        ("reason", v_str(&reason)),
                    ]),
                );
                logging::agg_increment("risk_block");
                self.revert_request(&req);
                continue;
            }

            if !circuit.allow() {
                logging::log(
                    Level::Warn,
                    Domain::Exec,
                    "circuit_open",
                    obj(&[("product", v_str(&req.product))]),
                );
                self.revert_request(&req);
                continue;
            }

            self.intent_seq += 1;
            let intent_id = format!("I-{}-{}-{}", self.product, now, self.intent_seq);
            let wal_write = wal.append_entry(&WalEntry::PlaceOrder {
                ts: now,
                order_id: intent_id.clone(),
                product: req.product.clone(),
                side: req.side.as_str().to_string(),
                size: req.size,
                params_hash: logging::params_hash(&format!(
                    "{}{}{:.8}",
                    req.product,
                    req.side.as_str(),
                    req.size
                )),
            });
            if let Err(err) = wal_write {
                logging::log(
                    Level::Error,
                    Domain::Store,
                    "wal_append_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
            logging::log_order_submit(
                &intent_id,
                &req.product,
                req.side.as_str(),
                req.size,
                &intent_id,
            );
            self.tracker.ensure(&intent_id, req.size);
            if let Ok((prev, next)) = self.tracker.apply(&intent_id, OrderEvent::Submit) {
                logging::log(
                    Level::Debug,
                    Domain::Exec,
                    "order_state",
                    obj(&[
                        ("order_id", v_str(&intent_id)),
                        ("prev", v_str(&format!("{:?}", prev))),
                        ("next", v_str(&format!("{:?}", next))),
                    ]),
                );
            }

            let placed = match req.side {
                Side::Buy => {
                    self.stats.num_buy_order += 1;
                    retry_async(retry_cfg, "buy_order", || exchange.buy(&req)).await
                }
                Side::Sell => {
                    self.stats.num_sell_order += 1;
                    retry_async(retry_cfg, "sell_order", || exchange.sell(&req)).await
                }
            };

            match placed {
                Ok(order) => {
                    circuit.record_success();
                    let _ = self.tracker.apply(
                        &intent_id,
                        OrderEvent::Ack { exchange_id: order.id.clone() },
                    );
                    if order.status == crate::order::OrderStatus::Filled {
                        let _ = self.tracker.apply(
                            &intent_id,
                            OrderEvent::Fill {
                                fill_id: format!("fill-{}", order.id),
                                qty: order.filled_size,
                            },
                        );
                    }
                    self.intent_by_order.insert(order.id.clone(), intent_id);
                    self.order_status_update(order, risk, wal);
                }
                Err(err) => {
                    circuit.record_failure();
                    match req.side {
                        Side::Buy => self.stats.num_buy_order_failed += 1,
                        Side::Sell => self.stats.num_sell_order_failed += 1,
                    }
                    logging::log(
                        Level::Error,
                        Domain::Exec,
                        "order_failed",
                        obj(&[
                            ("order_id", v_str(&intent_id)),
                            ("product", v_str(&req.product)),
                            ("side", v_str(req.side.as_str())),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    let cancel = wal.append_entry(&WalEntry::Cancel {
                        ts: now,
                        order_id: intent_id.clone(),
                    });
                    if let Err(err) = cancel {
                        logging::log(
                            Level::Error,
                            Domain::Store,
                            "wal_append_failed",
                            obj(&[("error", v_str(&err.to_string()))]),
                        );
                    }
                    self.revert_request(&req);
                }
            }
        }
        Ok(())
    }

    // -- order status updates -----------------------------------------------

    /// Pending orders to poll against the broker, with the local fields the
    /// broker response will not echo back.
    pub fn pending_order_refs(&self) -> Vec<(String, Side, Option<String>, f64, f64)> {
        self.book
            .pending_orders()
            .into_iter()
            .map(|o| (o.id.clone(), o.side, o.position_id.clone(), o.stop, o.profit))
            .collect()
    }

    pub fn order_status_update(
        &mut self,
        order: Order,
        risk: &mut RiskManager,
        wal: &mut Wal,
    ) {
        if order.status == crate::order::OrderStatus::Filled {
            let wal_id = self
                .intent_by_order
                .get(&order.id)
                .cloned()
                .unwrap_or_else(|| order.id.clone());
            let fill = wal.append_entry(&WalEntry::Fill {
                ts: order.update_ts,
                order_id: wal_id,
                product: order.product.clone(),
                price: order.price,
                size: order.filled_size,
                fees: order.fees,
            });
            if let Err(err) = fill {
                logging::log(
                    Level::Error,
                    Domain::Store,
                    "wal_append_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        }

        let event = self.book.apply_order_update(order.clone());
        match event {
            BookEvent::BuyOpen => {
                logging::log(
                    Level::Info,
                    Domain::Fill,
                    "buy_open",
                    obj(&[
                        ("order_id", v_str(&order.id)),
                        ("size", v_num(order.request_size)),
                    ]),
                );
            }
            BookEvent::BuyFilled { position_id } => {
                let cost = order.filled_value() + order.fees;
                let prior_size = self.asset.current_size - self.asset.initial_size;
                self.fund.buy_confirm(1, cost, order.fees);
                self.fund.update_avg_buy_price(order.price, cost, prior_size, order.filled_size);
                self.asset.buy_confirm(order.filled_size);
                self.stats.num_buy_order_success += 1;

                let stop = self.stop_price_for(order.price, order.stop);
                if stop > 0.0 {
                    self.book.arm_stop_loss(&position_id, stop);
                }
                let tp = self.take_profit_price_for(order.price, order.profit);
                if tp > 0.0 {
                    self.book.arm_take_profit(&position_id, tp);
                }

                risk.record_trade(
                    &self.product,
                    Side::Buy,
                    order.filled_size,
                    order.price,
                    0.0,
                    order.update_ts,
                );
                logging::log_fill(
                    &order.id,
                    &self.product,
                    "BUY",
                    order.price,
                    order.filled_size,
                    order.fees,
                );
                logging::log_position(
                    "position_open",
                    &position_id,
                    &[
                        ("entry_price", v_num(order.price)),
                        ("size", v_num(order.filled_size)),
                        ("stop_loss", v_num(stop)),
                        ("take_profit", v_num(tp)),
                    ],
                );
                logging::agg_increment("fill");
                logging::agg_increment("trade");
            }
            BookEvent::BuyCanceled => {
                self.fund.buy_fail(1);
                logging::log(
                    Level::Info,
                    Domain::Fill,
                    "buy_canceled",
                    obj(&[("order_id", v_str(&order.id))]),
                );
            }
            BookEvent::SellOpen { position_id } => {
                logging::log(
                    Level::Info,
                    Domain::Fill,
                    "sell_open",
                    obj(&[
                        ("order_id", v_str(&order.id)),
                        (
                            "position_id",
                            position_id.map(|p| v_str(&p)).unwrap_or(serde_json::Value::Null),
                        ),
                    ]),
                );
            }
            BookEvent::SellFilled { position_id, profit } => {
                let proceeds = order.filled_value();
                self.fund.sell_confirm(proceeds, order.fees);
                self.asset.sell_confirm(order.filled_size);
                self.fund.realized_profit += profit;
                self.stats.num_sell_order_success += 1;
                self.stats.record_closed_trade(profit);

                risk.record_trade(
                    &self.product,
                    Side::Sell,
                    order.filled_size,
                    order.price,
                    profit,
                    order.update_ts,
                );
                logging::log_fill(
                    &order.id,
                    &self.product,
                    "SELL",
                    order.price,
                    order.filled_size,
                    order.fees,
                );
                logging::log_position(
                    "position_closed",
                    &position_id,
                    &[("profit", v_num(profit)), ("exit_price", v_num(order.price))],
                );
                logging::agg_increment("fill");
                logging::agg_increment("trade");
            }
            BookEvent::SellCanceled { reopened } => {
                self.asset.sell_fail(order.request_size);
                logging::log(
                    Level::Warn,
                    Domain::Fill,
                    "sell_canceled",
                    obj(&[
                        ("order_id", v_str(&order.id)),
                        (
                            "reopened",
                            reopened.map(|p| v_str(&p)).unwrap_or(serde_json::Value::Null),
                        ),
                    ]),
                );
            }
            BookEvent::Ignored => {
                logging::log(
                    Level::Debug,
                    Domain::Fill,
                    "update_ignored",
                    obj(&[("order_id", v_str(&order.id))]),
                );
            }
        }

        self.refresh_mark_to_market();
        risk.update_position_price(&self.product, self.current_rate);
        let equity = self.fund.equity();
        self.metrics.update(equity);
        logging::log(
            Level::Debug,
            Domain::Market,
            "metrics.update",
            obj(&[
                ("product", v_str(&self.product)),
                ("equity", v_num(equity)),
                ("realized", v_num(self.fund.realized_profit)),
                ("unrealized", v_num(self.fund.unrealized_profit)),
                ("drawdown", v_num(self.metrics.max_drawdown)),
            ]),
        );
    }

    fn refresh_mark_to_market(&mut self) {
        self.fund.unrealized_profit = self.book.unrealized_total(self.current_rate);
    }

    // -- persistence ---------------------------------------------------------

    /// Lazy commit: dirty positions, metrics row and a WAL snapshot.
    pub fn persist(
        &mut self,
        ts: u64,
        store: &mut crate::storage::StateStore,
        wal: &mut Wal,
    ) {
        let dirty = self.book.take_dirty_positions();
        if !dirty.is_empty() {
            if let Err(err) = store.save_positions(&self.product, &dirty) {
                logging::log(
                    Level::Error,
                    Domain::Store,
                    "position_save_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        }
        if let Err(err) = store.persist_metrics(
            ts,
            &self.product,
            self.fund.current_value,
            self.asset.current_size,
            self.fund.realized_profit,
            self.fund.unrealized_profit,
            self.fund.equity(),
            self.metrics.max_drawdown,
            &self.stats,
        ) {
            logging::log(
                Level::Error,
                Domain::Store,
                "metrics_save_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            );
        }
        if let Err(err) = wal.write_snapshot(
            ts,
            &self.product,
            self.fund.current_value,
            self.asset.current_size,
            self.fund.realized_profit,
            self.book.open_count() as u64,
        ) {
            logging::log(
                Level::Error,
                Domain::Store,
                "wal_snapshot_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderStatus;

    /// Scripted strategy for deterministic engine tests.
    struct Scripted {
        signals: Vec<i32>,
        cursor: usize,
    }

    impl Scripted {
        fn new(signals: Vec<i32>) -> Self {
            Self { signals, cursor: 0 }
        }
    }

    impl Strategy for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn required_indicators(&self) -> Vec<IndicatorSpec> {
            Vec::new()
        }

        fn warmup(&self) -> usize {
            0
        }

        fn generate_signal(&mut self, _frames: &[Frame]) -> Signal {
            let s = self.signals.get(self.cursor).copied().unwrap_or(0);
            self.cursor += 1;
            Signal::of(s)
        }
    }

    fn test_cfg(dir: &tempfile::TempDir) -> Config {
        let mut cfg = Config::from_env();
        cfg.product = "TESTUSDT".to_string();
        cfg.candle_interval = 300;
        cfg.initial_fund = 10_000.0;
        cfg.fund_max_liquidity = 9_000.0;
        cfg.fund_max_per_buy_value = 1_000.0;
        cfg.asset_min_per_trade_size = 0.0001;
        cfg.stop_loss_enabled = true;
        cfg.stop_loss_kind = StopLossKind::Trailing;
        cfg.stop_loss_rate = 2.0;
        cfg.take_profit_enabled = true;
        cfg.take_profit_kind = TakeProfitKind::Simple;
        cfg.take_profit_rate = 4.0;
        cfg.max_daily_loss = 0.0;
        cfg.max_daily_loss_percent = 0.0;
        cfg.max_open_positions = 0;
        cfg.kill_file = dir.path().join("STOP").to_string_lossy().to_string();
        cfg.risk_state_path = dir.path().join("risk.json").to_string_lossy().to_string();
        cfg.override_dir = dir.path().join("override").to_string_lossy().to_string();
        cfg
    }

    fn market_with(dir: &tempfile::TempDir, signals: Vec<i32>) -> Market {
        Market::new(test_cfg(dir), Box::new(Scripted::new(signals)))
    }

    fn candle(ts: u64, close: f64) -> Candle {
        Candle { ts, open: close, high: close + 1.0, low: close - 1.0, close, volume: 10.0 }
    }

    fn filled_buy(id: &str, size: f64, price: f64) -> Order {
        Order {
            id: id.to_string(),
            product: "TESTUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
            request_size: size,
            filled_size: size,
            remaining_size: 0.0,
            price,
            funds: size * price,
            fees: size * price * 0.001,
            create_ts: 1_000,
            update_ts: 1_000,
            stop: 0.0,
            profit: 0.0,
            position_id: None,
        }
    }

    #[test]
    fn buy_signal_produces_sized_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![2]);
        let reqs = market.on_candle(candle(300, 100.0));
        assert_eq!(reqs.len(), 2, "strength 2 = two buy slices");
        for req in &reqs {
            assert_eq!(req.side, Side::Buy);
            // 1000 fund at rate 100 = 10 units
            assert!((req.size - 10.0).abs() < 1e-6);
        }
        assert_eq!(market.stats.num_buy_req, 2);
        // funds held until fills arrive
        assert!((market.fund.current_hold_value - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn sell_signal_without_position_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![-1]);
        let reqs = market.on_candle(candle(300, 100.0));
        assert!(reqs.is_empty());
        assert_eq!(market.stats.num_sell_req_reject, 1);
    }

    #[test]
    fn fill_accounting_and_ladder_arming() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![0]);
        market.on_candle(candle(300, 100.0));
        let mut risk = RiskManager::new(&test_cfg(&dir), 1_000);
        let wal_path = dir.path().join("t.wal");
        let mut wal = Wal::open(wal_path.to_str().unwrap()).unwrap();

        market.fund.take_for_buy(1);
        market.order_status_update(filled_buy("B-1", 10.0, 100.0), &mut risk, &mut wal);

        assert_eq!(market.book.open_count(), 1);
        assert_eq!(market.stats.num_buy_order_success, 1);
        assert!((market.asset.current_size - 10.0).abs() < 1e-9);
        // cost = 1000 + 1.0 fee
        assert!((market.fund.current_value - 8_999.0).abs() < 1e-9);
        assert_eq!(market.fund.current_hold_value, 0.0);
        let pos = market.book.position("B-1").unwrap();
        assert!((pos.stop_loss - 98.0).abs() < 1e-9, "2% trailing stop");
        assert!((pos.take_profit - 104.0).abs() < 1e-9, "4% target");
    }

    #[test]
    fn tick_take_profit_fires_before_candle_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![0]);
        market.on_candle(candle(300, 100.0));
        let mut risk = RiskManager::new(&test_cfg(&dir), 1_000);
        let mut wal = Wal::open(dir.path().join("t.wal").to_str().unwrap()).unwrap();
        market.fund.take_for_buy(1);
        market.order_status_update(filled_buy("B-1", 10.0, 100.0), &mut risk, &mut wal);

        let quiet = market.on_tick(601, 103.0, 1.0);
        assert!(quiet.requests.is_empty());
        let hit = market.on_tick(602, 104.0, 1.0);
        assert_eq!(hit.requests.len(), 1);
        assert_eq!(hit.requests[0].side, Side::Sell);
        assert_eq!(hit.requests[0].position_id.as_deref(), Some("B-1"));
        assert_eq!(market.stats.num_take_profit_hit, 1);
    }

    #[test]
    fn candle_close_stop_loss_generates_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![0, 0]);
        market.on_candle(candle(300, 100.0));
        let mut risk = RiskManager::new(&test_cfg(&dir), 1_000);
        let mut wal = Wal::open(dir.path().join("t.wal").to_str().unwrap()).unwrap();
        market.fund.take_for_buy(1);
        market.order_status_update(filled_buy("B-1", 10.0, 100.0), &mut risk, &mut wal);

        // price collapses through the 98.0 stop on the next candle close
        let reqs = market.on_candle(candle(600, 97.0));
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].side, Side::Sell);
        assert_eq!(market.stats.num_stop_loss_hit, 1);
    }

    #[test]
    fn trailing_stop_ratchets_up_with_price() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![0, 0, 0]);
        market.on_candle(candle(300, 100.0));
        let mut risk = RiskManager::new(&test_cfg(&dir), 1_000);
        let mut wal = Wal::open(dir.path().join("t.wal").to_str().unwrap()).unwrap();
        market.fund.take_for_buy(1);
        market.order_status_update(filled_buy("B-1", 10.0, 100.0), &mut risk, &mut wal);
        assert!((market.book.position("B-1").unwrap().stop_loss - 98.0).abs() < 1e-9);

        // rally: stop ratchets to 2% under 103
        market.on_candle(candle(600, 103.0));
        let stop_after_rally = market.book.position("B-1").unwrap().stop_loss;
        assert!((stop_after_rally - 100.94).abs() < 1e-9);

        // pullback: ratchet holds
        market.on_candle(candle(900, 101.5));
        assert!(
            (market.book.position("B-1").unwrap().stop_loss - stop_after_rally).abs() < 1e-9
        );
    }

    #[test]
    fn sell_fill_realizes_profit() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![0]);
        market.on_candle(candle(300, 100.0));
        let mut risk = RiskManager::new(&test_cfg(&dir), 1_000);
        let mut wal = Wal::open(dir.path().join("t.wal").to_str().unwrap()).unwrap();
        market.fund.take_for_buy(1);
        market.order_status_update(filled_buy("B-1", 10.0, 100.0), &mut risk, &mut wal);

        let id = market.book.closable_position().unwrap();
        market.asset.take_for_sell(10.0);
        let mut sell = filled_buy("S-1", 10.0, 110.0);
        sell.side = Side::Sell;
        sell.position_id = Some(id);
        market.order_status_update(sell, &mut risk, &mut wal);

        assert!((market.fund.realized_profit - 100.0).abs() < 1e-9);
        assert_eq!(market.stats.num_success_trade, 1);
        assert_eq!(market.book.open_count(), 0);
        assert_eq!(market.asset.current_size, 0.0);
        assert_eq!(market.asset.current_hold_size, 0.0);
    }

    #[test]
    fn paused_market_ignores_signals() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![3, -3]);
        market.pause_trading(true, true);
        assert!(market.on_candle(candle(300, 100.0)).is_empty());
        assert!(market.on_candle(candle(600, 100.0)).is_empty());
        assert_eq!(market.stats.num_buy_req, 0);
        assert_eq!(market.stats.num_sell_req, 0);
    }

    #[test]
    fn flat_candle_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![3]);
        let flat = Candle { ts: 300, open: 5.0, high: 5.0, low: 5.0, close: 5.0, volume: 0.0 };
        assert!(market.on_candle(flat).is_empty());
        assert_eq!(market.candle_count(), 0);
    }

    #[test]
    fn manual_override_stop_buy_parks_until_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(&dir);
        std::fs::create_dir_all(&cfg.override_dir).unwrap();
        let mut market = Market::new(cfg.clone(), Box::new(Scripted::new(vec![0])));
        market.on_candle(candle(300, 100.0));

        std::fs::write(
            std::path::Path::new(&cfg.override_dir).join("TRADE_papertrader.TESTUSDT"),
            r#"{"product":"TESTUSDT","side":"BUY","type":"stop","size":1.0,"price":0.0,"stop":95.0,"profit":0.0}"#,
        )
        .unwrap();

        let reqs = market.manual_trade_requests("papertrader");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].order_type, OrderType::Stop);
        // the execute path parks stop requests on the book
        market.book.add_pending_trade_req(reqs.into_iter().next().unwrap());

        assert!(market.on_tick(601, 96.0, 1.0).requests.is_empty());
        let fired = market.on_tick(602, 95.0, 1.0).requests;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].side, Side::Buy);
        assert_eq!(fired[0].order_type, OrderType::Market);

        // the override file fires exactly once
        assert!(market.manual_trade_requests("papertrader").is_empty());
    }

    #[test]
    fn manual_override_rejects_wrong_product() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(&dir);
        std::fs::create_dir_all(&cfg.override_dir).unwrap();
        let mut market = Market::new(cfg.clone(), Box::new(Scripted::new(vec![0])));
        market.on_candle(candle(300, 100.0));
        std::fs::write(
            std::path::Path::new(&cfg.override_dir).join("TRADE_papertrader.TESTUSDT"),
            r#"{"product":"OTHER","side":"BUY","type":"market","size":1.0,"price":0.0,"stop":0.0,"profit":0.0}"#,
        )
        .unwrap();
        assert!(market.manual_trade_requests("papertrader").is_empty());
        assert_eq!(market.fund.current_hold_value, 0.0);
    }

    #[test]
    fn close_all_generates_sells_for_every_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = market_with(&dir, vec![0]);
        market.on_candle(candle(300, 100.0));
        let mut risk = RiskManager::new(&test_cfg(&dir), 1_000);
        let mut wal = Wal::open(dir.path().join("t.wal").to_str().unwrap()).unwrap();
        for i in 0..3 {
            market.fund.take_for_buy(1);
            market.order_status_update(
                filled_buy(&format!("B-{}", i), 5.0, 100.0),
                &mut risk,
                &mut wal,
            );
        }
        let reqs = market.close_all_positions();
        assert_eq!(reqs.len(), 3);
        assert!(reqs.iter().all(|r| r.side == Side::Sell));
    }
}
