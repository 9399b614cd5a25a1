//! Live trading loop.
//!
//! Wires the configured exchange, strategy, risk manager, WAL and store
//! into one per-product [`Market`] engine, then drives it from the Binance
//! websocket feed or, for venues without a stream, from candle-boundary
//! REST polling. Ctrl-C triggers an orderly shutdown with an optional
//! close-all.

use std::time::Instant;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use algoedge::config::{now_ts, Config};
use algoedge::exchange::retry::RetryConfig;
use algoedge::exchange::{Exchange, ExchangeKind};
use algoedge::feed::{spawn_binance_kline_feed, FeedEvent};
use algoedge::logging::{self, obj, v_num, v_str, Domain, Level};
use algoedge::market::Market;
use algoedge::reliability::circuit::CircuitBreaker;
use algoedge::reliability::wal::Wal;
use algoedge::risk::RiskManager;
use algoedge::storage::StateStore;
use algoedge::strategy;

struct Session<'a> {
    cfg: &'a Config,
    exchange: &'a (dyn Exchange + Send + Sync),
    market: Market,
    risk: RiskManager,
    wal: Wal,
    store: StateStore,
    circuit: CircuitBreaker,
    retry_cfg: RetryConfig,
    last_persist: u64,
}

impl<'a> Session<'a> {
    async fn handle_tick(&mut self, ts: u64, price: f64, size: f64) -> Result<()> {
        let outcome = self.market.on_tick(ts, price, size);
        self.risk.update_position_price(&self.market.product, price);
        if !outcome.requests.is_empty() {
            self.market
                .execute_requests(
                    outcome.requests,
                    self.exchange,
                    &mut self.risk,
                    &mut self.wal,
                    &mut self.circuit,
                    &self.retry_cfg,
                    now_ts(),
                )
                .await?;
        }
        if let Some(candle) = outcome.closed_candle {
            self.handle_candle(candle).await?;
        }
        Ok(())
    }

    async fn handle_candle(&mut self, candle: algoedge::candle::Candle) -> Result<()> {
        // tick aggregation and the explicit feed both close intervals; the
        // first one to arrive wins
        if candle.ts <= self.market.last_candle_ts() {
            return Ok(());
        }
        if let Err(err) = self.store.save_candle(&self.market.product, &candle) {
            logging::log(
                Level::Warn,
                Domain::Store,
                "candle_save_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            );
        }
        let mut requests = self.market.on_candle(candle);
        self.risk.update_position_price(&self.market.product, self.market.current_rate());
        requests.extend(self.market.manual_trade_requests(self.exchange.name()));
        if !requests.is_empty() {
            self.market
                .execute_requests(
                    requests,
                    self.exchange,
                    &mut self.risk,
                    &mut self.wal,
                    &mut self.circuit,
                    &self.retry_cfg,
                    now_ts(),
                )
                .await?;
        }
        self.poll_pending_orders().await;
        self.maybe_persist();
        logging::tick_aggregator();
        Ok(())
    }

    /// Ask the broker about orders we have not seen settle yet. The broker
    /// response does not echo our local fields (side, position link, SL/TP),
    /// so they are restored from the book's pending record.
    async fn poll_pending_orders(&mut self) {
        for (id, side, position_id, stop, profit) in self.market.pending_order_refs() {
            match self.exchange.get_order(&self.market.product, &id).await {
                Ok(mut order) => {
                    order.side = side;
                    order.position_id = position_id;
                    order.stop = stop;
                    order.profit = profit;
                    self.market.order_status_update(order, &mut self.risk, &mut self.wal);
                }
                Err(err) => {
                    logging::log(
                        Level::Warn,
                        Domain::Exec,
                        "pending_order_poll_failed",
                        obj(&[("order_id", v_str(&id)), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
    }

    fn maybe_persist(&mut self) {
        let now = now_ts();
        if now.saturating_sub(self.last_persist) >= self.cfg.persist_every_secs {
            self.market.persist(now, &mut self.store, &mut self.wal);
            self.last_persist = now;
        }
    }

    async fn shutdown(&mut self) {
        if self.cfg.close_on_exit {
            let closes = self.market.close_all_positions();
            if !closes.is_empty() {
                let result = self
                    .market
                    .execute_requests(
                        closes,
                        self.exchange,
                        &mut self.risk,
                        &mut self.wal,
                        &mut self.circuit,
                        &self.retry_cfg,
                        now_ts(),
                    )
                    .await;
                if let Err(err) = result {
                    logging::log(
                        Level::Error,
                        Domain::Exec,
                        "close_all_failed",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
        self.market.persist(now_ts(), &mut self.store, &mut self.wal);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let kind = ExchangeKind::from_env();
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("exchange", v_str(kind.as_str())),
            ("product", v_str(&cfg.product)),
            ("strategy", v_str(&cfg.strategy)),
            ("candle_interval", json!(cfg.candle_interval)),
        ]),
    );

    let exchange = kind.build(cfg.clone())?;
    let mut store = StateStore::new(&cfg.sqlite_path)?;
    store.init()?;

    let recovery = Wal::recover(&cfg.wal_path)?;
    for intent in &recovery.pending_intents {
        logging::log(
            Level::Warn,
            Domain::System,
            "unreconciled_intent",
            obj(&[
                ("order_id", v_str(&intent.order_id)),
                ("product", v_str(&intent.product)),
                ("side", v_str(&intent.side)),
                ("size", v_num(intent.size)),
                ("ts", json!(intent.ts)),
            ]),
        );
    }
    let wal = Wal::open(&cfg.wal_path)?;

    let strategy = strategy::build(&cfg.strategy)?;
    let mut market = Market::new(cfg.clone(), strategy);
    market.setup(exchange.as_ref(), Some(&mut store)).await?;
    if let Some(snap) = recovery.snapshots_by_product.get(&cfg.product) {
        market.apply_recovery(snap);
    }

    let risk = RiskManager::new(&cfg, now_ts());
    let mut session = Session {
        cfg: &cfg,
        exchange: exchange.as_ref(),
        market,
        risk,
        wal,
        store,
        circuit: CircuitBreaker::new(cfg.api_failure_threshold),
        retry_cfg: RetryConfig::default(),
        last_persist: now_ts(),
    };

    let (tx, mut rx) = mpsc::channel::<FeedEvent>(256);
    let mut use_feed = kind == ExchangeKind::Binance;
    let _feed_task = if use_feed {
        Some(spawn_binance_kline_feed(&cfg, tx.clone()))
    } else {
        None
    };
    drop(tx);

    // paper replays faster than real time; live venues wait for the boundary
    let paper_replay_ms: u64 = std::env::var("PAPER_REPLAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    let poll_delay = |cfg: &Config| -> Duration {
        if kind == ExchangeKind::Paper {
            Duration::from_millis(paper_replay_ms)
        } else {
            Duration::from_secs(cfg.sleep_until_next_candle(now_ts()))
        }
    };

    let started = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logging::log(Level::Info, Domain::System, "shutdown_signal", obj(&[]));
                break;
            }
            event = rx.recv(), if use_feed => {
                match event {
                    Some(FeedEvent::Tick { ts, price, size, .. }) => {
                        session.handle_tick(ts, price, size).await?;
                    }
                    Some(FeedEvent::Candle { candle, .. }) => {
                        session.handle_candle(candle).await?;
                    }
                    None => {
                        logging::log(
                            Level::Warn,
                            Domain::Feed,
                            "feed_closed",
                            obj(&[("fallback", v_str("rest_polling"))]),
                        );
                        use_feed = false;
                    }
                }
            }
            _ = sleep(poll_delay(&cfg)), if !use_feed => {
                match session.exchange.fetch_latest_candle(&cfg.product, cfg.candle_interval).await {
                    Ok(candle) => session.handle_candle(candle).await?,
                    Err(err) => {
                        let msg = err.to_string();
                        if msg.contains("exhausted") {
                            // paper dataset finished: session is over
                            logging::log(
                                Level::Info,
                                Domain::System,
                                "dataset_complete",
                                obj(&[]),
                            );
                            break;
                        }
                        logging::log(
                            Level::Error,
                            Domain::Feed,
                            "candle_fetch_failed",
                            obj(&[("error", v_str(&msg))]),
                        );
                    }
                }
            }
        }
    }

    session.shutdown().await;
    let stats = session.market.stats;
    logging::log_session_summary(
        started.elapsed().as_secs(),
        session.market.fund.realized_profit,
        session.market.fund.unrealized_profit,
        session.market.metrics.max_drawdown,
        stats.num_success_trade + stats.num_failed_trade,
        stats.win_rate(),
        stats.num_stop_loss_hit,
        stats.num_take_profit_hit,
    );
    Ok(())
}
