//! Offline candle replay through the full engine.
//!
//! Candles run through the same [`Market`] code path as live trading, with
//! the paper adapter providing instant fills. The loop simulates one
//! intra-candle tick at the bar's high so aggressive take-profit behavior
//! matches the live loop's tick handling.

use anyhow::Result;

use crate::candle::Candle;
use crate::config::Config;
use crate::exchange::retry::RetryConfig;
use crate::exchange::PaperTrader;
use crate::market::Market;
use crate::reliability::circuit::CircuitBreaker;
use crate::reliability::wal::Wal;
use crate::risk::RiskManager;
use crate::strategy;

#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub candles: usize,
    pub buys: u64,
    pub sells: u64,
    pub wins: u64,
    pub losses: u64,
    pub stop_loss_hits: u64,
    pub take_profit_hits: u64,
    pub realized_profit: f64,
    pub unrealized_profit: f64,
    pub equity_end: f64,
    pub max_drawdown: f64,
    pub open_positions: usize,
    pub hold_profit: f64,
}

impl BacktestReport {
    pub fn summary(&self) -> String {
        format!(
            "candles={} buys={} sells={} wins={} losses={} sl_hits={} tp_hits={} \
             realized={:.4} unrealized={:.4} equity={:.4} max_dd={:.4} open={} hold={:.4}",
            self.candles,
            self.buys,
            self.sells,
            self.wins,
            self.losses,
            self.stop_loss_hits,
            self.take_profit_hits,
            self.realized_profit,
            self.unrealized_profit,
            self.equity_end,
            self.max_drawdown,
            self.open_positions,
            self.hold_profit,
        )
    }
}

/// Parse one `timestamp,open,high,low,close,volume` line.
pub fn parse_csv_line(line: &str) -> Result<Candle> {
    let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
    if fields.len() < 6 {
        anyhow::bail!("expected 6 columns, got {}", fields.len());
    }
    Ok(Candle {
        ts: fields[0].parse::<f64>()? as u64,
        open: fields[1].parse()?,
        high: fields[2].parse()?,
        low: fields[3].parse()?,
        close: fields[4].parse()?,
        volume: fields[5].parse()?,
    })
}

/// Replay `candles` through the engine and close everything at the end.
pub async fn run_backtest(cfg: Config, candles: &[Candle]) -> Result<BacktestReport> {
    let strategy = strategy::build(&cfg.strategy)?;
    let mut market = Market::new(cfg.clone(), strategy);
    let paper = PaperTrader::from_candles(cfg.clone(), candles.to_vec());
    let mut risk = RiskManager::new(&cfg, candles.first().map(|c| c.ts).unwrap_or(0));
    let mut wal = Wal::open(&cfg.wal_path)?;
    let mut circuit = CircuitBreaker::new(cfg.api_failure_threshold);
    // paper fills never need backoff
    let retry_cfg = RetryConfig { max_retries: 0, base_delay_ms: 0, ..Default::default() };

    for candle in candles {
        // intra-candle tick at the high so aggressive TP sees the wick
        paper.set_market_rate(candle.high);
        let tick = market.on_tick(candle.ts, candle.high, candle.volume);
        if !tick.requests.is_empty() {
            market
                .execute_requests(
                    tick.requests,
                    &paper,
                    &mut risk,
                    &mut wal,
                    &mut circuit,
                    &retry_cfg,
                    candle.ts,
                )
                .await?;
        }
        paper.set_market_rate(candle.close);
        let requests = market.on_candle(*candle);
        risk.update_position_price(&market.product, candle.close);
        if !requests.is_empty() {
            market
                .execute_requests(
                    requests,
                    &paper,
                    &mut risk,
                    &mut wal,
                    &mut circuit,
                    &retry_cfg,
                    candle.ts,
                )
                .await?;
        }
    }

    // flatten at the end of the run so realized P&L covers everything
    let last_ts = candles.last().map(|c| c.ts).unwrap_or(0);
    let closes = market.close_all_positions();
    if !closes.is_empty() {
        market
            .execute_requests(closes, &paper, &mut risk, &mut wal, &mut circuit, &retry_cfg, last_ts)
            .await?;
    }

    Ok(BacktestReport {
        candles: candles.len(),
        buys: market.stats.num_buy_order_success,
        sells: market.stats.num_sell_order_success,
        wins: market.stats.num_success_trade,
        losses: market.stats.num_failed_trade,
        stop_loss_hits: market.stats.num_stop_loss_hit,
        take_profit_hits: market.stats.num_take_profit_hit,
        realized_profit: market.fund.realized_profit,
        unrealized_profit: market.fund.unrealized_profit,
        equity_end: market.equity(),
        max_drawdown: market.metrics.max_drawdown,
        open_positions: market.book.open_count(),
        hold_profit: market.hold_profit(),
    })
}

/// Convenience wrapper used by the backtest binary: load a CSV and run.
pub async fn run_backtest_csv(cfg: Config, path: &str) -> Result<BacktestReport> {
    let raw = std::fs::read_to_string(path)?;
    let mut candles = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.to_lowercase().starts_with("timestamp")
        {
            continue;
        }
        match parse_csv_line(trimmed) {
            Ok(c) => candles.push(c),
            Err(_) => continue,
        }
    }
    if candles.is_empty() {
        anyhow::bail!("no candles parsed from {}", path);
    }
    run_backtest(cfg, &candles).await
}
