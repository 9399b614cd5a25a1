//! End-to-end paper trading session: a deterministic candle series runs
//! through the full engine (strategy -> risk gate -> WAL -> paper fills ->
//! position book) and the accounting invariants are checked on the way out.

use algoedge::backtest::run_backtest;
use algoedge::candle::Candle;
use algoedge::config::Config;
use algoedge::reliability::wal::Wal;

// aligned to a UTC day boundary so one session never spans a daily
// risk-counter rollover
const SESSION_START_TS: u64 = 1_700_006_400;

fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Candle {
            ts: SESSION_START_TS + i as u64 * 300,
            open: c,
            high: c * 1.002,
            low: c * 0.998,
            close: c,
            volume: 1_500.0,
        })
        .collect()
}

/// Long bleed into a sharp recovery, then another leg down: the RSI swing
/// strategy buys the recovery and the ladders/exits do the rest.
fn swing_series() -> Vec<Candle> {
    let mut closes: Vec<f64> = vec![1_000.0; 100];
    for i in 0..80 {
        closes.push(1_000.0 - i as f64 * 3.0);
    }
    for i in 0..60 {
        closes.push(763.0 + i as f64 * 5.0);
    }
    for i in 0..60 {
        closes.push(1_060.0 - i as f64 * 6.0);
    }
    candles_from_closes(&closes)
}

fn session_cfg(dir: &tempfile::TempDir) -> Config {
    let mut cfg = Config::from_env();
    cfg.product = "TESTUSDT".to_string();
    cfg.candle_interval = 300;
    cfg.strategy = "trend_rsi".to_string();
    cfg.initial_fund = 10_000.0;
    cfg.fund_max_liquidity = 9_000.0;
    cfg.fund_max_per_buy_value = 500.0;
    cfg.asset_min_per_trade_size = 0.0001;
    cfg.paper_fee_rate = 0.001;
    cfg.stop_loss_enabled = true;
    cfg.stop_loss_rate = 2.0;
    cfg.take_profit_enabled = true;
    cfg.take_profit_rate = 4.0;
    // generous limits so the series itself drives the trades
    cfg.max_daily_loss = 0.0;
    cfg.max_daily_loss_percent = 0.0;
    cfg.max_position_size = 0.0;
    cfg.max_open_positions = 0;
    cfg.kill_file = dir.path().join("STOP").to_string_lossy().to_string();
    cfg.risk_state_path = dir.path().join("risk.json").to_string_lossy().to_string();
    cfg.wal_path = dir.path().join("session.wal").to_string_lossy().to_string();
    cfg.sqlite_path = dir.path().join("session.sqlite").to_string_lossy().to_string();
    cfg
}

#[tokio::test]
async fn swing_session_trades_and_settles_flat() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = session_cfg(&dir);
    let candles = swing_series();

    let report = run_backtest(cfg.clone(), &candles).await.unwrap();

    assert!(report.buys >= 1, "recovery leg should trigger buys: {}", report.summary());
    assert_eq!(report.open_positions, 0, "close-all must flatten: {}", report.summary());
    assert_eq!(
        report.sells,
        report.wins + report.losses,
        "every sell settles exactly one position: {}",
        report.summary()
    );
    assert_eq!(report.unrealized_profit, 0.0, "flat book has no MTM");
    assert!(
        (report.equity_end - (10_000.0 + report.realized_profit)).abs() < 1e-6,
        "equity must equal initial capital plus realized P&L: {}",
        report.summary()
    );
}

#[tokio::test]
async fn session_wal_has_no_dangling_intents() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = session_cfg(&dir);
    let candles = swing_series();

    let report = run_backtest(cfg.clone(), &candles).await.unwrap();
    assert!(report.buys > 0);

    // paper fills are instant, so every logged intent must have settled
    let recovery = Wal::recover(&cfg.wal_path).unwrap();
    assert!(
        recovery.pending_intents.is_empty(),
        "unsettled intents after an instant-fill session: {:?}",
        recovery.pending_intents
    );
    assert!(!recovery.fills_since_snapshot.is_empty());
}

#[tokio::test]
async fn daily_loss_limit_blocks_further_buying() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = session_cfg(&dir);
    // tight absolute loss limit and no protective exits: the limit is what
    // stops the bleeding
    cfg.max_daily_loss = 5.0;
    cfg.stop_loss_enabled = false;
    cfg.take_profit_enabled = false;

    // first recovery bounce buys, a crash forces a losing exit past the
    // limit, then a second bounce fires another buy signal the risk gate
    // must refuse
    let mut closes: Vec<f64> = vec![1_000.0; 60];
    for i in 0..80 {
        closes.push(1_000.0 - i as f64 * 3.0);
    }
    for i in 0..10 {
        closes.push(763.0 + i as f64 * 5.0);
    }
    for i in 0..12 {
        closes.push(810.0 - i as f64 * 40.0);
    }
    for i in 0..25 {
        closes.push(370.0 + i as f64 * 6.0);
    }
    let candles = candles_from_closes(&closes);

    let report = run_backtest(cfg, &candles).await.unwrap();
    assert!(report.buys > 0, "first bounce should trigger buys: {}", report.summary());
    assert!(
        report.buys <= 3,
        "second buy signal must be refused after the loss latch: {}",
        report.summary()
    );
    // the latch lets risk-reducing closes through, so the session ends flat
    assert_eq!(report.open_positions, 0, "{}", report.summary());
    assert!(report.equity_end < 10_000.0, "series is a net loss: {}", report.summary());
}

#[tokio::test]
async fn flat_series_never_trades() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = session_cfg(&dir);
    let candles = candles_from_closes(&vec![500.0; 300]);
    let report = run_backtest(cfg, &candles).await.unwrap();
    assert_eq!(report.buys, 0, "{}", report.summary());
    assert_eq!(report.sells, 0);
    assert_eq!(report.equity_end, 10_000.0);
}
