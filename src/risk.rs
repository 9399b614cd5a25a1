//! Pre-trade risk gate.
//!
//! Enforces daily loss limits (absolute and percent of starting capital),
//! a per-order size cap and a concurrent-position cap, and latches a
//! trading block with a reason once a daily limit is breached. State is
//! persisted to a JSON file on every mutation and survives restarts;
//! counters reset when the calendar day rolls over.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{day_bucket, Config};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::order::Side;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PositionExposure {
    pub size: f64,
    pub entry_price: f64,
    pub entry_ts: u64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub date: String,
    pub daily_pnl: f64,
    pub open_positions: HashMap<String, PositionExposure>,
    pub trades_today: u32,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

impl RiskState {
    fn fresh(date: String) -> Self {
        Self {
            date,
            daily_pnl: 0.0,
            open_positions: HashMap::new(),
            trades_today: 0,
            blocked: false,
            block_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DailyPnl {
    pub realized: f64,
    pub unrealized: f64,
}

impl DailyPnl {
    pub fn total(&self) -> f64 {
        self.realized + self.unrealized
    }
}

pub struct RiskManager {
    max_daily_loss: f64,
    max_daily_loss_percent: f64,
    max_position_size: f64,
    max_open_positions: usize,
    starting_capital: f64,
    kill_file: String,
    state_path: PathBuf,
    state: RiskState,
}

impl RiskManager {
    pub fn new(cfg: &Config, now_ts: u64) -> Self {
        let state_path = PathBuf::from(&cfg.risk_state_path);
        let today = day_bucket(now_ts);
        let state = Self::load_state(&state_path, &today);
        let mgr = Self {
            max_daily_loss: cfg.max_daily_loss,
            max_daily_loss_percent: cfg.max_daily_loss_percent,
            max_position_size: cfg.max_position_size,
            max_open_positions: cfg.max_open_positions,
            starting_capital: cfg.starting_capital,
            kill_file: cfg.kill_file.clone(),
            state_path,
            state,
        };
        logging::log(
            Level::Info,
            Domain::Risk,
            "init",
            obj(&[
                ("max_daily_loss", v_num(mgr.max_daily_loss)),
                ("max_daily_loss_pct", v_num(mgr.max_daily_loss_percent)),
                ("max_open_positions", v_num(mgr.max_open_positions as f64)),
                ("blocked", serde_json::json!(mgr.state.blocked)),
            ]),
        );
        mgr
    }

    fn load_state(path: &Path, today: &str) -> RiskState {
        let loaded = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<RiskState>(&raw).ok());
        match loaded {
            Some(state) if state.date == today => state,
            Some(_) | None => RiskState::fresh(today.to_string()),
        }
    }

    fn save_state(&self) {
        if let Some(dir) = self.state_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match serde_json::to_string_pretty(&self.state) {
            Ok(raw) => {
                if let Err(err) = std::fs::write(&self.state_path, raw) {
                    logging::log(
                        Level::Error,
                        Domain::Risk,
                        "state_save_failed",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            }
            Err(err) => logging::log(
                Level::Error,
                Domain::Risk,
                "state_save_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            ),
        }
    }

    fn roll_day_if_needed(&mut self, now_ts: u64) {
        let today = day_bucket(now_ts);
        if self.state.date != today {
            logging::log(
                Level::Info,
                Domain::Risk,
                "daily_reset",
                obj(&[("previous", v_str(&self.state.date)), ("date", v_str(&today))]),
            );
            let open = std::mem::take(&mut self.state.open_positions);
            self.state = RiskState::fresh(today);
            // open positions carry over; only the counters reset
            self.state.open_positions = open;
            self.save_state();
        }
    }

    pub fn blocked(&self) -> bool {
        self.state.blocked
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.state.block_reason.as_deref()
    }

    pub fn open_position_count(&self) -> usize {
        self.state.open_positions.len()
    }

    /// Realized + mark-to-market P&L for the current day.
    pub fn daily_pnl(&self) -> DailyPnl {
        DailyPnl {
            realized: self.state.daily_pnl,
            unrealized: self.state.open_positions.values().map(|p| p.unrealized_pnl).sum(),
        }
    }

    fn latch_block(&mut self, reason: String) {
        logging::log(
            Level::Error,
            Domain::Risk,
            "trading_blocked",
            obj(&[("reason", v_str(&reason))]),
        );
        self.state.blocked = true;
        self.state.block_reason = Some(reason);
        self.save_state();
    }

    /// Gate one order. `Err(reason)` means the order must not be placed.
    /// The kill file halts everything; a latched daily-loss block and the
    /// position-count cap apply to new exposure only, so risk-reducing
    /// sells always get through.
    pub fn can_place_order(
        &mut self,
        product: &str,
        side: Side,
        size: f64,
        _price: f64,
        now_ts: u64,
    ) -> Result<(), String> {
        self.roll_day_if_needed(now_ts);

        if Path::new(&self.kill_file).exists() {
            return Err(format!("kill file present: {}", self.kill_file));
        }

        if side == Side::Buy {
            if self.state.blocked {
                return Err(format!(
                    "trading blocked: {}",
                    self.state.block_reason.as_deref().unwrap_or("unknown")
                ));
            }
            let pnl = self.daily_pnl();
            if pnl.total() < 0.0 {
                let loss = -pnl.total();
                if self.max_daily_loss > 0.0 && loss >= self.max_daily_loss {
                    let reason = format!("daily loss limit reached: {:.2}", loss);
                    self.latch_block(reason.clone());
                    return Err(reason);
                }
                if self.max_daily_loss_percent > 0.0 && self.starting_capital > 0.0 {
                    let loss_pct = loss / self.starting_capital * 100.0;
                    if loss_pct >= self.max_daily_loss_percent {
                        let reason =
                            format!("daily loss percent limit reached: {:.2}%", loss_pct);
                        self.latch_block(reason.clone());
                        return Err(reason);
                    }
                }
            }
        }

        if self.max_position_size > 0.0 && size > self.max_position_size {
            let reason = format!(
                "order size {:.6} exceeds max {:.6}",
                size, self.max_position_size
            );
            logging::log_risk_check("position_size", "fail", size, self.max_position_size);
            return Err(reason);
        }

        if side == Side::Buy && self.max_open_positions > 0 {
            let exposure = self.state.open_positions.get(product).map(|p| p.size).unwrap_or(0.0);
            if exposure == 0.0 && self.state.open_positions.len() >= self.max_open_positions {
                let reason =
                    format!("max open positions {} reached", self.max_open_positions);
                logging::log_risk_check(
                    "open_positions",
                    "fail",
                    self.state.open_positions.len() as f64,
                    self.max_open_positions as f64,
                );
                return Err(reason);
            }
        }

        Ok(())
    }

    /// Record an executed trade. For sells, `pnl` is the realized profit of
    /// the closed slice and feeds the daily loss accounting.
    pub fn record_trade(
        &mut self,
        product: &str,
        side: Side,
        size: f64,
        price: f64,
        pnl: f64,
        now_ts: u64,
    ) {
        self.roll_day_if_needed(now_ts);
        self.state.trades_today += 1;
        if pnl != 0.0 {
            self.state.daily_pnl += pnl;
        }

        match side {
            Side::Buy => {
                let entry = self.state.open_positions.entry(product.to_string()).or_default();
                if entry.size == 0.0 {
                    *entry = PositionExposure {
                        size,
                        entry_price: price,
                        entry_ts: now_ts,
                        current_price: price,
                        unrealized_pnl: 0.0,
                    };
                } else {
                    let total = entry.size + size;
                    if total > 0.0 {
                        entry.entry_price =
                            (entry.entry_price * entry.size + price * size) / total;
                    }
                    entry.size = total;
                    entry.current_price = price;
                }
            }
            Side::Sell => {
                let remove = if let Some(entry) = self.state.open_positions.get_mut(product) {
                    entry.size -= size;
                    entry.size <= 1e-9
                } else {
                    false
                };
                if remove {
                    self.state.open_positions.remove(product);
                }
            }
        }
        self.save_state();
    }

    /// Refresh mark-to-market for a product; called per tick/candle.
    pub fn update_position_price(&mut self, product: &str, price: f64) {
        if let Some(entry) = self.state.open_positions.get_mut(product) {
            entry.current_price = price;
            entry.unrealized_pnl = (price - entry.entry_price) * entry.size;
        }
    }

    /// Manual unblock, e.g. operator intervention. Not called by the loop.
    pub fn reset_block(&mut self) {
        logging::log(Level::Warn, Domain::Risk, "block_reset", obj(&[]));
        self.state.blocked = false;
        self.state.block_reason = None;
        self.save_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(dir: &tempfile::TempDir) -> Config {
        let mut cfg = Config::from_env();
        cfg.max_daily_loss = 500.0;
        cfg.max_daily_loss_percent = 10.0;
        cfg.max_position_size = 2.0;
        cfg.max_open_positions = 2;
        cfg.starting_capital = 10_000.0;
        cfg.kill_file = dir.path().join("STOP").to_string_lossy().to_string();
        cfg.risk_state_path = dir.path().join("risk_state.json").to_string_lossy().to_string();
        cfg
    }

    const TS: u64 = 1_700_000_000;

    #[test]
    fn allows_order_within_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        assert!(risk.can_place_order("BTCUSDT", Side::Buy, 0.5, 100.0, TS).is_ok());
    }

    #[test]
    fn blocks_on_daily_loss_and_latches() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        risk.record_trade("BTCUSDT", Side::Sell, 1.0, 90.0, -600.0, TS);
        let err = risk.can_place_order("BTCUSDT", Side::Buy, 0.5, 100.0, TS).unwrap_err();
        assert!(err.contains("daily loss limit"), "{}", err);
        assert!(risk.blocked());
        // latched: subsequent buys fail on the block itself
        let err2 = risk.can_place_order("BTCUSDT", Side::Buy, 0.5, 100.0, TS).unwrap_err();
        assert!(err2.contains("trading blocked"), "{}", err2);
        // risk-reducing sells still pass so positions can be flattened
        assert!(risk.can_place_order("BTCUSDT", Side::Sell, 0.5, 100.0, TS).is_ok());
    }

    #[test]
    fn percent_limit_uses_starting_capital() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_cfg(&dir);
        cfg.max_daily_loss = 0.0; // only the percent limit active
        let mut risk = RiskManager::new(&cfg, TS);
        // 10% of 10_000 = 1_000
        risk.record_trade("BTCUSDT", Side::Sell, 1.0, 90.0, -999.0, TS);
        assert!(risk.can_place_order("BTCUSDT", Side::Buy, 0.5, 100.0, TS).is_ok());
        risk.record_trade("BTCUSDT", Side::Sell, 1.0, 90.0, -1.0, TS);
        assert!(risk.can_place_order("BTCUSDT", Side::Buy, 0.5, 100.0, TS).is_err());
    }

    #[test]
    fn unrealized_loss_counts_toward_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        risk.record_trade("BTCUSDT", Side::Buy, 1.0, 1_000.0, 0.0, TS);
        risk.update_position_price("BTCUSDT", 400.0);
        let pnl = risk.daily_pnl();
        assert!((pnl.unrealized + 600.0).abs() < 1e-9);
        assert!(risk.can_place_order("BTCUSDT", Side::Buy, 0.5, 400.0, TS).is_err());
    }

    #[test]
    fn size_cap_rejects_without_latching() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        assert!(risk.can_place_order("BTCUSDT", Side::Buy, 3.0, 100.0, TS).is_err());
        assert!(!risk.blocked());
        assert!(risk.can_place_order("BTCUSDT", Side::Buy, 1.0, 100.0, TS).is_ok());
    }

    #[test]
    fn open_position_cap_applies_to_new_products_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        risk.record_trade("AAA", Side::Buy, 1.0, 100.0, 0.0, TS);
        risk.record_trade("BBB", Side::Buy, 1.0, 100.0, 0.0, TS);
        // third product rejected
        assert!(risk.can_place_order("CCC", Side::Buy, 0.5, 100.0, TS).is_err());
        // adding to an existing product is allowed
        assert!(risk.can_place_order("AAA", Side::Buy, 0.5, 100.0, TS).is_ok());
        // sells always allowed by the cap
        assert!(risk.can_place_order("CCC", Side::Sell, 0.5, 100.0, TS).is_ok());
    }

    #[test]
    fn sell_removes_closed_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        risk.record_trade("AAA", Side::Buy, 1.0, 100.0, 0.0, TS);
        risk.record_trade("AAA", Side::Buy, 1.0, 110.0, 0.0, TS);
        assert_eq!(risk.open_position_count(), 1);
        let exposure = risk.state.open_positions.get("AAA").unwrap();
        assert!((exposure.entry_price - 105.0).abs() < 1e-9, "averaged entry");
        risk.record_trade("AAA", Side::Sell, 2.0, 120.0, 30.0, TS);
        assert_eq!(risk.open_position_count(), 0);
        assert!((risk.daily_pnl().realized - 30.0).abs() < 1e-9);
    }

    #[test]
    fn day_rollover_resets_counters_and_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = RiskManager::new(&test_cfg(&dir), TS);
        risk.record_trade("AAA", Side::Buy, 1.0, 100.0, -600.0, TS);
        assert!(risk.can_place_order("AAA", Side::Buy, 0.5, 100.0, TS).is_err());
        assert!(risk.blocked());
        // next day: block and realized pnl reset, exposure carries over
        let next_day = TS + 86_400;
        assert!(risk.can_place_order("AAA", Side::Buy, 0.5, 100.0, next_day).is_ok());
        assert_eq!(risk.open_position_count(), 1);
        assert_eq!(risk.daily_pnl().realized, 0.0);
    }

    #[test]
    fn kill_file_halts_trading() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(&dir);
        std::fs::write(&cfg.kill_file, b"halt").unwrap();
        let mut risk = RiskManager::new(&cfg, TS);
        let err = risk.can_place_order("AAA", Side::Buy, 0.5, 100.0, TS).unwrap_err();
        assert!(err.contains("kill file"), "{}", err);
    }

    #[test]
    fn state_survives_restart_same_day() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(&dir);
        {
            let mut risk = RiskManager::new(&cfg, TS);
            risk.record_trade("AAA", Side::Buy, 1.0, 100.0, -50.0, TS);
        }
        let risk = RiskManager::new(&cfg, TS);
        assert!((risk.daily_pnl().realized + 50.0).abs() < 1e-9);
        assert_eq!(risk.open_position_count(), 1);
    }
}
