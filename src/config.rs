//! Environment-driven runtime configuration.
//!
//! Every knob has a default that yields a safe paper-trading setup; live
//! venues activate only when API credentials are present.

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// How the stop price for a new position is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopLossKind {
    /// Fixed percent below entry rate, never moved.
    Simple,
    /// Percent below rate, ratcheted up as the rate rises.
    Trailing,
    /// `rate - 2*ATR(period)`, ratcheted like Trailing.
    Atr(u32),
    /// The strategy supplies the stop price with its signal.
    Strategy,
}

impl StopLossKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "simple" => StopLossKind::Simple,
            "trailing" => StopLossKind::Trailing,
            "strategy" => StopLossKind::Strategy,
            other if other.starts_with("ATR") => {
                StopLossKind::Atr(other[3..].parse().unwrap_or(14))
            }
            _ => StopLossKind::Trailing,
        }
    }

    pub fn is_trailing(&self) -> bool {
        matches!(self, StopLossKind::Trailing | StopLossKind::Atr(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TakeProfitKind {
    /// Fixed percent above entry rate.
    Simple,
    /// The strategy supplies the target with its signal.
    Strategy,
}

impl TakeProfitKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "strategy" => TakeProfitKind::Strategy,
            _ => TakeProfitKind::Simple,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub product: String,
    pub candle_interval: u64,
    pub history_window: usize,

    // venue endpoints and credentials
    pub binance_base: String,
    pub binance_ws_base: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub openalgo_base: String,
    pub openalgo_api_key: Option<String>,

    // paper trading
    pub paper_data_dir: String,
    pub paper_random_candles: usize,
    pub paper_start_price: f64,
    pub paper_fee_rate: f64,
    pub paper_slippage: f64,

    // fund / asset sizing
    pub initial_fund: f64,
    pub fund_max_liquidity: f64,
    pub fund_max_per_buy_value: f64,
    pub asset_max_per_trade_size: f64,
    pub asset_min_per_trade_size: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,

    // stop loss / take profit
    pub stop_loss_enabled: bool,
    pub stop_loss_kind: StopLossKind,
    pub stop_loss_rate: f64,
    pub take_profit_enabled: bool,
    pub take_profit_kind: TakeProfitKind,
    pub take_profit_rate: f64,

    // risk limits
    pub max_daily_loss: f64,
    pub max_daily_loss_percent: f64,
    pub max_position_size: f64,
    pub max_open_positions: usize,
    pub starting_capital: f64,
    pub kill_file: String,
    pub risk_state_path: String,

    // persistence
    pub sqlite_path: String,
    pub wal_path: String,
    pub persist_every_secs: u64,

    pub strategy: String,
    pub api_failure_threshold: u32,
    pub close_on_exit: bool,
    pub override_dir: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            product: env_str("PRODUCT", "BTCUSDT"),
            candle_interval: env_or("CANDLE_SECS", 300),
            history_window: env_or("HISTORY_WINDOW", 500),

            binance_base: env_str("BINANCE_BASE", "https://api.binance.com"),
            binance_ws_base: env_str("BINANCE_WS_BASE", "wss://stream.binance.com:9443"),
            api_key: std::env::var("API_KEY").ok(),
            api_secret: std::env::var("API_SECRET").ok(),
            openalgo_base: env_str("OPENALGO_BASE", "http://127.0.0.1:5000"),
            openalgo_api_key: std::env::var("OPENALGO_API_KEY").ok(),

            paper_data_dir: env_str("PAPER_DATA_DIR", "raw_data"),
            paper_random_candles: env_or("PAPER_RANDOM_CANDLES", 5000),
            paper_start_price: env_or("PAPER_START_PRICE", 1000.0),
            paper_fee_rate: env_or("PAPER_FEE_RATE", 0.001),
            paper_slippage: env_or("PAPER_SLIPPAGE", 0.0),

            initial_fund: env_or("INITIAL_FUND", 10_000.0),
            fund_max_liquidity: env_or("FUND_MAX_LIQUIDITY", 9_000.0),
            fund_max_per_buy_value: env_or("FUND_MAX_PER_BUY_VALUE", 500.0),
            asset_max_per_trade_size: env_or("ASSET_MAX_PER_TRADE_SIZE", 1.0),
            asset_min_per_trade_size: env_or("ASSET_MIN_PER_TRADE_SIZE", 0.0001),
            maker_fee: env_or("MAKER_FEE", 0.001),
            taker_fee: env_or("TAKER_FEE", 0.001),

            stop_loss_enabled: env_or("STOP_LOSS_ENABLED", true),
            stop_loss_kind: StopLossKind::parse(&env_str("STOP_LOSS_KIND", "trailing")),
            stop_loss_rate: env_or("STOP_LOSS_RATE", 2.0),
            take_profit_enabled: env_or("TAKE_PROFIT_ENABLED", true),
            take_profit_kind: TakeProfitKind::parse(&env_str("TAKE_PROFIT_KIND", "simple")),
            take_profit_rate: env_or("TAKE_PROFIT_RATE", 4.0),

            max_daily_loss: env_or("MAX_DAILY_LOSS", 0.0),
            max_daily_loss_percent: env_or("MAX_DAILY_LOSS_PCT", 2.0),
            max_position_size: env_or("MAX_POSITION_SIZE", 0.0),
            max_open_positions: env_or("MAX_OPEN_POSITIONS", 10),
            starting_capital: env_or("STARTING_CAPITAL", 10_000.0),
            kill_file: env_str("KILL_FILE", "/tmp/STOP"),
            risk_state_path: env_str("RISK_STATE_PATH", "data/risk_state.json"),

            sqlite_path: env_str("SQLITE_PATH", "./algoedge.sqlite"),
            wal_path: env_str("WAL_PATH", "./algoedge.wal"),
            persist_every_secs: env_or("PERSIST_SECS", 300),

            strategy: env_str("STRATEGY", "ema_rsi"),
            api_failure_threshold: env_or("API_FAILURE_THRESHOLD", 5),
            close_on_exit: env_or("CLOSE_ON_EXIT", false),
            override_dir: env_str("OVERRIDE_DIR", "override"),
        }
    }

    pub fn sleep_until_next_candle(&self, now_ts: u64) -> u64 {
        let next = ((now_ts / self.candle_interval) + 1) * self.candle_interval;
        next.saturating_sub(now_ts)
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Calendar day (UTC) for a unix timestamp, used for daily risk buckets.
pub fn day_bucket(ts: u64) -> String {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}
