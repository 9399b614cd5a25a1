//! Structured JSON-lines logging.
//!
//! Every entry carries a run id, a monotonic sequence number, a level and a
//! domain so sessions can be replayed and filtered after the fact. Entries
//! go to run-scoped files (`events.jsonl` for info and above,
//! `trace.jsonl` for debug/trace, `metrics.jsonl` for metric events) and to
//! stdout. Credentials are redacted before anything is written.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,   // candles, rates, indicators
    Strategy, // signal generation
    Risk,     // limit checks, blocks
    Exec,     // order submissions
    Fill,     // order status updates, fills
    Book,     // position transitions, ladders
    Feed,     // websocket / polling feed
    Store,    // sqlite, wal
    System,   // startup, shutdown, recovery
    Audit,    // replay trail
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Strategy => "strategy",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Fill => "fill",
            Domain::Book => "book",
            Domain::Feed => "feed",
            Domain::Store => "store",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    /// LOG_DOMAINS is a comma-separated allowlist, or "all".
    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

struct RunContext {
    run_id: String,
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
    metrics: Mutex<BufWriter<File>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        let open = |name: &str, fallback: &str| -> File {
            File::create(run_dir.join(name)).unwrap_or_else(|err| {
                eprintln!("[log] failed to create {}: {}", name, err);
                File::create(fallback).expect("log fallback")
            })
        };

        RunContext {
            run_id,
            events: Mutex::new(BufWriter::new(open("events.jsonl", "/tmp/algoedge-events.jsonl"))),
            trace: Mutex::new(BufWriter::new(open("trace.jsonl", "/tmp/algoedge-trace.jsonl"))),
            metrics: Mutex::new(BufWriter::new(open(
                "metrics.jsonl",
                "/tmp/algoedge-metrics.jsonl",
            ))),
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "X-MBX-APIKEY", "api_key", "apikey", "signature"]
    {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["order_id", "position_id", "product", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core emit
// =============================================================================

/// RFC3339 timestamp with milliseconds.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("domain".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if event.starts_with("metrics") {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn params_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut h);
    format!("{:x}", h.finish())
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_candle(product: &str, ts: u64, o: f64, h: f64, l: f64, c: f64, v: f64) {
    log(
        Level::Trace,
        Domain::Market,
        "candle",
        obj(&[
            ("product", v_str(product)),
            ("candle_ts", json!(ts)),
            ("o", v_num(o)),
            ("h", v_num(h)),
            ("l", v_num(l)),
            ("c", v_num(c)),
            ("v", v_num(v)),
        ]),
    );
}

pub fn log_signal(strategy: &str, product: &str, strength: i32, stop: f64, profit: f64) {
    log(
        Level::Debug,
        Domain::Strategy,
        "signal",
        obj(&[
            ("strategy", v_str(strategy)),
            ("product", v_str(product)),
            ("strength", json!(strength)),
            ("stop", v_num(stop)),
            ("profit", v_num(profit)),
        ]),
    );
}

pub fn log_risk_check(check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Risk,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_order_submit(order_id: &str, product: &str, side: &str, size: f64, params: &str) {
    log(
        Level::Info,
        Domain::Exec,
        "order_submit",
        obj(&[
            ("order_id", v_str(order_id)),
            ("product", v_str(product)),
            ("side", v_str(side)),
            ("size", v_num(size)),
            ("params_hash", v_str(&params_hash(params))),
        ]),
    );
}

pub fn log_fill(order_id: &str, product: &str, side: &str, price: f64, size: f64, fees: f64) {
    log(
        Level::Info,
        Domain::Fill,
        "fill",
        obj(&[
            ("order_id", v_str(order_id)),
            ("product", v_str(product)),
            ("side", v_str(side)),
            ("price", v_num(price)),
            ("size", v_num(size)),
            ("fees", v_num(fees)),
        ]),
    );
}

pub fn log_position(event: &str, position_id: &str, fields: &[(&str, Value)]) {
    let mut map = obj(fields);
    map.insert("position_id".to_string(), v_str(position_id));
    log(Level::Info, Domain::Book, event, map);
}

pub fn log_session_summary(
    duration_secs: u64,
    realized_profit: f64,
    unrealized_profit: f64,
    max_drawdown: f64,
    total_trades: u64,
    win_rate: f64,
    sl_hits: u64,
    tp_hits: u64,
) {
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("duration_secs", json!(duration_secs)),
            ("realized_profit", v_num(realized_profit)),
            ("unrealized_profit", v_num(unrealized_profit)),
            ("max_drawdown", v_num(max_drawdown)),
            ("total_trades", json!(total_trades)),
            ("win_rate", v_num(win_rate)),
            ("stop_loss_hits", json!(sl_hits)),
            ("take_profit_hits", json!(tp_hits)),
        ]),
    );
}

// =============================================================================
// Periodic aggregator
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    trades: u64,
    fills: u64,
    risk_blocks: u64,
    candles: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            trades: 0,
            fills: 0,
            risk_blocks: 0,
            candles: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "trade" => self.trades += 1,
            "fill" => self.fills += 1,
            "risk_block" => self.risk_blocks += 1,
            "candle" => self.candles += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<(u64, u64, u64, u64)> {
        if self.last_flush.elapsed().as_secs() >= self.flush_interval_secs {
            let out = (self.trades, self.fills, self.risk_blocks, self.candles);
            self.trades = 0;
            self.fills = 0;
            self.risk_blocks = 0;
            self.candles = 0;
            self.last_flush = Instant::now();
            Some(out)
        } else {
            None
        }
    }
}

pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

/// Call periodically from the loop to emit aggregated counters.
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some((trades, fills, blocks, candles)) = agg.maybe_flush() {
            log(
                Level::Info,
                Domain::System,
                "aggregated_stats",
                obj(&[
                    ("trades", json!(trades)),
                    ("fills", json!(fills)),
                    ("risk_blocks", json!(blocks)),
                    ("candles", json!(candles)),
                ]),
            );
        }
    }
}
