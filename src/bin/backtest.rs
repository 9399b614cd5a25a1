//! Offline backtest runner.
//!
//! Usage: `backtest <candles.csv>` with `timestamp,open,high,low,close,volume`
//! rows. Strategy and risk knobs come from the same environment variables
//! the live loop reads.

use algoedge::backtest::run_backtest_csv;
use algoedge::config::Config;

#[tokio::main]
async fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| "data.csv".to_string());
    let cfg = Config::from_env();
    match run_backtest_csv(cfg, &path).await {
        Ok(report) => {
            println!("{}", report.summary());
        }
        Err(err) => {
            eprintln!("backtest failed on {}: {}", path, err);
            std::process::exit(1);
        }
    }
}
