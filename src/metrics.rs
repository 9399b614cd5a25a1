//! Per-market trade statistics and equity tracking.

use serde::Serialize;

/// Counters mirrored into logs and the metrics table.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TradeStats {
    pub num_buy_req: u64,
    pub num_sell_req: u64,
    pub num_buy_req_reject: u64,
    pub num_sell_req_reject: u64,
    pub num_buy_order: u64,
    pub num_sell_order: u64,
    pub num_buy_order_success: u64,
    pub num_sell_order_success: u64,
    pub num_buy_order_failed: u64,
    pub num_sell_order_failed: u64,
    pub num_take_profit_hit: u64,
    pub num_stop_loss_hit: u64,
    pub num_success_trade: u64,
    pub num_failed_trade: u64,
}

impl TradeStats {
    pub fn record_closed_trade(&mut self, profit: f64) {
        if profit > 0.0 {
            self.num_success_trade += 1;
        } else {
            self.num_failed_trade += 1;
        }
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.num_success_trade + self.num_failed_trade;
        if total == 0 {
            0.0
        } else {
            self.num_success_trade as f64 / total as f64
        }
    }
}

/// Tracks equity peak and max drawdown as a negative fraction of the peak.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsEngine {
    pub equity_peak: f64,
    pub max_drawdown: f64,
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, equity: f64) {
        if equity > self.equity_peak {
            self.equity_peak = equity;
        }
        let drawdown = if self.equity_peak > 0.0 {
            (equity - self.equity_peak) / self.equity_peak
        } else {
            0.0
        };
        if drawdown < self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawdown_tracks_peak() {
        let mut m = MetricsEngine::new();
        m.update(1_000.0);
        m.update(1_200.0);
        m.update(900.0);
        assert_eq!(m.equity_peak, 1_200.0);
        assert!((m.max_drawdown + 0.25).abs() < 1e-9);
        // recovering does not shrink recorded max drawdown
        m.update(1_300.0);
        assert!((m.max_drawdown + 0.25).abs() < 1e-9);
    }

    #[test]
    fn win_rate_counts_closed_trades() {
        let mut s = TradeStats::default();
        s.record_closed_trade(10.0);
        s.record_closed_trade(-5.0);
        s.record_closed_trade(2.0);
        assert_eq!(s.num_success_trade, 2);
        assert_eq!(s.num_failed_trade, 1);
        assert!((s.win_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
