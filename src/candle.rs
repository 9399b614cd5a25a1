use serde::{Deserialize, Serialize};

/// One OHLC bar. Timestamps are epoch seconds aligned to the interval start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Off-hours feeds produce bars where nothing traded. Those are dropped
    /// rather than fed to the indicators.
    pub fn is_flat(&self) -> bool {
        self.open == self.high
            && self.high == self.low
            && self.low == self.close
            && self.volume == 0.0
    }
}

/// Aggregates raw ticks into interval candles.
///
/// A tick that lands past the current interval boundary first closes the
/// in-progress candle (stamped at its interval start), then seeds the next
/// one.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    interval: u64,
    window_start: u64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    has_ticks: bool,
}

impl CandleBuilder {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            window_start: 0,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            has_ticks: false,
        }
    }

    pub fn on_tick(&mut self, ts: u64, price: f64, size: f64) -> Option<Candle> {
        if price <= 0.0 {
            return None;
        }
        let window = ts - ts % self.interval;
        let mut closed = None;
        if self.has_ticks && window > self.window_start {
            closed = self.take(self.window_start);
        }
        if !self.has_ticks {
            self.window_start = window;
            self.open = price;
            self.high = price;
            self.low = price;
            self.has_ticks = true;
        } else {
            if price > self.high {
                self.high = price;
            }
            if price < self.low {
                self.low = price;
            }
        }
        self.close = price;
        self.volume += size;
        closed
    }

    /// Close whatever is in progress, e.g. at shutdown.
    pub fn force_close(&mut self) -> Option<Candle> {
        if self.has_ticks {
            self.take(self.window_start)
        } else {
            None
        }
    }

    fn take(&mut self, ts: u64) -> Option<Candle> {
        let candle = Candle {
            ts,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        };
        self.has_ticks = false;
        self.volume = 0.0;
        Some(candle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_aggregates_within_interval() {
        let mut b = CandleBuilder::new(60);
        assert!(b.on_tick(0, 100.0, 1.0).is_none());
        assert!(b.on_tick(10, 105.0, 2.0).is_none());
        assert!(b.on_tick(50, 95.0, 1.0).is_none());
        let c = b.on_tick(60, 99.0, 1.0).expect("boundary tick closes candle");
        assert_eq!(c.ts, 0);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 95.0);
        assert_eq!(c.volume, 4.0);
    }

    #[test]
    fn builder_skips_zero_price() {
        let mut b = CandleBuilder::new(60);
        assert!(b.on_tick(0, 0.0, 1.0).is_none());
        assert!(b.force_close().is_none());
    }

    #[test]
    fn builder_spans_gap_of_intervals() {
        let mut b = CandleBuilder::new(60);
        b.on_tick(0, 100.0, 1.0);
        // next tick three intervals later still closes the first candle once
        let c = b.on_tick(185, 101.0, 1.0).unwrap();
        assert_eq!(c.ts, 0);
        assert_eq!(c.close, 100.0);
        let c2 = b.force_close().unwrap();
        assert_eq!(c2.ts, 180);
        assert_eq!(c2.open, 101.0);
    }

    #[test]
    fn flat_zero_volume_candle_detected() {
        let flat = Candle { ts: 0, open: 5.0, high: 5.0, low: 5.0, close: 5.0, volume: 0.0 };
        assert!(flat.is_flat());
        let live = Candle { ts: 0, open: 5.0, high: 5.0, low: 5.0, close: 5.0, volume: 2.0 };
        assert!(!live.is_flat());
    }
}
