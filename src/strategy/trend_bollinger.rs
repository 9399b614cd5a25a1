//! Bollinger band breakout-and-fade tracker.
//!
//! Remembers which band the close last touched; when price falls back
//! inside the bands, a retreat from the upper touch sells and a bounce off
//! the lower touch buys.

use super::{ind, Frame, Signal, Strategy};
use crate::indicators::{IndicatorKind, IndicatorSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
enum BandTouch {
    None,
    Upper,
    Middle,
    Lower,
}

pub struct TrendBollinger {
    period: usize,
    band_period: u32,
    upper_bound_pct: f64,
    lower_bound_pct: f64,
    last_hit: BandTouch,
    last_hit_close: f64,
    trend_up: Option<bool>,
}

impl Default for TrendBollinger {
    fn default() -> Self {
        Self {
            period: 50,
            band_period: 20,
            upper_bound_pct: 0.0,
            lower_bound_pct: 0.0,
            last_hit: BandTouch::None,
            last_hit_close: 0.0,
            trend_up: None,
        }
    }
}

impl Strategy for TrendBollinger {
    fn name(&self) -> &'static str {
        "trend_bollinger"
    }

    fn required_indicators(&self) -> Vec<IndicatorSpec> {
        vec![
            IndicatorSpec::new(IndicatorKind::BollUpper, self.band_period),
            IndicatorSpec::new(IndicatorKind::BollLower, self.band_period),
        ]
    }

    fn warmup(&self) -> usize {
        self.period
    }

    fn generate_signal(&mut self, frames: &[Frame]) -> Signal {
        if frames.len() < self.period {
            return Signal::hold();
        }
        let upper = ind(frames, IndicatorKind::BollUpper, self.band_period);
        let lower = ind(frames, IndicatorKind::BollLower, self.band_period);
        let close = match frames.last() {
            Some(f) => f.candle.close,
            None => return Signal::hold(),
        };
        if upper <= 0.0 || lower <= 0.0 {
            return Signal::hold();
        }

        let mut signal = 0;
        if close > upper / 100.0 * (100.0 - self.upper_bound_pct) {
            self.last_hit = BandTouch::Upper;
        } else if close < lower / 100.0 * (100.0 + self.lower_bound_pct) {
            self.last_hit = BandTouch::Lower;
        } else {
            if self.last_hit == BandTouch::Upper && close < self.last_hit_close {
                self.trend_up = Some(false);
            } else if self.last_hit == BandTouch::Lower && close > self.last_hit_close {
                self.trend_up = Some(true);
            }
            self.last_hit = BandTouch::Middle;
        }
        self.last_hit_close = close;

        match self.trend_up.take() {
            Some(true) => signal = 3,
            Some(false) => signal = -3,
            None => {}
        }
        Signal::of(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::frames_from_closes;

    fn run(s: &mut TrendBollinger, closes: &[f64]) -> Vec<i32> {
        let frames = frames_from_closes(closes, s.required_indicators());
        let mut out = Vec::new();
        for n in s.warmup()..frames.len() {
            let sig = s.generate_signal(&frames[..n + 1]);
            if !sig.is_hold() {
                out.push(sig.strength);
            }
        }
        out
    }

    #[test]
    fn holds_before_warmup() {
        let mut s = TrendBollinger::default();
        let frames = frames_from_closes(&[100.0; 10], s.required_indicators());
        assert!(s.generate_signal(&frames).is_hold());
    }

    #[test]
    fn bounce_off_lower_band_buys() {
        let mut s = TrendBollinger::default();
        // oscillating base, a hard dump through the lower band, then a
        // bounce back inside the bands
        let mut closes: Vec<f64> =
            (0..60).map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        for i in 0..5 {
            closes.push(95.0 - i as f64 * 3.0);
        }
        for i in 0..6 {
            closes.push(84.0 + i as f64 * 2.5);
        }
        let signals = run(&mut s, &closes);
        assert!(signals.contains(&3), "expected buy on lower-band bounce, got {:?}", signals);
    }

    #[test]
    fn retreat_from_upper_band_sells() {
        let mut s = TrendBollinger::default();
        let mut closes: Vec<f64> =
            (0..60).map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        for i in 0..5 {
            closes.push(105.0 + i as f64 * 3.0);
        }
        for i in 0..6 {
            closes.push(116.0 - i as f64 * 2.5);
        }
        let signals = run(&mut s, &closes);
        assert!(signals.contains(&-3), "expected sell on upper-band retreat, got {:?}", signals);
    }

    #[test]
    fn quiet_range_stays_flat() {
        let mut s = TrendBollinger::default();
        let closes: Vec<f64> =
            (0..120).map(|i| 100.0 + if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        assert!(run(&mut s, &closes).is_empty());
    }
}
