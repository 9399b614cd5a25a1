//! EMA ribbon + RSI regime filter.
//!
//! Four EMAs define trend alignment; RSI above the bullish mark selects the
//! long regime. Signal strength builds by one each bar the aligned trend
//! persists, capped at 3.

use super::{ind, Frame, Signal, Strategy};
use crate::indicators::{IndicatorKind, IndicatorSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Bias {
    Flat,
    Long,
    Short,
}

pub struct EmaRsi {
    period: usize,
    ema_s: u32,
    ema_m: u32,
    ema_l: u32,
    ema_ll: u32,
    rsi: u32,
    rsi_bullish_mark: f64,
    bias: Bias,
    strength: i32,
}

impl Default for EmaRsi {
    fn default() -> Self {
        Self {
            period: 80,
            ema_s: 5,
            ema_m: 13,
            ema_l: 21,
            ema_ll: 80,
            rsi: 21,
            rsi_bullish_mark: 50.0,
            bias: Bias::Flat,
            strength: 0,
        }
    }
}

impl Strategy for EmaRsi {
    fn name(&self) -> &'static str {
        "ema_rsi"
    }

    fn required_indicators(&self) -> Vec<IndicatorSpec> {
        vec![
            IndicatorSpec::new(IndicatorKind::Ema, self.ema_s),
            IndicatorSpec::new(IndicatorKind::Ema, self.ema_m),
            IndicatorSpec::new(IndicatorKind::Ema, self.ema_l),
            IndicatorSpec::new(IndicatorKind::Ema, self.ema_ll),
            IndicatorSpec::new(IndicatorKind::Rsi, self.rsi),
        ]
    }

    fn warmup(&self) -> usize {
        self.period
    }

    fn generate_signal(&mut self, frames: &[Frame]) -> Signal {
        if frames.len() < self.period {
            return Signal::hold();
        }
        let rsi = ind(frames, IndicatorKind::Rsi, self.rsi);
        let ema_s = ind(frames, IndicatorKind::Ema, self.ema_s);
        let ema_m = ind(frames, IndicatorKind::Ema, self.ema_m);
        let ema_l = ind(frames, IndicatorKind::Ema, self.ema_l);
        let ema_ll = ind(frames, IndicatorKind::Ema, self.ema_ll);

        let bullish_trend = ema_m > ema_l;

        if rsi > self.rsi_bullish_mark {
            // bullish regime
            if self.bias == Bias::Short {
                // trend reversal against a short stance: flush hard
                self.bias = Bias::Flat;
                self.strength = 0;
                return Signal::of(-3);
            }
            if self.bias == Bias::Long && ema_s < ema_m && ema_s < ema_l {
                self.bias = Bias::Flat;
                self.strength = 0;
                return Signal::hold();
            }
            if bullish_trend && ema_s > ema_m && ema_s > ema_l && ema_l > ema_ll && ema_m > ema_ll
            {
                if self.bias == Bias::Long {
                    self.strength = (self.strength + 1).min(3);
                } else {
                    self.bias = Bias::Long;
                    self.strength = 1;
                }
            }
        } else {
            // bearish regime
            if self.bias == Bias::Long {
                self.bias = Bias::Flat;
                self.strength = 0;
            }
            if self.bias == Bias::Short && ema_s > ema_m && ema_s > ema_l {
                self.bias = Bias::Flat;
                self.strength = 0;
                return Signal::hold();
            }
            if !bullish_trend && ema_s < ema_m && ema_s < ema_l && ema_l < ema_ll && ema_m < ema_ll
            {
                if self.bias == Bias::Short {
                    self.strength = (self.strength - 1).max(-3);
                } else {
                    self.bias = Bias::Short;
                    self.strength = -1;
                }
            }
        }
        Signal::of(self.strength)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::frames_from_closes;

    fn strategy() -> EmaRsi {
        EmaRsi::default()
    }

    #[test]
    fn holds_before_warmup() {
        let mut s = strategy();
        let frames = frames_from_closes(&[100.0; 10], s.required_indicators());
        assert!(s.generate_signal(&frames).is_hold());
    }

    #[test]
    fn sustained_uptrend_builds_buy_strength() {
        let mut s = strategy();
        // long flat base, then a steady climb aligns all EMAs and lifts RSI
        let mut closes = vec![100.0; 100];
        for i in 0..120 {
            closes.push(100.0 + (i as f64) * 0.8);
        }
        let frames = frames_from_closes(&closes, s.required_indicators());
        let mut last = Signal::hold();
        for n in s.warmup()..frames.len() {
            last = s.generate_signal(&frames[..n + 1]);
        }
        assert!(last.strength >= 1, "expected buy signal, got {:?}", last);
    }

    #[test]
    fn strength_caps_at_three() {
        let mut s = strategy();
        let mut closes = vec![100.0; 100];
        for i in 0..300 {
            closes.push(100.0 + (i as f64) * 0.8);
        }
        let frames = frames_from_closes(&closes, s.required_indicators());
        let mut max_seen = 0;
        for n in s.warmup()..frames.len() {
            let sig = s.generate_signal(&frames[..n + 1]);
            max_seen = max_seen.max(sig.strength);
            assert!(sig.strength <= 3);
        }
        assert_eq!(max_seen, 3, "persistent trend should saturate strength");
    }

    #[test]
    fn sustained_downtrend_builds_sell_strength() {
        let mut s = strategy();
        let mut closes = vec![1_000.0; 100];
        for i in 0..200 {
            closes.push(1_000.0 - (i as f64) * 2.0);
        }
        let frames = frames_from_closes(&closes, s.required_indicators());
        let mut min_seen = 0;
        for n in s.warmup()..frames.len() {
            let sig = s.generate_signal(&frames[..n + 1]);
            min_seen = min_seen.min(sig.strength);
        }
        assert!(min_seen <= -1, "expected sell signal, got {}", min_seen);
    }
}
