//! RSI swing tracker.
//!
//! Buys when RSI recovers off an oversold low-water mark, sells when it
//! gives back half its high-water reading (or drops off overbought).

use super::{ind, Frame, Signal, Strategy};
use crate::indicators::{IndicatorKind, IndicatorSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Neutral,
    Oversold,
    Long,
    Overbought,
    Short,
}

pub struct TrendRsi {
    period: usize,
    rsi_period: u32,
    oversold_rsi: f64,
    overbought_rsi: f64,
    rsi_recover: f64,
    rsi_drop: f64,
    rsi_divisor: f64,
    phase: Phase,
    rsi_low: f64,
    rsi_high: f64,
}

impl Default for TrendRsi {
    fn default() -> Self {
        Self {
            period: 52,
            rsi_period: 14,
            oversold_rsi: 30.0,
            overbought_rsi: 82.0,
            rsi_recover: 3.0,
            rsi_drop: 0.0,
            rsi_divisor: 2.0,
            phase: Phase::Neutral,
            rsi_low: 0.0,
            rsi_high: 0.0,
        }
    }
}

impl Strategy for TrendRsi {
    fn name(&self) -> &'static str {
        "trend_rsi"
    }

    fn required_indicators(&self) -> Vec<IndicatorSpec> {
        vec![IndicatorSpec::new(IndicatorKind::Rsi, self.rsi_period)]
    }

    fn warmup(&self) -> usize {
        self.period
    }

    fn generate_signal(&mut self, frames: &[Frame]) -> Signal {
        if frames.len() < self.period {
            return Signal::hold();
        }
        let cur_rsi = ind(frames, IndicatorKind::Rsi, self.rsi_period);
        let mut signal = 0;

        if cur_rsi <= self.oversold_rsi {
            self.rsi_low = cur_rsi;
            self.phase = Phase::Oversold;
        }
        if self.phase == Phase::Oversold {
            self.rsi_low = self.rsi_low.min(cur_rsi);
            if cur_rsi >= self.rsi_low + self.rsi_recover {
                self.rsi_high = cur_rsi;
                self.phase = Phase::Long;
                signal = 3;
            }
        }
        if self.phase == Phase::Long {
            self.rsi_high = self.rsi_high.max(cur_rsi);
            if cur_rsi <= self.rsi_high / self.rsi_divisor {
                self.phase = Phase::Short;
                signal = -3;
            }
        }
        if self.phase == Phase::Long && cur_rsi >= self.overbought_rsi {
            self.rsi_high = cur_rsi;
            self.phase = Phase::Overbought;
        }
        if self.phase == Phase::Overbought {
            self.rsi_high = self.rsi_high.max(cur_rsi);
            if cur_rsi <= self.rsi_high - self.rsi_drop {
                self.phase = Phase::Short;
                signal = -3;
            }
        }

        Signal::of(signal)
    }
}
