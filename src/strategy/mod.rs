//! Strategy interface.
//!
//! A strategy is a pure decision function over the candle/indicator history:
//! it declares which indicators it reads, how much warmup it needs, and
//! emits an integer signal in -3..=+3 (strong sell .. hold .. strong buy),
//! optionally with its own stop-loss / take-profit prices.

mod ema_rsi;
mod trend_bollinger;
mod trend_rsi;

pub use ema_rsi::EmaRsi;
pub use trend_bollinger::TrendBollinger;
pub use trend_rsi::TrendRsi;

use anyhow::{bail, Result};

use crate::candle::Candle;
use crate::indicators::{IndicatorKind, IndicatorRow, IndicatorSpec};

/// One bar of history as the strategies see it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub candle: Candle,
    pub indicators: IndicatorRow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    /// -3..=+3; 0 holds.
    pub strength: i32,
    /// Strategy-supplied stop price, 0 = none.
    pub stop: f64,
    /// Strategy-supplied take-profit price, 0 = none.
    pub profit: f64,
}

impl Signal {
    pub fn hold() -> Self {
        Self { strength: 0, stop: 0.0, profit: 0.0 }
    }

    pub fn of(strength: i32) -> Self {
        Self { strength: strength.clamp(-3, 3), stop: 0.0, profit: 0.0 }
    }

    pub fn is_hold(&self) -> bool {
        self.strength == 0
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Indicators the market must compute for this strategy.
    fn required_indicators(&self) -> Vec<IndicatorSpec>;

    /// Bars of history required before signals are meaningful.
    fn warmup(&self) -> usize;

    fn generate_signal(&mut self, frames: &[Frame]) -> Signal;
}

/// Read an indicator value off the most recent frame.
pub fn ind(frames: &[Frame], kind: IndicatorKind, period: u32) -> f64 {
    frames
        .last()
        .and_then(|f| f.indicators.get(&IndicatorSpec::new(kind, period)))
        .copied()
        .unwrap_or(0.0)
}

pub fn build(name: &str) -> Result<Box<dyn Strategy>> {
    match name {
        "ema_rsi" => Ok(Box::new(EmaRsi::default())),
        "trend_rsi" => Ok(Box::new(TrendRsi::default())),
        "trend_bollinger" => Ok(Box::new(TrendBollinger::default())),
        other => bail!("unknown strategy: {}", other),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_clamps_strength() {
        assert_eq!(Signal::of(7).strength, 3);
        assert_eq!(Signal::of(-9).strength, -3);
        assert!(Signal::of(0).is_hold());
    }

    #[test]
    fn build_known_strategies() {
        assert!(build("ema_rsi").is_ok());
        assert!(build("trend_rsi").is_ok());
        assert!(build("trend_bollinger").is_ok());
        assert!(build("nope").is_err());
    }
}
