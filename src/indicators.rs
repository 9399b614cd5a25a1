//! Indicator calculations over candle history.
//!
//! Strategies declare the indicators they read via [`IndicatorSpec`]; the
//! market recomputes the union once per closed candle into an
//! [`IndicatorRow`] so every strategy sees the same values for a bar.

use std::collections::HashMap;

use crate::candle::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Ema,
    Sma,
    Rsi,
    Atr,
    BollUpper,
    BollLower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndicatorSpec {
    pub kind: IndicatorKind,
    pub period: u32,
}

impl IndicatorSpec {
    pub fn new(kind: IndicatorKind, period: u32) -> Self {
        Self { kind, period }
    }
}

pub type IndicatorRow = HashMap<IndicatorSpec, f64>;

/// Extra lookback given to smoothed indicators so they converge before the
/// value is read.
const SMOOTHING_PAD: usize = 50;

pub struct IndicatorEngine {
    specs: Vec<IndicatorSpec>,
}

impl IndicatorEngine {
    pub fn new(mut specs: Vec<IndicatorSpec>) -> Self {
        specs.sort_by_key(|s| (s.kind as u8, s.period));
        specs.dedup();
        Self { specs }
    }

    pub fn specs(&self) -> &[IndicatorSpec] {
        &self.specs
    }

    /// Compute all configured indicators for the last candle of `history`.
    pub fn calculate(&self, history: &[Candle]) -> IndicatorRow {
        let mut row = IndicatorRow::with_capacity(self.specs.len());
        for spec in &self.specs {
            let window = spec.period as usize + SMOOTHING_PAD;
            let start = history.len().saturating_sub(window);
            let tail = &history[start..];
            let value = match spec.kind {
                IndicatorKind::Ema => ema(tail, spec.period as usize),
                IndicatorKind::Sma => sma(tail, spec.period as usize),
                IndicatorKind::Rsi => rsi(tail, spec.period as usize),
                IndicatorKind::Atr => atr(tail, spec.period as usize),
                IndicatorKind::BollUpper => bollinger(tail, spec.period as usize, 2.0).0,
                IndicatorKind::BollLower => bollinger(tail, spec.period as usize, 2.0).1,
            };
            row.insert(*spec, value);
        }
        row
    }
}

/// Exponential moving average of closes, seeded with the SMA of the first
/// `period` bars. Returns 0.0 until enough history exists.
pub fn ema(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period {
        return 0.0;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = candles[..period].iter().map(|c| c.close).sum::<f64>() / period as f64;
    candles[period..]
        .iter()
        .fold(seed, |acc, c| alpha * c.close + (1.0 - alpha) * acc)
}

pub fn sma(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period {
        return 0.0;
    }
    let tail = &candles[candles.len() - period..];
    tail.iter().map(|c| c.close).sum::<f64>() / period as f64
}

/// Wilder RSI over closes. Returns 50.0 (neutral) until warm.
pub fn rsi(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() <= period {
        return 50.0;
    }
    let mut gain = 0.0;
    let mut loss = 0.0;
    for w in candles[..=period].windows(2) {
        let delta = w[1].close - w[0].close;
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }
    let mut avg_gain = gain / period as f64;
    let mut avg_loss = loss / period as f64;
    for w in candles[period..].windows(2) {
        let delta = w[1].close - w[0].close;
        let (g, l) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + g) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + l) / period as f64;
    }
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Average true range with Wilder smoothing.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() <= period {
        return 0.0;
    }
    let tr = |prev: &Candle, cur: &Candle| -> f64 {
        let hl = cur.high - cur.low;
        let hc = (cur.high - prev.close).abs();
        let lc = (cur.low - prev.close).abs();
        hl.max(hc).max(lc)
    };
    let mut ranges = candles.windows(2).map(|w| tr(&w[0], &w[1]));
    let mut acc = 0.0;
    for _ in 0..period {
        match ranges.next() {
            Some(r) => acc += r,
            None => return 0.0,
        }
    }
    let mut value = acc / period as f64;
    for r in ranges {
        value = (value * (period as f64 - 1.0) + r) / period as f64;
    }
    value
}

/// Bollinger bands: (upper, lower, middle) at `k` standard deviations.
pub fn bollinger(candles: &[Candle], period: usize, k: f64) -> (f64, f64, f64) {
    if period == 0 || candles.len() < period {
        return (0.0, 0.0, 0.0);
    }
    let mid = sma(candles, period);
    let tail = &candles[candles.len() - period..];
    let var = tail.iter().map(|c| (c.close - mid).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    (mid + k * sd, mid - k * sd, mid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(price: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts: i as u64 * 60,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 1.0,
            })
            .collect()
    }

    fn closes(prices: &[f64]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle {
                ts: i as u64 * 60,
                open: p,
                high: p + 1.0,
                low: p - 1.0,
                close: p,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn ema_flat_series_equals_price() {
        let candles = flat(100.0, 50);
        assert!((ema(&candles, 10) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ema_tracks_rising_series() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let candles = closes(&prices);
        let fast = ema(&candles, 5);
        let slow = ema(&candles, 20);
        assert!(fast > slow, "fast EMA should lead in an uptrend");
        assert!(fast < 159.0 && fast > 150.0);
    }

    #[test]
    fn ema_insufficient_history_is_zero() {
        let candles = flat(100.0, 5);
        assert_eq!(ema(&candles, 10), 0.0);
    }

    #[test]
    fn sma_simple_average() {
        let candles = closes(&[1.0, 2.0, 3.0, 4.0]);
        assert!((sma(&candles, 4) - 2.5).abs() < 1e-9);
        assert!((sma(&candles, 2) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_gains_saturates() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let candles = closes(&prices);
        assert!((rsi(&candles, 14) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_near_zero() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 - i as f64).collect();
        let candles = closes(&prices);
        assert!(rsi(&candles, 14) < 1.0);
    }

    #[test]
    fn rsi_neutral_when_cold() {
        let candles = flat(100.0, 5);
        assert_eq!(rsi(&candles, 14), 50.0);
    }

    #[test]
    fn atr_flat_series_with_range() {
        // every bar has high-low = 2.0 and no gaps, so ATR converges to 2.0
        let candles = flat(100.0, 40)
            .into_iter()
            .map(|mut c| {
                c.high = 101.0;
                c.low = 99.0;
                c
            })
            .collect::<Vec<_>>();
        assert!((atr(&candles, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_bands_bracket_mean() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let candles = closes(&prices);
        let (upper, lower, mid) = bollinger(&candles, 20, 2.0);
        assert!(upper > mid && mid > lower);
    }

    #[test]
    fn engine_dedups_specs_and_fills_row() {
        let engine = IndicatorEngine::new(vec![
            IndicatorSpec::new(IndicatorKind::Ema, 5),
            IndicatorSpec::new(IndicatorKind::Ema, 5),
            IndicatorSpec::new(IndicatorKind::Rsi, 14),
        ]);
        assert_eq!(engine.specs().len(), 2);
        let row = engine.calculate(&flat(100.0, 60));
        assert_eq!(row.len(), 2);
        assert!((row[&IndicatorSpec::new(IndicatorKind::Ema, 5)] - 100.0).abs() < 1e-9);
    }
}
