// =============================================================================
// Technical indicators — CPU-bound math shared by agents and the rule engine
// =============================================================================

pub mod atr;
pub mod rsi;

use crate::market::Candle;

/// Support and resistance from the most recent `window` bars: lowest low and
/// highest high.
pub fn support_resistance(candles: &[Candle], window: usize) -> Option<(f64, f64)> {
    if candles.is_empty() || window == 0 {
        return None;
    }
    let start = candles.len().saturating_sub(window);
    let slice = &candles[start..];
    let support = slice.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let resistance = slice.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    if support.is_finite() && resistance.is_finite() {
        Some((support, resistance))
    } else {
        None
    }
}

/// Simple moving average of the last `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let start = closes.len() - period;
    let mean = closes[start..].iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}
