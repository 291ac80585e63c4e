// =============================================================================
// Average True Range (ATR) — Wilder smoothing over bar ranges
// =============================================================================
//
// ATR feeds two decisions in the engine: the technical agent's volatility
// level (via the percent form below) and the portfolio manager's adaptive
// thresholds. Both read it from 5-minute candles with the standard
// 14-bar window.
//
// True Range per bar:   TR = max(H - L, |H - prevClose|, |L - prevClose|)
// Smoothing:            ATR_0 = mean of the first `period` TRs
//                       ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market::Candle;

/// Most recent ATR over `candles` (oldest first) for the given `period`.
///
/// Returns `None` when the period is zero, when fewer than `period + 1`
/// candles are available (each True Range needs the previous close), or
/// when any intermediate value goes non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() <= period {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);
        let range = bar.high - bar.low;
        let gap_up = (bar.high - prev.close).abs();
        let gap_down = (bar.low - prev.close).abs();
        true_ranges.push(range.max(gap_up).max(gap_down));
    }

    let period_f = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / period_f;
    if !atr.is_finite() {
        return None;
    }

    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR as a percentage of the latest close.
///
/// This is the scale-free form the technical agent classifies volatility
/// with (above 2% reads HIGH, below 1% LOW) and the portfolio manager's
/// threshold bands are quoted in.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some(atr / last_close * 100.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 10.0,
        }
    }

    /// Flat 5-minute tape around a price with a fixed half-range.
    fn flat_tape(price: f64, half_range: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|_| candle(price, price + half_range, price - half_range, price))
            .collect()
    }

    #[test]
    fn atr_rejects_zero_period() {
        assert!(calculate_atr(&flat_tape(60_000.0, 400.0, 20), 0).is_none());
    }

    #[test]
    fn atr_needs_period_plus_one_candles() {
        // 14 candles give only 13 True Ranges for period 14.
        assert!(calculate_atr(&flat_tape(60_000.0, 400.0, 14), 14).is_none());
        assert!(calculate_atr(&flat_tape(60_000.0, 400.0, 15), 14).is_some());
    }

    #[test]
    fn atr_converges_to_the_constant_range() {
        // Every bar spans 800 around an unmoving close.
        let atr = calculate_atr(&flat_tape(60_000.0, 400.0, 30), 14).unwrap();
        assert!((atr - 800.0).abs() < 1e-6, "expected 800, got {atr}");
    }

    #[test]
    fn atr_picks_up_gaps_through_prev_close() {
        // A gap from 60k to 66k dwarfs the bar's own 400-point range.
        let mut candles = flat_tape(60_000.0, 200.0, 4);
        candles.push(candle(66_000.0, 66_200.0, 65_800.0, 66_000.0));
        let atr = calculate_atr(&candles, 4).unwrap();
        assert!(atr > 1_000.0, "gap should dominate the ATR, got {atr}");
    }

    #[test]
    fn atr_decays_after_a_volatility_burst() {
        // Wide bars followed by a calm stretch: smoothing pulls ATR down.
        let mut candles = flat_tape(60_000.0, 1_000.0, 15);
        candles.extend(flat_tape(60_000.0, 100.0, 15));
        let burst = calculate_atr(&candles[..15], 14).unwrap();
        let settled = calculate_atr(&candles, 14).unwrap();
        assert!(settled < burst, "ATR must decay: {settled} !< {burst}");
    }

    #[test]
    fn atr_nan_poisons_to_none() {
        let mut candles = flat_tape(60_000.0, 400.0, 6);
        candles[2].high = f64::NAN;
        assert!(calculate_atr(&candles, 4).is_none());
    }

    // ---- percent form ------------------------------------------------------

    #[test]
    fn atr_pct_is_scale_free() {
        // 800-point range on a 60k close: 1.33%, the MEDIUM volatility band.
        let pct = calculate_atr_pct(&flat_tape(60_000.0, 400.0, 30), 14).unwrap();
        assert!((pct - 800.0 / 60_000.0 * 100.0).abs() < 1e-6);

        // Same relative range at a tenth the price reads the same percent.
        let pct_small = calculate_atr_pct(&flat_tape(6_000.0, 40.0, 30), 14).unwrap();
        assert!((pct - pct_small).abs() < 1e-6);
    }

    #[test]
    fn atr_pct_none_on_zero_close() {
        let candles: Vec<Candle> = (0..20).map(|_| candle(0.0, 0.0, 0.0, 0.0)).collect();
        assert!(calculate_atr_pct(&candles, 14).is_none());
    }
}
