// =============================================================================
// Relative Strength Index (RSI) — Wilder smoothing over close-to-close moves
// =============================================================================
//
// Two consumers, two very different windows:
//   - The technical agent reads RSI(14) from 5-minute candle closes.
//   - The rule engine reads RSI(5) from its rolling 20-tick price buffer on
//     every evaluation pass, so the short-period path is the hot one.
//
// Computation:
//   seed  — simple mean of the first `period` gains / losses
//   then  — avg = (prev_avg * (period - 1) + current) / period   (Wilder)
//   RSI   = 100 - 100 / (1 + avg_gain / avg_loss)
// =============================================================================

/// Compute the RSI series over `closes` for the given `period`.
///
/// The result carries one value per close from index `period` onward
/// (`closes.len() - period` values); the first `period + 1` closes are
/// consumed seeding the averages. Too little data, or a zero period, yields
/// an empty series. A non-finite intermediate truncates the series.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    // Seed the averages with a simple mean over the first `period` moves.
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in closes.windows(2).take(period) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gain_sum += delta;
        } else {
            loss_sum -= delta;
        }
    }

    let period_f = period as f64;
    let mut avg_gain = gain_sum / period_f;
    let mut avg_loss = loss_sum / period_f;

    let mut series = Vec::with_capacity(closes.len() - period);
    match rsi_value(avg_gain, avg_loss) {
        Some(first) => series.push(first),
        None => return series,
    }

    // Wilder smoothing over the remaining moves.
    for pair in closes.windows(2).skip(period) {
        let delta = pair[1] - pair[0];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(rsi) => series.push(rsi),
            None => break,
        }
    }

    series
}

/// Most recent RSI value, or `None` when the buffer is too short.
///
/// This is the shape every call site wants: the rule engine's per-tick
/// RSI(5), the technical agent's RSI(14), and the planner's context line
/// all read only the tail of the series.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

/// RSI from the smoothed averages, in [0, 100].
///
/// A flat tape (no gains, no losses) reads 50; a gains-only tape pegs at
/// 100. Non-finite results return `None`.
fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if avg_gain == 0.0 && avg_loss == 0.0 {
        return Some(50.0);
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    rsi.is_finite().then_some(rsi)
}
