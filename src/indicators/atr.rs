// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the Wilder-smoothed average of TR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use crate::venue::Kline;

/// Most recent ATR over `klines` (oldest first).
///
/// Returns `None` when `period` is zero, when fewer than `period + 1` klines
/// are available (each TR needs a previous close), or when any intermediate
/// value is non-finite.
pub fn atr(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < period + 1 {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(klines.len() - 1);
    for pair in klines.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }

    let period_f = period as f64;
    let mut value = true_ranges[..period].iter().sum::<f64>() / period_f;
    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    value.is_finite().then_some(value)
}

/// ATR expressed as a fraction of the latest close; used to scale the dynamic
/// grid interval across assets with different price scales.
pub fn atr_fraction(klines: &[Kline], period: usize) -> Option<f64> {
    let value = atr(klines, period)?;
    let last_close = klines.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(value / last_close)
}
