//! Average True Range (ATR) over daily bars
//!
//! True Range is the greatest of:
//! - Current High - Current Low
//! - Abs(Current High - Previous Close)
//! - Abs(Current Low - Previous Close)
//!
//! The engine uses a plain mean of the most recent true ranges. ATR only scales the
//! breakout probability score, so it must never be zero.

use crate::models::Candle;

/// Default ATR period (daily bars)
pub const ATR_PERIOD: usize = 14;

/// Fallback used when there is not enough daily history
pub const DEFAULT_ATR: f64 = 50.0;

/// True range of each candle against the previous close
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let high = pair[1].high;
            let low = pair[1].low;
            let prev_close = pair[0].close;

            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}

/// Mean true range over the last `period` true ranges
///
/// Returns None with fewer than 2 candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < 2 || period == 0 {
        return None;
    }

    let start = candles.len().saturating_sub(period + 1);
    let ranges = true_ranges(&candles[start..]);
    if ranges.is_empty() {
        return None;
    }

    Some(ranges.iter().sum::<f64>() / ranges.len() as f64)
}

/// ATR with a fixed fallback for short or flat history
pub fn atr_or_default(candles: &[Candle], period: usize, fallback: f64) -> f64 {
    match calculate_atr(candles, period) {
        Some(atr) if atr > 0.0 => atr,
        _ => fallback,
    }
}
