use crate::models::Bar;

/// Retracement levels in percent of the high-low range, measured up from the low.
pub const FIBONACCI_LEVELS: [f64; 6] = [0.0, 23.6, 38.2, 50.0, 61.8, 100.0];

/// Wilder smoothing forgets its seed after roughly this many periods.
pub const RSI_WARMUP_PERIODS: usize = 10;

pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 {
        return vec![prices[0]; prices.len()];
    }
    if period == 1 {
        return prices.to_vec();
    }
    if prices.len() < period {
        return vec![prices[0]; prices.len()];
    }

    let mut sma_values = Vec::with_capacity(prices.len());
    for _ in 0..period - 1 {
        sma_values.push(prices[0]);
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(window_sum / period as f64);
    }

    sma_values
}

/// Simple average of the last `period` closes, `None` when the window is shorter.
pub fn latest_sma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: f64 = bars[bars.len() - period..].iter().map(|b| b.close).sum();
    Some(sum / period as f64)
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder-smoothed RSI; positions before the first full period read 50.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 || prices.len() < period + 1 {
        return vec![50.0; prices.len()];
    }

    let mut rsi_values = vec![50.0; prices.len()];
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    rsi_values
}

pub fn latest_rsi(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let tail_len = period.saturating_mul(RSI_WARMUP_PERIODS).saturating_add(1);
    let tail = &bars[bars.len().saturating_sub(tail_len)..];
    let closes: Vec<f64> = tail.iter().map(|b| b.close).collect();
    calculate_rsi(&closes, period).last().copied()
}

/// Average true range over the `period` bars ending at `index`.
pub fn calculate_atr_from_bars(bars: &[Bar], index: usize, period: usize) -> Option<f64> {
    if index >= bars.len() {
        return None;
    }
    if period == 0 || index == 0 {
        return Some(0.0);
    }

    let start = index.saturating_sub(period.saturating_sub(1));
    let mut true_ranges: Vec<f64> = Vec::with_capacity(index - start + 1);
    for i in start..=index {
        let bar = &bars[i];
        let prev_close = if i > 0 { bars[i - 1].close } else { bar.close };
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }

    Some(true_ranges.iter().sum::<f64>() / true_ranges.len() as f64)
}

/// Key used for a retracement level in auxiliary maps, e.g. `fib_61_8`.
pub fn fibonacci_key(level: f64) -> String {
    let formatted = format!("{}", level);
    format!("fib_{}", formatted.replace('.', "_"))
}

/// Retracement prices over the last `lookback` bars, keyed by [`fibonacci_key`].
pub fn calculate_fibonacci_levels(bars: &[Bar], lookback: usize) -> Vec<(String, f64)> {
    if bars.is_empty() {
        return Vec::new();
    }
    let start = bars.len().saturating_sub(lookback.max(1));
    let window = &bars[start..];
    let high = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    if !high.is_finite() || !low.is_finite() {
        return Vec::new();
    }
    let range = high - low;

    FIBONACCI_LEVELS
        .iter()
        .map(|&level| (fibonacci_key(level), low + range * level / 100.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                ticker: "AAA".to_string(),
                timestamp: base + Duration::hours(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000,
                indicators: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn sma_pads_with_first_price() {
        let sma = calculate_sma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(sma, vec![1.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn latest_sma_requires_full_window() {
        let bars = bars_from_closes(&[10.0, 20.0, 30.0]);
        assert_eq!(latest_sma(&bars, 2), Some(25.0));
        assert_eq!(latest_sma(&bars, 4), None);
    }

    #[test]
    fn rsi_saturates_on_monotonic_series() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(calculate_rsi(&rising, 14).last().copied(), Some(100.0));
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert_eq!(calculate_rsi(&falling, 14).last().copied(), Some(0.0));
        assert_eq!(latest_rsi(&bars_from_closes(&[1.0, 2.0]), 14), None);
    }

    #[test]
    fn latest_rsi_reads_only_the_warmup_tail() {
        let closes: Vec<f64> = (0..600)
            .map(|i| 100.0 + 8.0 * (i as f64 / 9.0).sin() + 0.02 * i as f64)
            .collect();
        let bars = bars_from_closes(&closes);
        let period = 14;
        let tail_start = closes.len() - (period * RSI_WARMUP_PERIODS + 1);

        let latest = latest_rsi(&bars, period).unwrap();
        let from_tail = calculate_rsi(&closes[tail_start..], period).last().copied().unwrap();
        let from_full = calculate_rsi(&closes, period).last().copied().unwrap();
        assert_eq!(latest, from_tail);
        assert!((latest - from_full).abs() < 0.01);

        // earlier bars cannot move the value once the tail is fixed
        let mut shifted = closes.clone();
        for close in shifted.iter_mut().take(tail_start) {
            *close += 40.0;
        }
        assert_eq!(latest_rsi(&bars_from_closes(&shifted), period), Some(latest));
    }

    #[test]
    fn atr_averages_true_range() {
        let bars = bars_from_closes(&[10.0, 10.0, 10.0, 10.0]);
        let atr = calculate_atr_from_bars(&bars, 3, 3).unwrap();
        assert!((atr - 2.0).abs() < 1e-12);
        assert_eq!(calculate_atr_from_bars(&bars, 10, 3), None);
    }

    #[test]
    fn fibonacci_levels_span_low_to_high() {
        let bars = bars_from_closes(&[50.0, 60.0, 70.0]);
        let levels = calculate_fibonacci_levels(&bars, 200);
        assert_eq!(levels.len(), FIBONACCI_LEVELS.len());
        assert_eq!(levels[0], ("fib_0".to_string(), 49.0));
        assert_eq!(levels[5], ("fib_100".to_string(), 71.0));
        let (key, value) = &levels[4];
        assert_eq!(key, "fib_61_8");
        assert!((value - (49.0 + 22.0 * 0.618)).abs() < 1e-9);
    }
}
