use crate::indicators::calculate_atr_from_bars;
use crate::models::{Bar, Decision, LongTermTrend, TradeDirection, TrendType};

/// Create a no-signal decision (default when nothing fires)
pub fn no_signal() -> Decision {
    Decision::NoSignal
}

/// Create a long entry with the given score, stop hint and evidence
pub fn enter_long(score: f64, stop_distance_hint: Option<f64>, evidence: Vec<String>) -> Decision {
    Decision::enter(TradeDirection::Long, score, stop_distance_hint, evidence)
}

/// Create a short entry with the given score, stop hint and evidence
pub fn enter_short(score: f64, stop_distance_hint: Option<f64>, evidence: Vec<String>) -> Decision {
    Decision::enter(TradeDirection::Short, score, stop_distance_hint, evidence)
}

/// ATR of the window's last bar times `multiplier`; `None` when it would be zero.
pub fn atr_stop_hint(window: &[Bar], period: usize, multiplier: f64) -> Option<f64> {
    let last = window.len().checked_sub(1)?;
    calculate_atr_from_bars(window, last, period)
        .map(|atr| atr * multiplier)
        .filter(|distance| distance.is_finite() && *distance > 0.0)
}

/// Extra score points when the market and instrument trends agree with `direction`.
pub fn trend_alignment_points(
    direction: TradeDirection,
    market_trend: TrendType,
    long_term_trend: Option<&LongTermTrend>,
    evidence: &mut Vec<String>,
) -> f64 {
    let favourable = match direction {
        TradeDirection::Long => TrendType::Bullish,
        TradeDirection::Short => TrendType::Bearish,
    };

    let mut points = 0.0;
    if market_trend == favourable {
        points += 2.0;
        evidence.push(format!("Market trend {}", market_trend));
    }
    if let Some(trend) = long_term_trend.filter(|t| t.trend == favourable) {
        points += 2.0;
        evidence.push(format!(
            "Long-term trend {} (close {:.2} vs SMA{} {:.2})",
            trend.trend, trend.close, trend.sma_period, trend.sma
        ));
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn atr_hint_is_none_for_flat_or_empty_windows() {
        assert_eq!(atr_stop_hint(&[], 14, 2.0), None);

        let base = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        let flat: Vec<Bar> = (0..5)
            .map(|i| Bar {
                ticker: "AAA".to_string(),
                timestamp: base + Duration::hours(i),
                open: 10.0,
                high: 10.0,
                low: 10.0,
                close: 10.0,
                volume: 1,
                indicators: BTreeMap::new(),
            })
            .collect();
        assert_eq!(atr_stop_hint(&flat, 3, 2.0), None);
    }

    #[test]
    fn alignment_rewards_matching_trends() {
        let mut evidence = Vec::new();
        let long_term = LongTermTrend {
            trend: TrendType::Bullish,
            close: 12.0,
            sma: 10.0,
            sma_period: 50,
        };
        let points = trend_alignment_points(
            TradeDirection::Long,
            TrendType::Bullish,
            Some(&long_term),
            &mut evidence,
        );
        assert_eq!(points, 4.0);
        assert_eq!(evidence.len(), 2);

        let mut evidence = Vec::new();
        let points = trend_alignment_points(
            TradeDirection::Short,
            TrendType::Bullish,
            Some(&long_term),
            &mut evidence,
        );
        assert_eq!(points, 0.0);
        assert!(evidence.is_empty());
    }
}
