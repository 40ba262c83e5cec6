use crate::error::StrategyError;
use crate::indicators::calculate_sma;
use crate::models::{Bar, Decision, LongTermTrend, TradeDirection, TrendType};
use crate::param_utils::{finite_param, get_param_f64, get_param_usize_rounded_clamped};
use crate::strategy_utils::{atr_stop_hint, enter_long, no_signal, trend_alignment_points};
use anyhow::{ensure, Result};
use std::collections::{BTreeMap, HashMap};

const BASE_SCORE: f64 = 9.0;

/// Goes long when the fast moving average crosses above the slow one,
/// unless the broad market is bearish.
pub struct SmaTrendStrategy {
    fast_period: usize,
    slow_period: usize,
    atr_period: usize,
    atr_multiplier: f64,
    min_score: Option<f64>,
}

impl SmaTrendStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Result<Self> {
        let fast_period = get_param_usize_rounded_clamped(&parameters, "fastPeriod", 20, 2, 400);
        let slow_period = get_param_usize_rounded_clamped(&parameters, "slowPeriod", 50, 3, 400);
        let atr_period = get_param_usize_rounded_clamped(&parameters, "atrPeriod", 14, 1, 200);
        let atr_multiplier = get_param_f64(&parameters, "atrMultiplier", 2.0);
        let min_score = finite_param(&parameters, "minScore");

        ensure!(
            fast_period < slow_period,
            "fastPeriod ({}) must be shorter than slowPeriod ({})",
            fast_period,
            slow_period
        );
        ensure!(
            atr_multiplier.is_finite() && atr_multiplier > 0.0,
            "atrMultiplier must be positive (value: {})",
            atr_multiplier
        );

        Ok(Self {
            fast_period,
            slow_period,
            atr_period,
            atr_multiplier,
            min_score,
        })
    }
}

impl super::SignalStrategy for SmaTrendStrategy {
    fn id(&self) -> &str {
        "sma_trend"
    }

    fn min_history(&self) -> usize {
        (self.slow_period + 1).max(self.atr_period + 1)
    }

    fn decide(
        &self,
        window: &[Bar],
        _ticker: &str,
        market_trend: TrendType,
        long_term_trend: Option<&LongTermTrend>,
        auxiliary: &BTreeMap<String, f64>,
    ) -> Result<Decision, StrategyError> {
        if window.len() < self.min_history() {
            return Err(StrategyError::InsufficientData {
                required: self.min_history(),
                available: window.len(),
            });
        }
        if market_trend == TrendType::Bearish {
            return Ok(no_signal());
        }

        // Only the tail matters; slow_period + 1 closes give the previous and current averages.
        let tail = &window[window.len() - (self.slow_period + 1)..];
        let closes: Vec<f64> = tail.iter().map(|b| b.close).collect();
        let fast = calculate_sma(&closes, self.fast_period);
        let slow = calculate_sma(&closes, self.slow_period);
        let n = closes.len();
        let (fast_prev, fast_now) = (fast[n - 2], fast[n - 1]);
        let (slow_prev, slow_now) = (slow[n - 2], slow[n - 1]);

        if !(fast_prev <= slow_prev && fast_now > slow_now) {
            return Ok(no_signal());
        }

        let mut evidence = vec![format!(
            "SMA{} crossed above SMA{} ({:.2} > {:.2})",
            self.fast_period, self.slow_period, fast_now, slow_now
        )];
        let mut score = BASE_SCORE;
        score += trend_alignment_points(
            TradeDirection::Long,
            market_trend,
            long_term_trend,
            &mut evidence,
        );

        let close = closes[n - 1];
        if let Some(&support) = auxiliary.get("fib_38_2") {
            if close >= support {
                score += 1.0;
                evidence.push(format!("Holding above 38.2% retracement ({:.2})", support));
            }
        }

        if let Some(min_score) = self.min_score {
            if score < min_score {
                return Ok(no_signal());
            }
        }

        let stop_hint = atr_stop_hint(window, self.atr_period, self.atr_multiplier);
        Ok(enter_long(score, stop_hint, evidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SignalStrategy;
    use chrono::{Duration, TimeZone, Utc};

    fn params(fast: f64, slow: f64) -> HashMap<String, f64> {
        let mut params = HashMap::new();
        params.insert("fastPeriod".to_string(), fast);
        params.insert("slowPeriod".to_string(), slow);
        params.insert("atrPeriod".to_string(), 3.0);
        params
    }

    fn window(closes: &[f64]) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                ticker: "AAA".to_string(),
                timestamp: base + Duration::days(i as i64),
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
    fn crossover_enters_long() {
        let strategy = SmaTrendStrategy::new(params(2.0, 4.0)).unwrap();
        // fast(2) <= slow(4) on the previous bar, above it on the last
        let bars = window(&[10.0, 10.0, 10.0, 9.0, 9.0, 12.0]);
        let mut auxiliary = BTreeMap::new();
        auxiliary.insert("fib_38_2".to_string(), 10.0);

        let decision = strategy
            .decide(&bars, "AAA", TrendType::Bullish, None, &auxiliary)
            .unwrap();
        let Decision::Enter(signal) = decision else {
            panic!("expected entry, got {:?}", decision);
        };
        assert_eq!(signal.direction, TradeDirection::Long);
        assert!((signal.confidence_score - 12.0).abs() < 1e-9);
        assert!(signal.stop_distance_hint.is_some());
    }

    #[test]
    fn bearish_market_blocks_entries() {
        let strategy = SmaTrendStrategy::new(params(2.0, 4.0)).unwrap();
        let bars = window(&[10.0, 10.0, 10.0, 9.0, 9.0, 12.0]);
        let decision = strategy
            .decide(&bars, "AAA", TrendType::Bearish, None, &BTreeMap::new())
            .unwrap();
        assert_eq!(decision, Decision::NoSignal);
    }

    #[test]
    fn no_cross_means_no_signal() {
        let strategy = SmaTrendStrategy::new(params(2.0, 4.0)).unwrap();
        let bars = window(&[10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        let decision = strategy
            .decide(&bars, "AAA", TrendType::Neutral, None, &BTreeMap::new())
            .unwrap();
        assert_eq!(decision, Decision::NoSignal);
    }

    #[test]
    fn min_score_filters_weak_crosses() {
        let mut p = params(2.0, 4.0);
        p.insert("minScore".to_string(), 15.0);
        let strategy = SmaTrendStrategy::new(p).unwrap();
        let bars = window(&[10.0, 10.0, 10.0, 9.0, 9.0, 12.0]);
        let decision = strategy
            .decide(&bars, "AAA", TrendType::Neutral, None, &BTreeMap::new())
            .unwrap();
        assert_eq!(decision, Decision::NoSignal);
    }

    #[test]
    fn fast_must_be_shorter_than_slow() {
        assert!(SmaTrendStrategy::new(params(50.0, 20.0)).is_err());
    }
}
