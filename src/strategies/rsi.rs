use crate::error::StrategyError;
use crate::indicators;
use crate::models::{Bar, Decision, LongTermTrend, TradeDirection, TrendType};
use crate::param_utils::{
    coerce_binary_param, get_param_f64, get_param_f64_clamped, get_param_usize_rounded_clamped,
};
use crate::strategy_utils::{
    atr_stop_hint, enter_long, enter_short, no_signal, trend_alignment_points,
};
use anyhow::{ensure, Result};
use std::collections::{BTreeMap, HashMap};

/// Base score for an RSI extreme; distance past the threshold and trend agreement add to it.
const BASE_SCORE: f64 = 8.0;

pub struct RsiReversionStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
    atr_period: usize,
    atr_multiplier: f64,
    allow_short: bool,
}

impl RsiReversionStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Result<Self> {
        let period = get_param_usize_rounded_clamped(&parameters, "rsiPeriod", 14, 2, 200);
        let oversold_level = get_param_f64_clamped(&parameters, "oversold", 30.0, 1.0, 99.0);
        let overbought_level = get_param_f64_clamped(&parameters, "overbought", 70.0, 1.0, 99.0);
        let atr_period = get_param_usize_rounded_clamped(&parameters, "atrPeriod", 14, 1, 200);
        let atr_multiplier = get_param_f64(&parameters, "atrMultiplier", 2.0);
        let allow_short =
            coerce_binary_param(get_param_f64(&parameters, "allowShort", 0.0), 0.0) > 0.5;

        ensure!(
            oversold_level < overbought_level,
            "oversold ({}) must be below overbought ({})",
            oversold_level,
            overbought_level
        );
        ensure!(
            atr_multiplier.is_finite() && atr_multiplier > 0.0,
            "atrMultiplier must be positive (value: {})",
            atr_multiplier
        );

        Ok(Self {
            period,
            oversold_level,
            overbought_level,
            atr_period,
            atr_multiplier,
            allow_short,
        })
    }

    fn current_rsi(&self, window: &[Bar]) -> Option<f64> {
        let precomputed = format!("RSI_{}", self.period);
        window
            .last()
            .and_then(|bar| bar.indicator(&precomputed))
            .or_else(|| indicators::latest_rsi(window, self.period))
    }
}

impl super::SignalStrategy for RsiReversionStrategy {
    fn id(&self) -> &str {
        "rsi_reversion"
    }

    fn min_history(&self) -> usize {
        (self.period + 1).max(self.atr_period + 1)
    }

    fn decide(
        &self,
        window: &[Bar],
        _ticker: &str,
        market_trend: TrendType,
        long_term_trend: Option<&LongTermTrend>,
        _auxiliary: &BTreeMap<String, f64>,
    ) -> Result<Decision, StrategyError> {
        if window.len() < self.min_history() {
            return Err(StrategyError::InsufficientData {
                required: self.min_history(),
                available: window.len(),
            });
        }
        let rsi = self.current_rsi(window).ok_or_else(|| {
            StrategyError::Computation(format!("RSI({}) unavailable", self.period))
        })?;

        let direction = if rsi <= self.oversold_level {
            TradeDirection::Long
        } else if self.allow_short && rsi >= self.overbought_level {
            TradeDirection::Short
        } else {
            return Ok(no_signal());
        };

        let (distance, label) = match direction {
            TradeDirection::Long => (self.oversold_level - rsi, "oversold"),
            TradeDirection::Short => (rsi - self.overbought_level, "overbought"),
        };
        let mut evidence = vec![format!("RSI {} ({:.1})", label, rsi)];
        let mut score = BASE_SCORE + (distance / 2.0).min(5.0);
        score += trend_alignment_points(direction, market_trend, long_term_trend, &mut evidence);

        let stop_hint = atr_stop_hint(window, self.atr_period, self.atr_multiplier);
        Ok(match direction {
            TradeDirection::Long => enter_long(score, stop_hint, evidence),
            TradeDirection::Short => enter_short(score, stop_hint, evidence),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SignalStrategy;
    use chrono::{Duration, TimeZone, Utc};

    fn window(closes: &[f64]) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                ticker: "AAA".to_string(),
                timestamp: base + Duration::hours(i as i64),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 1_000,
                indicators: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn oversold_window_enters_long_with_stop_hint() {
        let strategy = RsiReversionStrategy::new(HashMap::new()).unwrap();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let decision = strategy
            .decide(
                &window(&closes),
                "AAA",
                TrendType::Neutral,
                None,
                &BTreeMap::new(),
            )
            .unwrap();

        let Decision::Enter(signal) = decision else {
            panic!("expected entry, got {:?}", decision);
        };
        assert_eq!(signal.direction, TradeDirection::Long);
        assert!((signal.confidence_score - 13.0).abs() < 1e-9);
        assert!(signal.stop_distance_hint.unwrap() > 0.0);
        assert!(signal.evidence[0].contains("oversold"));
    }

    #[test]
    fn precomputed_indicator_takes_precedence() {
        let strategy = RsiReversionStrategy::new(HashMap::new()).unwrap();
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let mut bars = window(&closes);
        if let Some(last) = bars.last_mut() {
            last.indicators.insert("RSI_14".to_string(), 55.0);
        }
        let decision = strategy
            .decide(&bars, "AAA", TrendType::Neutral, None, &BTreeMap::new())
            .unwrap();
        assert_eq!(decision, Decision::NoSignal);
    }

    #[test]
    fn overbought_needs_short_permission() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let bars = window(&closes);

        let long_only = RsiReversionStrategy::new(HashMap::new()).unwrap();
        let decision = long_only
            .decide(&bars, "AAA", TrendType::Bearish, None, &BTreeMap::new())
            .unwrap();
        assert_eq!(decision, Decision::NoSignal);

        let mut params = HashMap::new();
        params.insert("allowShort".to_string(), 1.0);
        let with_shorts = RsiReversionStrategy::new(params).unwrap();
        let decision = with_shorts
            .decide(&bars, "AAA", TrendType::Bearish, None, &BTreeMap::new())
            .unwrap();
        let Decision::Enter(signal) = decision else {
            panic!("expected short entry");
        };
        assert_eq!(signal.direction, TradeDirection::Short);
        assert!((signal.confidence_score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn short_window_is_an_error() {
        let strategy = RsiReversionStrategy::new(HashMap::new()).unwrap();
        let err = strategy
            .decide(
                &window(&[1.0, 2.0]),
                "AAA",
                TrendType::Neutral,
                None,
                &BTreeMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, StrategyError::InsufficientData { .. }));
    }

    #[test]
    fn inverted_levels_are_rejected() {
        let mut params = HashMap::new();
        params.insert("oversold".to_string(), 80.0);
        params.insert("overbought".to_string(), 20.0);
        assert!(RsiReversionStrategy::new(params).is_err());
    }
}
