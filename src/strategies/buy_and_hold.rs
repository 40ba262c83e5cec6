use crate::error::StrategyError;
use crate::models::{Bar, Decision, LongTermTrend, TrendType};
use crate::strategy_utils::enter_long;
use std::collections::{BTreeMap, HashMap};

/// Enters every instrument on its first evaluable bar and never exits on its own.
pub struct BuyAndHoldStrategy {
    score: f64,
}

impl BuyAndHoldStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        let score = parameters
            .get("score")
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(10.0);
        Self { score }
    }
}

impl super::SignalStrategy for BuyAndHoldStrategy {
    fn id(&self) -> &str {
        "buy_and_hold"
    }

    fn min_history(&self) -> usize {
        1
    }

    fn decide(
        &self,
        _window: &[Bar],
        _ticker: &str,
        _market_trend: TrendType,
        _long_term_trend: Option<&LongTermTrend>,
        _auxiliary: &BTreeMap<String, f64>,
    ) -> Result<Decision, StrategyError> {
        // Do not gate this on trend or history; the engine only asks while no position is open.
        Ok(enter_long(
            self.score,
            None,
            vec!["Buy and hold".to_string()],
        ))
    }
}
