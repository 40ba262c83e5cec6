use crate::error::StrategyError;
use crate::models::{Bar, Decision, LongTermTrend, TrendType};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

/// Signal-generation plugin driven by the engine.
///
/// `decide` sees bars up to and including the current simulated timestamp and must
/// not depend on anything else that could leak future data. Errors are treated by
/// the engine as "no signal" for that instrument at that timestamp.
pub trait SignalStrategy {
    fn id(&self) -> &str;

    /// Bars the window must hold before `decide` is consulted.
    fn min_history(&self) -> usize;

    fn decide(
        &self,
        window: &[Bar],
        ticker: &str,
        market_trend: TrendType,
        long_term_trend: Option<&LongTermTrend>,
        auxiliary: &BTreeMap<String, f64>,
    ) -> Result<Decision, StrategyError>;
}

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RsiReversionStrategy;

#[path = "strategies/sma_trend.rs"]
pub mod sma_trend;

pub use sma_trend::SmaTrendStrategy;

#[path = "strategies/buy_and_hold.rs"]
pub mod buy_and_hold;

pub use buy_and_hold::BuyAndHoldStrategy;

const STRATEGY_IDS: [&str; 3] = ["buy_and_hold", "rsi_reversion", "sma_trend"];

pub fn available_strategies() -> &'static [&'static str] {
    &STRATEGY_IDS
}

pub fn create_strategy(
    strategy_id: &str,
    parameters: HashMap<String, f64>,
) -> Result<Box<dyn SignalStrategy + Send + Sync>> {
    match strategy_id {
        "rsi_reversion" => Ok(Box::new(RsiReversionStrategy::new(parameters)?)),
        "sma_trend" => Ok(Box::new(SmaTrendStrategy::new(parameters)?)),
        "buy_and_hold" => Ok(Box::new(BuyAndHoldStrategy::new(parameters))),
        _ => Err(anyhow::anyhow!("Unknown strategy: {}", strategy_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds_every_listed_strategy() {
        for id in available_strategies() {
            let strategy = create_strategy(id, HashMap::new()).unwrap();
            assert_eq!(strategy.id(), *id);
        }
    }

    #[test]
    fn registry_rejects_unknown_id() {
        let err = create_strategy("martingale", HashMap::new())
            .err()
            .expect("unknown id must fail");
        assert!(err.to_string().contains("martingale"));
    }
}
