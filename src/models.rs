use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One instrument's OHLCV sample at one timestamp, plus any precomputed indicator fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
}

impl Bar {
    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators
            .get(name)
            .copied()
            .filter(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BarInterval {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
}

impl BarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarInterval::Hour => "1h",
            BarInterval::Day => "1d",
        }
    }
}

impl fmt::Display for BarInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarInterval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> AnyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1h" | "hour" | "hourly" => Ok(BarInterval::Hour),
            "1d" | "day" | "daily" => Ok(BarInterval::Day),
            other => Err(anyhow!("Unsupported data interval: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            TradeDirection::Long => 1.0,
            TradeDirection::Short => -1.0,
        }
    }
}

impl FromStr for TradeDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> AnyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(TradeDirection::Long),
            "short" | "sell" => Ok(TradeDirection::Short),
            other => Err(anyhow!("Invalid trade direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
    StopLoss,
    TakeProfit,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::StopLoss => "STOP_LOSS",
            TradeStatus::TakeProfit => "TAKE_PROFIT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Open)
    }
}

/// Coarse market classification produced by a trend provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendType {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl TrendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendType::Bullish => "BULLISH",
            TrendType::Bearish => "BEARISH",
            TrendType::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for TrendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instrument trend from a single moving average, with the values it was derived from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LongTermTrend {
    pub trend: TrendType,
    pub close: f64,
    pub sma: f64,
    pub sma_period: usize,
}

/// Entry request returned by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub direction: TradeDirection,
    /// Points scale shared with the signal-strength analysis (weak < 10, medium < 15).
    pub confidence_score: f64,
    /// Suggested distance from entry to stop, in price units.
    pub stop_distance_hint: Option<f64>,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoSignal,
    Enter(EntrySignal),
}

impl Decision {
    pub fn enter(
        direction: TradeDirection,
        confidence_score: f64,
        stop_distance_hint: Option<f64>,
        evidence: Vec<String>,
    ) -> Self {
        Decision::Enter(EntrySignal {
            direction,
            confidence_score,
            stop_distance_hint,
            evidence,
        })
    }
}

/// One portfolio-value sample per simulated timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub portfolio_value: f64,
    pub cash: f64,
    pub open_positions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_parses_aliases() {
        assert_eq!("1h".parse::<BarInterval>().unwrap(), BarInterval::Hour);
        assert_eq!("Daily".parse::<BarInterval>().unwrap(), BarInterval::Day);
        assert!("5m".parse::<BarInterval>().is_err());
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&TradeStatus::TakeProfit).unwrap();
        assert_eq!(json, "\"TAKE_PROFIT\"");
        assert!(TradeStatus::StopLoss.is_terminal());
        assert!(!TradeStatus::Open.is_terminal());
    }

    #[test]
    fn bar_indicator_skips_non_finite_values() {
        let mut bar = Bar {
            ticker: "AAA".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0,
            indicators: BTreeMap::new(),
        };
        bar.indicators.insert("RSI_14".to_string(), 42.0);
        bar.indicators.insert("BROKEN".to_string(), f64::NAN);
        assert_eq!(bar.indicator("RSI_14"), Some(42.0));
        assert_eq!(bar.indicator("BROKEN"), None);
        assert_eq!(bar.indicator("MISSING"), None);
    }
}
