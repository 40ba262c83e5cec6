use crate::models::BarInterval;
use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SETTING_INITIAL_CAPITAL: &str = "BACKTEST_INITIAL_CAPITAL";
pub const SETTING_COMMISSION_RATE: &str = "BACKTEST_COMMISSION_RATE";
pub const SETTING_RISK_PER_TRADE: &str = "BACKTEST_RISK_PER_TRADE";
pub const SETTING_DATA_INTERVAL: &str = "BACKTEST_DATA_INTERVAL";
pub const SETTING_MARKET_INDEX: &str = "BACKTEST_MARKET_INDEX";
pub const SETTING_LOOKBACK_BUFFER_DAYS: &str = "BACKTEST_LOOKBACK_BUFFER_DAYS";
pub const SETTING_MIN_HISTORY_BARS: &str = "BACKTEST_MIN_HISTORY_BARS";
pub const SETTING_MARKET_TREND_SMA: &str = "BACKTEST_MARKET_TREND_SMA";
pub const SETTING_LONG_TERM_TREND_SMA: &str = "BACKTEST_LONG_TERM_TREND_SMA";
pub const SETTING_FIBONACCI_LOOKBACK: &str = "BACKTEST_FIBONACCI_LOOKBACK";
pub const SETTING_TAKE_PROFIT_MULTIPLE: &str = "BACKTEST_TAKE_PROFIT_MULTIPLE";

const SETTING_KEYS: [&str; 11] = [
    SETTING_INITIAL_CAPITAL,
    SETTING_COMMISSION_RATE,
    SETTING_RISK_PER_TRADE,
    SETTING_DATA_INTERVAL,
    SETTING_MARKET_INDEX,
    SETTING_LOOKBACK_BUFFER_DAYS,
    SETTING_MIN_HISTORY_BARS,
    SETTING_MARKET_TREND_SMA,
    SETTING_LONG_TERM_TREND_SMA,
    SETTING_FIBONACCI_LOOKBACK,
    SETTING_TAKE_PROFIT_MULTIPLE,
];

/// Run-wide settings for one backtest; recorded into every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    pub commission_rate: f64,
    pub risk_per_trade: f64,
    pub data_interval: BarInterval,
    /// Market-breadth reference instrument; the run fails without its data.
    pub market_index_ticker: String,
    /// Calendar days loaded before the start date so indicators have history.
    pub lookback_buffer_days: i64,
    pub min_history_bars: usize,
    pub market_trend_sma_period: usize,
    pub long_term_trend_sma_period: usize,
    pub fibonacci_lookback: usize,
    /// Take-profit distance as a multiple of the stop distance.
    pub take_profit_risk_multiple: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            commission_rate: 0.001,
            risk_per_trade: 0.02,
            data_interval: BarInterval::Hour,
            market_index_ticker: "^GSPC".to_string(),
            lookback_buffer_days: 200,
            min_history_bars: 60,
            market_trend_sma_period: 200,
            long_term_trend_sma_period: 50,
            fibonacci_lookback: 200,
            take_profit_risk_multiple: 2.0,
        }
    }
}

impl BacktestConfig {
    /// Builds a config from string settings; absent keys keep their defaults.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let data_interval = match setting_value(settings, SETTING_DATA_INTERVAL) {
            Some(raw) => raw.parse::<BarInterval>()?,
            None => defaults.data_interval,
        };
        let market_index_ticker = setting_value(settings, SETTING_MARKET_INDEX)
            .map(|raw| raw.to_uppercase())
            .unwrap_or(defaults.market_index_ticker);

        let config = Self {
            initial_capital: optional_setting_f64(
                settings,
                SETTING_INITIAL_CAPITAL,
                defaults.initial_capital,
                Some(0.0),
                None,
            )?,
            commission_rate: optional_setting_f64(
                settings,
                SETTING_COMMISSION_RATE,
                defaults.commission_rate,
                Some(0.0),
                Some(1.0),
            )?,
            risk_per_trade: optional_setting_f64(
                settings,
                SETTING_RISK_PER_TRADE,
                defaults.risk_per_trade,
                Some(0.0),
                Some(1.0),
            )?,
            data_interval,
            market_index_ticker,
            lookback_buffer_days: optional_setting_usize(
                settings,
                SETTING_LOOKBACK_BUFFER_DAYS,
                defaults.lookback_buffer_days as usize,
                0,
            )? as i64,
            min_history_bars: optional_setting_usize(
                settings,
                SETTING_MIN_HISTORY_BARS,
                defaults.min_history_bars,
                1,
            )?,
            market_trend_sma_period: optional_setting_usize(
                settings,
                SETTING_MARKET_TREND_SMA,
                defaults.market_trend_sma_period,
                1,
            )?,
            long_term_trend_sma_period: optional_setting_usize(
                settings,
                SETTING_LONG_TERM_TREND_SMA,
                defaults.long_term_trend_sma_period,
                1,
            )?,
            fibonacci_lookback: optional_setting_usize(
                settings,
                SETTING_FIBONACCI_LOOKBACK,
                defaults.fibonacci_lookback,
                1,
            )?,
            take_profit_risk_multiple: optional_setting_f64(
                settings,
                SETTING_TAKE_PROFIT_MULTIPLE,
                defaults.take_profit_risk_multiple,
                Some(0.0),
                None,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads the `BACKTEST_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = SETTING_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self::from_settings_map(&settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.initial_capital.is_finite() && self.initial_capital > 0.0,
            "Initial capital must be positive (value: {})",
            self.initial_capital
        );
        ensure!(
            (0.0..1.0).contains(&self.commission_rate),
            "Commission rate must be in [0, 1) (value: {})",
            self.commission_rate
        );
        ensure!(
            self.risk_per_trade > 0.0 && self.risk_per_trade <= 1.0,
            "Risk per trade must be in (0, 1] (value: {})",
            self.risk_per_trade
        );
        ensure!(
            self.lookback_buffer_days >= 0,
            "Lookback buffer must not be negative (value: {})",
            self.lookback_buffer_days
        );
        ensure!(
            self.min_history_bars > 0
                && self.market_trend_sma_period > 0
                && self.long_term_trend_sma_period > 0
                && self.fibonacci_lookback > 0,
            "History and indicator periods must be positive"
        );
        ensure!(
            self.take_profit_risk_multiple.is_finite() && self.take_profit_risk_multiple > 0.0,
            "Take-profit multiple must be positive (value: {})",
            self.take_profit_risk_multiple
        );
        ensure!(
            !self.market_index_ticker.trim().is_empty(),
            "Market index ticker must not be empty"
        );
        Ok(())
    }
}

fn setting_value<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = setting_value(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = setting_value(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_settings_give_defaults() {
        let config = BacktestConfig::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(config, BacktestConfig::default());
    }

    #[test]
    fn settings_override_defaults() {
        let config = BacktestConfig::from_settings_map(&settings(&[
            (SETTING_INITIAL_CAPITAL, "50000"),
            (SETTING_COMMISSION_RATE, " 0 "),
            (SETTING_DATA_INTERVAL, "1d"),
            (SETTING_MARKET_INDEX, "spy"),
            (SETTING_MIN_HISTORY_BARS, "20"),
        ]))
        .unwrap();
        assert_eq!(config.initial_capital, 50_000.0);
        assert_eq!(config.commission_rate, 0.0);
        assert_eq!(config.data_interval, BarInterval::Day);
        assert_eq!(config.market_index_ticker, "SPY");
        assert_eq!(config.min_history_bars, 20);
        assert_eq!(config.risk_per_trade, 0.02);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = BacktestConfig::from_settings_map(&settings(&[(SETTING_RISK_PER_TRADE, "1.5")]))
            .unwrap_err();
        assert!(err.to_string().contains("must be <= 1"));

        let err = BacktestConfig::from_settings_map(&settings(&[(SETTING_MIN_HISTORY_BARS, "2.5")]))
            .unwrap_err();
        assert!(err.to_string().contains("must be an integer"));

        let err = BacktestConfig::from_settings_map(&settings(&[(SETTING_INITIAL_CAPITAL, "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("Initial capital"));

        assert!(
            BacktestConfig::from_settings_map(&settings(&[(SETTING_DATA_INTERVAL, "5m")])).is_err()
        );
    }
}
