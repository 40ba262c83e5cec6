use crate::config::BacktestConfig;
use crate::models::{EquityPoint, TrendType};
use crate::performance::{PerformanceCalculator, PerformanceMetrics};
use crate::trade::Trade;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Inputs that produced a run, echoed into the report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestSettings {
    pub tickers: Vec<String>,
    pub strategy_id: String,
    pub strategy_parameters: BTreeMap<String, f64>,
    pub config: BacktestConfig,
}

/// Trade statistics for one bucket of an analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub trade_count: usize,
    pub win_rate: f64,
    pub average_pnl_percent: f64,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyPerformance {
    /// `YYYY-MM`
    pub month: String,
    pub start_value: f64,
    pub end_value: f64,
    pub return_percent: f64,
}

/// Outcome of one run. The closed-trade list and equity series are frozen at
/// finalization; `metrics` is derived from them by [`BacktestResult::calculate_metrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub settings: BacktestSettings,
    pub max_drawdown: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    #[serde(default)]
    metrics: PerformanceMetrics,
}

impl BacktestResult {
    pub fn new(
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        initial_capital: f64,
        final_capital: f64,
        settings: BacktestSettings,
        max_drawdown: f64,
        trades: Vec<Trade>,
        equity_curve: Vec<EquityPoint>,
    ) -> Self {
        Self {
            start_date,
            end_date,
            initial_capital,
            final_capital,
            settings,
            max_drawdown,
            trades,
            equity_curve,
            metrics: PerformanceMetrics::default(),
        }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Recomputes every derived field from scratch; calling it twice changes nothing.
    pub fn calculate_metrics(&mut self) {
        self.metrics = PerformanceCalculator::calculate_performance(
            &self.trades,
            self.initial_capital,
            self.final_capital,
            self.start_date,
            self.end_date,
            &self.equity_curve,
            self.max_drawdown,
        );
    }

    /// Buckets by entry score: weak (< 10), medium (< 15), strong.
    pub fn analyze_by_signal_strength(&self) -> BTreeMap<String, BucketStats> {
        self.bucketize(&["weak", "medium", "strong"], |trade| {
            let score = trade.entry_score();
            Some(if score < 10.0 {
                "weak"
            } else if score < 15.0 {
                "medium"
            } else {
                "strong"
            })
        })
    }

    pub fn analyze_by_market_condition(&self) -> BTreeMap<String, BucketStats> {
        let labels = [
            TrendType::Bullish.as_str(),
            TrendType::Bearish.as_str(),
            TrendType::Neutral.as_str(),
        ];
        self.bucketize(&labels, |trade| Some(trade.market_trend_at_entry().as_str()))
    }

    /// Buckets by holding period: short (< 24h), medium (< 7 days), long.
    pub fn analyze_by_holding_period(&self) -> BTreeMap<String, BucketStats> {
        self.bucketize(&["short", "medium", "long"], |trade| {
            let hours = trade.holding_period_hours()?;
            Some(if hours < 24.0 {
                "short"
            } else if hours < 168.0 {
                "medium"
            } else {
                "long"
            })
        })
    }

    fn bucketize<F>(&self, labels: &[&str], classify: F) -> BTreeMap<String, BucketStats>
    where
        F: Fn(&Trade) -> Option<&'static str>,
    {
        let mut grouped: HashMap<&str, Vec<&Trade>> = HashMap::new();
        for trade in &self.trades {
            if let Some(label) = classify(trade) {
                grouped.entry(label).or_default().push(trade);
            }
        }

        labels
            .iter()
            .map(|label| {
                let stats = grouped
                    .get(label)
                    .map(|trades| bucket_stats(trades))
                    .unwrap_or_default();
                (label.to_string(), stats)
            })
            .collect()
    }

    /// First and last equity sample of each calendar month, in order.
    pub fn monthly_performance(&self) -> Vec<MonthlyPerformance> {
        let mut months: Vec<MonthlyPerformance> = Vec::new();
        for point in &self.equity_curve {
            let month = format!("{:04}-{:02}", point.timestamp.year(), point.timestamp.month());
            match months.last_mut() {
                Some(current) if current.month == month => {
                    current.end_value = point.portfolio_value;
                }
                _ => months.push(MonthlyPerformance {
                    month,
                    start_value: point.portfolio_value,
                    end_value: point.portfolio_value,
                    return_percent: 0.0,
                }),
            }
        }
        for month in &mut months {
            month.return_percent = if month.start_value > 0.0 {
                (month.end_value - month.start_value) / month.start_value * 100.0
            } else {
                0.0
            };
        }
        months
    }

    /// Dictionary view for reporting: metrics, analyses, settings and every trade.
    pub fn to_value(&self) -> Value {
        let m = &self.metrics;
        json!({
            "backtest_period": {
                "start_date": self.start_date.to_rfc3339(),
                "end_date": self.end_date.to_rfc3339(),
                "duration_days": (self.end_date - self.start_date).num_days(),
            },
            "capital": {
                "initial_capital": self.initial_capital,
                "final_capital": self.final_capital,
                "total_pnl": m.total_pnl,
                "total_return_percent": m.total_return_percent,
                "annualized_return_percent": m.annualized_return_percent,
            },
            "risk_metrics": {
                "max_drawdown_percent": m.max_drawdown_percent,
                "sharpe_ratio": m.sharpe_ratio,
                "sortino_ratio": m.sortino_ratio,
            },
            "trade_statistics": {
                "total_trades": m.total_trades,
                "winning_trades": m.winning_trades,
                "losing_trades": m.losing_trades,
                "win_rate": m.win_rate,
                "profit_factor": ratio_value(m.profit_factor),
                "average_win": m.average_win,
                "average_loss": m.average_loss,
                "largest_win": m.largest_win,
                "largest_loss": m.largest_loss,
                "average_holding_period_hours": m.average_holding_period_hours,
            },
            "detailed_analysis": {
                "signal_strength_analysis": self.analyze_by_signal_strength(),
                "market_condition_analysis": self.analyze_by_market_condition(),
                "holding_period_analysis": self.analyze_by_holding_period(),
            },
            "settings": self.settings,
            "trades": self.trades,
        })
    }
}

fn bucket_stats(trades: &[&Trade]) -> BucketStats {
    if trades.is_empty() {
        return BucketStats::default();
    }
    let winners = trades
        .iter()
        .filter(|t| t.realized_pnl().unwrap_or(0.0) > 0.0)
        .count();
    let pnl_percents: Vec<f64> = trades
        .iter()
        .map(|t| t.realized_pnl_percent().unwrap_or(0.0))
        .collect();
    BucketStats {
        trade_count: trades.len(),
        win_rate: winners as f64 / trades.len() as f64,
        average_pnl_percent: PerformanceCalculator::average(&pnl_percents),
        total_pnl: trades.iter().filter_map(|t| t.realized_pnl()).sum(),
    }
}

/// JSON has no infinity; unbounded ratios are written as the string `"inf"`.
pub fn ratio_value(value: f64) -> Value {
    if value.is_finite() {
        json!(value)
    } else if value.is_nan() {
        Value::Null
    } else if value > 0.0 {
        json!("inf")
    } else {
        json!("-inf")
    }
}

/// Serde counterpart of [`ratio_value`] for struct fields.
pub fn serialize_ratio<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else if value.is_nan() {
        serializer.serialize_none()
    } else if *value > 0.0 {
        serializer.serialize_str("inf")
    } else {
        serializer.serialize_str("-inf")
    }
}
