use crate::models::EquityPoint;
use crate::trade::Trade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Samples per year used to annualize Sharpe and Sortino.
///
/// Fixed regardless of the bar interval; hourly runs are annualized as if each
/// sample were one trading day.
pub const ANNUALIZATION_FACTOR: f64 = 252.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_pnl: f64,
    pub total_return_percent: f64,
    pub annualized_return_percent: f64,
    pub max_drawdown_percent: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    /// Gross wins over gross losses; infinite when there are wins and no losses.
    pub profit_factor: f64,
    pub average_win: f64,
    /// Magnitude of the mean losing trade (positive).
    pub average_loss: f64,
    pub largest_win: f64,
    /// Most negative realized P&L.
    pub largest_loss: f64,
    pub average_holding_period_hours: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Metrics over closed trades and the equity series. No trades means all defaults.
    pub fn calculate_performance(
        trades: &[Trade],
        initial_capital: f64,
        final_capital: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        equity_curve: &[EquityPoint],
        max_drawdown_fraction: f64,
    ) -> PerformanceMetrics {
        if trades.is_empty() {
            return PerformanceMetrics::default();
        }

        let pnls: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl()).collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl < 0.0).collect();

        let total_trades = trades.len();
        let gross_wins: f64 = wins.iter().sum();
        let gross_losses: f64 = losses.iter().sum::<f64>().abs();

        let profit_factor = if gross_losses > 0.0 {
            gross_wins / gross_losses
        } else if gross_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let holding_hours: Vec<f64> = trades
            .iter()
            .filter_map(|t| t.holding_period_hours())
            .collect();

        let returns = Self::sample_returns(equity_curve);

        PerformanceMetrics {
            total_pnl: pnls.iter().sum(),
            total_return_percent: Self::total_return_percent(initial_capital, final_capital),
            annualized_return_percent: Self::annualized_return_percent(
                initial_capital,
                final_capital,
                start_date,
                end_date,
            ),
            max_drawdown_percent: max_drawdown_fraction * 100.0,
            sharpe_ratio: Self::calculate_sharpe_ratio(&returns),
            sortino_ratio: Self::calculate_sortino_ratio(&returns),
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / total_trades as f64,
            profit_factor,
            average_win: Self::average(&wins),
            average_loss: Self::average(&losses).abs(),
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
            average_holding_period_hours: Self::average(&holding_hours),
        }
    }

    pub fn total_return_percent(initial_capital: f64, final_capital: f64) -> f64 {
        if initial_capital <= 0.0 || !final_capital.is_finite() {
            return 0.0;
        }
        (final_capital - initial_capital) / initial_capital * 100.0
    }

    /// `(final / initial)^(365.25 / days) - 1`, in percent, over whole calendar days.
    pub fn annualized_return_percent(
        initial_capital: f64,
        final_capital: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> f64 {
        if initial_capital <= 0.0 || !final_capital.is_finite() {
            return 0.0;
        }
        let days = (end_date - start_date).num_days();
        if days <= 0 {
            return 0.0;
        }

        let total_return_ratio = final_capital / initial_capital;
        if total_return_ratio <= 0.0 {
            return -100.0;
        }
        (total_return_ratio.powf(365.25 / days as f64) - 1.0) * 100.0
    }

    /// Sample-to-sample fractional change of portfolio value.
    pub fn sample_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .filter_map(|window| {
                let prev_value = window[0].portfolio_value;
                let curr_value = window[1].portfolio_value;
                if prev_value > 0.0 {
                    Some((curr_value - prev_value) / prev_value)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Zero risk-free rate, sample standard deviation.
    pub fn calculate_sharpe_ratio(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean_return = returns.mean();
        let std_dev = returns.std_dev();
        Self::annualized_ratio(mean_return, std_dev)
    }

    /// Like Sharpe, but the denominator only sees negative samples.
    pub fn calculate_sortino_ratio(returns: &[f64]) -> f64 {
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if returns.len() < 2 || downside.len() < 2 {
            return 0.0;
        }
        let mean_return = returns.mean();
        let downside_std = downside.std_dev();
        Self::annualized_ratio(mean_return, downside_std)
    }

    fn annualized_ratio(mean_return: f64, std_dev: f64) -> f64 {
        if !std_dev.is_finite() || std_dev == 0.0 || !mean_return.is_finite() {
            return 0.0;
        }
        (mean_return * ANNUALIZATION_FACTOR) / (std_dev * ANNUALIZATION_FACTOR.sqrt())
    }

    pub fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}
