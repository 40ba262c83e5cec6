use crate::config::BacktestConfig;
use crate::data_context::BarSource;
use crate::engine::BacktestingEngine;
use crate::models::BarInterval;
use crate::result::{serialize_ratio, BacktestResult};
use crate::strategy::create_strategy;
use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Walk-forward months are fixed at 30 calendar days.
pub const DAYS_PER_MONTH: i64 = 30;

pub const RANKED_METRICS: [&str; 5] = [
    "total_return_percent",
    "sharpe_ratio",
    "win_rate",
    "profit_factor",
    "max_drawdown_percent",
];

/// Per-run replacements for fields of the service config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_per_trade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_interval: Option<BarInterval>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copy of `base` with every set field replaced, validated as a whole.
    pub fn apply(&self, base: &BacktestConfig) -> Result<BacktestConfig> {
        let mut config = base.clone();
        if let Some(commission_rate) = self.commission_rate {
            config.commission_rate = commission_rate;
        }
        if let Some(risk_per_trade) = self.risk_per_trade {
            config.risk_per_trade = risk_per_trade;
        }
        if let Some(data_interval) = self.data_interval {
            config.data_interval = data_interval;
        }
        config.validate().context("Invalid config override")?;
        Ok(config)
    }
}

/// One named strategy configuration to run.
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub name: String,
    pub strategy_id: String,
    pub parameters: HashMap<String, f64>,
    pub overrides: ConfigOverrides,
}

impl StrategyRequest {
    pub fn new(strategy_id: &str, parameters: HashMap<String, f64>) -> Self {
        Self::named(strategy_id, strategy_id, parameters)
    }

    pub fn named(name: &str, strategy_id: &str, parameters: HashMap<String, f64>) -> Self {
        Self {
            name: name.to_string(),
            strategy_id: strategy_id.to_string(),
            parameters,
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategySummary {
    pub strategy_id: String,
    pub parameters: BTreeMap<String, f64>,
    pub commission_rate: f64,
    pub risk_per_trade: f64,
    pub data_interval: BarInterval,
    pub final_capital: f64,
    pub total_return_percent: f64,
    pub annualized_return_percent: f64,
    pub max_drawdown_percent: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    #[serde(serialize_with = "serialize_ratio")]
    pub profit_factor: f64,
}

impl StrategySummary {
    pub fn from_result(result: &BacktestResult) -> Self {
        let metrics = result.metrics();
        Self {
            strategy_id: result.settings.strategy_id.clone(),
            parameters: result.settings.strategy_parameters.clone(),
            commission_rate: result.settings.config.commission_rate,
            risk_per_trade: result.settings.config.risk_per_trade,
            data_interval: result.settings.config.data_interval,
            final_capital: result.final_capital,
            total_return_percent: metrics.total_return_percent,
            annualized_return_percent: metrics.annualized_return_percent,
            max_drawdown_percent: metrics.max_drawdown_percent,
            sharpe_ratio: metrics.sharpe_ratio,
            win_rate: metrics.win_rate,
            total_trades: metrics.total_trades,
            profit_factor: metrics.profit_factor,
        }
    }

    fn metric(&self, name: &str) -> f64 {
        match name {
            "total_return_percent" => self.total_return_percent,
            "sharpe_ratio" => self.sharpe_ratio,
            "win_rate" => self.win_rate,
            "profit_factor" => self.profit_factor,
            "max_drawdown_percent" => self.max_drawdown_percent,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyComparison {
    pub summaries: BTreeMap<String, StrategySummary>,
    /// Strategy names per metric, best first.
    pub rankings: BTreeMap<String, Vec<String>>,
    pub best_overall: Option<String>,
    /// Configurations that failed, with the error that stopped them.
    pub failures: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalkForwardWindow {
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalkForwardPeriod {
    #[serde(flatten)]
    pub window: WalkForwardWindow,
    pub test_return_percent: f64,
    pub test_max_drawdown_percent: f64,
    pub test_win_rate: f64,
    pub test_total_trades: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalkForwardSummary {
    pub total_periods: usize,
    pub average_return_percent: f64,
    pub average_win_rate: f64,
    pub positive_periods: usize,
    /// Share of periods with a positive test return.
    pub consistency_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardAnalysis {
    pub strategy_id: String,
    pub periods: Vec<WalkForwardPeriod>,
    pub summary: WalkForwardSummary,
}

/// One grid point that completed, with the values it was built from.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRun {
    pub combination: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub summary: StrategySummary,
}

/// Labels of the best combination per metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizationSummary {
    pub best_total_return: Option<String>,
    pub best_sharpe_ratio: Option<String>,
    pub best_win_rate: Option<String>,
    pub minimum_drawdown: Option<String>,
    pub combinations_tested: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterOptimization {
    pub strategy_id: String,
    /// Grid values of the top Sharpe ratio run.
    pub best_parameters: Option<BTreeMap<String, f64>>,
    pub results: BTreeMap<String, OptimizationRun>,
    pub rankings: BTreeMap<String, Vec<String>>,
    pub failures: BTreeMap<String, String>,
    pub summary: OptimizationSummary,
}

struct ComparisonTask {
    request: StrategyRequest,
}

struct ComparisonTaskResult {
    name: String,
    duration_secs: f64,
    run: Result<BacktestResult>,
}

/// Higher-level runs on top of [`BacktestingEngine`]: single backtests,
/// strategy comparison and walk-forward analysis over one bar source.
pub struct BacktestingService {
    source: Arc<dyn BarSource + Send + Sync>,
    config: BacktestConfig,
    show_progress: bool,
}

impl BacktestingService {
    pub fn new(source: Arc<dyn BarSource + Send + Sync>, config: BacktestConfig) -> Self {
        Self {
            source,
            config,
            show_progress: false,
        }
    }

    /// Shows an indicatif progress bar for multi-run operations.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run_strategy_backtest(
        &self,
        strategy_id: &str,
        parameters: &HashMap<String, f64>,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestResult> {
        info!(
            "Starting {} backtest for {} ticker{}",
            strategy_id,
            tickers.len(),
            if tickers.len() == 1 { "" } else { "s" }
        );
        let result = run_single_backtest(
            self.source.clone(),
            &self.config,
            strategy_id,
            parameters,
            tickers,
            start,
            end,
        )?;
        info!(
            "Backtest completed. Return: {:.2}%, Win rate: {:.1}%",
            result.metrics().total_return_percent,
            result.metrics().win_rate * 100.0
        );
        Ok(result)
    }

    /// Runs every request on a worker pool; failed configurations are reported, not fatal.
    pub fn compare_strategies(
        &self,
        requests: &[StrategyRequest],
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<StrategyComparison> {
        ensure!(!requests.is_empty(), "At least one strategy is required for comparison");
        info!(
            "Comparing {} strateg{}",
            requests.len(),
            if requests.len() == 1 { "y" } else { "ies" }
        );

        let (summaries, failures) = self.run_requests(requests, tickers, start, end)?;
        let rankings = rank_summaries(&summaries);
        let best_overall = top_ranked(&rankings, "sharpe_ratio");

        Ok(StrategyComparison {
            summaries,
            rankings,
            best_overall,
            failures,
        })
    }

    /// Grid search: backtests the cartesian product of `ranges` on top of `base_parameters`.
    ///
    /// `commission_rate` and `risk_per_trade` ranges vary the run config; every other key is a
    /// strategy parameter. Failing combinations are logged and left out of the rankings.
    pub fn run_parameter_optimization(
        &self,
        strategy_id: &str,
        base_parameters: &HashMap<String, f64>,
        ranges: &BTreeMap<String, Vec<f64>>,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ParameterOptimization> {
        ensure!(!ranges.is_empty(), "At least one parameter range is required");
        for (key, values) in ranges {
            ensure!(!values.is_empty(), "Parameter range {} has no values", key);
            if let Some(value) = values.iter().find(|value| !value.is_finite()) {
                bail!("Parameter range {} contains a non-finite value: {}", key, value);
            }
        }

        let combinations = parameter_combinations(ranges);
        info!(
            "Starting parameter optimization of {}: {} combination{}",
            strategy_id,
            combinations.len(),
            if combinations.len() == 1 { "" } else { "s" }
        );

        let mut by_label = BTreeMap::new();
        let mut requests = Vec::with_capacity(combinations.len());
        for combination in combinations {
            let label = combination_label(&combination);
            let mut parameters = base_parameters.clone();
            let mut overrides = ConfigOverrides::default();
            for (key, value) in &combination {
                match key.as_str() {
                    "commission_rate" => overrides.commission_rate = Some(*value),
                    "risk_per_trade" => overrides.risk_per_trade = Some(*value),
                    _ => {
                        parameters.insert(key.clone(), *value);
                    }
                }
            }
            requests.push(
                StrategyRequest::named(&label, strategy_id, parameters).with_overrides(overrides),
            );
            by_label.insert(label, combination);
        }

        let (summaries, failures) = self.run_requests(&requests, tickers, start, end)?;
        let rankings = rank_summaries(&summaries);
        let summary = OptimizationSummary {
            best_total_return: top_ranked(&rankings, "total_return_percent"),
            best_sharpe_ratio: top_ranked(&rankings, "sharpe_ratio"),
            best_win_rate: top_ranked(&rankings, "win_rate"),
            minimum_drawdown: top_ranked(&rankings, "max_drawdown_percent"),
            combinations_tested: summaries.len(),
        };
        let best_parameters = summary
            .best_sharpe_ratio
            .as_ref()
            .and_then(|label| by_label.get(label).cloned());
        match &summary.best_sharpe_ratio {
            Some(label) => info!("Best parameters by Sharpe ratio: {}", label),
            None => warn!("Every parameter combination failed"),
        }

        let results = summaries
            .into_iter()
            .filter_map(|(label, run_summary)| {
                let combination = by_label.remove(&label)?;
                Some((
                    label,
                    OptimizationRun {
                        combination,
                        summary: run_summary,
                    },
                ))
            })
            .collect();

        Ok(ParameterOptimization {
            strategy_id: strategy_id.to_string(),
            best_parameters,
            results,
            rankings,
            failures,
            summary,
        })
    }

    fn run_requests(
        &self,
        requests: &[StrategyRequest],
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(BTreeMap<String, StrategySummary>, BTreeMap<String, String>)> {
        let mut names = HashSet::new();
        for request in requests {
            if !names.insert(request.name.as_str()) {
                bail!("Duplicate strategy name in comparison: {}", request.name);
            }
        }

        let total = requests.len();
        if total == 0 {
            return Ok((BTreeMap::new(), BTreeMap::new()));
        }
        let num_workers = std::cmp::min(total, std::cmp::max(1, num_cpus::get()));
        info!("Using {} worker threads", num_workers);

        let (task_tx, task_rx): (Sender<ComparisonTask>, Receiver<ComparisonTask>) =
            bounded(total);
        let (result_tx, result_rx): (
            Sender<ComparisonTaskResult>,
            Receiver<ComparisonTaskResult>,
        ) = bounded(total);

        let tickers: Arc<Vec<String>> = Arc::new(tickers.to_vec());
        let mut handles = Vec::new();
        for _ in 0..num_workers {
            let rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let source = self.source.clone();
            let config = self.config.clone();
            let tickers = tickers.clone();

            let handle = thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    let ComparisonTask { request } = task;
                    let started = Instant::now();
                    let run = request.overrides.apply(&config).and_then(|config| {
                        run_single_backtest(
                            source.clone(),
                            &config,
                            &request.strategy_id,
                            &request.parameters,
                            tickers.as_slice(),
                            start,
                            end,
                        )
                    });
                    let message = ComparisonTaskResult {
                        name: request.name,
                        duration_secs: started.elapsed().as_secs_f64(),
                        run,
                    };
                    if result_tx.send(message).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for request in requests {
            task_tx.send(ComparisonTask {
                request: request.clone(),
            })?;
        }
        drop(task_tx);

        let pb = self.progress_bar(total);
        let mut summaries = BTreeMap::new();
        let mut failures = BTreeMap::new();
        let mut completed = 0usize;
        while completed < total {
            match result_rx.recv() {
                Ok(message) => {
                    completed += 1;
                    pb.set_position(completed as u64);
                    match message.run {
                        Ok(result) => {
                            let summary = StrategySummary::from_result(&result);
                            info!(
                                "Completed {} in {:.1}s (return {:.2}%, Sharpe {:.4})",
                                message.name,
                                message.duration_secs,
                                summary.total_return_percent,
                                summary.sharpe_ratio
                            );
                            summaries.insert(message.name, summary);
                        }
                        Err(err) => {
                            error!("Error testing strategy {}: {:#}", message.name, err);
                            failures.insert(message.name, format!("{:#}", err));
                        }
                    }
                }
                Err(_) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }
        if failures.is_empty() {
            pb.finish_with_message("Runs completed");
        } else {
            pb.finish_with_message("Runs completed with errors");
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("A comparison worker panicked");
            }
        }

        Ok((summaries, failures))
    }

    /// Backtests each out-of-sample window in turn; failing windows are logged and skipped.
    pub fn run_walk_forward_analysis(
        &self,
        strategy_id: &str,
        parameters: &HashMap<String, f64>,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        train_months: u32,
        test_months: u32,
    ) -> Result<WalkForwardAnalysis> {
        ensure!(train_months > 0, "Training period must be at least one month");
        ensure!(test_months > 0, "Test period must be at least one month");
        // fail fast on a bad id or parameters before iterating windows
        create_strategy(strategy_id, parameters.clone())
            .with_context(|| format!("Failed to build strategy {}", strategy_id))?;

        let windows = walk_forward_windows(start, end, train_months, test_months);
        info!(
            "Starting walk forward analysis: {} window{}",
            windows.len(),
            if windows.len() == 1 { "" } else { "s" }
        );

        let pb = self.progress_bar(windows.len());
        let mut periods = Vec::with_capacity(windows.len());
        for (index, window) in windows.iter().enumerate() {
            info!(
                "Training: {} to {}, Testing: {} to {}",
                window.train_start, window.train_end, window.test_start, window.test_end
            );
            match run_single_backtest(
                self.source.clone(),
                &self.config,
                strategy_id,
                parameters,
                tickers,
                window.test_start,
                window.test_end,
            ) {
                Ok(result) => {
                    let metrics = result.metrics();
                    periods.push(WalkForwardPeriod {
                        window: *window,
                        test_return_percent: metrics.total_return_percent,
                        test_max_drawdown_percent: metrics.max_drawdown_percent,
                        test_win_rate: metrics.win_rate,
                        test_total_trades: metrics.total_trades,
                    });
                }
                Err(err) => error!(
                    "Error in walk forward period {} to {}: {:#}",
                    window.train_start, window.test_end, err
                ),
            }
            pb.set_position((index + 1) as u64);
        }
        pb.finish_with_message("Walk forward analysis completed");

        let summary = summarize_walk_forward(&periods);
        info!(
            "Walk forward: {} period{}, average return {:.2}%, consistency {:.1}%",
            summary.total_periods,
            if summary.total_periods == 1 { "" } else { "s" },
            summary.average_return_percent,
            summary.consistency_score * 100.0
        );
        Ok(WalkForwardAnalysis {
            strategy_id: strategy_id.to_string(),
            periods,
            summary,
        })
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

fn run_single_backtest(
    source: Arc<dyn BarSource + Send + Sync>,
    config: &BacktestConfig,
    strategy_id: &str,
    parameters: &HashMap<String, f64>,
    tickers: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<BacktestResult> {
    let strategy = create_strategy(strategy_id, parameters.clone())
        .with_context(|| format!("Failed to build strategy {}", strategy_id))?;
    let recorded: BTreeMap<String, f64> = parameters
        .iter()
        .map(|(key, value)| (key.clone(), *value))
        .collect();
    let mut engine = BacktestingEngine::new(config.clone(), source, strategy)
        .with_strategy_parameters(recorded);
    engine
        .run(tickers, start, end)
        .with_context(|| format!("Backtest of {} from {} to {} failed", strategy_id, start, end))
}

/// Train `[cur, cur + train)`, test `[train_end, min(train_end + test, end)]`; the next
/// window starts at the previous test start.
pub fn walk_forward_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    train_months: u32,
    test_months: u32,
) -> Vec<WalkForwardWindow> {
    let train = Duration::days(train_months as i64 * DAYS_PER_MONTH);
    let test = Duration::days(test_months as i64 * DAYS_PER_MONTH);
    if train <= Duration::zero() || test <= Duration::zero() {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut current = start;
    while current < end {
        let train_end = current + train;
        let test_start = train_end;
        if test_start >= end {
            break;
        }
        let test_end = std::cmp::min(test_start + test, end);
        windows.push(WalkForwardWindow {
            train_start: current,
            train_end,
            test_start,
            test_end,
        });
        current = test_start;
    }
    windows
}

pub fn summarize_walk_forward(periods: &[WalkForwardPeriod]) -> WalkForwardSummary {
    if periods.is_empty() {
        return WalkForwardSummary::default();
    }
    let count = periods.len() as f64;
    let positive_periods = periods
        .iter()
        .filter(|period| period.test_return_percent > 0.0)
        .count();
    WalkForwardSummary {
        total_periods: periods.len(),
        average_return_percent: periods.iter().map(|p| p.test_return_percent).sum::<f64>() / count,
        average_win_rate: periods.iter().map(|p| p.test_win_rate).sum::<f64>() / count,
        positive_periods,
        consistency_score: positive_periods as f64 / count,
    }
}

/// Cartesian product of `ranges` in key order; repeated values within a range collapse.
pub fn parameter_combinations(ranges: &BTreeMap<String, Vec<f64>>) -> Vec<BTreeMap<String, f64>> {
    let mut combinations = vec![BTreeMap::new()];
    for (key, values) in ranges {
        let mut distinct: Vec<f64> = Vec::with_capacity(values.len());
        for value in values {
            if !distinct.contains(value) {
                distinct.push(*value);
            }
        }
        combinations = combinations
            .iter()
            .flat_map(|base| {
                distinct.iter().map(move |value| {
                    let mut next = base.clone();
                    next.insert(key.clone(), *value);
                    next
                })
            })
            .collect();
    }
    combinations
}

/// `key=value` pairs joined by commas, e.g. `risk_per_trade=0.01,rsiPeriod=14`.
pub fn combination_label(combination: &BTreeMap<String, f64>) -> String {
    if combination.is_empty() {
        return "default".to_string();
    }
    combination
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

fn top_ranked(rankings: &BTreeMap<String, Vec<String>>, metric: &str) -> Option<String> {
    rankings.get(metric).and_then(|names| names.first().cloned())
}

/// Names per metric, best first. Drawdown ranks ascending, everything else descending;
/// ties fall back to name order.
pub fn rank_summaries(
    summaries: &BTreeMap<String, StrategySummary>,
) -> BTreeMap<String, Vec<String>> {
    let mut rankings = BTreeMap::new();
    if summaries.is_empty() {
        return rankings;
    }
    for metric in RANKED_METRICS {
        let ascending = metric == "max_drawdown_percent";
        let mut entries: Vec<(&String, f64)> = summaries
            .iter()
            .map(|(name, summary)| (name, summary.metric(metric)))
            .collect();
        entries.sort_by(|(name_a, a), (name_b, b)| {
            let ordering = if ascending {
                a.partial_cmp(b)
            } else {
                b.partial_cmp(a)
            };
            ordering
                .unwrap_or(Ordering::Equal)
                .then_with(|| name_a.cmp(name_b))
        });
        rankings.insert(
            metric.to_string(),
            entries.into_iter().map(|(name, _)| name.clone()).collect(),
        );
    }
    rankings
}
