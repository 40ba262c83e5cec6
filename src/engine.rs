use crate::bar_utils::{build_timeline, normalize_ticker_symbol};
use crate::cache::{DailyTrendCache, InstrumentContext};
use crate::config::BacktestConfig;
use crate::data_context::BarSource;
use crate::error::EngineError;
use crate::indicators::calculate_fibonacci_levels;
use crate::models::*;
use crate::portfolio::Portfolio;
use crate::result::{BacktestResult, BacktestSettings};
use crate::strategy::SignalStrategy;
use crate::trade::{Trade, TradeEntry};
use crate::trend::{classify_long_term_trend, MarketTrendProvider, SmaTrendProvider};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::collections::{hash_map::DefaultHasher, BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const FORCED_LIQUIDATION_RATIONALE: &str = "Forced liquidation at end of backtest";

/// Lifecycle of one [`BacktestingEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Init,
    LoadingData,
    Simulating,
    Finalizing,
    Done,
    Failed { reason: String },
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "INIT",
            RunState::LoadingData => "LOADING_DATA",
            RunState::Simulating => "SIMULATING",
            RunState::Finalizing => "FINALIZING",
            RunState::Done => "DONE",
            RunState::Failed { .. } => "FAILED",
        }
    }
}

/// Bars materialized before simulation starts.
struct LoadedData {
    tickers: Vec<String>,
    bars_by_ticker: BTreeMap<String, Vec<Bar>>,
    reference_bars: Vec<Bar>,
}

/// Replays bars for a set of instruments through one strategy and a virtual portfolio.
///
/// Single-threaded: the portfolio is only touched from the event loop. One engine can
/// run several times; every run starts from a fresh portfolio and trend cache.
pub struct BacktestingEngine {
    config: BacktestConfig,
    source: Arc<dyn BarSource + Send + Sync>,
    strategy: Box<dyn SignalStrategy + Send + Sync>,
    strategy_parameters: BTreeMap<String, f64>,
    trend_provider: Box<dyn MarketTrendProvider + Send + Sync>,
    cache: DailyTrendCache,
    state: RunState,
}

impl BacktestingEngine {
    pub fn new(
        config: BacktestConfig,
        source: Arc<dyn BarSource + Send + Sync>,
        strategy: Box<dyn SignalStrategy + Send + Sync>,
    ) -> Self {
        let trend_provider = Box::new(SmaTrendProvider::new(config.market_trend_sma_period));
        Self {
            config,
            source,
            strategy,
            strategy_parameters: BTreeMap::new(),
            trend_provider,
            cache: DailyTrendCache::new(),
            state: RunState::Init,
        }
    }

    pub fn with_trend_provider(
        mut self,
        trend_provider: Box<dyn MarketTrendProvider + Send + Sync>,
    ) -> Self {
        self.trend_provider = trend_provider;
        self
    }

    /// Parameters recorded in the result settings; the strategy is already built from them.
    pub fn with_strategy_parameters(mut self, parameters: BTreeMap<String, f64>) -> Self {
        self.strategy_parameters = parameters;
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    pub fn daily_cache(&self) -> &DailyTrendCache {
        &self.cache
    }

    pub fn run(
        &mut self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestResult, EngineError> {
        self.cache.reset();
        self.state = RunState::Init;

        let loaded = match self.load_data(tickers, start, end) {
            Ok(loaded) => loaded,
            Err(err) => {
                error!("Backtest failed while loading data: {}", err);
                self.state = RunState::Failed {
                    reason: err.to_string(),
                };
                return Err(err);
            }
        };

        let result = self.simulate(loaded, start, end);
        self.transition(RunState::Done);
        Ok(result)
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run state {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
    }

    fn load_data(
        &mut self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<LoadedData, EngineError> {
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }

        let mut seen = HashSet::new();
        let requested: Vec<String> = tickers
            .iter()
            .filter_map(|ticker| normalize_ticker_symbol(ticker))
            .filter(|ticker| seen.insert(ticker.clone()))
            .collect();
        if requested.is_empty() {
            return Err(EngineError::NoTickers);
        }
        let reference = normalize_ticker_symbol(&self.config.market_index_ticker).ok_or_else(|| {
            EngineError::NoReferenceData {
                instrument: self.config.market_index_ticker.clone(),
            }
        })?;

        self.transition(RunState::LoadingData);

        let mut to_fetch = requested.clone();
        if !to_fetch.contains(&reference) {
            to_fetch.push(reference.clone());
        }
        let load_start = start - Duration::days(self.config.lookback_buffer_days);
        let mut bars_by_ticker =
            self.source
                .get_bars(&to_fetch, load_start, end, self.config.data_interval)?;

        let reference_bars = if requested.contains(&reference) {
            bars_by_ticker.get(&reference).cloned()
        } else {
            bars_by_ticker.remove(&reference)
        }
        .unwrap_or_default();
        if reference_bars.is_empty() {
            return Err(EngineError::NoReferenceData {
                instrument: reference,
            });
        }

        let mut available = Vec::with_capacity(requested.len());
        for ticker in &requested {
            match bars_by_ticker.get(ticker) {
                Some(series) if !series.is_empty() => available.push(ticker.clone()),
                _ => warn!(
                    "No {} data for {} between {} and {}; excluding it from the run",
                    self.config.data_interval, ticker, load_start, end
                ),
            }
        }
        bars_by_ticker.retain(|ticker, series| !series.is_empty() && available.contains(ticker));
        if available.is_empty() {
            return Err(EngineError::NoInstrumentData);
        }

        let bar_count: usize = bars_by_ticker.values().map(Vec::len).sum();
        info!(
            "Loaded {} bars for {} instrument{} (+{} reference bars for {})",
            bar_count,
            available.len(),
            if available.len() == 1 { "" } else { "s" },
            reference_bars.len(),
            reference
        );

        Ok(LoadedData {
            tickers: available,
            bars_by_ticker,
            reference_bars,
        })
    }

    fn simulate(
        &mut self,
        loaded: LoadedData,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BacktestResult {
        self.transition(RunState::Simulating);
        let LoadedData {
            tickers,
            bars_by_ticker,
            reference_bars,
        } = loaded;

        let timeline = build_timeline(bars_by_ticker.values(), start, end);
        if timeline.is_empty() {
            warn!("No bars fall between {} and {}; nothing to simulate", start, end);
        } else {
            info!(
                "Simulating {} timestamps across {} instrument{}",
                timeline.len(),
                tickers.len(),
                if tickers.len() == 1 { "" } else { "s" }
            );
        }

        let mut portfolio = Portfolio::new(self.config.initial_capital, self.config.commission_rate);
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(timeline.len());
        let required_history = self
            .config
            .min_history_bars
            .max(self.strategy.min_history())
            .max(1);
        let mut cursors: HashMap<&str, usize> =
            tickers.iter().map(|ticker| (ticker.as_str(), 0)).collect();
        let mut reference_cursor = 0usize;
        let empty_auxiliary = BTreeMap::new();

        for &timestamp in &timeline {
            for (ticker, cursor) in cursors.iter_mut() {
                if let Some(series) = bars_by_ticker.get(*ticker) {
                    while *cursor < series.len() && series[*cursor].timestamp <= timestamp {
                        *cursor += 1;
                    }
                }
            }
            while reference_cursor < reference_bars.len()
                && reference_bars[reference_cursor].timestamp <= timestamp
            {
                reference_cursor += 1;
            }

            // 1. prices of instruments with a bar at exactly this timestamp
            let mut snapshot: HashMap<String, f64> = HashMap::new();
            for ticker in &tickers {
                if let Some(bar) = bar_at(&bars_by_ticker, &cursors, ticker, timestamp) {
                    if bar.close.is_finite() && bar.close > 0.0 {
                        snapshot.insert(ticker.clone(), bar.close);
                    }
                }
            }

            let trend_provider = self.trend_provider.as_ref();
            let config = &self.config;
            let refreshed = self.cache.ensure_fresh(timestamp, || {
                compute_daily_context(
                    trend_provider,
                    config,
                    &reference_bars[..reference_cursor],
                    &bars_by_ticker,
                    &cursors,
                )
            });
            if refreshed {
                debug!(
                    "Refreshed daily trend cache for {}: market {}",
                    timestamp.date_naive(),
                    self.cache.market_trend()
                );
            }
            let market_trend = self.cache.market_trend();

            // 2. exits before entries
            let exits = portfolio.check_stop_loss_take_profit(&snapshot, timestamp);
            if !exits.is_empty() {
                info!("{}: {}", timestamp, exits.join(", "));
            }

            // 3. entries
            for ticker in Self::ordered_tickers_for_date(&tickers, timestamp) {
                if portfolio.has_open_position(ticker) {
                    continue;
                }
                let Some(&price) = snapshot.get(ticker.as_str()) else {
                    continue;
                };
                let (Some(series), Some(&visible)) =
                    (bars_by_ticker.get(ticker), cursors.get(ticker.as_str()))
                else {
                    continue;
                };
                if visible < required_history {
                    continue;
                }

                let window = &series[..visible];
                let context = self.cache.instrument(ticker);
                let long_term_trend = context.and_then(|ctx| ctx.long_term_trend.as_ref());
                let auxiliary = context
                    .map(|ctx| &ctx.auxiliary)
                    .unwrap_or(&empty_auxiliary);

                match self
                    .strategy
                    .decide(window, ticker, market_trend, long_term_trend, auxiliary)
                {
                    Ok(Decision::NoSignal) => {}
                    Ok(Decision::Enter(signal)) => {
                        let long_term = long_term_trend.map(|trend| trend.trend);
                        self.execute_entry(
                            &mut portfolio,
                            ticker,
                            timestamp,
                            price,
                            signal,
                            market_trend,
                            long_term,
                        );
                    }
                    Err(err) => {
                        warn!(
                            "Strategy {} failed for {} at {}: {}; treating as no signal",
                            self.strategy.id(),
                            ticker,
                            timestamp,
                            err
                        );
                    }
                }
            }

            // 4. mark to market
            equity_curve.push(EquityPoint {
                timestamp,
                portfolio_value: portfolio.get_portfolio_value(&snapshot),
                cash: portfolio.current_cash(),
                open_positions: portfolio.open_position_count(),
            });
            portfolio.update_drawdown(&snapshot);
        }

        self.transition(RunState::Finalizing);
        let exit_timestamp = timeline.last().copied().unwrap_or(end);
        Self::liquidate_open_positions(&mut portfolio, &bars_by_ticker, exit_timestamp);

        let final_capital = portfolio.current_cash();
        let max_drawdown = portfolio.max_drawdown();
        let settings = BacktestSettings {
            tickers,
            strategy_id: self.strategy.id().to_string(),
            strategy_parameters: self.strategy_parameters.clone(),
            config: self.config.clone(),
        };
        let mut result = BacktestResult::new(
            start,
            end,
            self.config.initial_capital,
            final_capital,
            settings,
            max_drawdown,
            portfolio.into_closed_trades(),
            equity_curve,
        );
        result.calculate_metrics();

        let trade_count = result.trades().len();
        info!(
            "Backtest for {} finished with {} trade{}: final capital {:.2} ({:.2}% return, {:.2}% max drawdown)",
            self.strategy.id(),
            trade_count,
            if trade_count == 1 { "" } else { "s" },
            final_capital,
            result.metrics().total_return_percent,
            max_drawdown * 100.0
        );
        result
    }

    fn execute_entry(
        &self,
        portfolio: &mut Portfolio,
        ticker: &str,
        timestamp: DateTime<Utc>,
        price: f64,
        signal: EntrySignal,
        market_trend: TrendType,
        long_term_trend: Option<TrendType>,
    ) {
        let EntrySignal {
            direction,
            confidence_score,
            stop_distance_hint,
            evidence,
        } = signal;

        let sign = direction.sign();
        let hint = stop_distance_hint.filter(|hint| hint.is_finite() && *hint > 0.0);
        let stop_loss_price = hint
            .map(|hint| price - sign * hint)
            .filter(|stop| *stop > 0.0);
        let take_profit_price = hint
            .map(|hint| price + sign * hint * self.config.take_profit_risk_multiple)
            .filter(|target| *target > 0.0);

        let quantity =
            portfolio.calculate_position_size(price, self.config.risk_per_trade, stop_loss_price);
        if quantity == 0 {
            debug!("Skipping {} entry for {}: no size at {:.2}", direction.as_str(), ticker, price);
            return;
        }

        let trade = Trade::open(TradeEntry {
            ticker: ticker.to_string(),
            direction,
            timestamp,
            price,
            quantity,
            score: confidence_score,
            evidence,
            stop_loss_price,
            take_profit_price,
            market_trend,
            long_term_trend,
        });
        if portfolio.open_position(trade) {
            info!(
                "Opened {} {} x {} @ {:.2} (score {:.1}, stop {}, target {})",
                direction.as_str(),
                ticker,
                quantity,
                price,
                confidence_score,
                format_price(stop_loss_price),
                format_price(take_profit_price)
            );
        }
    }

    /// Closes whatever is still open at each instrument's last close.
    fn liquidate_open_positions(
        portfolio: &mut Portfolio,
        bars_by_ticker: &BTreeMap<String, Vec<Bar>>,
        exit_timestamp: DateTime<Utc>,
    ) {
        for ticker in portfolio.open_tickers() {
            let last_close = bars_by_ticker
                .get(&ticker)
                .and_then(|series| series.last())
                .map(|bar| bar.close)
                .filter(|close| close.is_finite() && *close > 0.0);
            let exit_price = match last_close {
                Some(close) => close,
                None => match portfolio.open_position_for(&ticker) {
                    Some(trade) => {
                        warn!("No closing price for {}; liquidating at entry price", ticker);
                        trade.entry_price()
                    }
                    None => continue,
                },
            };
            if !portfolio.close_position(
                &ticker,
                exit_timestamp,
                exit_price,
                vec![FORCED_LIQUIDATION_RATIONALE.to_string()],
                TradeStatus::Closed,
            ) {
                warn!("Failed to liquidate open position in {}", ticker);
            }
        }
    }

    fn ordered_tickers_for_date<'a>(tickers: &'a [String], date: DateTime<Utc>) -> Vec<&'a String> {
        let mut ordered: Vec<(u64, &'a String)> = tickers
            .iter()
            .map(|ticker| (Self::ticker_date_hash(ticker.as_str(), date), ticker))
            .collect();
        ordered.sort_by(|(hash_a, ticker_a), (hash_b, ticker_b)| {
            hash_a.cmp(hash_b).then_with(|| ticker_a.cmp(ticker_b))
        });
        ordered.into_iter().map(|(_, ticker)| ticker).collect()
    }

    fn ticker_date_hash(ticker: &str, date: DateTime<Utc>) -> u64 {
        let mut hasher = DefaultHasher::new();
        ticker.hash(&mut hasher);
        date.timestamp().hash(&mut hasher);
        hasher.finish()
    }
}

fn bar_at<'a>(
    bars_by_ticker: &'a BTreeMap<String, Vec<Bar>>,
    cursors: &HashMap<&str, usize>,
    ticker: &str,
    timestamp: DateTime<Utc>,
) -> Option<&'a Bar> {
    let series = bars_by_ticker.get(ticker)?;
    let visible = *cursors.get(ticker)?;
    let bar = series.get(visible.checked_sub(1)?)?;
    (bar.timestamp == timestamp).then_some(bar)
}

fn compute_daily_context(
    trend_provider: &(dyn MarketTrendProvider + Send + Sync),
    config: &BacktestConfig,
    reference_window: &[Bar],
    bars_by_ticker: &BTreeMap<String, Vec<Bar>>,
    cursors: &HashMap<&str, usize>,
) -> (TrendType, HashMap<String, InstrumentContext>) {
    let market_trend = trend_provider.classify(reference_window);

    let mut instruments = HashMap::with_capacity(cursors.len());
    for (ticker, &visible) in cursors {
        let Some(series) = bars_by_ticker.get(*ticker) else {
            continue;
        };
        if visible == 0 {
            continue;
        }
        let window = &series[..visible];
        let long_term_trend = classify_long_term_trend(window, config.long_term_trend_sma_period);
        let mut auxiliary: BTreeMap<String, f64> =
            calculate_fibonacci_levels(window, config.fibonacci_lookback)
                .into_iter()
                .collect();
        if let Some(trend) = long_term_trend.as_ref() {
            auxiliary.insert("long_term_sma".to_string(), trend.sma);
        }
        instruments.insert(
            ticker.to_string(),
            InstrumentContext {
                long_term_trend,
                auxiliary,
            },
        );
    }
    (market_trend, instruments)
}

fn format_price(price: Option<f64>) -> String {
    price
        .map(|value| format!("{:.2}", value))
        .unwrap_or_else(|| "-".to_string())
}
