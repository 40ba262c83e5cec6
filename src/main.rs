use anyhow::{anyhow, bail, Context, Result};
use backtest_engine::{
    backtester::{BacktestingService, StrategyRequest},
    bar_utils::normalize_ticker_symbol,
    config::BacktestConfig,
    data_context::{import_csv, parse_timestamp, BarSource, InMemoryBarSource},
    models::BarInterval,
    param_utils::{parse_parameter_assignments, parse_parameter_ranges},
    report::{build_report, format_summary, write_json},
    strategy::available_strategies,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "backtest_engine")]
#[command(about = "Bar-by-bar backtesting of trading strategies over historical market data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Market data snapshot (.bin) or CSV file (.csv)
    #[arg(long = "data", value_name = "PATH")]
    data: PathBuf,
    /// Comma separated tickers (defaults to every ticker in the data except the market index)
    #[arg(long, value_delimiter = ',')]
    tickers: Vec<String>,
    /// First simulated timestamp (RFC3339, "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD")
    #[arg(long, value_parser = parse_date_arg)]
    start: DateTime<Utc>,
    /// Last simulated timestamp, inclusive
    #[arg(long, value_parser = parse_date_arg)]
    end: DateTime<Utc>,
    /// Starting cash
    #[arg(long)]
    capital: Option<f64>,
    /// Commission per leg as a fraction of notional
    #[arg(long)]
    commission: Option<f64>,
    /// Fraction of cash risked per trade
    #[arg(long)]
    risk: Option<f64>,
    /// Market reference instrument used for trend classification
    #[arg(long = "market-index")]
    market_index: Option<String>,
    /// Interval of bars read from CSV input (1h or 1d)
    #[arg(long, default_value = "1d")]
    csv_interval: BarInterval,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one strategy and print a summary
    Backtest {
        #[command(flatten)]
        run: RunArgs,
        /// Strategy id (see `strategies`)
        #[arg(long, default_value = "buy_and_hold")]
        strategy: String,
        /// Strategy parameter as key=value; repeat for more
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Write the full JSON report here
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Run several strategies over the same data and rank them
    Compare {
        #[command(flatten)]
        run: RunArgs,
        /// Comma separated strategy ids
        #[arg(long, value_delimiter = ',', required = true)]
        strategies: Vec<String>,
        /// Write the comparison as JSON here
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Backtest rolling out-of-sample windows (30-day months)
    WalkForward {
        #[command(flatten)]
        run: RunArgs,
        /// Strategy id (see `strategies`)
        #[arg(long, default_value = "buy_and_hold")]
        strategy: String,
        /// Strategy parameter as key=value; repeat for more
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Training window length in months
        #[arg(long, default_value_t = 6)]
        train_months: u32,
        /// Test window length in months
        #[arg(long, default_value_t = 1)]
        test_months: u32,
        /// Write the analysis as JSON here
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Grid-search strategy parameters and run settings
    Optimize {
        #[command(flatten)]
        run: RunArgs,
        /// Strategy id (see `strategies`)
        #[arg(long, default_value = "buy_and_hold")]
        strategy: String,
        /// Fixed strategy parameter as key=value; repeat for more
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Values to try as key=v1,v2,...; commission_rate and risk_per_trade vary the run settings
        #[arg(long = "range", value_name = "KEY=V1,V2", required = true)]
        ranges: Vec<String>,
        /// Write the optimization results as JSON here
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Convert a CSV bar file into a market data snapshot
    ImportCsv {
        /// CSV with ticker,timestamp,open,high,low,close,volume[,indicator...]
        #[arg(short, long, value_name = "PATH")]
        input: PathBuf,
        /// Destination snapshot file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
        /// Interval of the bars in the CSV
        #[arg(long, default_value = "1d")]
        interval: BarInterval,
    },
    /// List available strategy ids
    Strategies,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting backtest engine. Simulated results are not a guarantee of future returns.");

    match command {
        Commands::Backtest {
            run,
            strategy,
            params,
            output,
        } => {
            let parameters = parse_parameter_assignments(&params)?;
            let (service, tickers) = prepare_service(&run)?;
            let result =
                service.run_strategy_backtest(&strategy, &parameters, &tickers, run.start, run.end)?;
            for line in format_summary(&result) {
                println!("{}", line);
            }
            if let Some(path) = output {
                write_json(&build_report(&result), &path)?;
            }
        }
        Commands::Compare {
            run,
            strategies,
            output,
        } => {
            let requests: Vec<StrategyRequest> = strategies
                .iter()
                .map(|id| StrategyRequest::new(id.trim(), Default::default()))
                .collect();
            let (service, tickers) = prepare_service(&run)?;
            let comparison = service
                .with_progress(true)
                .compare_strategies(&requests, &tickers, run.start, run.end)?;
            for (name, summary) in &comparison.summaries {
                println!(
                    "{:<20} return {:>8.2}%  sharpe {:>6.2}  drawdown {:>6.2}%  trades {}",
                    name,
                    summary.total_return_percent,
                    summary.sharpe_ratio,
                    summary.max_drawdown_percent,
                    summary.total_trades
                );
            }
            for (name, reason) in &comparison.failures {
                warn!("{} failed: {}", name, reason);
            }
            match comparison.best_overall.as_deref() {
                Some(best) => println!("Best overall (Sharpe): {}", best),
                None => bail!("Every strategy in the comparison failed"),
            }
            if let Some(path) = output {
                write_json(&comparison, &path)?;
            }
        }
        Commands::WalkForward {
            run,
            strategy,
            params,
            train_months,
            test_months,
            output,
        } => {
            let parameters = parse_parameter_assignments(&params)?;
            let (service, tickers) = prepare_service(&run)?;
            let analysis = service.with_progress(true).run_walk_forward_analysis(
                &strategy,
                &parameters,
                &tickers,
                run.start,
                run.end,
                train_months,
                test_months,
            )?;
            let summary = &analysis.summary;
            println!(
                "Periods: {}  average return {:.2}%  average win rate {:.1}%  consistency {:.1}%",
                summary.total_periods,
                summary.average_return_percent,
                summary.average_win_rate * 100.0,
                summary.consistency_score * 100.0
            );
            if let Some(path) = output {
                write_json(&analysis, &path)?;
            }
        }
        Commands::Optimize {
            run,
            strategy,
            params,
            ranges,
            output,
        } => {
            let parameters = parse_parameter_assignments(&params)?;
            let ranges = parse_parameter_ranges(&ranges)?;
            let (service, tickers) = prepare_service(&run)?;
            let optimization = service.with_progress(true).run_parameter_optimization(
                &strategy,
                &parameters,
                &ranges,
                &tickers,
                run.start,
                run.end,
            )?;
            for (label, outcome) in &optimization.results {
                println!(
                    "{:<40} return {:>8.2}%  sharpe {:>6.2}  drawdown {:>6.2}%  trades {}",
                    label,
                    outcome.summary.total_return_percent,
                    outcome.summary.sharpe_ratio,
                    outcome.summary.max_drawdown_percent,
                    outcome.summary.total_trades
                );
            }
            for (label, reason) in &optimization.failures {
                warn!("{} failed: {}", label, reason);
            }
            match optimization.summary.best_sharpe_ratio.as_deref() {
                Some(best) => println!(
                    "Best parameters (Sharpe): {}  [{} combination{} tested]",
                    best,
                    optimization.summary.combinations_tested,
                    if optimization.summary.combinations_tested == 1 { "" } else { "s" }
                ),
                None => bail!("Every parameter combination failed"),
            }
            if let Some(path) = output {
                write_json(&optimization, &path)?;
            }
        }
        Commands::ImportCsv {
            input,
            output,
            interval,
        } => {
            let bars = import_csv(&input)?;
            let source = InMemoryBarSource::new(interval, bars);
            source
                .to_snapshot()
                .save_to_file(&output)
                .with_context(|| format!("Failed to write snapshot {}", output.display()))?;
            info!(
                "Imported {} bars for {} tickers into {}",
                source.bar_count(),
                source.tickers().len(),
                output.display()
            );
        }
        Commands::Strategies => {
            for id in available_strategies() {
                println!("{}", id);
            }
        }
    }

    Ok(())
}

/// Loads data, applies CLI overrides to the environment config and resolves tickers.
fn prepare_service(run: &RunArgs) -> Result<(BacktestingService, Vec<String>)> {
    let source = load_source(&run.data, run.csv_interval)?;

    let mut config = BacktestConfig::from_env()?;
    if let Some(capital) = run.capital {
        config.initial_capital = capital;
    }
    if let Some(commission) = run.commission {
        config.commission_rate = commission;
    }
    if let Some(risk) = run.risk {
        config.risk_per_trade = risk;
    }
    if let Some(index) = run.market_index.as_deref() {
        config.market_index_ticker = normalize_ticker_symbol(index)
            .ok_or_else(|| anyhow!("Market index ticker must not be empty"))?;
    }
    if config.data_interval != source.interval() {
        info!(
            "Using the {} interval of {} instead of configured {}",
            source.interval(),
            run.data.display(),
            config.data_interval
        );
        config.data_interval = source.interval();
    }
    config.validate()?;

    let tickers = if run.tickers.is_empty() {
        let reference = normalize_ticker_symbol(&config.market_index_ticker);
        source
            .tickers()
            .into_iter()
            .filter(|ticker| Some(ticker) != reference.as_ref())
            .collect()
    } else {
        run.tickers.clone()
    };
    if tickers.is_empty() {
        bail!("No tickers to backtest in {}", run.data.display());
    }

    let source: Arc<dyn BarSource + Send + Sync> = Arc::new(source);
    Ok((BacktestingService::new(source, config), tickers))
}

fn load_source(path: &Path, csv_interval: BarInterval) -> Result<InMemoryBarSource> {
    let source = InMemoryBarSource::from_path(path, csv_interval)
        .with_context(|| format!("Failed to load market data from {}", path.display()))?;
    if source.bar_count() == 0 {
        bail!("Market data file {} contains no bars", path.display());
    }
    Ok(source)
}

fn parse_date_arg(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_timestamp(value).ok_or_else(|| format!("invalid date or timestamp: {}", value))
}
