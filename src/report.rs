use crate::result::BacktestResult;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Human-oriented summary on top of the full result dictionary.
pub fn build_report(result: &BacktestResult) -> Value {
    let metrics = result.metrics();
    json!({
        "executive_summary": {
            "backtest_period": format!(
                "{} to {}",
                result.start_date.format("%Y-%m-%d"),
                result.end_date.format("%Y-%m-%d")
            ),
            "strategy": result.settings.strategy_id,
            "total_return": format!("{:.2}%", metrics.total_return_percent),
            "annualized_return": format!("{:.2}%", metrics.annualized_return_percent),
            "max_drawdown": format!("{:.2}%", metrics.max_drawdown_percent),
            "sharpe_ratio": format!("{:.2}", metrics.sharpe_ratio),
            "win_rate": format!("{:.1}%", metrics.win_rate * 100.0),
            "total_trades": metrics.total_trades,
        },
        "detailed_metrics": result.to_value(),
        "trade_analysis": {
            "signal_strength": result.analyze_by_signal_strength(),
            "market_conditions": result.analyze_by_market_condition(),
            "holding_periods": result.analyze_by_holding_period(),
        },
        "monthly_performance": result.monthly_performance(),
    })
}

/// Pretty-printed JSON, creating parent directories as needed.
pub fn write_json<T: Serialize + ?Sized, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to serialize JSON to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    info!("Report saved to {}", path.display());
    Ok(())
}

/// Plain-text lines for the terminal.
pub fn format_summary(result: &BacktestResult) -> Vec<String> {
    let metrics = result.metrics();
    let profit_factor = if metrics.profit_factor.is_finite() {
        format!("{:.2}", metrics.profit_factor)
    } else {
        "inf".to_string()
    };
    vec![
        format!(
            "Period: {} to {}",
            result.start_date.format("%Y-%m-%d %H:%M"),
            result.end_date.format("%Y-%m-%d %H:%M")
        ),
        format!(
            "Capital: {:.2} -> {:.2} ({:+.2}%, annualized {:+.2}%)",
            result.initial_capital,
            result.final_capital,
            metrics.total_return_percent,
            metrics.annualized_return_percent
        ),
        format!(
            "Risk: max drawdown {:.2}%, Sharpe {:.2}, Sortino {:.2}",
            metrics.max_drawdown_percent, metrics.sharpe_ratio, metrics.sortino_ratio
        ),
        format!(
            "Trades: {} ({} won, {} lost, win rate {:.1}%, profit factor {})",
            metrics.total_trades,
            metrics.winning_trades,
            metrics.losing_trades,
            metrics.win_rate * 100.0,
            profit_factor
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacktestConfig;
    use crate::result::BacktestSettings;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn empty_result() -> BacktestResult {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut result = BacktestResult::new(
            start,
            start + Duration::days(31),
            100_000.0,
            100_000.0,
            BacktestSettings {
                tickers: vec!["AAA".to_string()],
                strategy_id: "buy_and_hold".to_string(),
                strategy_parameters: BTreeMap::new(),
                config: BacktestConfig::default(),
            },
            0.0,
            Vec::new(),
            Vec::new(),
        );
        result.calculate_metrics();
        result
    }

    #[test]
    fn report_has_every_section() {
        let report = build_report(&empty_result());
        assert_eq!(
            report["executive_summary"]["backtest_period"],
            json!("2024-01-01 to 2024-02-01")
        );
        assert_eq!(report["executive_summary"]["total_return"], json!("0.00%"));
        assert!(report["detailed_metrics"]["settings"].is_object());
        assert!(report["trade_analysis"]["signal_strength"]["weak"].is_object());
        assert_eq!(report["monthly_performance"], json!([]));
    }

    #[test]
    fn write_json_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");
        write_json(&build_report(&empty_result()), &path).unwrap();

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["executive_summary"]["strategy"], json!("buy_and_hold"));
    }

    #[test]
    fn summary_lines_mention_capital_and_trades() {
        let lines = format_summary(&empty_result());
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("100000.00 -> 100000.00"));
        assert!(lines[3].starts_with("Trades: 0"));
    }
}
