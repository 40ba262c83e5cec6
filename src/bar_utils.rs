use crate::models::Bar;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Groups owned bars keyed by normalized ticker, optionally keeping only a known set.
///
/// Each group comes back sorted ascending by timestamp with one bar per timestamp.
pub fn group_bars_by_ticker(
    bars: impl IntoIterator<Item = Bar>,
    tickers: Option<&[String]>,
) -> BTreeMap<String, Vec<Bar>> {
    let allowed: Option<HashSet<String>> = tickers.map(|list| {
        list.iter()
            .filter_map(|ticker| normalize_ticker_symbol(ticker))
            .collect()
    });

    let mut grouped: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
    for mut bar in bars {
        let Some(key) = normalize_ticker_symbol(&bar.ticker) else {
            continue;
        };
        if let Some(allowed) = allowed.as_ref() {
            if !allowed.contains(&key) {
                continue;
            }
        }
        bar.ticker = key.clone();
        grouped.entry(key).or_default().push(bar);
    }

    grouped
        .par_iter_mut()
        .for_each(|(_, values)| sort_and_dedup(values));
    grouped.retain(|_, values| !values.is_empty());
    grouped
}

/// Sorts ascending by timestamp; for duplicate timestamps the bar seen last wins.
pub fn sort_and_dedup(bars: &mut Vec<Bar>) {
    bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars.drain(..) {
        match deduped.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => deduped.push(bar),
        }
    }
    *bars = deduped;
}

/// Sorted, deduplicated union of every bar timestamp within `[start, end]`.
pub fn build_timeline<'a, I>(
    series: I,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<DateTime<Utc>>
where
    I: IntoIterator<Item = &'a Vec<Bar>>,
{
    let mut timeline = BTreeSet::new();
    for bars in series {
        for bar in bars {
            if bar.timestamp >= start && bar.timestamp <= end {
                timeline.insert(bar.timestamp);
            }
        }
    }
    timeline.into_iter().collect()
}

/// Normalizes a ticker string by trimming whitespace and uppercasing.
pub fn normalize_ticker_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bar(ticker: &str, timestamp: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000,
            indicators: BTreeMap::new(),
        }
    }

    #[test]
    fn group_filters_sorts_and_dedups() {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let tickers = vec!["aaa".to_string(), "BBB".to_string()];
        let bars = vec![
            bar("AAA", base + Duration::days(1), 104.0),
            bar(" aaa", base, 101.0),
            bar("AAA", base + Duration::days(1), 105.0),
            bar("ZZZ", base, 50.5),
        ];

        let grouped = group_bars_by_ticker(bars, Some(&tickers));
        assert_eq!(grouped.len(), 1);
        assert!(grouped.get("BBB").is_none());

        let aaa = grouped.get("AAA").expect("AAA data missing");
        assert_eq!(aaa.len(), 2);
        assert!(aaa[0].timestamp < aaa[1].timestamp);
        assert_eq!(aaa[0].ticker, "AAA");
        assert_eq!(aaa[1].close, 105.0);
    }

    #[test]
    fn timeline_is_sorted_union_within_range() {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let a = vec![bar("A", base, 1.0), bar("A", base + Duration::days(2), 1.0)];
        let b = vec![
            bar("B", base - Duration::days(1), 1.0),
            bar("B", base + Duration::days(1), 1.0),
            bar("B", base + Duration::days(2), 1.0),
            bar("B", base + Duration::days(5), 1.0),
        ];

        let timeline = build_timeline([&a, &b], base, base + Duration::days(2));
        assert_eq!(
            timeline,
            vec![base, base + Duration::days(1), base + Duration::days(2)]
        );
    }

    #[test]
    fn normalize_rejects_blank() {
        assert_eq!(normalize_ticker_symbol("  msft "), Some("MSFT".to_string()));
        assert_eq!(normalize_ticker_symbol("   "), None);
    }
}
