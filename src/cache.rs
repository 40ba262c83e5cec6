use crate::models::{LongTermTrend, TrendType};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};

/// Per-instrument context recomputed once per simulated day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentContext {
    pub long_term_trend: Option<LongTermTrend>,
    pub auxiliary: BTreeMap<String, f64>,
}

/// Trend values shared by every timestamp of one calendar day.
///
/// Owned by a single engine run: `reset` at run start, refreshed on the first
/// timestamp of each new UTC date. Readers may see values up to one day old.
#[derive(Debug, Clone, Default)]
pub struct DailyTrendCache {
    as_of: Option<NaiveDate>,
    market_trend: TrendType,
    instruments: HashMap<String, InstrumentContext>,
    refresh_count: usize,
}

impl DailyTrendCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn needs_refresh(&self, timestamp: DateTime<Utc>) -> bool {
        self.as_of != Some(timestamp.date_naive())
    }

    /// Runs `compute` only when `timestamp` falls on a date not cached yet.
    /// Returns whether a refresh happened.
    pub fn ensure_fresh<F>(&mut self, timestamp: DateTime<Utc>, compute: F) -> bool
    where
        F: FnOnce() -> (TrendType, HashMap<String, InstrumentContext>),
    {
        if !self.needs_refresh(timestamp) {
            return false;
        }
        let (market_trend, instruments) = compute();
        self.as_of = Some(timestamp.date_naive());
        self.market_trend = market_trend;
        self.instruments = instruments;
        self.refresh_count += 1;
        true
    }

    pub fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }

    pub fn market_trend(&self) -> TrendType {
        self.market_trend
    }

    pub fn instrument(&self, ticker: &str) -> Option<&InstrumentContext> {
        self.instruments.get(ticker)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn refreshes_once_per_calendar_day() {
        let mut cache = DailyTrendCache::new();
        let morning = Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap();

        assert!(cache.ensure_fresh(morning, || (TrendType::Bullish, HashMap::new())));
        assert!(!cache.ensure_fresh(morning + Duration::hours(3), || {
            (TrendType::Bearish, HashMap::new())
        }));
        assert_eq!(cache.market_trend(), TrendType::Bullish);

        assert!(cache.ensure_fresh(morning + Duration::days(1), || {
            (TrendType::Bearish, HashMap::new())
        }));
        assert_eq!(cache.market_trend(), TrendType::Bearish);
        assert_eq!(cache.refresh_count(), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let mut cache = DailyTrendCache::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap();
        let mut instruments = HashMap::new();
        instruments.insert("AAA".to_string(), InstrumentContext::default());
        cache.ensure_fresh(at, || (TrendType::Bullish, instruments));
        assert!(cache.instrument("AAA").is_some());

        cache.reset();
        assert!(cache.as_of().is_none());
        assert!(cache.instrument("AAA").is_none());
        assert_eq!(cache.market_trend(), TrendType::Neutral);
        assert_eq!(cache.refresh_count(), 0);
        assert!(cache.needs_refresh(at));
    }
}
