use crate::indicators::latest_sma;
use crate::models::{Bar, LongTermTrend, TrendType};

/// Classifies the broad market from the reference instrument's bars up to the
/// current simulated time. Implementations must not look past the last bar given.
pub trait MarketTrendProvider {
    fn classify(&self, reference_window: &[Bar]) -> TrendType;
}

/// Close above its moving average is bullish, below is bearish.
#[derive(Debug, Clone)]
pub struct SmaTrendProvider {
    period: usize,
}

impl SmaTrendProvider {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl MarketTrendProvider for SmaTrendProvider {
    fn classify(&self, reference_window: &[Bar]) -> TrendType {
        classify_against_sma(reference_window, self.period)
            .map(|trend| trend.trend)
            .unwrap_or(TrendType::Neutral)
    }
}

/// Long-term trend of a single instrument, `None` until `period` bars exist.
pub fn classify_long_term_trend(bars: &[Bar], period: usize) -> Option<LongTermTrend> {
    classify_against_sma(bars, period)
}

fn classify_against_sma(bars: &[Bar], period: usize) -> Option<LongTermTrend> {
    let last = bars.last()?;
    let sma = latest_sma(bars, period)?;
    let trend = if last.close > sma {
        TrendType::Bullish
    } else if last.close < sma {
        TrendType::Bearish
    } else {
        TrendType::Neutral
    };
    Some(LongTermTrend {
        trend,
        close: last.close,
        sma,
        sma_period: period,
    })
}
