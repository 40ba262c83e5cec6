use crate::models::{TradeDirection, TradeStatus, TrendType};
use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything known about a position at the moment it is opened.
#[derive(Debug, Clone)]
pub struct TradeEntry {
    pub ticker: String,
    pub direction: TradeDirection,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub quantity: u32,
    pub score: f64,
    pub evidence: Vec<String>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub market_trend: TrendType,
    pub long_term_trend: Option<TrendType>,
}

/// One simulated position. Exit fields stay `None` while the trade is open and are
/// written exactly once when the owning portfolio closes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    id: String,
    ticker: String,
    direction: TradeDirection,
    status: TradeStatus,
    entry_timestamp: DateTime<Utc>,
    entry_price: f64,
    quantity: u32,
    entry_score: f64,
    entry_evidence: Vec<String>,
    stop_loss_price: Option<f64>,
    take_profit_price: Option<f64>,
    market_trend_at_entry: TrendType,
    long_term_trend_at_entry: Option<TrendType>,
    exit_timestamp: Option<DateTime<Utc>>,
    exit_price: Option<f64>,
    exit_rationale: Option<Vec<String>>,
    realized_pnl: Option<f64>,
    realized_pnl_percent: Option<f64>,
    commission_paid: Option<f64>,
    holding_period_seconds: Option<i64>,
}

impl Trade {
    pub fn open(entry: TradeEntry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ticker: entry.ticker,
            direction: entry.direction,
            status: TradeStatus::Open,
            entry_timestamp: entry.timestamp,
            entry_price: entry.price,
            quantity: entry.quantity,
            entry_score: entry.score,
            entry_evidence: entry.evidence,
            stop_loss_price: entry.stop_loss_price,
            take_profit_price: entry.take_profit_price,
            market_trend_at_entry: entry.market_trend,
            long_term_trend_at_entry: entry.long_term_trend,
            exit_timestamp: None,
            exit_price: None,
            exit_rationale: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            commission_paid: None,
            holding_period_seconds: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn direction(&self) -> TradeDirection {
        self.direction
    }

    pub fn status(&self) -> TradeStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn entry_timestamp(&self) -> DateTime<Utc> {
        self.entry_timestamp
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn entry_score(&self) -> f64 {
        self.entry_score
    }

    pub fn entry_evidence(&self) -> &[String] {
        &self.entry_evidence
    }

    pub fn stop_loss_price(&self) -> Option<f64> {
        self.stop_loss_price
    }

    pub fn take_profit_price(&self) -> Option<f64> {
        self.take_profit_price
    }

    pub fn market_trend_at_entry(&self) -> TrendType {
        self.market_trend_at_entry
    }

    pub fn long_term_trend_at_entry(&self) -> Option<TrendType> {
        self.long_term_trend_at_entry
    }

    pub fn exit_timestamp(&self) -> Option<DateTime<Utc>> {
        self.exit_timestamp
    }

    pub fn exit_price(&self) -> Option<f64> {
        self.exit_price
    }

    pub fn exit_rationale(&self) -> Option<&[String]> {
        self.exit_rationale.as_deref()
    }

    pub fn realized_pnl(&self) -> Option<f64> {
        self.realized_pnl
    }

    pub fn realized_pnl_percent(&self) -> Option<f64> {
        self.realized_pnl_percent
    }

    pub fn commission_paid(&self) -> Option<f64> {
        self.commission_paid
    }

    pub fn holding_period(&self) -> Option<Duration> {
        self.holding_period_seconds.map(Duration::seconds)
    }

    pub fn holding_period_hours(&self) -> Option<f64> {
        self.holding_period_seconds
            .map(|seconds| seconds as f64 / 3600.0)
    }

    pub fn entry_notional(&self) -> f64 {
        self.entry_price * self.quantity as f64
    }

    /// Price move in the trade's favour times quantity, before commission.
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity as f64 * self.direction.sign()
    }

    pub fn is_stop_loss_triggered(&self, current_price: f64) -> bool {
        match (self.stop_loss_price, self.direction) {
            (Some(stop), TradeDirection::Long) => current_price <= stop,
            (Some(stop), TradeDirection::Short) => current_price >= stop,
            (None, _) => false,
        }
    }

    pub fn is_take_profit_triggered(&self, current_price: f64) -> bool {
        match (self.take_profit_price, self.direction) {
            (Some(target), TradeDirection::Long) => current_price >= target,
            (Some(target), TradeDirection::Short) => current_price <= target,
            (None, _) => false,
        }
    }

    /// Moves the trade into a terminal status and records the realized outcome.
    ///
    /// Commission is `commission_rate * (entry_notional + exit_notional)` and is
    /// subtracted from the realized P&L. Returns `false` without touching any field
    /// when the trade is already closed or `status` is not terminal.
    pub(crate) fn close(
        &mut self,
        exit_timestamp: DateTime<Utc>,
        exit_price: f64,
        commission_rate: f64,
        exit_rationale: Vec<String>,
        status: TradeStatus,
    ) -> bool {
        if self.status.is_terminal() {
            warn!(
                "Trade {} for {} is already {}; ignoring close request",
                self.id,
                self.ticker,
                self.status.as_str()
            );
            return false;
        }
        if !status.is_terminal() {
            warn!(
                "Refusing to close trade {} for {} with non-terminal status {}",
                self.id,
                self.ticker,
                status.as_str()
            );
            return false;
        }

        let entry_notional = self.entry_notional();
        let exit_notional = exit_price * self.quantity as f64;
        let commission = commission_rate * (entry_notional + exit_notional);
        let pnl = self.unrealized_pnl(exit_price) - commission;
        let pnl_percent = if entry_notional > 0.0 {
            pnl / entry_notional * 100.0
        } else {
            0.0
        };

        self.status = status;
        self.exit_timestamp = Some(exit_timestamp);
        self.exit_price = Some(exit_price);
        self.exit_rationale = Some(exit_rationale);
        self.realized_pnl = Some(pnl);
        self.realized_pnl_percent = Some(pnl_percent);
        self.commission_paid = Some(commission);
        self.holding_period_seconds = Some((exit_timestamp - self.entry_timestamp).num_seconds());
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn entry(
        ticker: &str,
        direction: TradeDirection,
        price: f64,
        quantity: u32,
        stop: Option<f64>,
        target: Option<f64>,
    ) -> TradeEntry {
        TradeEntry {
            ticker: ticker.to_string(),
            direction,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap(),
            price,
            quantity,
            score: 12.0,
            evidence: vec!["test entry".to_string()],
            stop_loss_price: stop,
            take_profit_price: target,
            market_trend: TrendType::Bullish,
            long_term_trend: Some(TrendType::Bullish),
        }
    }

    #[test]
    fn long_close_subtracts_commission_on_both_legs() {
        let mut trade = Trade::open(entry(
            "AAA",
            TradeDirection::Long,
            100.0,
            100,
            Some(95.0),
            Some(115.0),
        ));
        let exit_at = Utc.with_ymd_and_hms(2024, 3, 2, 15, 30, 0).unwrap();

        assert!(trade.close(
            exit_at,
            115.0,
            0.001,
            vec!["Take-profit triggered".to_string()],
            TradeStatus::TakeProfit,
        ));

        let pnl = trade.realized_pnl().unwrap();
        assert!((pnl - 1478.5).abs() < 1e-9);
        assert!((trade.realized_pnl_percent().unwrap() - 14.785).abs() < 1e-9);
        assert!((trade.commission_paid().unwrap() - 21.5).abs() < 1e-9);
        assert_eq!(trade.status(), TradeStatus::TakeProfit);
        assert!((trade.holding_period_hours().unwrap() - 25.5).abs() < 1e-9);
    }

    #[test]
    fn short_pnl_profits_from_falling_price() {
        let mut trade = Trade::open(entry("BBB", TradeDirection::Short, 50.0, 10, None, None));
        assert!((trade.unrealized_pnl(45.0) - 50.0).abs() < 1e-9);
        assert!((trade.unrealized_pnl(55.0) + 50.0).abs() < 1e-9);

        let exit_at = trade.entry_timestamp() + Duration::hours(3);
        assert!(trade.close(exit_at, 40.0, 0.0, Vec::new(), TradeStatus::Closed));
        assert!((trade.realized_pnl().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn second_close_keeps_first_outcome() {
        let mut trade = Trade::open(entry("AAA", TradeDirection::Long, 10.0, 5, None, None));
        let first_exit = trade.entry_timestamp() + Duration::hours(1);
        assert!(trade.close(first_exit, 12.0, 0.0, Vec::new(), TradeStatus::Closed));
        let first_pnl = trade.realized_pnl();

        assert!(!trade.close(
            first_exit + Duration::hours(1),
            1.0,
            0.0,
            Vec::new(),
            TradeStatus::StopLoss,
        ));
        assert_eq!(trade.realized_pnl(), first_pnl);
        assert_eq!(trade.exit_price(), Some(12.0));
        assert_eq!(trade.status(), TradeStatus::Closed);
    }

    #[test]
    fn open_trade_has_no_exit_fields() {
        let trade = Trade::open(entry("AAA", TradeDirection::Long, 10.0, 5, None, None));
        assert!(trade.is_open());
        assert!(trade.exit_timestamp().is_none());
        assert!(trade.exit_price().is_none());
        assert!(trade.exit_rationale().is_none());
        assert!(trade.realized_pnl().is_none());
        assert!(trade.holding_period().is_none());
    }

    #[test]
    fn close_rejects_open_status() {
        let mut trade = Trade::open(entry("AAA", TradeDirection::Long, 10.0, 5, None, None));
        let exit_at = trade.entry_timestamp() + Duration::hours(1);
        assert!(!trade.close(exit_at, 11.0, 0.0, Vec::new(), TradeStatus::Open));
        assert!(trade.is_open());
        assert!(trade.realized_pnl().is_none());
    }

    #[test]
    fn exit_predicates_are_direction_aware() {
        let long = Trade::open(entry(
            "AAA",
            TradeDirection::Long,
            100.0,
            1,
            Some(95.0),
            Some(110.0),
        ));
        assert!(long.is_stop_loss_triggered(95.0));
        assert!(!long.is_stop_loss_triggered(95.01));
        assert!(long.is_take_profit_triggered(110.0));
        assert!(!long.is_take_profit_triggered(109.99));

        let short = Trade::open(entry(
            "AAA",
            TradeDirection::Short,
            100.0,
            1,
            Some(105.0),
            Some(90.0),
        ));
        assert!(short.is_stop_loss_triggered(105.0));
        assert!(!short.is_stop_loss_triggered(104.0));
        assert!(short.is_take_profit_triggered(89.0));
        assert!(!short.is_take_profit_triggered(91.0));

        let unprotected = Trade::open(entry("AAA", TradeDirection::Long, 100.0, 1, None, None));
        assert!(!unprotected.is_stop_loss_triggered(0.0));
        assert!(!unprotected.is_take_profit_triggered(1_000.0));
    }
}
