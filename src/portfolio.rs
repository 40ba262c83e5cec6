use crate::models::TradeStatus;
use crate::trade::Trade;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};

pub const STOP_LOSS_RATIONALE: &str = "Stop-loss triggered";
pub const TAKE_PROFIT_RATIONALE: &str = "Take-profit triggered";

const PRICE_EPSILON: f64 = 1e-9;

/// Sole owner of simulated capital and of every trade, open or closed.
///
/// Mutators return `false` instead of failing and never leave a half-applied
/// change behind.
#[derive(Debug, Clone)]
pub struct Portfolio {
    initial_cash: f64,
    current_cash: f64,
    commission_rate: f64,
    open_positions: BTreeMap<String, Trade>,
    closed_trades: Vec<Trade>,
    peak_portfolio_value: f64,
    max_drawdown: f64,
}

impl Portfolio {
    pub fn new(initial_cash: f64, commission_rate: f64) -> Self {
        Self {
            initial_cash,
            current_cash: initial_cash,
            commission_rate,
            open_positions: BTreeMap::new(),
            closed_trades: Vec::new(),
            peak_portfolio_value: initial_cash,
            max_drawdown: 0.0,
        }
    }

    pub fn initial_cash(&self) -> f64 {
        self.initial_cash
    }

    pub fn current_cash(&self) -> f64 {
        self.current_cash
    }

    pub fn commission_rate(&self) -> f64 {
        self.commission_rate
    }

    pub fn peak_portfolio_value(&self) -> f64 {
        self.peak_portfolio_value
    }

    /// Largest peak-to-trough decline seen so far, as a fraction of the peak.
    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    pub fn has_open_position(&self, ticker: &str) -> bool {
        self.open_positions.contains_key(ticker)
    }

    pub fn open_position_for(&self, ticker: &str) -> Option<&Trade> {
        self.open_positions.get(ticker)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Trade> {
        self.open_positions.values()
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn open_tickers(&self) -> Vec<String> {
        self.open_positions.keys().cloned().collect()
    }

    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed_trades
    }

    pub fn into_closed_trades(self) -> Vec<Trade> {
        self.closed_trades
    }

    /// Shares to buy so that hitting the stop loses `risk_per_trade` of current cash.
    ///
    /// Without a usable stop the risked dollars are divided by the entry price instead.
    /// The result is at least 1 and never more than cash can cover including commission.
    pub fn calculate_position_size(
        &self,
        entry_price: f64,
        risk_per_trade: f64,
        stop_loss_price: Option<f64>,
    ) -> u32 {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return 0;
        }

        let risked_dollars = self.current_cash * risk_per_trade;
        let per_share_risk = stop_loss_price
            .map(|stop| (entry_price - stop).abs())
            .filter(|risk| risk.is_finite() && *risk > PRICE_EPSILON)
            .unwrap_or(entry_price);

        let desired = (risked_dollars / per_share_risk).floor().max(0.0);
        let affordable = (self.current_cash / (entry_price * (1.0 + self.commission_rate)))
            .floor()
            .max(0.0);

        desired.min(affordable).max(1.0).min(u32::MAX as f64) as u32
    }

    pub fn can_open_position(&self, entry_price: f64, quantity: u32) -> bool {
        self.current_cash >= entry_price * quantity as f64 * (1.0 + self.commission_rate)
    }

    pub fn open_position(&mut self, trade: Trade) -> bool {
        if !trade.is_open() || trade.quantity() == 0 {
            debug!(
                "Rejecting open for {}: trade is not a fresh position",
                trade.ticker()
            );
            return false;
        }
        if self.open_positions.contains_key(trade.ticker()) {
            debug!(
                "Rejecting open for {}: position already open",
                trade.ticker()
            );
            return false;
        }
        if !self.can_open_position(trade.entry_price(), trade.quantity()) {
            debug!(
                "Rejecting open for {}: {} x {:.2} exceeds cash {:.2}",
                trade.ticker(),
                trade.quantity(),
                trade.entry_price(),
                self.current_cash
            );
            return false;
        }

        let cost = trade.entry_notional() * (1.0 + self.commission_rate);
        self.current_cash -= cost;
        self.open_positions.insert(trade.ticker().to_string(), trade);
        true
    }

    /// Closes the open trade for `ticker` and credits back its entry cost plus realized P&L.
    pub fn close_position(
        &mut self,
        ticker: &str,
        exit_timestamp: DateTime<Utc>,
        exit_price: f64,
        rationale: Vec<String>,
        status: TradeStatus,
    ) -> bool {
        let Some(mut trade) = self.open_positions.remove(ticker) else {
            return false;
        };

        if !trade.close(
            exit_timestamp,
            exit_price,
            self.commission_rate,
            rationale,
            status,
        ) {
            self.open_positions.insert(ticker.to_string(), trade);
            return false;
        }

        // Realized P&L is already net of both commission legs and the entry leg was
        // debited at open, so it is refunded here to charge each leg exactly once.
        let entry_commission = trade.entry_notional() * self.commission_rate;
        let realized = trade.realized_pnl().unwrap_or(0.0);
        self.current_cash += trade.entry_notional() + entry_commission + realized;
        info!(
            "Closed {} {} x {} @ {:.2} ({}): P&L {:.2}",
            trade.direction().as_str(),
            ticker,
            trade.quantity(),
            exit_price,
            status.as_str(),
            realized
        );
        self.closed_trades.push(trade);
        true
    }

    /// Closes every trade whose stop or take-profit is hit by `price_map`.
    ///
    /// Fills happen at the stop or take-profit level. Returns labels such as
    /// `AAPL_STOP_LOSS` for each closed trade.
    pub fn check_stop_loss_take_profit(
        &mut self,
        price_map: &HashMap<String, f64>,
        timestamp: DateTime<Utc>,
    ) -> Vec<String> {
        let mut triggered = Vec::new();
        for (ticker, trade) in &self.open_positions {
            let Some(&price) = price_map.get(ticker) else {
                continue;
            };
            if trade.is_stop_loss_triggered(price) {
                if let Some(stop) = trade.stop_loss_price() {
                    triggered.push((ticker.clone(), stop, TradeStatus::StopLoss));
                }
            } else if trade.is_take_profit_triggered(price) {
                if let Some(target) = trade.take_profit_price() {
                    triggered.push((ticker.clone(), target, TradeStatus::TakeProfit));
                }
            }
        }

        let mut closed = Vec::with_capacity(triggered.len());
        for (ticker, fill_price, status) in triggered {
            let rationale = match status {
                TradeStatus::StopLoss => STOP_LOSS_RATIONALE,
                _ => TAKE_PROFIT_RATIONALE,
            };
            if self.close_position(
                &ticker,
                timestamp,
                fill_price,
                vec![rationale.to_string()],
                status,
            ) {
                closed.push(format!("{}_{}", ticker, status.as_str()));
            } else {
                warn!("Failed to close {} after {} trigger", ticker, status.as_str());
            }
        }
        closed
    }

    /// Cash plus the marked value of every open trade.
    ///
    /// A trade whose ticker is absent from `price_map` is carried at its entry notional.
    pub fn get_portfolio_value(&self, price_map: &HashMap<String, f64>) -> f64 {
        let positions_value: f64 = self
            .open_positions
            .iter()
            .map(|(ticker, trade)| {
                let unrealized = price_map
                    .get(ticker)
                    .map(|&price| trade.unrealized_pnl(price))
                    .unwrap_or(0.0);
                trade.entry_notional() + unrealized
            })
            .sum();
        self.current_cash + positions_value
    }

    pub fn update_drawdown(&mut self, price_map: &HashMap<String, f64>) {
        let current_value = self.get_portfolio_value(price_map);
        if current_value > self.peak_portfolio_value {
            self.peak_portfolio_value = current_value;
        }
        if self.peak_portfolio_value > 0.0 {
            let drawdown = (self.peak_portfolio_value - current_value) / self.peak_portfolio_value;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeDirection;
    use crate::trade::tests::entry;
    use crate::trade::TradeEntry;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn prices(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs
            .iter()
            .map(|(ticker, price)| (ticker.to_string(), *price))
            .collect()
    }

    fn long(ticker: &str, price: f64, quantity: u32) -> Trade {
        Trade::open(entry(ticker, TradeDirection::Long, price, quantity, None, None))
    }

    #[test]
    fn take_profit_closes_at_target_price() {
        let mut portfolio = Portfolio::new(100_000.0, 0.001);
        let trade = Trade::open(entry(
            "AAA",
            TradeDirection::Long,
            100.0,
            100,
            Some(95.0),
            Some(115.0),
        ));
        let entered_at = trade.entry_timestamp();
        assert!(portfolio.open_position(trade));
        assert!((portfolio.current_cash() - 89_990.0).abs() < 1e-9);

        let closed = portfolio.check_stop_loss_take_profit(
            &prices(&[("AAA", 116.0)]),
            entered_at + Duration::hours(1),
        );
        assert_eq!(closed, vec!["AAA_TAKE_PROFIT".to_string()]);

        let trade = &portfolio.closed_trades()[0];
        assert_eq!(trade.exit_price(), Some(115.0));
        assert_eq!(trade.status(), TradeStatus::TakeProfit);
        assert!((trade.realized_pnl().unwrap() - 1478.5).abs() < 1e-9);
        assert!((portfolio.current_cash() - 101_478.5).abs() < 1e-9);
        assert!(!portfolio.has_open_position("AAA"));
    }

    #[test]
    fn stop_wins_over_take_profit_when_both_trigger() {
        let mut portfolio = Portfolio::new(10_000.0, 0.0);
        // Degenerate levels so one price satisfies both predicates.
        let trade = Trade::open(entry(
            "AAA",
            TradeDirection::Long,
            100.0,
            10,
            Some(101.0),
            Some(99.0),
        ));
        let at = trade.entry_timestamp() + Duration::hours(1);
        assert!(portfolio.open_position(trade));

        let closed = portfolio.check_stop_loss_take_profit(&prices(&[("AAA", 100.0)]), at);
        assert_eq!(closed, vec!["AAA_STOP_LOSS".to_string()]);
        assert_eq!(portfolio.closed_trades()[0].exit_price(), Some(101.0));
    }

    #[test]
    fn exits_skip_tickers_without_price() {
        let mut portfolio = Portfolio::new(10_000.0, 0.0);
        let trade = Trade::open(entry(
            "AAA",
            TradeDirection::Long,
            100.0,
            10,
            Some(95.0),
            None,
        ));
        let at = trade.entry_timestamp();
        assert!(portfolio.open_position(trade));
        let closed = portfolio.check_stop_loss_take_profit(&prices(&[("BBB", 1.0)]), at);
        assert!(closed.is_empty());
        assert!(portfolio.has_open_position("AAA"));
    }

    #[test]
    fn position_size_from_stop_distance() {
        let portfolio = Portfolio::new(50_000.0, 0.001);
        assert_eq!(portfolio.calculate_position_size(50.0, 0.02, Some(48.0)), 500);
        assert!(portfolio.can_open_position(50.0, 500));
    }

    #[test]
    fn position_size_without_stop_divides_by_price() {
        let portfolio = Portfolio::new(50_000.0, 0.0);
        assert_eq!(portfolio.calculate_position_size(50.0, 0.02, None), 20);
        // A zero-width stop falls back the same way.
        assert_eq!(portfolio.calculate_position_size(50.0, 0.02, Some(50.0)), 20);
    }

    #[test]
    fn position_size_is_clamped_to_affordable_and_at_least_one() {
        let portfolio = Portfolio::new(1_000.0, 0.001);
        // Tight stop asks for 1,000 shares, cash covers only 9.
        assert_eq!(portfolio.calculate_position_size(100.0, 0.5, Some(99.5)), 9);

        let tiny_risk = Portfolio::new(1_000.0, 0.0);
        assert_eq!(tiny_risk.calculate_position_size(100.0, 0.0001, Some(90.0)), 1);
    }

    #[test]
    fn open_rejects_insufficient_cash_without_mutation() {
        let mut portfolio = Portfolio::new(1_000.0, 0.001);
        assert!(!portfolio.open_position(long("AAA", 100.0, 10)));
        assert_eq!(portfolio.current_cash(), 1_000.0);
        assert_eq!(portfolio.open_position_count(), 0);
    }

    #[test]
    fn only_first_open_per_ticker_succeeds() {
        let mut portfolio = Portfolio::new(100_000.0, 0.0);
        assert!(portfolio.open_position(long("AAA", 10.0, 10)));
        let cash_after_first = portfolio.current_cash();
        assert!(!portfolio.open_position(long("AAA", 11.0, 10)));
        assert_eq!(portfolio.current_cash(), cash_after_first);
        assert_eq!(portfolio.open_position_count(), 1);

        let at = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        assert!(portfolio.close_position("AAA", at, 12.0, Vec::new(), TradeStatus::Closed));
        assert!(portfolio.open_position(long("AAA", 12.0, 10)));
    }

    #[test]
    fn close_without_open_position_is_noop() {
        let mut portfolio = Portfolio::new(1_000.0, 0.0);
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        assert!(!portfolio.close_position("AAA", at, 1.0, Vec::new(), TradeStatus::Closed));
        assert_eq!(portfolio.current_cash(), 1_000.0);
        assert!(portfolio.closed_trades().is_empty());
    }

    #[test]
    fn close_with_open_status_leaves_position_in_place() {
        let mut portfolio = Portfolio::new(10_000.0, 0.0);
        assert!(portfolio.open_position(long("AAA", 10.0, 10)));
        let cash = portfolio.current_cash();
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        assert!(!portfolio.close_position("AAA", at, 12.0, Vec::new(), TradeStatus::Open));
        assert!(portfolio.has_open_position("AAA"));
        assert_eq!(portfolio.current_cash(), cash);
    }

    #[test]
    fn valuation_carries_unpriced_positions_at_entry_notional() {
        let mut portfolio = Portfolio::new(10_000.0, 0.0);
        assert!(portfolio.open_position(long("AAA", 10.0, 100)));
        assert!(portfolio.open_position(long("BBB", 20.0, 50)));

        let value = portfolio.get_portfolio_value(&prices(&[("AAA", 12.0)]));
        // cash 8,000 + AAA marked 1,200 + BBB carried at 1,000
        assert!((value - 10_200.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let mut portfolio = Portfolio::new(10_000.0, 0.0);
        assert!(portfolio.open_position(long("AAA", 100.0, 50)));

        portfolio.update_drawdown(&prices(&[("AAA", 120.0)]));
        assert!((portfolio.peak_portfolio_value() - 11_000.0).abs() < 1e-9);
        assert_eq!(portfolio.max_drawdown(), 0.0);

        portfolio.update_drawdown(&prices(&[("AAA", 98.0)]));
        assert!((portfolio.max_drawdown() - 1_100.0 / 11_000.0).abs() < 1e-12);

        portfolio.update_drawdown(&prices(&[("AAA", 110.0)]));
        assert!((portfolio.max_drawdown() - 0.1).abs() < 1e-12);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open { ticker: usize, price: f64, quantity: u32 },
        Close { ticker: usize, price: f64 },
        Mark { prices: Vec<f64> },
    }

    const TICKERS: [&str; 3] = ["AAA", "BBB", "CCC"];

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 1.0..200.0f64, 1..200u32).prop_map(|(ticker, price, quantity)| Op::Open {
                ticker,
                price,
                quantity
            }),
            (0..3usize, 1.0..200.0f64).prop_map(|(ticker, price)| Op::Close { ticker, price }),
            proptest::collection::vec(1.0..200.0f64, 3).prop_map(|prices| Op::Mark { prices }),
        ]
    }

    fn open_entry(ticker: &str, price: f64, quantity: u32) -> TradeEntry {
        entry(ticker, TradeDirection::Long, price, quantity, None, None)
    }

    proptest! {
        #[test]
        fn cash_is_conserved_without_commission(ops in proptest::collection::vec(arb_op(), 1..60)) {
            let initial = 50_000.0;
            let mut portfolio = Portfolio::new(initial, 0.0);
            let base = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();

            for (step, op) in ops.into_iter().enumerate() {
                let at = base + Duration::hours(step as i64);
                match op {
                    Op::Open { ticker, price, quantity } => {
                        portfolio.open_position(Trade::open(open_entry(TICKERS[ticker], price, quantity)));
                    }
                    Op::Close { ticker, price } => {
                        portfolio.close_position(TICKERS[ticker], at, price, Vec::new(), TradeStatus::Closed);
                    }
                    Op::Mark { prices } => {
                        let map: HashMap<String, f64> = TICKERS
                            .iter()
                            .zip(prices)
                            .map(|(ticker, price)| (ticker.to_string(), price))
                            .collect();
                        portfolio.update_drawdown(&map);
                    }
                }
                prop_assert!(portfolio.current_cash() >= -1e-6);
            }

            let open_notional: f64 = portfolio.open_positions().map(|t| t.entry_notional()).sum();
            let realized: f64 = portfolio
                .closed_trades()
                .iter()
                .filter_map(|t| t.realized_pnl())
                .sum();
            let lhs = portfolio.current_cash() + open_notional;
            let rhs = initial + realized;
            prop_assert!((lhs - rhs).abs() < 1e-6 * initial.max(rhs.abs()));
        }

        #[test]
        fn max_drawdown_never_decreases(marks in proptest::collection::vec(1.0..500.0f64, 1..80)) {
            let mut portfolio = Portfolio::new(10_000.0, 0.001);
            prop_assert!(portfolio.open_position(long("AAA", 100.0, 40)));
            let mut previous = portfolio.max_drawdown();
            for price in marks {
                portfolio.update_drawdown(&prices(&[("AAA", price)]));
                prop_assert!(portfolio.max_drawdown() >= previous);
                previous = portfolio.max_drawdown();
            }
        }

        #[test]
        fn at_most_one_open_trade_per_ticker(quantities in proptest::collection::vec(1..20u32, 2..10)) {
            let mut portfolio = Portfolio::new(1_000_000.0, 0.0);
            let results: Vec<bool> = quantities
                .iter()
                .map(|&quantity| portfolio.open_position(long("AAA", 10.0, quantity)))
                .collect();
            prop_assert!(results[0]);
            prop_assert!(results[1..].iter().all(|opened| !opened));
            prop_assert_eq!(portfolio.open_position_count(), 1);
        }
    }
}
