//! Diff-and-execute: compares the final target set against live holdings
//! and emits the minimal order list to close the gap.
//!
//! Exit priority outranks price: closes and reduces always go out as
//! market orders and are emitted before any entry. Entries follow the
//! signal-age policy: fresh signals go market bounded by slippage (and
//! are skipped, not chased, when price has already run), mid-aged signals
//! go limit at the reference price and expire at the next tick, stale
//! signals are dropped.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::engine::config::{ExecConfig, StopConfig};
use crate::models::{
    ManagedPosition, Order, OrderConstraints, OrderIntent, Side, StopState, TargetPortfolio,
};

pub struct ExecutionDiffer {
    exec: ExecConfig,
    stop_loss_pct: Decimal,
}

impl ExecutionDiffer {
    pub fn new(exec: ExecConfig, stops: &StopConfig) -> Self {
        Self {
            exec,
            stop_loss_pct: stops.stop_loss_pct,
        }
    }

    /// Produce the ordered list of orders reconciling holdings toward the
    /// target. Equal target and holdings yield an empty list.
    pub fn diff(
        &self,
        target: &TargetPortfolio,
        holdings: &[ManagedPosition],
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Vec<Order> {
        let mut closes = Vec::new();
        let mut reduces = Vec::new();
        let mut entries = Vec::new();

        // Positions with no surviving target (or whose side flipped) are
        // closed outright. Positions already in CLOSING belong to the stop
        // monitor and are left alone.
        for position in holdings {
            if position.state == StopState::Closing {
                continue;
            }
            if target.entry(&position.token, position.side).is_none() {
                let price = self.mark_price(prices, &position.token, position.current_price);
                closes.push(self.market_exit(
                    OrderIntent::Close,
                    position,
                    position.notional(price),
                    price,
                    now,
                ));
            }
        }

        for entry in &target.entries {
            let held = holdings
                .iter()
                .find(|p| p.token == entry.token && p.side == entry.side);

            match held {
                Some(position) if position.state == StopState::Closing => {
                    // Being closed by the stop monitor; do not fight it.
                    continue;
                }
                Some(position) => {
                    let price = self.mark_price(prices, &entry.token, position.current_price);
                    let delta = entry.target_usd - position.notional(price);

                    if delta.abs() < self.exec.min_rebalance_usd {
                        debug!(
                            token = %entry.token,
                            delta = %delta,
                            "Delta below rebalance threshold, leaving alone"
                        );
                        continue;
                    }

                    if delta < Decimal::ZERO {
                        reduces.push(self.market_exit(
                            OrderIntent::Reduce,
                            position,
                            delta.abs(),
                            price,
                            now,
                        ));
                    } else if let Some(order) =
                        self.entry_order(OrderIntent::Add, entry, delta, prices, now)
                    {
                        entries.push(order);
                    }
                }
                None => {
                    if let Some(order) =
                        self.entry_order(OrderIntent::Open, entry, entry.target_usd, prices, now)
                    {
                        entries.push(order);
                    }
                }
            }
        }

        let mut orders = closes;
        orders.append(&mut reduces);
        orders.append(&mut entries);
        orders
    }

    /// Build an open/add order per the signal-age decision tree, or skip.
    fn entry_order(
        &self,
        intent: OrderIntent,
        entry: &crate::models::TargetPortfolioEntry,
        size_usd: Decimal,
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Option<Order> {
        let age_secs = (now - entry.observed_at).num_seconds();
        if age_secs >= self.exec.stale_signal_secs {
            info!(
                token = %entry.token,
                age_secs,
                "Signal stale, skipping entry"
            );
            return None;
        }

        let current = self.mark_price(prices, &entry.token, entry.reference_price);

        let order = if age_secs < self.exec.fresh_signal_secs {
            // Fresh: market, but only if price has not already run away.
            let drift = if entry.reference_price.is_zero() {
                Decimal::ZERO
            } else {
                ((current - entry.reference_price) / entry.reference_price).abs()
            };
            if drift > self.exec.max_slippage {
                info!(
                    token = %entry.token,
                    drift = %drift,
                    tolerance = %self.exec.max_slippage,
                    "Price moved beyond slippage tolerance, skipping this cycle"
                );
                return None;
            }
            Order::market(
                intent,
                entry.token.clone(),
                entry.side,
                size_usd,
                OrderConstraints {
                    max_slippage: self.exec.max_slippage,
                    reference_price: entry.reference_price,
                    deadline: now + Duration::seconds(self.exec.limit_ttl_secs),
                },
            )
        } else {
            // Mid-aged: limit at the reference price, expiring at the next
            // tick; never resubmitted automatically.
            Order::limit(
                intent,
                entry.token.clone(),
                entry.side,
                size_usd,
                OrderConstraints {
                    max_slippage: self.exec.max_slippage,
                    reference_price: entry.reference_price,
                    deadline: now + Duration::seconds(self.exec.limit_ttl_secs),
                },
            )
        };

        // Every open carries its protective stop so the position is never
        // left unprotected.
        let order = if intent == OrderIntent::Open {
            order
                .with_initial_stop(self.initial_stop(entry.side, current))
                .with_contributors(entry.contributors.clone())
        } else {
            order
        };

        Some(order)
    }

    fn market_exit(
        &self,
        intent: OrderIntent,
        position: &ManagedPosition,
        size_usd: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Order {
        Order::market(
            intent,
            position.token.clone(),
            position.side,
            size_usd,
            OrderConstraints {
                max_slippage: self.exec.max_slippage,
                reference_price: price,
                deadline: now + Duration::seconds(self.exec.limit_ttl_secs),
            },
        )
    }

    /// Direction-aware initial stop at a fixed distance from entry.
    pub fn initial_stop(&self, side: Side, entry_price: Decimal) -> Decimal {
        match side {
            Side::Long => entry_price * (Decimal::ONE - self.stop_loss_pct),
            Side::Short => entry_price * (Decimal::ONE + self.stop_loss_pct),
        }
    }

    fn mark_price(
        &self,
        prices: &HashMap<String, Decimal>,
        token: &str,
        fallback: Decimal,
    ) -> Decimal {
        prices.get(token).copied().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, TargetPortfolioEntry};
    use rust_decimal_macros::dec;

    fn differ() -> ExecutionDiffer {
        ExecutionDiffer::new(ExecConfig::default(), &StopConfig::default())
    }

    fn target_entry(
        token: &str,
        side: Side,
        usd: Decimal,
        age_secs: i64,
        reference: Decimal,
    ) -> TargetPortfolioEntry {
        TargetPortfolioEntry {
            token: token.to_string(),
            side,
            weight: dec!(0.1),
            target_usd: usd,
            reference_price: reference,
            observed_at: Utc::now() - Duration::seconds(age_secs),
            contributors: vec!["0xaaa".to_string()],
        }
    }

    fn holding(token: &str, side: Side, size: Decimal, price: Decimal) -> ManagedPosition {
        let mut pos = ManagedPosition::open(
            token.to_string(),
            side,
            size,
            price,
            dec!(3),
            price * dec!(0.96),
            vec!["0xaaa".to_string()],
        );
        pos.current_price = price;
        pos
    }

    fn prices(pairs: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        pairs.iter().map(|(t, p)| (t.to_string(), *p)).collect()
    }

    #[test]
    fn test_equal_target_and_holdings_emit_nothing() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(10000),
            10,
            dec!(50000),
        )]);
        // 0.2 BTC * 50000 = exactly the target notional
        let held = vec![holding("BTC", Side::Long, dec!(0.2), dec!(50000))];

        let orders = d.diff(&target, &held, &prices(&[("BTC", dec!(50000))]), Utc::now());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_zero_target_closes_position_market() {
        let d = differ();
        let target = TargetPortfolio::new(vec![]);
        let held = vec![holding("ETH", Side::Long, dec!(5), dec!(2000))];

        let orders = d.diff(&target, &held, &prices(&[("ETH", dec!(2000))]), Utc::now());
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].intent, OrderIntent::Close);
        assert_eq!(orders[0].order_type, OrderType::Market);
        assert_eq!(orders[0].size_usd, dec!(10000));
    }

    #[test]
    fn test_fresh_signal_opens_market_with_stop() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(8000),
            30,
            dec!(50000),
        )]);

        let orders = d.diff(&target, &[], &prices(&[("BTC", dec!(50100))]), Utc::now());
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].intent, OrderIntent::Open);
        assert_eq!(orders[0].order_type, OrderType::Market);
        // Stop below entry for a long.
        let stop = orders[0].initial_stop.unwrap();
        assert!(stop < dec!(50100));
    }

    #[test]
    fn test_fresh_signal_skipped_when_price_ran_away() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(8000),
            30,
            dec!(50000),
        )]);

        // 2% above reference, tolerance is 0.5%.
        let orders = d.diff(&target, &[], &prices(&[("BTC", dec!(51000))]), Utc::now());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_mid_aged_signal_goes_limit_with_deadline() {
        let d = differ();
        let now = Utc::now();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(8000),
            600,
            dec!(50000),
        )]);

        let orders = d.diff(&target, &[], &prices(&[("BTC", dec!(50000))]), now);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_type, OrderType::Limit);
        assert_eq!(orders[0].constraints.reference_price, dec!(50000));
        assert!(orders[0].constraints.deadline > now);
    }

    #[test]
    fn test_stale_signal_skipped() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(8000),
            3600,
            dec!(50000),
        )]);

        let orders = d.diff(&target, &[], &prices(&[("BTC", dec!(50000))]), Utc::now());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_delta_below_threshold_ignored() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(10020),
            10,
            dec!(50000),
        )]);
        let held = vec![holding("BTC", Side::Long, dec!(0.2), dec!(50000))];

        let orders = d.diff(&target, &held, &prices(&[("BTC", dec!(50000))]), Utc::now());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_oversized_position_reduced_market() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Long,
            dec!(6000),
            10,
            dec!(50000),
        )]);
        let held = vec![holding("BTC", Side::Long, dec!(0.2), dec!(50000))];

        let orders = d.diff(&target, &held, &prices(&[("BTC", dec!(50000))]), Utc::now());
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].intent, OrderIntent::Reduce);
        assert_eq!(orders[0].order_type, OrderType::Market);
        assert_eq!(orders[0].size_usd, dec!(4000));
    }

    #[test]
    fn test_side_flip_closes_then_opens() {
        let d = differ();
        let target = TargetPortfolio::new(vec![target_entry(
            "BTC",
            Side::Short,
            dec!(8000),
            30,
            dec!(50000),
        )]);
        let held = vec![holding("BTC", Side::Long, dec!(0.2), dec!(50000))];

        let orders = d.diff(&target, &held, &prices(&[("BTC", dec!(50000))]), Utc::now());
        assert_eq!(orders.len(), 2);
        // Close comes first: exit priority outranks entries.
        assert_eq!(orders[0].intent, OrderIntent::Close);
        assert_eq!(orders[0].side, Side::Long);
        assert_eq!(orders[1].intent, OrderIntent::Open);
        assert_eq!(orders[1].side, Side::Short);
    }

    #[test]
    fn test_closing_position_left_to_stop_monitor() {
        let d = differ();
        let target = TargetPortfolio::new(vec![]);
        let mut pos = holding("BTC", Side::Long, dec!(0.2), dec!(50000));
        pos.state = StopState::Closing;

        let orders = d.diff(&target, &[pos], &prices(&[("BTC", dec!(50000))]), Utc::now());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_initial_stop_direction() {
        let d = differ();
        assert_eq!(d.initial_stop(Side::Long, dec!(100)), dec!(96));
        assert_eq!(d.initial_stop(Side::Short, dec!(100)), dec!(104));
    }
}
