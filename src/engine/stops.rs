//! Independent stop monitor: per-position protective state machine.
//!
//! Each position moves ACTIVE → ARMED (trailing live) → CLOSING. Stops
//! are decoupled from the copied traders' own exits: a mirrored position
//! is protected even when the source trader rides a loss. The stop price
//! only ever tightens; it never moves against the position once armed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::engine::config::StopConfig;
use crate::models::{
    ManagedPosition, Order, OrderConstraints, OrderIntent, Side, StopState,
};

/// Why the monitor decided to close a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    TrailingStop,
    TimeStop,
    LiquidationGuard,
    /// Source trader's position vanished without a close event; carries
    /// the trader address to blacklist.
    TraderLiquidated(String),
}

pub struct StopMonitor {
    config: StopConfig,
}

impl StopMonitor {
    pub fn new(config: StopConfig) -> Self {
        Self { config }
    }

    pub fn blacklist_cooldown_hours(&self) -> i64 {
        self.config.blacklist_cooldown_hours
    }

    /// One monitor pass over a position at the given mark price.
    ///
    /// Mutates stop levels and the water mark; returns a close reason
    /// when the position must transition to CLOSING.
    pub fn evaluate(
        &self,
        position: &mut ManagedPosition,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<CloseReason> {
        if position.state == StopState::Closing {
            return None;
        }
        position.current_price = price;

        // Pre-emptive liquidation guard runs before anything else.
        if let Some(liq) = position.liquidation_price {
            if !price.is_zero() {
                let proximity = ((price - liq) / price).abs();
                if proximity <= self.config.liquidation_buffer_pct {
                    warn!(
                        token = %position.token,
                        price = %price,
                        liquidation = %liq,
                        "Within liquidation buffer, closing pre-emptively"
                    );
                    position.state = StopState::Closing;
                    return Some(CloseReason::LiquidationGuard);
                }
            }
        }

        self.advance_trailing(position, price);

        if position.stop_hit(price) {
            let reason = if position.armed {
                CloseReason::TrailingStop
            } else {
                CloseReason::StopLoss
            };
            info!(
                token = %position.token,
                stop = %position.stop_price,
                price = %price,
                armed = position.armed,
                "Stop hit"
            );
            position.state = StopState::Closing;
            return Some(reason);
        }

        if position.holding_duration(now) >= Duration::hours(self.config.max_hold_hours) {
            info!(
                token = %position.token,
                hours = position.holding_duration(now).num_hours(),
                "Time-stop reached"
            );
            position.state = StopState::Closing;
            return Some(CloseReason::TimeStop);
        }

        None
    }

    /// Arm the trailing stop once profit crosses the activation threshold
    /// and ratchet it behind the water mark. Tightens only.
    fn advance_trailing(&self, position: &mut ManagedPosition, price: Decimal) {
        if !position.armed {
            if position.unrealized_return(price) >= self.config.trail_activation_pct {
                position.armed = true;
                position.state = StopState::Armed;
                position.water_mark = price;
                info!(
                    token = %position.token,
                    price = %price,
                    "Trailing stop armed"
                );
            } else {
                return;
            }
        }

        match position.side {
            Side::Long => {
                if price > position.water_mark {
                    position.water_mark = price;
                }
                let candidate =
                    position.water_mark * (Decimal::ONE - self.config.trail_distance_pct);
                if candidate > position.stop_price {
                    position.stop_price = candidate;
                }
            }
            Side::Short => {
                if price < position.water_mark {
                    position.water_mark = price;
                }
                let candidate =
                    position.water_mark * (Decimal::ONE + self.config.trail_distance_pct);
                if candidate < position.stop_price {
                    position.stop_price = candidate;
                }
            }
        }
    }

    /// Feed one provider snapshot observation for a source trader.
    ///
    /// A position absent from the snapshot with no recorded close action
    /// is a *possible* liquidation; it is acted on only after the
    /// configured number of consecutive missing snapshots, since a single
    /// stale snapshot looks identical.
    pub fn note_snapshot(
        &self,
        position: &mut ManagedPosition,
        source: &str,
        still_held: bool,
        closed_explicitly: bool,
    ) -> Option<CloseReason> {
        if position.state == StopState::Closing {
            return None;
        }

        if still_held || closed_explicitly {
            position.missing_streak.remove(source);
            return None;
        }

        let streak = position.missing_streak.entry(source.to_string()).or_insert(0);
        *streak += 1;

        if *streak >= self.config.liquidation_confirm_snapshots {
            warn!(
                token = %position.token,
                trader = %source,
                snapshots = *streak,
                "Source position vanished without close event, treating as liquidation"
            );
            position.state = StopState::Closing;
            return Some(CloseReason::TraderLiquidated(source.to_string()));
        }

        None
    }

    /// Market close for a CLOSING position. Always market: exit priority
    /// outranks price.
    pub fn close_order(&self, position: &ManagedPosition, price: Decimal) -> Order {
        Order::market(
            OrderIntent::Close,
            position.token.clone(),
            position.side,
            position.notional(price),
            OrderConstraints {
                max_slippage: Decimal::ONE, // uncapped, must get out
                reference_price: price,
                deadline: Utc::now() + Duration::minutes(5),
            },
        )
    }
}
