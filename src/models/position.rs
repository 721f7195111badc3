//! Managed position owned by the execution/monitoring subsystem.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

/// Margin mode. Cross margin is never used; liquidation risk stays
/// confined to the single position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
}

/// Protective-state machine phase for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopState {
    /// Fixed stop-loss active, trailing not yet armed
    Active,
    /// Trailing stop armed and tracking the water mark
    Armed,
    /// Close order decided; position destroyed on confirmed fill
    Closing,
}

/// A position held by the managed account.
///
/// Created when an open order fills. Stop levels are mutated only by the
/// stop monitor; size only by the differ on partial adjustments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedPosition {
    pub token: String,
    pub side: Side,

    /// Position size in base units
    pub size: Decimal,

    pub entry_price: Decimal,
    pub leverage: Decimal,
    pub margin_mode: MarginMode,
    pub opened_at: DateTime<Utc>,

    /// Current protective stop price
    pub stop_price: Decimal,

    /// High-water mark for longs, low-water mark for shorts
    pub water_mark: Decimal,

    /// Whether the trailing stop is armed
    pub armed: bool,

    pub state: StopState,

    /// Last mark price seen by the monitor
    pub current_price: Decimal,

    /// Venue-reported liquidation price, when known
    pub liquidation_price: Option<Decimal>,

    /// Tracked traders whose snapshot positions contributed to this target
    #[serde(default)]
    pub sources: Vec<String>,

    /// Consecutive snapshots in which a source trader's position was
    /// missing without a close event, per source address
    #[serde(default)]
    pub missing_streak: HashMap<String, u8>,
}

impl ManagedPosition {
    pub fn open(
        token: String,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        leverage: Decimal,
        stop_price: Decimal,
        sources: Vec<String>,
    ) -> Self {
        Self {
            token,
            side,
            size,
            entry_price,
            leverage,
            margin_mode: MarginMode::Isolated,
            opened_at: Utc::now(),
            stop_price,
            water_mark: entry_price,
            armed: false,
            state: StopState::Active,
            current_price: entry_price,
            liquidation_price: None,
            sources,
            missing_streak: HashMap::new(),
        }
    }

    /// Notional value at the given mark price.
    pub fn notional(&self, price: Decimal) -> Decimal {
        self.size * price
    }

    /// Notional at the last seen mark price.
    pub fn current_notional(&self) -> Decimal {
        self.notional(self.current_price)
    }

    /// Signed unrealized return fraction, direction-aware.
    pub fn unrealized_return(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let raw = (price - self.entry_price) / self.entry_price;
        match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }

    pub fn holding_duration(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Whether the given mark price has crossed the protective stop.
    pub fn stop_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.stop_price,
            Side::Short => price >= self.stop_price,
        }
    }

    /// Adjust size after a partial add/reduce fill. Entry price is
    /// volume-averaged on adds.
    pub fn adjust_size(&mut self, delta: Decimal, fill_price: Decimal) {
        if delta > Decimal::ZERO {
            let old_cost = self.size * self.entry_price;
            let new_cost = delta * fill_price;
            let new_size = self.size + delta;
            if !new_size.is_zero() {
                self.entry_price = (old_cost + new_cost) / new_size;
            }
            self.size = new_size;
        } else {
            self.size = (self.size + delta).max(Decimal::ZERO);
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size <= Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> ManagedPosition {
        ManagedPosition::open(
            "ETH".to_string(),
            Side::Long,
            dec!(2),
            dec!(2000),
            dec!(3),
            dec!(1900),
            vec!["0xabc".to_string()],
        )
    }

    #[test]
    fn test_unrealized_return_direction() {
        let long = long_position();
        assert_eq!(long.unrealized_return(dec!(2200)), dec!(0.1));
        assert_eq!(long.unrealized_return(dec!(1800)), dec!(-0.1));

        let mut short = long_position();
        short.side = Side::Short;
        assert_eq!(short.unrealized_return(dec!(1800)), dec!(0.1));
        assert_eq!(short.unrealized_return(dec!(2200)), dec!(-0.1));
    }

    #[test]
    fn test_stop_hit() {
        let long = long_position();
        assert!(!long.stop_hit(dec!(1950)));
        assert!(long.stop_hit(dec!(1900)));
        assert!(long.stop_hit(dec!(1850)));

        let mut short = long_position();
        short.side = Side::Short;
        short.stop_price = dec!(2100);
        assert!(!short.stop_hit(dec!(2050)));
        assert!(short.stop_hit(dec!(2100)));
    }

    #[test]
    fn test_adjust_size_averages_entry() {
        let mut pos = long_position();
        pos.adjust_size(dec!(2), dec!(2200));

        assert_eq!(pos.size, dec!(4));
        assert_eq!(pos.entry_price, dec!(2100));

        pos.adjust_size(dec!(-1), dec!(2100));
        assert_eq!(pos.size, dec!(3));
        // entry unchanged on reduce
        assert_eq!(pos.entry_price, dec!(2100));
    }
}
