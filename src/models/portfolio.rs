//! Target portfolio entries and the derived risk-cap utilization view.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// One entry of the target portfolio. The set is recomputed wholesale each
/// rebalance; entries are never partially mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPortfolioEntry {
    pub token: String,
    pub side: Side,

    /// Fraction of account value (0 to 1)
    pub weight: Decimal,

    /// Target notional in USD
    pub target_usd: Decimal,

    /// Mark price of the newest snapshot observation behind this entry;
    /// the differ checks live price drift against it
    pub reference_price: Decimal,

    /// When the newest contributing observation was taken; drives the
    /// signal-age execution policy
    pub observed_at: DateTime<Utc>,

    /// Tracked traders whose positions contributed to this entry
    #[serde(default)]
    pub contributors: Vec<String>,
}

/// Complete replacement target set produced by one rebalance cycle.
/// Tokens absent from the set are implicitly zero-target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetPortfolio {
    pub entries: Vec<TargetPortfolioEntry>,
    pub built_at: Option<DateTime<Utc>>,
}

impl TargetPortfolio {
    pub fn new(entries: Vec<TargetPortfolioEntry>) -> Self {
        Self {
            entries,
            built_at: Some(Utc::now()),
        }
    }

    /// Sum of |target_usd| across all entries.
    pub fn total_exposure(&self) -> Decimal {
        self.entries.iter().map(|e| e.target_usd.abs()).sum()
    }

    /// Aggregate |target_usd| per token.
    pub fn token_exposure(&self) -> HashMap<String, Decimal> {
        let mut by_token: HashMap<String, Decimal> = HashMap::new();
        for entry in &self.entries {
            *by_token.entry(entry.token.clone()).or_default() += entry.target_usd.abs();
        }
        by_token
    }

    /// Aggregate exposure on one side.
    pub fn side_exposure(&self, side: Side) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.side == side)
            .map(|e| e.target_usd.abs())
            .sum()
    }

    pub fn entry(&self, token: &str, side: Side) -> Option<&TargetPortfolioEntry> {
        self.entries
            .iter()
            .find(|e| e.token == token && e.side == side)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-only view of current exposure against the configured caps.
/// Derived from holdings plus the just-built target; never persisted on
/// its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCapState {
    pub total_exposure: Decimal,
    pub total_cap: Decimal,

    pub largest_position: Decimal,
    pub per_position_cap: Decimal,

    pub max_token_exposure: Decimal,
    pub per_token_cap: Decimal,

    pub long_exposure: Decimal,
    pub short_exposure: Decimal,
    pub directional_cap: Decimal,

    pub implied_leverage: Decimal,
    pub leverage_cap: Decimal,

    pub position_count: usize,
    pub max_positions: usize,
}

impl RiskCapState {
    /// Fraction of the total-exposure cap in use.
    pub fn total_utilization(&self) -> Decimal {
        if self.total_cap.is_zero() {
            return Decimal::ZERO;
        }
        self.total_exposure / self.total_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(token: &str, side: Side, usd: Decimal) -> TargetPortfolioEntry {
        TargetPortfolioEntry {
            token: token.to_string(),
            side,
            weight: dec!(0.1),
            target_usd: usd,
            reference_price: dec!(100),
            observed_at: Utc::now(),
            contributors: vec![],
        }
    }

    #[test]
    fn test_exposure_aggregation() {
        let portfolio = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(5000)),
            entry("ETH", Side::Short, dec!(3000)),
            entry("SOL", Side::Long, dec!(2000)),
        ]);

        assert_eq!(portfolio.total_exposure(), dec!(10000));
        assert_eq!(portfolio.side_exposure(Side::Long), dec!(7000));
        assert_eq!(portfolio.side_exposure(Side::Short), dec!(3000));
        assert_eq!(portfolio.token_exposure()["BTC"], dec!(5000));
    }
}
