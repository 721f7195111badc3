//! Risk overlay: the ordered cap sequence that clamps a proposed target
//! portfolio into an enforceable one.
//!
//! Caps run in a fixed order, each operating on the previous step's
//! output: per-position, per-token, directional, total exposure,
//! leverage, position count. Shrinking never fails the cycle; every clamp
//! is logged with the cap that fired and by how much. `verify` re-checks
//! the invariants afterwards; a failure there is a programming defect and
//! aborts the cycle before any order goes out.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::engine::config::RiskConfig;
use crate::error::EngineError;
use crate::models::{RiskCapState, Side, TargetPortfolio, TargetPortfolioEntry};

/// Tolerance in verify comparisons. Aggregates are clamped exactly, so
/// this only absorbs Decimal noise from downstream arithmetic.
const VERIFY_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

pub struct RiskOverlay {
    config: RiskConfig,
}

impl RiskOverlay {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Apply the full cap sequence. Idempotent: re-applying to its own
    /// output changes nothing.
    pub fn apply(&self, mut target: TargetPortfolio, account_value: Decimal) -> TargetPortfolio {
        self.cap_per_position(&mut target, account_value);
        self.cap_per_token(&mut target, account_value);
        self.cap_directional(&mut target, account_value);
        self.cap_total(&mut target, account_value);
        self.cap_leverage(&mut target, account_value);
        self.cap_position_count(&mut target);
        target
    }

    /// Step 1: min of percentage-of-account and absolute dollar ceiling.
    fn cap_per_position(&self, target: &mut TargetPortfolio, account_value: Decimal) {
        let cap = (account_value * self.config.per_position_pct).min(self.config.per_position_usd);
        for entry in &mut target.entries {
            if entry.target_usd > cap {
                info!(
                    cap = "per_position",
                    token = %entry.token,
                    before = %entry.target_usd,
                    after = %cap,
                    "Cap fired"
                );
                set_target(entry, cap, account_value);
            }
        }
    }

    /// Step 2: per-token aggregate, scaled proportionally within the token.
    fn cap_per_token(&self, target: &mut TargetPortfolio, account_value: Decimal) {
        let cap = account_value * self.config.per_token_pct;
        let by_token = target.token_exposure();

        for (token, exposure) in by_token {
            if exposure <= cap || exposure.is_zero() {
                continue;
            }
            info!(
                cap = "per_token",
                token = %token,
                before = %exposure,
                after = %cap,
                "Cap fired"
            );
            let group: Vec<&mut TargetPortfolioEntry> = target
                .entries
                .iter_mut()
                .filter(|e| e.token == token)
                .collect();
            scale_group(group, cap, account_value);
        }
    }

    /// Step 3: aggregate long and aggregate short, each capped separately.
    fn cap_directional(&self, target: &mut TargetPortfolio, account_value: Decimal) {
        let cap = account_value * self.config.directional_pct;
        for side in [Side::Long, Side::Short] {
            let exposure = target.side_exposure(side);
            if exposure <= cap || exposure.is_zero() {
                continue;
            }
            info!(
                cap = "directional",
                side = side.as_str(),
                before = %exposure,
                after = %cap,
                "Cap fired"
            );
            let group: Vec<&mut TargetPortfolioEntry> = target
                .entries
                .iter_mut()
                .filter(|e| e.side == side)
                .collect();
            scale_group(group, cap, account_value);
        }
    }

    /// Step 4: total exposure across the whole set.
    fn cap_total(&self, target: &mut TargetPortfolio, account_value: Decimal) {
        let cap = account_value * self.config.total_exposure_pct;
        let exposure = target.total_exposure();
        if exposure <= cap || exposure.is_zero() {
            return;
        }
        info!(
            cap = "total_exposure",
            before = %exposure,
            after = %cap,
            "Cap fired"
        );
        scale_group(target.entries.iter_mut().collect(), cap, account_value);
    }

    /// Step 5: implied leverage. Sizes shrink; leverage never rises.
    fn cap_leverage(&self, target: &mut TargetPortfolio, account_value: Decimal) {
        if account_value.is_zero() {
            return;
        }
        let cap = account_value * self.config.max_leverage;
        let exposure = target.total_exposure();
        if exposure <= cap || exposure.is_zero() {
            return;
        }
        info!(
            cap = "leverage",
            implied = %(exposure / account_value),
            ceiling = %self.config.max_leverage,
            "Cap fired, shrinking sizes"
        );
        scale_group(target.entries.iter_mut().collect(), cap, account_value);
    }

    /// Step 6: keep the highest-weight entries, drop the rest entirely.
    fn cap_position_count(&self, target: &mut TargetPortfolio) {
        if target.entries.len() <= self.config.max_positions {
            return;
        }
        target
            .entries
            .sort_by(|a, b| b.weight.cmp(&a.weight).then(a.token.cmp(&b.token)));
        for dropped in &target.entries[self.config.max_positions..] {
            info!(
                cap = "position_count",
                token = %dropped.token,
                weight = %dropped.weight,
                "Cap fired, dropping entry"
            );
        }
        target.entries.truncate(self.config.max_positions);
    }

    /// Re-check every invariant on the final set. A violation here means
    /// the overlay itself is broken: the caller must abort the cycle
    /// without submitting any order.
    pub fn verify(
        &self,
        target: &TargetPortfolio,
        account_value: Decimal,
    ) -> Result<(), EngineError> {
        let per_position_cap =
            (account_value * self.config.per_position_pct).min(self.config.per_position_usd);
        for entry in &target.entries {
            if entry.target_usd > per_position_cap + VERIFY_EPSILON {
                return Err(violation(format!(
                    "entry {} {} exceeds per-position cap: {} > {}",
                    entry.token,
                    entry.side.as_str(),
                    entry.target_usd,
                    per_position_cap
                )));
            }
        }

        let per_token_cap = account_value * self.config.per_token_pct;
        for (token, exposure) in target.token_exposure() {
            if exposure > per_token_cap + VERIFY_EPSILON {
                return Err(violation(format!(
                    "token {} exceeds per-token cap: {} > {}",
                    token, exposure, per_token_cap
                )));
            }
        }

        let directional_cap = account_value * self.config.directional_pct;
        for side in [Side::Long, Side::Short] {
            let exposure = target.side_exposure(side);
            if exposure > directional_cap + VERIFY_EPSILON {
                return Err(violation(format!(
                    "{} exposure exceeds directional cap: {} > {}",
                    side.as_str(),
                    exposure,
                    directional_cap
                )));
            }
        }

        let total_cap = account_value * self.config.total_exposure_pct;
        if target.total_exposure() > total_cap + VERIFY_EPSILON {
            return Err(violation(format!(
                "total exposure exceeds cap: {} > {}",
                target.total_exposure(),
                total_cap
            )));
        }

        if target.entries.len() > self.config.max_positions {
            return Err(violation(format!(
                "position count exceeds cap: {} > {}",
                target.entries.len(),
                self.config.max_positions
            )));
        }

        Ok(())
    }

    /// Derived, read-only view of exposure versus caps.
    pub fn utilization(&self, target: &TargetPortfolio, account_value: Decimal) -> RiskCapState {
        let token_exposure = target.token_exposure();
        let implied_leverage = if account_value.is_zero() {
            Decimal::ZERO
        } else {
            target.total_exposure() / account_value
        };

        RiskCapState {
            total_exposure: target.total_exposure(),
            total_cap: account_value * self.config.total_exposure_pct,
            largest_position: target
                .entries
                .iter()
                .map(|e| e.target_usd)
                .max()
                .unwrap_or(Decimal::ZERO),
            per_position_cap: (account_value * self.config.per_position_pct)
                .min(self.config.per_position_usd),
            max_token_exposure: token_exposure.values().copied().max().unwrap_or(Decimal::ZERO),
            per_token_cap: account_value * self.config.per_token_pct,
            long_exposure: target.side_exposure(Side::Long),
            short_exposure: target.side_exposure(Side::Short),
            directional_cap: account_value * self.config.directional_pct,
            implied_leverage,
            leverage_cap: self.config.max_leverage,
            position_count: target.entries.len(),
            max_positions: self.config.max_positions,
        }
    }
}

fn violation(msg: String) -> EngineError {
    warn!(reason = %msg, "Risk invariant violated after overlay");
    EngineError::InvariantViolation(msg)
}

fn set_target(entry: &mut TargetPortfolioEntry, target_usd: Decimal, account_value: Decimal) {
    entry.target_usd = target_usd;
    entry.weight = if account_value.is_zero() {
        Decimal::ZERO
    } else {
        target_usd / account_value
    };
}

/// Scale a group of entries so their combined exposure lands exactly on
/// the cap. Decimal division leaves rounding residue; it is settled
/// against the largest entry so the aggregate holds without tolerance.
fn scale_group(mut entries: Vec<&mut TargetPortfolioEntry>, cap: Decimal, account_value: Decimal) {
    let exposure: Decimal = entries.iter().map(|e| e.target_usd).sum();
    if exposure.is_zero() {
        return;
    }
    let factor = cap / exposure;

    let mut scaled_sum = Decimal::ZERO;
    for entry in entries.iter_mut() {
        let scaled = entry.target_usd * factor;
        set_target(entry, scaled, account_value);
        scaled_sum += entry.target_usd;
    }

    let residue = scaled_sum - cap;
    if residue.is_zero() {
        return;
    }
    if let Some(largest) = entries.iter_mut().max_by_key(|e| e.target_usd) {
        let settled = largest.target_usd - residue;
        set_target(largest, settled, account_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn entry(token: &str, side: Side, usd: Decimal, account: Decimal) -> TargetPortfolioEntry {
        TargetPortfolioEntry {
            token: token.to_string(),
            side,
            weight: usd / account,
            target_usd: usd,
            reference_price: dec!(100),
            observed_at: Utc::now(),
            contributors: vec![],
        }
    }

    fn overlay() -> RiskOverlay {
        RiskOverlay::new(RiskConfig::default())
    }

    #[test]
    fn test_per_position_cap_uses_min_of_pct_and_abs() {
        // $60,000 proposed on a $100,000 account with 10%/$50,000 caps
        // clamps to $10,000 (the percentage), not $50,000.
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![entry("BTC", Side::Long, dec!(60000), account)]);

        let capped = overlay().apply(target, account);
        assert_eq!(capped.entries[0].target_usd, dec!(10000));
        assert_eq!(capped.entries[0].weight, dec!(0.10));
    }

    #[test]
    fn test_total_exposure_cap_scales_proportionally() {
        let config = RiskConfig {
            per_position_pct: dec!(0.5),
            per_token_pct: dec!(0.5),
            directional_pct: dec!(1.0),
            total_exposure_pct: dec!(0.5),
            ..RiskConfig::default()
        };
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(40000), account),
            entry("ETH", Side::Short, dec!(40000), account),
        ]);

        let capped = RiskOverlay::new(config).apply(target, account);
        assert_eq!(capped.total_exposure(), dec!(50000));
        // Relative proportions preserved.
        assert_eq!(capped.entries[0].target_usd, capped.entries[1].target_usd);
    }

    #[test]
    fn test_directional_cap_only_shrinks_offending_side() {
        let config = RiskConfig {
            per_position_pct: dec!(0.5),
            per_position_usd: dec!(1000000),
            per_token_pct: dec!(0.5),
            directional_pct: dec!(0.4),
            total_exposure_pct: dec!(2.0),
            ..RiskConfig::default()
        };
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(30000), account),
            entry("ETH", Side::Long, dec!(30000), account),
            entry("SOL", Side::Short, dec!(10000), account),
        ]);

        let capped = RiskOverlay::new(config).apply(target, account);
        assert_eq!(capped.side_exposure(Side::Long), dec!(40000));
        assert_eq!(capped.side_exposure(Side::Short), dec!(10000));
    }

    #[test]
    fn test_scaling_residue_lands_exactly_on_cap() {
        // 25000/30000 is non-terminating in decimal; the side aggregate
        // must still land exactly on the cap, not a hair above it.
        let config = RiskConfig {
            per_position_pct: dec!(0.5),
            per_position_usd: dec!(1000000),
            per_token_pct: dec!(0.5),
            directional_pct: dec!(0.25),
            total_exposure_pct: dec!(2.0),
            ..RiskConfig::default()
        };
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(10000), account),
            entry("ETH", Side::Long, dec!(10000), account),
            entry("SOL", Side::Long, dec!(10000), account),
        ]);

        let capped = RiskOverlay::new(config).apply(target, account);
        assert_eq!(capped.side_exposure(Side::Long), dec!(25000));
    }

    #[test]
    fn test_position_count_drops_lowest_weight_entirely() {
        let config = RiskConfig {
            max_positions: 2,
            ..RiskConfig::default()
        };
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(9000), account),
            entry("ETH", Side::Long, dec!(6000), account),
            entry("SOL", Side::Long, dec!(3000), account),
        ]);

        let capped = RiskOverlay::new(config).apply(target, account);
        assert_eq!(capped.len(), 2);
        assert!(capped.entry("SOL", Side::Long).is_none());
        // Survivors keep their full size, not a partial one.
        assert_eq!(capped.entry("BTC", Side::Long).unwrap().target_usd, dec!(9000));
    }

    #[test]
    fn test_overlay_is_idempotent() {
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(60000), account),
            entry("ETH", Side::Short, dec!(25000), account),
            entry("SOL", Side::Long, dec!(12000), account),
        ]);

        let ov = overlay();
        let once = ov.apply(target, account);
        let twice = ov.apply(once.clone(), account);

        assert_eq!(once.entries.len(), twice.entries.len());
        for (a, b) in once.entries.iter().zip(twice.entries.iter()) {
            assert_eq!(a.token, b.token);
            assert_eq!(a.target_usd, b.target_usd);
        }
    }

    #[test]
    fn test_verify_passes_on_overlay_output() {
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(60000), account),
            entry("ETH", Side::Short, dec!(45000), account),
            entry("SOL", Side::Long, dec!(30000), account),
        ]);

        let ov = overlay();
        let capped = ov.apply(target, account);
        assert!(ov.verify(&capped, account).is_ok());
    }

    #[test]
    fn test_verify_rejects_breached_target() {
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![entry("BTC", Side::Long, dec!(60000), account)]);

        let err = overlay().verify(&target, account).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn test_utilization_view() {
        let account = dec!(100000);
        let target = TargetPortfolio::new(vec![
            entry("BTC", Side::Long, dec!(10000), account),
            entry("ETH", Side::Short, dec!(5000), account),
        ]);

        let state = overlay().utilization(&target, account);
        assert_eq!(state.total_exposure, dec!(15000));
        assert_eq!(state.total_cap, dec!(80000));
        assert_eq!(state.largest_position, dec!(10000));
        assert_eq!(state.long_exposure, dec!(10000));
        assert_eq!(state.short_exposure, dec!(5000));
        assert_eq!(state.position_count, 2);
    }
}
