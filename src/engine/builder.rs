//! Target-portfolio construction from scored traders' live positions.
//!
//! Allocation weights come from a softmax over log-scores with a
//! configurable temperature (at temperature 1 this is proportional to
//! score; lower temperatures concentrate weight on the leaders). Every
//! included trader keeps a non-zero weight. Pooled per-token exposure is
//! index-style: weight × the trader's position as a fraction of their own
//! account, summed across traders, then netted long against short.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::engine::config::PortfolioConfig;
use crate::models::{Side, TargetPortfolio, TargetPortfolioEntry, TrackedTrader};

/// Pooled weight below which a netted token is treated as flat.
const NET_EPSILON: f64 = 1e-9;

#[derive(Default)]
struct SideBucket {
    weight: f64,
    observed_at: Option<DateTime<Utc>>,
    reference_price: Decimal,
    contributors: Vec<String>,
}

impl SideBucket {
    fn accumulate(&mut self, weight: f64, pos_observed: DateTime<Utc>, mark: Decimal, address: &str) {
        self.weight += weight;
        if self.observed_at.map_or(true, |t| pos_observed > t) {
            self.observed_at = Some(pos_observed);
            self.reference_price = mark;
        }
        if !self.contributors.iter().any(|c| c == address) {
            self.contributors.push(address.to_string());
        }
    }
}

pub struct PortfolioBuilder {
    config: PortfolioConfig,
}

impl PortfolioBuilder {
    pub fn new(config: PortfolioConfig) -> Self {
        Self { config }
    }

    /// Softmax-style allocation weights over composite scores.
    ///
    /// Only scored, non-blacklisted traders participate; the result maps
    /// address to a weight in (0, 1], summing to 1 over included traders.
    pub fn allocation_weights(
        &self,
        traders: &[&TrackedTrader],
    ) -> HashMap<String, f64> {
        if traders.is_empty() {
            return HashMap::new();
        }

        let temp = self.config.temperature.max(1e-3);
        let exps: Vec<f64> = traders
            .iter()
            .map(|t| {
                // Floor keeps every included trader at non-zero weight.
                let s = t.score_total().max(1e-6);
                (s.ln() / temp).exp()
            })
            .collect();
        let sum: f64 = exps.iter().sum();

        traders
            .iter()
            .zip(exps)
            .map(|(t, e)| (t.address.clone(), e / sum))
            .collect()
    }

    /// Build the proposed target set. Always a complete replacement:
    /// tokens absent from the result are implicitly zero-target.
    pub fn build(
        &self,
        traders: &[TrackedTrader],
        account_value: Decimal,
        now: DateTime<Utc>,
    ) -> TargetPortfolio {
        let mut eligible: Vec<&TrackedTrader> = traders
            .iter()
            .filter(|t| t.score.is_some() && !t.is_blacklisted(now))
            .collect();
        eligible.sort_by(|a, b| {
            b.score_total()
                .partial_cmp(&a.score_total())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        eligible.truncate(self.config.top_n);

        if eligible.is_empty() {
            info!("No eligible traders; target portfolio is empty");
            return TargetPortfolio::new(Vec::new());
        }

        let weights = self.allocation_weights(&eligible);

        // Pool weight × position-fraction-of-own-account per (token, side).
        let mut pooled: HashMap<String, (SideBucket, SideBucket)> = HashMap::new();
        for trader in &eligible {
            let weight = weights[&trader.address];
            for pos in &trader.positions {
                let fraction = pos.account_fraction(trader.account_value);
                if fraction <= 0.0 {
                    continue;
                }
                let entry = pooled.entry(pos.token.clone()).or_default();
                let bucket = match pos.side {
                    Side::Long => &mut entry.0,
                    Side::Short => &mut entry.1,
                };
                bucket.accumulate(weight * fraction, pos.observed_at, pos.mark_price, &trader.address);
            }
        }

        let mut entries = Vec::new();
        for (token, (long, short)) in pooled {
            let net = long.weight - short.weight;
            if net.abs() < NET_EPSILON {
                // Equal pull long and short: uncertainty is not traded.
                debug!(token = %token, long = long.weight, short = short.weight,
                    "Long/short tie, leaving token flat");
                continue;
            }

            let (side, bucket) = if net > 0.0 {
                (Side::Long, long)
            } else {
                (Side::Short, short)
            };
            let weight = Decimal::try_from(net.abs()).unwrap_or(Decimal::ZERO);

            entries.push(TargetPortfolioEntry {
                token,
                side,
                weight,
                target_usd: account_value * weight,
                reference_price: bucket.reference_price,
                observed_at: bucket.observed_at.unwrap_or(now),
                contributors: bucket.contributors,
            });
        }

        entries.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.token.cmp(&b.token)));

        info!(
            traders = eligible.len(),
            entries = entries.len(),
            "Built proposed target portfolio"
        );

        TargetPortfolio::new(entries)
    }
}
