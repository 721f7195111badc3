//! Composite scoring of tracked traders.
//!
//! Produces a bounded score in [0, 1] from six named sub-scores, a style
//! classification, and a recency decay. Traders with insufficient sample
//! size are not scored at all (score withheld, not zeroed); a missing
//! timeframe drops its sub-score and the weights renormalize over what is
//! available.

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use tracing::debug;

use crate::engine::config::ScoringConfig;
use crate::models::{CompositeScore, TrackedTrader, TraderStyle};

pub struct TraderScorer {
    config: ScoringConfig,
}

impl TraderScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Score a trader, or withhold the score entirely.
    ///
    /// Returns `None` when the trader fails the hard sample-size gates:
    /// below the minimum trade count or minimum account value.
    pub fn score(&self, trader: &TrackedTrader, now: DateTime<Utc>) -> Option<CompositeScore> {
        if trader.total_trade_count() < self.config.min_trade_count {
            debug!(
                address = %trader.address,
                trades = trader.total_trade_count(),
                "Score withheld: below minimum trade count"
            );
            return None;
        }
        if trader.account_value < self.config.min_account_value {
            debug!(
                address = %trader.address,
                account_value = %trader.account_value,
                "Score withheld: below minimum account value"
            );
            return None;
        }

        let return_score = self.return_score(trader);
        let risk_adjusted = self.risk_adjusted_score(trader);
        let win_rate = self.win_rate_score(trader);
        let consistency = self.consistency_score(trader);
        let label_bonus = Some(if trader.label.is_empty() { 0.0 } else { 1.0 });
        let risk_management = self.risk_management_score(trader);

        let components: [(Option<f64>, f64); 6] = [
            (return_score, self.config.weight_return),
            (risk_adjusted, self.config.weight_risk_adjusted),
            (win_rate, self.config.weight_win_rate),
            (consistency, self.config.weight_consistency),
            (label_bonus, self.config.weight_label_bonus),
            (risk_management, self.config.weight_risk_management),
        ];

        // Weighted sum over available components, renormalized so a trader
        // is never punished for data the provider did not report.
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (score, weight) in components {
            if let Some(s) = score {
                weighted += s * weight;
                weight_sum += weight;
            }
        }
        let base = if weight_sum > 0.0 { weighted / weight_sum } else { 0.0 };

        let style_mult = match trader.style {
            TraderStyle::Hft => self.config.style_multiplier_hft,
            TraderStyle::Swing => self.config.style_multiplier_swing,
            TraderStyle::Position => self.config.style_multiplier_position,
        };

        let total = (base * style_mult * self.recency_decay(trader, now)).clamp(0.0, 1.0);

        Some(CompositeScore {
            total,
            return_score,
            risk_adjusted,
            win_rate,
            consistency,
            label_bonus,
            risk_management,
        })
    }

    /// Bucket the trader into HFT / swing / position.
    pub fn classify_style(&self, trader: &TrackedTrader) -> TraderStyle {
        if trader.trades_per_day >= self.config.hft_trades_per_day {
            TraderStyle::Hft
        } else if trader.avg_hold_hours >= self.config.position_hold_hours {
            TraderStyle::Position
        } else {
            TraderStyle::Swing
        }
    }

    /// Mean ROI across available timeframes, capped-linear into [0, 1].
    fn return_score(&self, trader: &TrackedTrader) -> Option<f64> {
        let rois: Vec<f64> = trader.metrics.values().map(|m| m.roi).collect();
        if rois.is_empty() {
            return None;
        }
        let mean = rois.iter().sum::<f64>() / rois.len() as f64;
        Some((mean / self.config.max_roi).clamp(0.0, 1.0))
    }

    /// Sharpe-like ratio of per-timeframe ROIs, depressed when the profit
    /// factor looks like luck.
    fn risk_adjusted_score(&self, trader: &TrackedTrader) -> Option<f64> {
        let rois: Vec<f64> = trader.metrics.values().map(|m| m.roi).collect();
        if rois.len() < 2 {
            return None;
        }

        let mean = rois.as_slice().mean();
        let std_dev = rois.as_slice().std_dev();

        let ratio = if std_dev > 0.0 {
            mean / std_dev
        } else if mean > 0.0 {
            self.config.max_risk_adjusted
        } else {
            0.0
        };

        let mut score = (ratio / self.config.max_risk_adjusted).clamp(0.0, 1.0);

        let (pf_lo, pf_hi) = self.config.profit_factor_bounds;
        if trader.profit_factor > 0.0
            && (trader.profit_factor < pf_lo || trader.profit_factor > pf_hi)
        {
            score *= self.config.luck_penalty;
        }

        Some(score)
    }

    /// Trade-count-weighted win rate, depressed outside the luck bounds.
    fn win_rate_score(&self, trader: &TrackedTrader) -> Option<f64> {
        let mut weighted = 0.0;
        let mut count = 0u32;
        for m in trader.metrics.values() {
            weighted += m.win_rate * m.trade_count as f64;
            count += m.trade_count;
        }
        if count == 0 {
            return None;
        }
        let win_rate = weighted / count as f64;

        // Anything at or above the saturation point is already a strong
        // edge; more does not score higher.
        let mut score = (win_rate / self.config.win_rate_saturation).min(1.0);

        let (lo, hi) = self.config.win_rate_bounds;
        if win_rate < lo || win_rate > hi {
            score *= self.config.luck_penalty;
        }

        Some(score)
    }

    /// Rewards being profitable simultaneously across all required
    /// timeframes; partial agreement gets a fixed lower score.
    fn consistency_score(&self, trader: &TrackedTrader) -> Option<f64> {
        let available = trader.metrics.len();
        if available == 0 {
            return None;
        }

        let positive = trader.metrics.values().filter(|m| m.roi > 0.0).count();
        let required = crate::models::Timeframe::ALL.len();

        let score = if positive == 0 {
            self.config.consistency_floor
        } else if positive == available && available == required {
            self.config.consistency_full
        } else {
            self.config.consistency_partial
        };

        Some(score)
    }

    /// Leverage discipline: low and steady leverage scores high.
    fn risk_management_score(&self, trader: &TrackedTrader) -> Option<f64> {
        if trader.leverage_history.is_empty() {
            return None;
        }

        let mean = trader.leverage_history.as_slice().mean();
        let std_dev = if trader.leverage_history.len() > 1 {
            trader.leverage_history.as_slice().std_dev()
        } else {
            0.0
        };

        let ceiling = self.config.leverage_comfort_ceiling;
        let level = (1.0 - mean / ceiling).clamp(0.0, 1.0);
        let steadiness = (1.0 - std_dev / ceiling).clamp(0.5, 1.0);

        Some(level * steadiness)
    }

    /// Exponential decay on hours since last activity, so stale traders
    /// fall out of contention without being deleted.
    fn recency_decay(&self, trader: &TrackedTrader, now: DateTime<Utc>) -> f64 {
        let hours = (now - trader.last_active_at).num_seconds().max(0) as f64 / 3600.0;
        0.5_f64.powf(hours / self.config.recency_half_life_hours)
    }
}
