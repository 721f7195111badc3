//! Engine configuration.
//!
//! One immutable structure handed explicitly into each cycle; nothing
//! reads configuration mid-computation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Trader scoring parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// ROI at or above which the return sub-score saturates at 1.0
    pub max_roi: f64,

    /// Minimum closed trades before a trader is scored at all
    pub min_trade_count: u32,

    /// Minimum account value in USD before a trader is scored at all
    pub min_account_value: Decimal,

    /// Win rates outside this band trigger the luck penalty
    pub win_rate_bounds: (f64, f64),

    /// Win rate at which the win-rate sub-score saturates at 1.0
    pub win_rate_saturation: f64,

    /// Profit factors outside this band trigger the luck penalty
    pub profit_factor_bounds: (f64, f64),

    /// Multiplier applied to a sub-score flagged as luck; depresses,
    /// never zeroes
    pub luck_penalty: f64,

    /// Sharpe-like ratio at which the risk-adjusted sub-score saturates
    pub max_risk_adjusted: f64,

    /// Consistency sub-score when profitable in every timeframe
    pub consistency_full: f64,

    /// Consistency sub-score on partial agreement
    pub consistency_partial: f64,

    /// Consistency sub-score when no timeframe is profitable
    pub consistency_floor: f64,

    /// Leverage above which the risk-management sub-score reaches zero
    pub leverage_comfort_ceiling: f64,

    /// Trades per day at or above which a trader is classed HFT
    pub hft_trades_per_day: f64,

    /// Average hold hours at or above which a trader is classed position
    pub position_hold_hours: f64,

    /// Final-score multipliers per style (hft, swing, position)
    pub style_multiplier_hft: f64,
    pub style_multiplier_swing: f64,
    pub style_multiplier_position: f64,

    /// Half-life in hours for the recency decay
    pub recency_half_life_hours: f64,

    /// Component weights: return, risk-adjusted, win-rate, consistency,
    /// label bonus, risk management
    pub weight_return: f64,
    pub weight_risk_adjusted: f64,
    pub weight_win_rate: f64,
    pub weight_consistency: f64,
    pub weight_label_bonus: f64,
    pub weight_risk_management: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_roi: 2.0,                      // 200% ROI saturates
            min_trade_count: 20,
            min_account_value: dec!(10000),
            win_rate_bounds: (0.35, 0.85),     // outside looks like luck
            win_rate_saturation: 0.6,
            profit_factor_bounds: (1.0, 8.0),
            luck_penalty: 0.4,
            max_risk_adjusted: 2.0,
            consistency_full: 1.0,
            consistency_partial: 0.4,
            consistency_floor: 0.0,
            leverage_comfort_ceiling: 20.0,
            hft_trades_per_day: 20.0,
            position_hold_hours: 72.0,
            style_multiplier_hft: 0.6,         // too fast to follow
            style_multiplier_swing: 1.0,       // structurally easiest to mirror
            style_multiplier_position: 0.85,
            recency_half_life_hours: 12.0,
            weight_return: 0.25,
            weight_risk_adjusted: 0.20,
            weight_win_rate: 0.15,
            weight_consistency: 0.20,
            weight_label_bonus: 0.05,
            weight_risk_management: 0.15,
        }
    }
}

/// Target-portfolio construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Softmax temperature over composite scores
    pub temperature: f64,

    /// How many top-scored traders to include
    pub top_n: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_n: 10,
        }
    }
}

/// Risk-overlay caps, applied in a fixed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Per-position cap as a fraction of account value
    pub per_position_pct: Decimal,

    /// Per-position absolute dollar ceiling
    pub per_position_usd: Decimal,

    /// Per-token aggregate cap as a fraction of account value
    pub per_token_pct: Decimal,

    /// Aggregate cap per direction (long, short) as account fraction
    pub directional_pct: Decimal,

    /// Total exposure cap as a fraction of account value
    pub total_exposure_pct: Decimal,

    /// Leverage ceiling; sizes shrink rather than leverage rising
    pub max_leverage: Decimal,

    pub max_positions: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            per_position_pct: dec!(0.10),      // 10% of account
            per_position_usd: dec!(50000),
            per_token_pct: dec!(0.15),
            directional_pct: dec!(0.60),
            total_exposure_pct: dec!(0.80),
            max_leverage: dec!(5),
            max_positions: 12,
        }
    }
}

/// Execution-diff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Deltas below this notional are left alone (anti-churn)
    pub min_rebalance_usd: Decimal,

    /// Slippage tolerance for market entries
    pub max_slippage: Decimal,

    /// Signal younger than this goes out as a market order
    pub fresh_signal_secs: i64,

    /// Signal older than this is stale and skipped
    pub stale_signal_secs: i64,

    /// Limit orders expire this long after emission (next tick)
    pub limit_ttl_secs: i64,

    /// Leverage applied to opened positions
    pub entry_leverage: Decimal,

    /// Maintenance margin fraction assumed for isolated positions; feeds
    /// the liquidation-price estimate on open
    pub maintenance_margin_pct: Decimal,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            min_rebalance_usd: dec!(50),
            max_slippage: dec!(0.005),         // 0.5%
            fresh_signal_secs: 120,
            stale_signal_secs: 1800,           // 30 minutes
            limit_ttl_secs: 240,
            entry_leverage: dec!(3),
            maintenance_margin_pct: dec!(0.005), // 0.5%
        }
    }
}

/// Stop-monitor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    /// Fixed stop distance from entry (fraction of entry price)
    pub stop_loss_pct: Decimal,

    /// Unrealized profit at which the trailing stop arms
    pub trail_activation_pct: Decimal,

    /// Trailing distance from the water mark
    pub trail_distance_pct: Decimal,

    /// Force close after holding this long
    pub max_hold_hours: i64,

    /// Force close when price is within this fraction of the
    /// liquidation price
    pub liquidation_buffer_pct: Decimal,

    /// Blacklist cooldown after an inferred trader liquidation
    pub blacklist_cooldown_hours: i64,

    /// Consecutive snapshots a source position must be missing (with no
    /// close event) before liquidation is inferred
    pub liquidation_confirm_snapshots: u8,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(0.04),
            trail_activation_pct: dec!(0.03),
            trail_distance_pct: dec!(0.02),
            max_hold_hours: 168,               // 7 days
            liquidation_buffer_pct: dec!(0.05),
            blacklist_cooldown_hours: 72,
            liquidation_confirm_snapshots: 2,
        }
    }
}

/// Cadences for the scheduler, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub refresh_secs: u64,
    pub rebalance_secs: u64,
    pub monitor_secs: u64,
    pub ingest_secs: u64,

    /// Bounded fan-out for per-trader provider fetches
    pub fetch_concurrency: usize,

    /// Ceiling on provider retry time per call
    pub retry_max_elapsed_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_secs: 86_400,              // daily
            rebalance_secs: 14_400,            // 4 hours
            monitor_secs: 60,
            ingest_secs: 300,                  // 5 minutes
            fetch_concurrency: 4,
            retry_max_elapsed_secs: 30,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub scoring: ScoringConfig,
    pub portfolio: PortfolioConfig,
    pub risk: RiskConfig,
    pub exec: ExecConfig,
    pub stops: StopConfig,
    pub schedule: ScheduleConfig,
}
