//! Tracked-trader model: per-timeframe metrics, style, score, blacklist.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// Lookback windows the provider reports metrics for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    D7,
    D30,
    D90,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::D7, Timeframe::D30, Timeframe::D90];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::D7 => "7d",
            Timeframe::D30 => "30d",
            Timeframe::D90 => "90d",
        }
    }
}

/// Raw performance metrics for one lookback window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeMetrics {
    /// Realized P&L in USD over the window
    pub pnl: Decimal,

    /// Return on investment over the window (0.5 = 50%)
    pub roi: f64,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Number of closed trades in the window
    pub trade_count: u32,
}

/// Trading style inferred from frequency and hold duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraderStyle {
    Hft,
    #[default]
    Swing,
    Position,
}

impl TraderStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraderStyle::Hft => "hft",
            TraderStyle::Swing => "swing",
            TraderStyle::Position => "position",
        }
    }
}

/// Composite score with its six named components.
///
/// Components are each in [0, 1] and `None` when the underlying data was
/// unavailable; the weighted sum renormalizes over present components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScore {
    /// Final score in [0, 1] after style multiplier and recency decay
    pub total: f64,

    pub return_score: Option<f64>,
    pub risk_adjusted: Option<f64>,
    pub win_rate: Option<f64>,
    pub consistency: Option<f64>,
    pub label_bonus: Option<f64>,
    pub risk_management: Option<f64>,
}

/// A tracked trader's current position as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderPosition {
    pub token: String,
    pub side: Side,

    /// Notional value in USD
    pub notional_usd: Decimal,

    /// Mark price when the snapshot was taken
    pub mark_price: Decimal,

    pub leverage: Decimal,

    /// When this position was observed in the provider snapshot
    pub observed_at: DateTime<Utc>,
}

impl TraderPosition {
    /// Position value as a fraction of the trader's own account.
    pub fn account_fraction(&self, account_value: Decimal) -> f64 {
        if account_value <= Decimal::ZERO {
            return 0.0;
        }
        (self.notional_usd / account_value)
            .try_into()
            .unwrap_or(0.0)
    }
}

/// What a trade event did to the trader's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Open,
    Increase,
    Decrease,
    Close,
}

/// One historical trade event from the provider's history feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trader_address: String,
    pub token: String,
    pub side: Side,
    pub action: TradeAction,
    pub size_usd: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Trader being mirrored, refreshed on the daily cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTrader {
    /// Opaque unique identifier from the provider
    pub address: String,

    /// Provider label (e.g. smart-money tag); empty when unlabeled
    #[serde(default)]
    pub label: String,

    /// Metrics per lookback window; a window may be missing
    #[serde(default)]
    pub metrics: HashMap<Timeframe, TimeframeMetrics>,

    /// Trader's own account value in USD
    pub account_value: Decimal,

    /// Current open positions from the latest snapshot
    #[serde(default)]
    pub positions: Vec<TraderPosition>,

    /// Average hold duration in hours, for style bucketing
    #[serde(default)]
    pub avg_hold_hours: f64,

    /// Trades per day, for style bucketing
    #[serde(default)]
    pub trades_per_day: f64,

    /// Gross profit / gross loss over the full history
    #[serde(default)]
    pub profit_factor: f64,

    /// Recent leverage readings, newest last
    #[serde(default)]
    pub leverage_history: Vec<f64>,

    /// Style classification, recomputed on refresh
    #[serde(default)]
    pub style: TraderStyle,

    /// Composite score; `None` when withheld by the hard gates
    #[serde(default)]
    pub score: Option<CompositeScore>,

    /// Fraction of deployable capital allocated to this trader (0 to 1)
    #[serde(default)]
    pub allocation_weight: f64,

    /// Blacklisted until this instant (set on inferred liquidation)
    #[serde(default)]
    pub blacklisted_until: Option<DateTime<Utc>>,

    /// Last observed activity, drives recency decay
    pub last_active_at: DateTime<Utc>,

    /// When the snapshot backing this record was taken
    pub refreshed_at: DateTime<Utc>,
}

impl TrackedTrader {
    pub fn new(address: String) -> Self {
        Self {
            address,
            label: String::new(),
            metrics: HashMap::new(),
            account_value: Decimal::ZERO,
            positions: Vec::new(),
            avg_hold_hours: 0.0,
            trades_per_day: 0.0,
            profit_factor: 0.0,
            leverage_history: Vec::new(),
            style: TraderStyle::Swing,
            score: None,
            allocation_weight: 0.0,
            blacklisted_until: None,
            last_active_at: Utc::now(),
            refreshed_at: Utc::now(),
        }
    }

    /// Total closed trades across all windows (sample-size gate input).
    pub fn total_trade_count(&self) -> u32 {
        self.metrics.values().map(|m| m.trade_count).max().unwrap_or(0)
    }

    pub fn is_blacklisted(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }

    /// Set the blacklist flag for a cooldown window.
    pub fn blacklist_for(&mut self, hours: i64, now: DateTime<Utc>) {
        self.blacklisted_until = Some(now + chrono::Duration::hours(hours));
    }

    /// Clear the blacklist once the cooldown has passed.
    pub fn clear_expired_blacklist(&mut self, now: DateTime<Utc>) {
        if self.blacklisted_until.is_some_and(|until| until <= now) {
            self.blacklisted_until = None;
        }
    }

    /// Whether the trader currently holds the given token on the given side.
    pub fn holds(&self, token: &str, side: Side) -> bool {
        self.positions
            .iter()
            .any(|p| p.token == token && p.side == side)
    }

    pub fn score_total(&self) -> f64 {
        self.score.as_ref().map(|s| s.total).unwrap_or(0.0)
    }
}
