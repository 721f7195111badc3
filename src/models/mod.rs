//! Data models for traders, positions, orders, and target portfolios.

mod order;
mod portfolio;
mod position;
mod trader;

pub use order::{Order, OrderConstraints, OrderIntent, OrderStatus, OrderType};
pub use portfolio::{RiskCapState, TargetPortfolio, TargetPortfolioEntry};
pub use position::{ManagedPosition, MarginMode, Side, StopState};
pub use trader::{
    CompositeScore, Timeframe, TimeframeMetrics, TrackedTrader, TradeAction, TradeEvent,
    TraderPosition, TraderStyle,
};
