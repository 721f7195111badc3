//! Order model: intent, constraints, and terminal lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// What the order is trying to do to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    Open,
    Add,
    Reduce,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Lifecycle status. Filled, Rejected, and Expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Expired)
    }
}

/// Execution constraints attached at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConstraints {
    /// Maximum tolerated slippage versus the reference price
    pub max_slippage: Decimal,

    /// Price the sizing decision was made against
    pub reference_price: Decimal,

    /// The order is void past this instant
    pub deadline: DateTime<Utc>,
}

/// An order emitted by the differ or the stop monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub intent: OrderIntent,
    pub token: String,
    pub side: Side,
    pub order_type: OrderType,

    /// Notional to trade in USD
    pub size_usd: Decimal,

    pub constraints: OrderConstraints,
    pub status: OrderStatus,

    /// Initial stop-loss price, set on every open so the position is
    /// never left unprotected
    pub initial_stop: Option<Decimal>,

    /// Source trader addresses whose signals produced this order
    pub contributors: Vec<String>,

    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn market(
        intent: OrderIntent,
        token: String,
        side: Side,
        size_usd: Decimal,
        constraints: OrderConstraints,
    ) -> Self {
        Self::new(intent, token, side, OrderType::Market, size_usd, constraints)
    }

    pub fn limit(
        intent: OrderIntent,
        token: String,
        side: Side,
        size_usd: Decimal,
        constraints: OrderConstraints,
    ) -> Self {
        Self::new(intent, token, side, OrderType::Limit, size_usd, constraints)
    }

    fn new(
        intent: OrderIntent,
        token: String,
        side: Side,
        order_type: OrderType,
        size_usd: Decimal,
        constraints: OrderConstraints,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent,
            token,
            side,
            order_type,
            size_usd,
            constraints,
            status: OrderStatus::Pending,
            initial_stop: None,
            contributors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_initial_stop(mut self, stop: Decimal) -> Self {
        self.initial_stop = Some(stop);
        self
    }

    pub fn with_contributors(mut self, contributors: Vec<String>) -> Self {
        self.contributors = contributors;
        self
    }

    /// Advance the lifecycle. Transitions out of a terminal status are
    /// rejected and return false.
    pub fn transition(&mut self, status: OrderStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    /// Whether this order closes or reduces exposure. Such orders always
    /// go out as market orders.
    pub fn is_exit(&self) -> bool {
        matches!(self.intent, OrderIntent::Close | OrderIntent::Reduce)
    }
}
