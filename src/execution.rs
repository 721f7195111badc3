//! Order-transport seam and the paper implementation.
//!
//! The scheduler submits orders through [`ExecutionTransport`] and polls
//! for fills; venue specifics (signing, endpoints, rate limits) live
//! entirely behind the trait. [`PaperTransport`] fills everything at the
//! reference price immediately and is what dry runs and tests use.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::EngineError;
use crate::models::{Order, OrderStatus};

/// A confirmed fill as reported by the venue.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub size_usd: Decimal,
}

#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    /// Submit an order to the venue. Returns the venue-assigned id.
    async fn submit(&self, order: &Order) -> Result<String, EngineError>;

    /// Poll the order's status. A `Filled` result must be accompanied by
    /// a fill retrievable via [`ExecutionTransport::fill`].
    async fn poll(&self, order_id: &str) -> Result<OrderStatus, EngineError>;

    /// The fill for a filled order, if known.
    async fn fill(&self, order_id: &str) -> Result<Option<Fill>, EngineError>;

    /// Cancel a resting order. Cancelling an already-terminal order is a
    /// no-op.
    async fn cancel(&self, order_id: &str) -> Result<(), EngineError>;
}

/// Paper venue: market orders fill instantly at the reference price,
/// limit orders fill at their limit. No partial fills, no rejections.
#[derive(Default)]
pub struct PaperTransport {
    fills: RwLock<std::collections::HashMap<String, Fill>>,
    submitted: RwLock<Vec<Order>>,
}

impl PaperTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every order submitted so far, in submission order.
    pub async fn submitted_orders(&self) -> Vec<Order> {
        self.submitted.read().await.clone()
    }
}

#[async_trait]
impl ExecutionTransport for PaperTransport {
    async fn submit(&self, order: &Order) -> Result<String, EngineError> {
        let price = order.constraints.reference_price;
        if price <= Decimal::ZERO {
            return Err(EngineError::ExecutionFailure {
                order_id: order.id.clone(),
                reason: "no reference price for paper fill".to_string(),
            });
        }

        info!(
            order_id = %order.id,
            token = %order.token,
            intent = ?order.intent,
            order_type = ?order.order_type,
            size_usd = %order.size_usd,
            price = %price,
            "Paper fill"
        );

        self.fills.write().await.insert(
            order.id.clone(),
            Fill {
                order_id: order.id.clone(),
                price,
                size_usd: order.size_usd,
            },
        );
        self.submitted.write().await.push(order.clone());
        Ok(order.id.clone())
    }

    async fn poll(&self, order_id: &str) -> Result<OrderStatus, EngineError> {
        if self.fills.read().await.contains_key(order_id) {
            Ok(OrderStatus::Filled)
        } else {
            Err(EngineError::ExecutionFailure {
                order_id: order_id.to_string(),
                reason: "unknown order".to_string(),
            })
        }
    }

    async fn fill(&self, order_id: &str) -> Result<Option<Fill>, EngineError> {
        Ok(self.fills.read().await.get(order_id).cloned())
    }

    async fn cancel(&self, _order_id: &str) -> Result<(), EngineError> {
        Ok(())
    }
}
