//! Live position book. The only place managed positions are mutated.
//!
//! The scheduler, monitor and executor all share one store; fills and
//! stop transitions flow through the narrow entry points here so the
//! book can never drift out of sync with itself.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::{ManagedPosition, Order, OrderIntent, Side};

pub struct PositionStore {
    /// Keyed by token: netting guarantees at most one side per token,
    /// and side flips arrive as a close followed by an open.
    positions: RwLock<HashMap<String, ManagedPosition>>,
    entry_leverage: Decimal,
    maintenance_margin_pct: Decimal,
}

impl PositionStore {
    pub fn new(entry_leverage: Decimal, maintenance_margin_pct: Decimal) -> Arc<Self> {
        Arc::new(Self {
            positions: RwLock::new(HashMap::new()),
            entry_leverage,
            maintenance_margin_pct,
        })
    }

    /// Isolated-margin liquidation estimate: the adverse move that eats
    /// the position's margin down to the maintenance requirement.
    fn liquidation_estimate(&self, side: Side, entry_price: Decimal) -> Option<Decimal> {
        if self.entry_leverage <= Decimal::ZERO {
            return None;
        }
        let margin_move = Decimal::ONE / self.entry_leverage - self.maintenance_margin_pct;
        Some(match side {
            Side::Long => entry_price * (Decimal::ONE - margin_move),
            Side::Short => entry_price * (Decimal::ONE + margin_move),
        })
    }

    /// Cloned snapshot of the current book.
    pub async fn snapshot(&self) -> Vec<ManagedPosition> {
        self.positions.read().await.values().cloned().collect()
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.positions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }

    /// Run `f` against one position under the write lock.
    pub async fn with_position<F, R>(&self, token: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut ManagedPosition) -> R,
    {
        let mut book = self.positions.write().await;
        book.get_mut(token).map(f)
    }

    /// Remove a position outright, returning it if present.
    pub async fn remove(&self, token: &str) -> Option<ManagedPosition> {
        self.positions.write().await.remove(token)
    }

    /// Apply a confirmed fill to the book.
    pub async fn apply_fill(
        &self,
        order: &Order,
        fill_price: Decimal,
    ) -> Result<(), EngineError> {
        if fill_price <= Decimal::ZERO {
            return Err(EngineError::data_invalid(
                &order.token,
                "non-positive fill price",
            ));
        }
        let size = order.size_usd / fill_price;
        let mut book = self.positions.write().await;

        match order.intent {
            OrderIntent::Open => {
                let stop = order.initial_stop.ok_or_else(|| {
                    EngineError::InvariantViolation(format!(
                        "open order for {} carries no initial stop",
                        order.token
                    ))
                })?;
                if book.contains_key(&order.token) {
                    return Err(EngineError::InvariantViolation(format!(
                        "open fill for {} but the book already holds it",
                        order.token
                    )));
                }
                info!(
                    token = %order.token,
                    side = ?order.side,
                    size = %size,
                    price = %fill_price,
                    "Position opened"
                );
                let mut position = ManagedPosition::open(
                    order.token.clone(),
                    order.side,
                    size,
                    fill_price,
                    self.entry_leverage,
                    stop,
                    order.contributors.clone(),
                );
                position.liquidation_price =
                    self.liquidation_estimate(order.side, fill_price);
                book.insert(order.token.clone(), position);
            }
            OrderIntent::Add => {
                let position = book.get_mut(&order.token).ok_or_else(|| {
                    EngineError::InvariantViolation(format!(
                        "add fill for {} but the book does not hold it",
                        order.token
                    ))
                })?;
                position.adjust_size(size, fill_price);
                info!(token = %order.token, added = %size, "Position increased");
            }
            OrderIntent::Reduce => {
                let position = book.get_mut(&order.token).ok_or_else(|| {
                    EngineError::InvariantViolation(format!(
                        "reduce fill for {} but the book does not hold it",
                        order.token
                    ))
                })?;
                position.adjust_size(-size, fill_price);
                if position.is_flat() {
                    book.remove(&order.token);
                    info!(token = %order.token, "Position reduced to flat");
                } else {
                    info!(token = %order.token, removed = %size, "Position reduced");
                }
            }
            OrderIntent::Close => {
                if book.remove(&order.token).is_none() {
                    warn!(token = %order.token, "Close fill for an unknown position");
                }
                info!(token = %order.token, price = %fill_price, "Position closed");
            }
        }

        Ok(())
    }
}
