use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use orderflow_core::OrderId;
use orderflow_orders::{NewOrder, Order};

/// Result of a successful `save`.
///
/// Both variants carry the persisted order with its storage-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new order row (and its items) was committed.
    Created(Order),
    /// The idempotency key matched an existing order; nothing was written.
    Replayed(Order),
}

impl SaveOutcome {
    pub fn order(&self) -> &Order {
        match self {
            SaveOutcome::Created(order) | SaveOutcome::Replayed(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            SaveOutcome::Created(order) | SaveOutcome::Replayed(order) => order,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, SaveOutcome::Replayed(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("order not found")]
    NotFound,

    /// The backend could not be reached (pool exhausted or closed, network down).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the operation.
    #[error("storage error: {0}")]
    Backend(String),

    /// A stored row could not be turned back into an order.
    #[error("corrupt order record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Durable storage for orders.
///
/// ## Guarantees
///
/// - `save` is atomic: the order and all of its items are committed together
///   or not at all.
/// - `save` is idempotent on `NewOrder::idempotency_key`: a key that was already
///   persisted returns `SaveOutcome::Replayed` with the existing order.
/// - Ids are assigned by the store, exactly once, and never reused.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save(&self, order: NewOrder) -> Result<SaveOutcome, StoreError>;

    async fn find_by_id(&self, id: OrderId) -> Result<Order, StoreError>;

    /// Release connections. Further calls may fail with `Unavailable`.
    async fn close(&self) {}
}

#[async_trait]
impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    async fn save(&self, order: NewOrder) -> Result<SaveOutcome, StoreError> {
        (**self).save(order).await
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        (**self).find_by_id(id).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
