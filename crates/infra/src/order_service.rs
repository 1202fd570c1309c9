//! Order processing pipeline (application-level orchestration).
//!
//! ```text
//! create_order
//!   ↓
//! 1. Validate input, compute total (no side effects on failure)
//!   ↓
//! 2. Persist order + items (atomic, idempotent on the idempotency key)
//!   ↓
//! 3. Publish `order.created` (best-effort; failure is logged, not returned)
//!   ↓
//! 4. Return the persisted order
//! ```
//!
//! The store is the source of truth. Once step 2 succeeds the order exists and
//! the caller gets success, even if the event could not be published. A retried
//! request with the same idempotency key publishes the same event id again, so
//! a lost publish can be recovered by the client retrying.
//!
//! This module contains no IO itself; it composes the store and publisher ports.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use orderflow_core::{CustomerId, Entity, OrderId, ValidationErrors};
use orderflow_events::{EventEnvelope, EventPublisher};
use orderflow_orders::{NewOrder, Order, OrderCreated, OrderItemInput};

use crate::order_store::{OrderStore, SaveOutcome, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// Input rejected; nothing was stored or published.
    #[error("invalid order: {0}")]
    Validation(ValidationErrors),

    #[error("order {0} not found")]
    NotFound(OrderId),

    /// The order could not be stored; nothing was published.
    #[error("failed to persist order: {0}")]
    Persistence(StoreError),

    /// Reading from storage failed.
    #[error("order storage unavailable: {0}")]
    StorageUnavailable(StoreError),
}

/// Order service counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderServiceStats {
    pub orders_created: u64,
    pub orders_replayed: u64,
    pub events_published: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    orders_created: AtomicU64,
    orders_replayed: AtomicU64,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
}

pub struct OrderService<S, P> {
    store: S,
    publisher: P,
    topic: String,
    counters: Counters,
}

impl<S, P> OrderService<S, P>
where
    S: OrderStore,
    P: EventPublisher,
{
    pub fn new(store: S, publisher: P, topic: impl Into<String>) -> Self {
        Self {
            store,
            publisher,
            topic: topic.into(),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn stats(&self) -> OrderServiceStats {
        OrderServiceStats {
            orders_created: self.counters.orders_created.load(Ordering::Relaxed),
            orders_replayed: self.counters.orders_replayed.load(Ordering::Relaxed),
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }

    /// Validate, persist and announce a new order.
    #[instrument(skip_all, fields(customer_id = %customer_id, item_count = items.len()))]
    pub async fn create_order(
        &self,
        customer_id: CustomerId,
        items: Vec<OrderItemInput>,
        idempotency_key: Option<&str>,
    ) -> Result<Order, OrderError> {
        let draft = NewOrder::create(customer_id, items, idempotency_key, Utc::now())
            .map_err(OrderError::Validation)?;

        let total = draft.total();
        let lines = draft.items().to_vec();

        let outcome = self.store.save(draft).await.map_err(|err| {
            error!(
                customer_id = %customer_id,
                items = ?lines,
                total = %total,
                error = %err,
                "failed to save order"
            );
            OrderError::Persistence(err)
        })?;

        let order = match outcome {
            SaveOutcome::Created(order) => {
                self.counters.orders_created.fetch_add(1, Ordering::Relaxed);
                info!(order_id = %order.id(), total = %order.total(), "order created");
                order
            }
            SaveOutcome::Replayed(order) => {
                self.counters.orders_replayed.fetch_add(1, Ordering::Relaxed);
                info!(order_id = %order.id(), "idempotent retry, returning existing order");
                order
            }
        };

        self.announce(&order).await;
        Ok(order)
    }

    /// Publish `order.created`. Failures are counted and logged only.
    async fn announce(&self, order: &Order) {
        let published = match EventEnvelope::from_event(&OrderCreated(order.clone())) {
            Ok(envelope) => self.publisher.publish(&self.topic, &envelope).await,
            Err(err) => Err(err),
        };

        match published {
            Ok(()) => {
                self.counters.events_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    order_id = %order.id(),
                    topic = %self.topic,
                    error = %err,
                    "failed to publish order.created; order is persisted"
                );
            }
        }
    }

    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn get_order(&self, id: OrderId) -> Result<Order, OrderError> {
        self.store.find_by_id(id).await.map_err(|err| match err {
            StoreError::NotFound => OrderError::NotFound(id),
            other => {
                error!(error = %other, "failed to load order");
                OrderError::StorageUnavailable(other)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use orderflow_core::{Money, ProductId};
    use orderflow_events::{InMemoryBroker, PublishError};

    use crate::order_store::InMemoryOrderStore;

    type TestService = OrderService<Arc<InMemoryOrderStore>, Arc<InMemoryBroker>>;

    fn service() -> (TestService, Arc<InMemoryOrderStore>, Arc<InMemoryBroker>) {
        let store = Arc::new(InMemoryOrderStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        (OrderService::new(store.clone(), broker.clone(), "orders"), store, broker)
    }

    fn item(product: i64, quantity: i64, cents: i64) -> OrderItemInput {
        OrderItemInput {
            product_id: ProductId::new(product),
            quantity,
            price: Some(Money::from_minor(cents)),
        }
    }

    #[tokio::test]
    async fn creates_persists_and_publishes() {
        let (service, store, broker) = service();

        let order = service
            .create_order(CustomerId::new(42), vec![item(1, 2, 999)], None)
            .await
            .unwrap();

        assert_eq!(order.total(), Money::from_minor(1998));
        assert_eq!(store.find_by_id(*order.id()).await.unwrap(), order);

        let messages = broker.messages("orders");
        assert_eq!(messages.len(), 1);
        let published: Order = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(published, order);
        assert_eq!(messages[0].key.as_deref(), Some(order.id().to_string().as_str()));
        assert_eq!(service.stats().events_published, 1);
    }

    #[tokio::test]
    async fn invalid_input_has_no_side_effects() {
        let (service, store, broker) = service();

        let err = service
            .create_order(CustomerId::new(42), vec![item(1, -1, 100), item(2, 1, -5)], None)
            .await
            .unwrap_err();

        let OrderError::Validation(errors) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(errors.has_field("items[0].quantity"));
        assert!(errors.has_field("items[1].price"));
        assert!(store.is_empty());
        assert!(broker.messages("orders").is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_reported_and_nothing_is_published() {
        let (service, store, broker) = service();
        store.set_available(false);

        let err = service
            .create_order(CustomerId::new(42), vec![item(1, 1, 100)], None)
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::Persistence(StoreError::Unavailable(_))));
        assert!(broker.messages("orders").is_empty());
    }

    #[tokio::test]
    async fn publish_failure_still_returns_the_order() {
        let (service, _store, broker) = service();
        broker.fail_next_publishes([PublishError::fatal("broker rejected")]);

        let order = service
            .create_order(CustomerId::new(42), vec![item(1, 1, 100)], None)
            .await
            .unwrap();

        assert_eq!(service.get_order(*order.id()).await.unwrap(), order);
        assert_eq!(service.stats().publish_failures, 1);
        assert!(broker.messages("orders").is_empty());
    }

    #[tokio::test]
    async fn idempotent_retry_returns_same_order_and_republishes_same_event() {
        let (service, store, broker) = service();
        broker.fail_next_publishes([PublishError::fatal("lost")]);

        let first = service
            .create_order(CustomerId::new(42), vec![item(1, 2, 999)], Some("req-1"))
            .await
            .unwrap();
        let retry = service
            .create_order(CustomerId::new(42), vec![item(1, 2, 999)], Some("req-1"))
            .await
            .unwrap();

        assert_eq!(first, retry);
        assert_eq!(store.len(), 1);
        // The retry recovered the lost event.
        assert_eq!(broker.messages("orders").len(), 1);

        let stats = service.stats();
        assert_eq!(stats.orders_created, 1);
        assert_eq!(stats.orders_replayed, 1);
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let (service, _store, _broker) = service();

        let err = service.get_order(OrderId::new(999_999)).await.unwrap_err();

        assert_eq!(err, OrderError::NotFound(OrderId::new(999_999)));
    }

    #[tokio::test]
    async fn read_failure_is_storage_unavailable() {
        let (service, store, _broker) = service();
        store.set_available(false);

        let err = service.get_order(OrderId::new(1)).await.unwrap_err();

        assert!(matches!(err, OrderError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn slow_publisher_does_not_change_the_result() {
        struct Slow;

        #[async_trait]
        impl EventPublisher for Slow {
            async fn publish(&self, _topic: &str, _event: &EventEnvelope) -> Result<(), PublishError> {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Err(PublishError::transient("timed out"))
            }
        }

        let service = OrderService::new(InMemoryOrderStore::new(), Slow, "orders");
        let order = service
            .create_order(CustomerId::new(7), vec![item(3, 3, 250)], None)
            .await
            .unwrap();

        assert_eq!(order.total(), Money::from_minor(750));
        assert_eq!(service.stats().publish_failures, 1);
    }
}
