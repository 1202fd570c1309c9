//! Integration tests for the full pipeline.
//!
//! Tests: OrderService → OrderStore → ReliablePublisher → Broker → OrderEventConsumer
//!
//! Verifies:
//! - Created orders reach the consumer exactly as persisted
//! - Rejected input leaves no trace anywhere
//! - Retries (client and publisher side) never duplicate orders or events

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use orderflow_core::{CustomerId, Entity, Money, OrderId, ProductId};
use orderflow_events::{InMemoryBroker, PublishError, ReliablePublisher, ReliablePublisherConfig, RetryPolicy};
use orderflow_orders::{NewOrder, Order, OrderItemInput};

use crate::order_service::{OrderError, OrderService};
use crate::order_store::{InMemoryOrderStore, OrderStore, SaveOutcome, StoreError};
use crate::workers::{ConsumerConfig, HandlerError, OrderEventConsumer, OrderEventHandler};

const TOPIC: &str = "orders";
const GROUP: &str = "order-service-group";

type Publisher = Arc<ReliablePublisher<Arc<InMemoryBroker>>>;

#[derive(Default)]
struct Collect(Mutex<Vec<Order>>);

#[async_trait]
impl OrderEventHandler for Arc<Collect> {
    async fn handle(&self, order: &Order) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(order.clone());
        Ok(())
    }
}

/// Commits the first save, then reports a lost connection to the caller.
#[derive(Default)]
struct LostReplyStore {
    inner: InMemoryOrderStore,
    tripped: AtomicBool,
}

#[async_trait]
impl OrderStore for LostReplyStore {
    async fn save(&self, order: NewOrder) -> Result<SaveOutcome, StoreError> {
        let outcome = self.inner.save(order).await?;
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset after commit".to_string()));
        }
        Ok(outcome)
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        self.inner.find_by_id(id).await
    }
}

fn publisher(broker: &Arc<InMemoryBroker>) -> Publisher {
    Arc::new(ReliablePublisher::new(
        broker.clone(),
        ReliablePublisherConfig {
            retry: RetryPolicy::exponential(5, Duration::from_millis(1), Duration::from_millis(5)),
            max_in_flight: 64,
            acquire_timeout: Duration::from_secs(1),
        },
    ))
}

fn item(product: i64, quantity: i64, cents: i64) -> OrderItemInput {
    OrderItemInput {
        product_id: ProductId::new(product),
        quantity,
        price: Some(Money::from_minor(cents)),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn created_order_reaches_consumer_unchanged() {
    let broker = Arc::new(InMemoryBroker::new());
    let service = OrderService::new(InMemoryOrderStore::new(), publisher(&broker), TOPIC);

    let collected = Arc::new(Collect::default());
    let source = broker.source(TOPIC, GROUP).with_poll_interval(Duration::from_millis(10));
    let consumer = OrderEventConsumer::spawn(source, collected.clone(), ConsumerConfig::default(), CancellationToken::new());

    let order = service
        .create_order(CustomerId::new(42), vec![item(1, 2, 999)], None)
        .await
        .unwrap();
    assert_eq!(order.total(), Money::from_minor(1998));

    eventually(|| consumer.stats().processed == 1).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(collected.0.lock().unwrap().as_slice(), &[order]);
    assert_eq!(broker.committed_offset(TOPIC, GROUP), 1);
}

#[tokio::test]
async fn rejected_order_is_neither_stored_nor_published() {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryOrderStore::new());
    let service = OrderService::new(store.clone(), publisher(&broker), TOPIC);

    let err = service.create_order(CustomerId::new(42), vec![], None).await.unwrap_err();

    assert!(matches!(err, OrderError::Validation(ref e) if e.has_field("items")));
    assert!(store.is_empty());
    assert!(broker.messages(TOPIC).is_empty());
}

#[tokio::test]
async fn concurrent_orders_keep_their_own_items() {
    let broker = Arc::new(InMemoryBroker::new());
    let service = Arc::new(OrderService::new(InMemoryOrderStore::new(), publisher(&broker), TOPIC));

    let tasks: Vec<_> = (1..=25)
        .map(|n| {
            let service = service.clone();
            tokio::spawn(async move {
                let items = vec![item(n, n, 100), item(n + 1000, 1, n * 10)];
                let order = service.create_order(CustomerId::new(n), items, None).await.unwrap();
                (n, order)
            })
        })
        .collect();

    for task in tasks {
        let (n, order) = task.await.unwrap();
        let stored = service.get_order(*order.id()).await.unwrap();
        assert_eq!(stored, order);
        assert_eq!(stored.customer_id(), CustomerId::new(n));
        assert_eq!(stored.items().len(), 2);
        assert_eq!(stored.items()[0].product_id, ProductId::new(n));
        assert_eq!(stored.items()[1].product_id, ProductId::new(n + 1000));
        assert_eq!(stored.total(), Money::from_minor(n * 100 + n * 10));
    }

    assert_eq!(broker.messages(TOPIC).len(), 25);
}

#[tokio::test]
async fn client_retry_after_lost_reply_does_not_duplicate() {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(LostReplyStore::default());
    let service = OrderService::new(store.clone(), publisher(&broker), TOPIC);

    let first = service
        .create_order(CustomerId::new(42), vec![item(1, 2, 999)], Some("checkout-17"))
        .await
        .unwrap_err();
    assert!(matches!(first, OrderError::Persistence(StoreError::Unavailable(_))));

    let retried = service
        .create_order(CustomerId::new(42), vec![item(1, 2, 999)], Some("checkout-17"))
        .await
        .unwrap();

    assert_eq!(store.inner.len(), 1);
    assert_eq!(service.get_order(*retried.id()).await.unwrap(), retried);
    assert_eq!(broker.messages(TOPIC).len(), 1);
}

#[tokio::test]
async fn transient_broker_failures_are_retried_without_duplicates() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next_publishes([PublishError::transient("connection reset"), PublishError::transient("loading")]);
    let publisher = publisher(&broker);
    let service = OrderService::new(InMemoryOrderStore::new(), publisher.clone(), TOPIC);

    service
        .create_order(CustomerId::new(1), vec![item(1, 1, 500)], None)
        .await
        .unwrap();

    assert_eq!(broker.messages(TOPIC).len(), 1);
    assert_eq!(publisher.stats().retries, 2);
    assert_eq!(service.stats().publish_failures, 0);
}

#[tokio::test]
async fn broker_outage_does_not_fail_order_creation() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next_publishes(vec![PublishError::transient("broker down"); 5]);
    let service = OrderService::new(InMemoryOrderStore::new(), publisher(&broker), TOPIC);

    let order = service
        .create_order(CustomerId::new(5), vec![item(2, 3, 333)], None)
        .await
        .unwrap();

    assert_eq!(service.get_order(*order.id()).await.unwrap(), order);
    assert!(broker.messages(TOPIC).is_empty());
    assert_eq!(service.stats().publish_failures, 1);
}

#[tokio::test]
async fn closed_publisher_rejects_but_orders_still_persist() {
    let broker = Arc::new(InMemoryBroker::new());
    let publisher = publisher(&broker);
    let service = OrderService::new(InMemoryOrderStore::new(), publisher.clone(), TOPIC);

    orderflow_events::EventPublisher::close(&publisher).await.unwrap();

    let order = service
        .create_order(CustomerId::new(8), vec![item(4, 1, 100)], None)
        .await
        .unwrap();

    assert_eq!(service.get_order(*order.id()).await.unwrap(), order);
    assert_eq!(service.stats().publish_failures, 1);
}
