//! Process-wide service wiring.
//!
//! Everything here is built once at startup and shared by all requests:
//! the order store (pool), the reliable publisher (single producer session)
//! and the consumer task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use orderflow_events::{
    EventPublisher, InMemoryBroker, PublishError, PublisherStats, ReliablePublisher, SourceError,
};
use orderflow_infra::workers::{ConsumerConfig, ConsumerHandle, ConsumerStats, LoggingOrderHandler, OrderEventConsumer};
use orderflow_infra::{AppConfig, InMemoryOrderStore, OrderService, OrderServiceStats, OrderStore, StoreError};

#[cfg(feature = "redis")]
use orderflow_infra::PostgresOrderStore;
#[cfg(feature = "redis")]
use orderflow_infra::event_bus::{RedisStreamsPublisher, RedisStreamsSource};

const CONSUMER_WATCH_INTERVAL: Duration = Duration::from_millis(500);

pub type SharedStore = Arc<dyn OrderStore>;
pub type SharedPublisher = Arc<ReliablePublisher<Arc<dyn EventPublisher>>>;
pub type Orders = OrderService<SharedStore, SharedPublisher>;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("order store: {0}")]
    Store(#[from] StoreError),

    #[error("event publisher: {0}")]
    Publisher(#[from] PublishError),

    #[error("event consumer: {0}")]
    Consumer(#[from] SourceError),
}

/// Which adapters are wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    Persistent,
}

/// Counters exposed on `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub backend: Backend,
    pub orders: OrderServiceStats,
    pub publisher: PublisherStats,
    pub consumer: ConsumerStats,
}

type StatsFn = Box<dyn Fn() -> ConsumerStats + Send + Sync>;

pub struct AppServices {
    pub orders: Orders,
    backend: Backend,
    consumer_stats: StatsFn,
}

impl AppServices {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            backend: self.backend,
            orders: self.orders.stats(),
            publisher: self.orders.publisher().stats(),
            consumer: (self.consumer_stats)(),
        }
    }
}

/// Services plus the background consumer, owned by the process entrypoint.
pub struct Runtime {
    pub services: Arc<AppServices>,
    consumer: ConsumerHandle,
}

impl Runtime {
    /// Stop the consumer after its current message, drain and close the
    /// publisher, then release the store.
    pub async fn shutdown(self) {
        if let Err(err) = self.consumer.shutdown().await {
            error!(error = %err, "order event consumer ended with an error");
        }

        if let Err(err) = self.services.orders.publisher().close().await {
            warn!(error = %err, "failed to close event publisher");
        }

        self.services.orders.store().close().await;
        info!("services stopped");
    }

    /// Whether the consumer task has already stopped (fatal source error).
    pub fn consumer_stopped(&self) -> bool {
        self.consumer.is_finished()
    }

    /// Resolves once the consumer task stops without being asked to.
    pub async fn consumer_exited(&self) {
        let mut tick = tokio::time::interval(CONSUMER_WATCH_INTERVAL);
        while !self.consumer_stopped() {
            tick.tick().await;
        }
    }
}

pub async fn build_services(config: &AppConfig) -> Result<Runtime, StartupError> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    Ok(build_in_memory_services(
        config,
        Arc::new(InMemoryOrderStore::new()),
        Arc::new(InMemoryBroker::new()),
    ))
}

/// In-memory wiring (dev/test). Callers keep the store and broker handles to
/// inspect or disturb them.
pub fn build_in_memory_services(
    config: &AppConfig,
    store: Arc<InMemoryOrderStore>,
    broker: Arc<InMemoryBroker>,
) -> Runtime {
    info!("using in-memory order store and broker");

    let source = broker.source(&config.broker.topic, &config.broker.group_id);
    let publisher: Arc<dyn EventPublisher> = broker;

    assemble(config, Backend::InMemory, store, publisher, source)
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &AppConfig) -> Result<Runtime, StartupError> {
    info!(topic = %config.broker.topic, "using postgres order store and redis streams broker");

    let store = PostgresOrderStore::connect(&config.database).await?;
    store.ensure_schema().await?;

    let publisher: Arc<dyn EventPublisher> = Arc::new(RedisStreamsPublisher::connect(&config.broker).await?);
    let source = RedisStreamsSource::connect(&config.broker).await?;

    Ok(assemble(config, Backend::Persistent, Arc::new(store), publisher, source))
}

fn assemble<S>(
    config: &AppConfig,
    backend: Backend,
    store: SharedStore,
    publisher: Arc<dyn EventPublisher>,
    source: S,
) -> Runtime
where
    S: orderflow_events::MessageSource + 'static,
{
    let publisher = Arc::new(ReliablePublisher::new(publisher, config.publisher.clone()));
    let orders = OrderService::new(store, publisher, config.broker.topic.clone());

    let consumer = OrderEventConsumer::spawn(
        source,
        LoggingOrderHandler,
        ConsumerConfig::default(),
        CancellationToken::new(),
    );

    let services = Arc::new(AppServices {
        orders,
        backend,
        consumer_stats: Box::new(consumer.stats_source()),
    });

    Runtime { services, consumer }
}
