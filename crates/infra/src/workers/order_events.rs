//! Consumer loop for `order.created` events.
//!
//! For each delivery:
//! - undecodable payloads are logged, counted and acknowledged (they can never succeed)
//! - decoded orders go to the `OrderEventHandler`
//! - the delivery is acknowledged only after the handler returns `Ok`
//! - a failing handler gets the delivery again after a backoff; after
//!   `max_handler_attempts` it is dead-lettered and acknowledged
//!
//! Shutdown is cooperative: the message being handled completes, then the
//! loop exits. A fatal source error ends the task and is returned from
//! `ConsumerHandle::shutdown`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use orderflow_core::Entity;
use orderflow_events::{Delivery, MessageSource, RetryPolicy, SourceError};
use orderflow_orders::Order;

/// Failure reported by an `OrderEventHandler`; the delivery will be retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Business reaction to a created order.
///
/// Deliveries are at-least-once: the same order can arrive more than once
/// (dedupe on the order id if the reaction is not idempotent).
#[async_trait]
pub trait OrderEventHandler: Send + Sync + 'static {
    async fn handle(&self, order: &Order) -> Result<(), HandlerError>;
}

/// Default handler: records the event in the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOrderHandler;

#[async_trait]
impl OrderEventHandler for LoggingOrderHandler {
    async fn handle(&self, order: &Order) -> Result<(), HandlerError> {
        info!(
            order_id = %order.id(),
            customer_id = %order.customer_id(),
            total = %order.total(),
            item_count = order.items().len(),
            "received order.created"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries that failed this many times are dead-lettered.
    pub max_handler_attempts: u32,
    /// Backoff before a failed delivery is handled again.
    pub handler_backoff: RetryPolicy,
    /// Backoff after transient source errors (broker unreachable).
    pub source_backoff: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_handler_attempts: 5,
            handler_backoff: RetryPolicy::exponential(5, Duration::from_millis(200), Duration::from_secs(10)),
            source_backoff: RetryPolicy::exponential(u32::MAX, Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub processed: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub dead_lettered: u64,
    pub source_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    dead_lettered: AtomicU64,
    source_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control and join the consumer task.
#[derive(Debug)]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<(), SourceError>>,
    counters: Arc<Counters>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Live view of the counters that outlives the handle.
    pub fn stats_source(&self) -> impl Fn() -> ConsumerStats + Send + Sync + 'static {
        let counters = self.counters.clone();
        move || counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown and wait for the loop to stop.
    ///
    /// Returns the error that ended the loop early, if any.
    pub async fn shutdown(self) -> Result<(), SourceError> {
        self.cancel.cancel();
        match self.join.await {
            Ok(result) => result,
            Err(join_err) => Err(SourceError::Fatal(format!("consumer task failed: {join_err}"))),
        }
    }
}

#[derive(Debug)]
pub struct OrderEventConsumer;

impl OrderEventConsumer {
    /// Spawn the consumer loop on the current tokio runtime.
    ///
    /// Cancelling `shutdown` (or calling `ConsumerHandle::shutdown`) stops it.
    pub fn spawn<S, H>(source: S, handler: H, config: ConsumerConfig, shutdown: CancellationToken) -> ConsumerHandle
    where
        S: MessageSource + 'static,
        H: OrderEventHandler,
    {
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            source,
            handler,
            config,
            cancel: shutdown.clone(),
            counters: counters.clone(),
        };

        ConsumerHandle {
            cancel: shutdown,
            join: tokio::spawn(worker.run()),
            counters,
        }
    }
}

struct Worker<S, H> {
    source: S,
    handler: H,
    config: ConsumerConfig,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl<S, H> Worker<S, H>
where
    S: MessageSource,
    H: OrderEventHandler,
{
    async fn run(mut self) -> Result<(), SourceError> {
        info!("order event consumer started");
        let mut source_failures = 0u32;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.source.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => {
                    source_failures = 0;
                    delivery
                }
                Ok(None) => continue,
                Err(SourceError::Transient(msg)) => {
                    self.counters.source_errors.fetch_add(1, Ordering::Relaxed);
                    source_failures = source_failures.saturating_add(1);
                    let delay = self.config.source_backoff.delay_for_attempt(source_failures);
                    warn!(error = %msg, delay_ms = delay.as_millis() as u64, "message source unavailable, backing off");
                    pause(&self.cancel, delay).await;
                    continue;
                }
                Err(fatal) => {
                    error!(error = %fatal, "message source failed, stopping consumer");
                    return Err(fatal);
                }
            };

            self.counters.received.fetch_add(1, Ordering::Relaxed);
            self.process(delivery).await?;
        }

        info!("order event consumer stopped");
        Ok(())
    }

    async fn process(&mut self, delivery: Delivery) -> Result<(), SourceError> {
        let order: Order = match serde_json::from_slice(&delivery.payload) {
            Ok(order) => order,
            Err(err) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(delivery_id = %delivery.id, error = %err, "undecodable order event, skipping");
                let acked = self.source.ack(&delivery).await;
                return settle(acked);
            }
        };

        match self.handler.handle(&order).await {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                let acked = self.source.ack(&delivery).await;
                settle(acked)
            }
            Err(err) if delivery.attempt >= self.config.max_handler_attempts => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                error!(
                    delivery_id = %delivery.id,
                    order_id = %order.id(),
                    attempt = delivery.attempt,
                    error = %err,
                    "order event handler kept failing, dead-lettering"
                );
                let parked = self.source.dead_letter(&delivery, &err.to_string()).await;
                settle(parked)
            }
            Err(err) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                let delay = self.config.handler_backoff.delay_for_key(delivery.attempt, &delivery.id);
                warn!(
                    delivery_id = %delivery.id,
                    order_id = %order.id(),
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "order event handler failed, will retry"
                );
                let released = self.source.release(&delivery).await;
                settle(released)?;
                pause(&self.cancel, delay).await;
                Ok(())
            }
        }
    }

}

/// Sleep unless shutdown is requested first.
async fn pause(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

/// A transient failure to settle a delivery only means it will be seen again.
fn settle(result: Result<(), SourceError>) -> Result<(), SourceError> {
    match result {
        Err(SourceError::Transient(msg)) => {
            warn!(error = %msg, "failed to settle delivery, it will be redelivered");
            Ok(())
        }
        other => other,
    }
}
