//! Retrying, backpressured wrapper around any `EventPublisher`.
//!
//! - Transient failures are retried with exponential backoff (`RetryPolicy`);
//!   fatal ones are returned immediately.
//! - At most `max_in_flight` publishes run concurrently; a caller that cannot get
//!   a slot within `acquire_timeout` gets `PublishError::Backpressure`.
//! - `close()` refuses new publishes, waits for in-flight ones to drain, then
//!   closes the inner publisher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::envelope::EventEnvelope;
use crate::publisher::{EventPublisher, PublishError};
use crate::retry::RetryPolicy;

/// Tuning for `ReliablePublisher`.
#[derive(Debug, Clone)]
pub struct ReliablePublisherConfig {
    pub retry: RetryPolicy,
    pub max_in_flight: u32,
    pub acquire_timeout: Duration,
}

impl Default for ReliablePublisherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_in_flight: 256,
            acquire_timeout: Duration::from_secs(2),
        }
    }
}

/// Publisher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub retries: u64,
    pub failures: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
}

pub struct ReliablePublisher<P> {
    inner: P,
    config: ReliablePublisherConfig,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
    counters: Counters,
}

impl<P: EventPublisher> ReliablePublisher<P> {
    pub fn new(inner: P, config: ReliablePublisherConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            inner,
            config: ReliablePublisherConfig {
                max_in_flight,
                ..config
            },
            slots: Arc::new(Semaphore::new(max_in_flight as usize)),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    async fn publish_with_retry(&self, topic: &str, event: &EventEnvelope) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.publish(topic, event).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(topic, event_id = event.event_id(), attempt, "publish succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) if err.is_retryable() && self.config.retry.should_retry(attempt) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.retry.delay_for_key(attempt, event.event_id());
                    warn!(
                        topic,
                        event_id = event.event_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient publish failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl<P: EventPublisher> EventPublisher for ReliablePublisher<P> {
    async fn publish(&self, topic: &str, event: &EventEnvelope) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let _permit = match tokio::time::timeout(self.config.acquire_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PublishError::Closed),
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic, event_id = event.event_id(), "publish rejected: too many in flight");
                return Err(PublishError::Backpressure);
            }
        };

        self.publish_with_retry(topic, event).await
    }

    async fn close(&self) -> Result<(), PublishError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Holding every slot means every in-flight publish has finished.
        match self.slots.acquire_many(self.config.max_in_flight).await {
            Ok(all) => all.forget(),
            Err(_) => return Ok(()),
        }
        self.slots.close();

        self.inner.close().await
    }
}
