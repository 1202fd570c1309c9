//! Event publication abstraction (mechanics only).
//!
//! The publisher is the **transport layer** for facts that have already been
//! made durable elsewhere:
//!
//! ```text
//! Request → Storage (commit) → EventPublisher (publish) → Broker → Consumers
//! ```
//!
//! Storage is the source of truth. If publication fails, the fact still exists
//! and publishing it again is safe.
//!
//! ## Delivery Guarantees
//!
//! - `publish()` returns `Ok` only once the broker acknowledged the write
//!   (at-least-once).
//! - Implementations drop duplicate sends of the same `event_id` where the broker
//!   allows it; consumers must still tolerate duplicates.
//!
//! ## Thread Safety
//!
//! The trait requires `Send + Sync`: a single publisher instance is shared by
//! every request handler.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::EventEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Retryable broker failure (connection reset, leader election, timeout).
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Non-retryable failure (message too large, serialization failure, rejected command).
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// Too many publishes in flight; the caller waited too long for a slot.
    #[error("publisher is saturated")]
    Backpressure,

    /// The publisher has been closed.
    #[error("publisher is closed")]
    Closed,
}

impl PublishError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Only transient broker failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Publishes events to a named topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &EventEnvelope) -> Result<(), PublishError>;

    /// Flush buffered sends and release the connection.
    async fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, topic: &str, event: &EventEnvelope) -> Result<(), PublishError> {
        (**self).publish(topic, event).await
    }

    async fn close(&self) -> Result<(), PublishError> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(PublishError::transient("reset").is_retryable());
        assert!(!PublishError::fatal("too large").is_retryable());
        assert!(!PublishError::Backpressure.is_retryable());
        assert!(!PublishError::Closed.is_retryable());
    }
}
