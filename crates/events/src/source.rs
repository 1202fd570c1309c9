//! Consumer-side abstraction: a source of deliveries with explicit acknowledgment.
//!
//! A `MessageSource` belongs to one consumer in a consumer group. Deliveries stay
//! pending until acknowledged, so a crash between receipt and `ack` leads to
//! redelivery (at-least-once) instead of loss.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! loop {
//!     match source.next().await? {
//!         Some(delivery) => {
//!             handle(&delivery)?;
//!             source.ack(&delivery).await?;
//!         }
//!         None => continue, // nothing yet; check for shutdown
//!     }
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-specific position (stream entry id, offset...).
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    /// How many times this consumer has been handed this message (1 on first receipt).
    pub attempt: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Retryable (connection dropped, broker busy).
    #[error("transient source error: {0}")]
    Transient(String),

    /// The source cannot continue (bad configuration, missing permissions).
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

#[async_trait]
pub trait MessageSource: Send {
    /// Wait (bounded) for the next delivery. `Ok(None)` means nothing arrived
    /// in time; callers should poll again.
    async fn next(&mut self) -> Result<Option<Delivery>, SourceError>;

    /// Commit the delivery; it will not be redelivered to the group.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), SourceError>;

    /// Give the delivery back unprocessed; it stays pending and is redelivered.
    async fn release(&mut self, delivery: &Delivery) -> Result<(), SourceError>;

    /// Park a delivery that keeps failing and commit it so it no longer blocks.
    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), SourceError>;
}
