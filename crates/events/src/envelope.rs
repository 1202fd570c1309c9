use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::Event;
use crate::publisher::PublishError;

/// Envelope for an outbound event: broker metadata + encoded payload.
///
/// This is the unit handed to an `EventPublisher`.
///
/// Notes:
/// - `event_id` is deterministic per fact; publishers use it to drop duplicate sends.
/// - `key` selects the partition/ordering scope.
/// - `payload` is already JSON-encoded so every publisher sends identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    event_id: String,
    event_type: String,
    event_version: u32,
    key: String,
    occurred_at: DateTime<Utc>,
    payload: Vec<u8>,
}

impl EventEnvelope {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        event_version: u32,
        key: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            event_version,
            key: key.into(),
            occurred_at,
            payload,
        }
    }

    /// Encode a typed event as JSON.
    ///
    /// Serialization failures are not retryable, so they surface as `Fatal`.
    pub fn from_event<E>(event: &E) -> Result<Self, PublishError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_vec(event)
            .map_err(|e| PublishError::Fatal(format!("failed to serialize {}: {e}", event.event_type())))?;

        Ok(Self::new(
            event.event_id(),
            event.event_type(),
            event.version(),
            event.partition_key(),
            event.occurred_at(),
            payload,
        ))
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
