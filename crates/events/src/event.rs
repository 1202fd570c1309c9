use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **identified deterministically** so duplicates from retries can be recognised
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "order.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Identity of the fact. Publishing the same fact twice yields the same id.
    fn event_id(&self) -> String;

    /// Key used by brokers to keep related events in order (same partition).
    fn partition_key(&self) -> String;
}
