//! Event publication and consumption mechanics (transport-agnostic).
//!
//! - `publisher`: the port used to publish events to a topic
//! - `source`: the port used by consumers to receive and acknowledge deliveries
//! - `reliable`: retry/backoff + backpressure around any publisher
//! - `in_memory`: a broker for tests and local development

pub mod envelope;
pub mod event;
pub mod in_memory;
pub mod publisher;
pub mod reliable;
pub mod retry;
pub mod source;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory::{DeadLetter, InMemoryBroker, InMemorySource, StoredMessage};
pub use publisher::{EventPublisher, PublishError};
pub use reliable::{PublisherStats, ReliablePublisher, ReliablePublisherConfig};
pub use retry::RetryPolicy;
pub use source::{Delivery, MessageSource, SourceError};
