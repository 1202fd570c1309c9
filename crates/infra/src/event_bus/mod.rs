//! Broker-backed implementations of the publisher and message-source ports.
//!
//! The ports themselves live in `orderflow-events` as pure mechanics.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsPublisher, RedisStreamsSource};
