//! Infrastructure layer: storage, broker adapters, order processing, workers, config.

pub mod config;
pub mod event_bus;
pub mod order_service;
pub mod order_store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{AppConfig, BrokerConfig, ConfigError};
pub use order_service::{OrderError, OrderService, OrderServiceStats};
pub use order_store::{DbConfig, InMemoryOrderStore, OrderStore, PostgresOrderStore, SaveOutcome, StoreError};
