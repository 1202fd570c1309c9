//! Order persistence boundary.
//!
//! `OrderStore` is the storage port used by the order service. Two adapters:
//! - `InMemoryOrderStore` for tests and the local dev profile
//! - `PostgresOrderStore` for production (`sqlx`)

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryOrderStore;
pub use postgres::{DbConfig, PostgresOrderStore};
pub use r#trait::{OrderStore, SaveOutcome, StoreError};
