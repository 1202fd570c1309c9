//! Orders domain module.
//!
//! This crate contains the business rules for orders (validation, total
//! computation, the order-created event), implemented purely as deterministic
//! domain logic (no IO, no HTTP, no storage).

pub mod event;
pub mod order;

pub use event::OrderCreated;
pub use order::{IdempotencyKey, NewOrder, Order, OrderItem, OrderItemInput, OrderStatus};
