//! `orderflow-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the money value object and the domain error model.

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, FieldViolation, ValidationErrors};
pub use id::{CustomerId, OrderId, ProductId};
pub use money::Money;
pub use value_object::ValueObject;
