//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. To
/// "modify" one, build a new value (see `Money::checked_add`).
///
/// - **Value Object**: `Money::from_minor(999)` equals any other `Money::from_minor(999)`
/// - **Entity**: an `Order` is the same order as long as its `OrderId` matches
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
