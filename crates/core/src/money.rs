//! Monetary amounts.
//!
//! Amounts are kept in minor units (cents) so that totals are exact; the wire
//! format is a plain decimal JSON number (`9.99`).

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::value_object::ValueObject;

const MINOR_PER_MAJOR: i64 = 100;

/// Largest magnitude, in minor units, that survives the decimal wire format
/// with every cent intact.
const MAX_MINOR: i64 = 1_000_000_000_000_000;

/// `MAX_MINOR` in major units; the decoder rejects anything beyond it.
const MAX_MAJOR: f64 = (MAX_MINOR / MINOR_PER_MAJOR) as f64;

/// Amount of money in minor units (e.g. cents). May be negative so that
/// validation can report it; order validation rejects negative prices.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(0);

    /// Largest amount that can be encoded and decoded again without loss.
    pub const MAX: Money = Money(MAX_MINOR);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Convert a decimal amount to the nearest minor unit.
    ///
    /// Returns `None` for non-finite or out-of-range input.
    pub fn from_major(major: f64) -> Option<Self> {
        if !major.is_finite() || major.abs() > MAX_MAJOR {
            return None;
        }
        Some(Self((major * MINOR_PER_MAJOR as f64).round() as i64))
    }

    pub fn to_major(&self) -> f64 {
        self.0 as f64 / MINOR_PER_MAJOR as f64
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Whether the amount fits the wire format (see `Money::MAX`).
    pub fn is_in_range(&self) -> bool {
        self.0.unsigned_abs() <= MAX_MINOR as u64
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_mul(self, quantity: i64) -> Option<Money> {
        self.0.checked_mul(quantity).map(Money)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_MAJOR as u64;
        write!(f, "{sign}{}.{:02}", abs / per, abs % per)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_major())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MoneyVisitor)
    }
}

struct MoneyVisitor;

impl Visitor<'_> for MoneyVisitor {
    type Value = Money;

    fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("a decimal amount")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Money, E> {
        Money::from_major(v).ok_or_else(|| E::custom("amount out of range"))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Money, E> {
        self.visit_f64(v as f64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Money, E> {
        self.visit_f64(v as f64)
    }
}
