use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{CustomerId, Entity, Money, OrderId, ProductId, ValidationErrors};

/// Longest idempotency key accepted from callers.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Order status.
///
/// Every created order starts (and currently stays) in `Created`; the other
/// variants are reserved for lifecycle handling downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(OrderStatus::Created),
            "PROCESSING" => Some(OrderStatus::Processing),
            "COMPLETED" => Some(OrderStatus::Completed),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// Line item: product, quantity, unit price. Owned exclusively by its order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Unit price.
    pub price: Money,
}

impl OrderItem {
    /// `price * quantity`, or `None` on overflow.
    pub fn line_total(&self) -> Option<Money> {
        self.price.checked_mul(self.quantity)
    }
}

/// Unvalidated line item as received from a caller.
///
/// `price` is optional so a missing price can be reported instead of silently
/// defaulting to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItemInput {
    pub product_id: ProductId,
    pub quantity: i64,
    pub price: Option<Money>,
}

/// Caller-supplied token that lets storage suppress duplicate writes from retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("must not be empty");
        }
        if raw.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err("must be at most 255 characters");
        }
        if !raw.chars().all(|c| c.is_ascii_graphic()) {
            return Err("must contain printable ASCII characters only");
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated order that has not been persisted yet (no id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    customer_id: CustomerId,
    items: Vec<OrderItem>,
    total: Money,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    idempotency_key: Option<IdempotencyKey>,
}

impl NewOrder {
    /// Validate input and build an order ready to be saved.
    ///
    /// Every offending field is reported. The total is always computed here;
    /// there is no way to supply one.
    pub fn create(
        customer_id: CustomerId,
        items: Vec<OrderItemInput>,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !customer_id.is_valid() {
            errors.push("customerId", "must be a positive identifier");
        }

        if items.is_empty() {
            errors.push("items", "must not be empty");
        }

        let key = match idempotency_key.map(IdempotencyKey::parse) {
            Some(Ok(k)) => Some(k),
            Some(Err(msg)) => {
                errors.push("idempotencyKey", msg);
                None
            }
            None => None,
        };

        let mut validated = Vec::with_capacity(items.len());
        let mut total = Some(Money::ZERO);

        for (idx, input) in items.into_iter().enumerate() {
            let before = errors.violations().len();

            if !input.product_id.is_valid() {
                errors.push(format!("items[{idx}].productId"), "must be a positive identifier");
            }
            if input.quantity <= 0 {
                errors.push(format!("items[{idx}].quantity"), "must be greater than zero");
            }
            match input.price {
                None => errors.push(format!("items[{idx}].price"), "is required"),
                Some(p) if p.is_negative() => {
                    errors.push(format!("items[{idx}].price"), "must not be negative")
                }
                Some(p) if !p.is_in_range() => errors.push(format!("items[{idx}].price"), "is out of range"),
                Some(_) => {}
            }

            if errors.violations().len() != before {
                continue;
            }

            let item = OrderItem {
                product_id: input.product_id,
                quantity: input.quantity,
                price: input.price.unwrap_or(Money::ZERO),
            };

            match item.line_total() {
                Some(line) => total = total.and_then(|t| t.checked_add(line)),
                None => {
                    errors.push(format!("items[{idx}]"), "line total is out of range");
                    continue;
                }
            }

            validated.push(item);
        }

        // Anything beyond `Money::MAX` could not be decoded by consumers.
        let total = match total.filter(Money::is_in_range) {
            Some(t) => t,
            None => {
                errors.push("items", "order total is out of range");
                Money::ZERO
            }
        };

        errors.into_result()?;

        Ok(Self {
            customer_id,
            items: validated,
            total,
            status: OrderStatus::Created,
            // Storage keeps microseconds; truncate so the returned record and a
            // later read are identical.
            created_at: now.trunc_subsecs(6),
            idempotency_key: key,
        })
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }

    /// Attach the storage-assigned id. Consumes the draft, so an id can only be
    /// assigned once.
    pub fn persisted(self, id: OrderId) -> Order {
        Order {
            id,
            customer_id: self.customer_id,
            items: self.items,
            total: self.total,
            status: self.status,
            created_at: self.created_at,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// Aggregate root: a persisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: OrderId,
    customer_id: CustomerId,
    items: Vec<OrderItem>,
    total: Money,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<IdempotencyKey>,
}

impl Order {
    /// Rebuild an order from stored columns (storage adapters only).
    pub fn rehydrate(
        id: OrderId,
        customer_id: CustomerId,
        items: Vec<OrderItem>,
        total: Money,
        status: OrderStatus,
        created_at: DateTime<Utc>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Self {
        Self {
            id,
            customer_id,
            items,
            total,
            status,
            created_at,
            idempotency_key,
        }
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }
}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
