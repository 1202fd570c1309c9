use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{CustomerId, Entity, Money, OrderId, ProductId};
use orderflow_orders::{Order, OrderItem, OrderItemInput, OrderStatus};

// -------------------------
// Request DTOs
// -------------------------

/// `POST /orders` body.
///
/// Missing fields decode to defaults so they surface as field-level
/// validation errors instead of a generic parse failure. Any client-supplied
/// total is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default, alias = "customer_id")]
    pub customer_id: i64,
    #[serde(default)]
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    #[serde(default, alias = "product_id")]
    pub product_id: i64,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub price: Option<Money>,
}

impl CreateOrderRequest {
    pub fn customer_id(&self) -> CustomerId {
        CustomerId::new(self.customer_id)
    }

    pub fn into_items(self) -> Vec<OrderItemInput> {
        self.items
            .into_iter()
            .map(|item| OrderItemInput {
                product_id: ProductId::new(item.product_id),
                quantity: item.quantity,
                price: item.price,
            })
            .collect()
    }
}

/// `GET /orders/get` query string. The id is parsed by hand so a malformed
/// value gets the standard error envelope.
#[derive(Debug, Deserialize)]
pub struct GetOrderQuery {
    pub id: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub total: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: *order.id(),
            customer_id: order.customer_id(),
            items: order.items().to_vec(),
            total: order.total(),
            status: order.status(),
            created_at: order.created_at(),
        }
    }
}
