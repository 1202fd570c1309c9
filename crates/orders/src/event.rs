use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::Entity;
use orderflow_events::Event;

use crate::order::Order;

/// Event: an order was persisted.
///
/// The payload on the wire is the full persisted order record, so consumers can
/// decode it as an `Order` directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderCreated(pub Order);

impl OrderCreated {
    pub const EVENT_TYPE: &'static str = "order.created";

    pub fn order(&self) -> &Order {
        &self.0
    }
}

impl Event for OrderCreated {
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.0.created_at()
    }

    /// One event per order: retries and replays of the same order share an id.
    fn event_id(&self) -> String {
        format!("{}:{}", Self::EVENT_TYPE, self.0.id())
    }

    fn partition_key(&self) -> String {
        self.0.id().to_string()
    }
}
