use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use orderflow_core::OrderId;
use orderflow_orders::{NewOrder, Order};

use super::r#trait::{OrderStore, SaveOutcome, StoreError};

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    orders: BTreeMap<OrderId, Order>,
    by_key: HashMap<String, OrderId>,
}

/// In-memory order store.
///
/// Intended for tests/dev. A single write lock makes each `save` atomic and
/// serializes id assignment.
#[derive(Debug)]
pub struct InMemoryOrderStore {
    state: RwLock<State>,
    available: AtomicBool,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.orders.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: NewOrder) -> Result<SaveOutcome, StoreError> {
        self.check_available()?;

        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Backend("order store lock poisoned".to_string()))?;

        if let Some(key) = order.idempotency_key() {
            if let Some(existing) = state.by_key.get(key.as_str()).and_then(|id| state.orders.get(id)) {
                return Ok(SaveOutcome::Replayed(existing.clone()));
            }
        }

        state.last_id += 1;
        let id = OrderId::new(state.last_id);
        let order = order.persisted(id);

        if let Some(key) = order.idempotency_key() {
            state.by_key.insert(key.as_str().to_string(), id);
        }
        state.orders.insert(id, order.clone());

        Ok(SaveOutcome::Created(order))
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        self.check_available()?;

        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Backend("order store lock poisoned".to_string()))?;

        state.orders.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn close(&self) {
        self.set_available(false);
    }
}
