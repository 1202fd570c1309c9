//! Postgres-backed order store.
//!
//! ## Schema
//!
//! `orders` holds one row per order; `order_items` holds its lines and is
//! removed with it (`ON DELETE CASCADE`). Money columns store minor units
//! (`BIGINT` cents) so totals read back exactly as written. `idempotency_key`
//! is `UNIQUE` and nullable: orders without a key never conflict.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | `PoolTimedOut`, `PoolClosed`, `Io`, `Tls` | `Unavailable` | Database unreachable or pool exhausted |
//! | `ColumnDecode`, `ColumnNotFound`, `Decode` | `Corrupt` | Row does not match the expected shape |
//! | `Database`, other | `Backend` | Constraint violations, syntax errors, etc. |
//!
//! ## Thread Safety
//!
//! `PostgresOrderStore` is `Send + Sync`; all access goes through the `PgPool`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use orderflow_core::{CustomerId, Money, OrderId, ProductId};
use orderflow_orders::{IdempotencyKey, NewOrder, Order, OrderItem, OrderStatus};

use super::r#trait::{OrderStore, SaveOutcome, StoreError};

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 100,
            min_connections: 10,
            max_lifetime: Duration::from_secs(60 * 60),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id              BIGSERIAL PRIMARY KEY,
        customer_id     BIGINT NOT NULL,
        total           BIGINT NOT NULL,
        status          TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        idempotency_key TEXT UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_items (
        id          BIGSERIAL PRIMARY KEY,
        order_id    BIGINT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
        product_id  BIGINT NOT NULL,
        quantity    BIGINT NOT NULL,
        price       BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id)",
];

#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool using `config` and verify the database is reachable.
    #[instrument(skip(config), err)]
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        info!(max_connections = config.max_connections, "connected to postgres");
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn find_id_by_key(&self, key: &IdempotencyKey) -> Result<Option<OrderId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM orders WHERE idempotency_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        Ok(id.map(OrderId::new))
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[instrument(
        skip(self, order),
        fields(
            customer_id = %order.customer_id(),
            item_count = order.items().len(),
            total = %order.total()
        ),
        err
    )]
    async fn save(&self, order: NewOrder) -> Result<SaveOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // NULL keys never conflict, so keyless orders always insert.
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO orders (customer_id, total, status, created_at, idempotency_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(order.customer_id().get())
        .bind(order.total().minor())
        .bind(order.status().as_str())
        .bind(order.created_at())
        .bind(order.idempotency_key().map(IdempotencyKey::as_str))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        let Some(id) = inserted else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;

            let existing = match order.idempotency_key() {
                Some(key) => self.find_id_by_key(key).await?,
                None => None,
            };
            let id = existing.ok_or_else(|| {
                StoreError::Backend("insert conflicted but no order holds the idempotency key".to_string())
            })?;
            return self.find_by_id(id).await.map(SaveOutcome::Replayed);
        };

        insert_items(&mut tx, id, order.items()).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(SaveOutcome::Created(order.persisted(OrderId::new(id))))
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn find_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, total, status, created_at, idempotency_key
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_order", e))?
        .ok_or(StoreError::NotFound)?;

        let order_row = OrderRow::from_row(&row).map_err(|e| map_sqlx_error("decode_order", e))?;

        let item_rows = sqlx::query(
            r#"
            SELECT product_id, quantity, price
            FROM order_items
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_order_items", e))?;

        let mut items = Vec::with_capacity(item_rows.len());
        for row in &item_rows {
            let item = OrderItemRow::from_row(row).map_err(|e| map_sqlx_error("decode_order_item", e))?;
            items.push(item.into());
        }

        order_row.into_order(items)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Insert every line of an order in one statement.
async fn insert_items(
    tx: &mut Transaction<'_, Postgres>,
    order_id: i64,
    items: &[OrderItem],
) -> Result<(), StoreError> {
    let product_ids: Vec<i64> = items.iter().map(|i| i.product_id.get()).collect();
    let quantities: Vec<i64> = items.iter().map(|i| i.quantity).collect();
    let prices: Vec<i64> = items.iter().map(|i| i.price.minor()).collect();

    sqlx::query(
        r#"
        INSERT INTO order_items (order_id, product_id, quantity, price)
        SELECT $1, product_id, quantity, price
        FROM UNNEST($2::BIGINT[], $3::BIGINT[], $4::BIGINT[]) WITH ORDINALITY
            AS t(product_id, quantity, price, position)
        ORDER BY position
        "#,
    )
    .bind(order_id)
    .bind(&product_ids)
    .bind(&quantities)
    .bind(&prices)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_order_items", e))?;

    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("connection pool closed in {operation}")),
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Backend(format!("database error in {operation} ({code}): {}", db_err.message()))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct OrderRow {
    id: i64,
    customer_id: i64,
    total: i64,
    status: String,
    created_at: DateTime<Utc>,
    idempotency_key: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            customer_id: row.try_get("customer_id")?,
            total: row.try_get("total")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            idempotency_key: row.try_get("idempotency_key")?,
        })
    }
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Result<Order, StoreError> {
        let status = OrderStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("order {} has unknown status {:?}", self.id, self.status)))?;

        let idempotency_key = self
            .idempotency_key
            .as_deref()
            .map(IdempotencyKey::parse)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("order {} has invalid idempotency key: {e}", self.id)))?;

        Ok(Order::rehydrate(
            OrderId::new(self.id),
            CustomerId::new(self.customer_id),
            items,
            Money::from_minor(self.total),
            status,
            self.created_at,
            idempotency_key,
        ))
    }
}

#[derive(Debug)]
struct OrderItemRow {
    product_id: i64,
    quantity: i64,
    price: i64,
}

impl<'r> FromRow<'r, PgRow> for OrderItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderItemRow {
            product_id: row.try_get("product_id")?,
            quantity: row.try_get("quantity")?,
            price: row.try_get("price")?,
        })
    }
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        OrderItem {
            product_id: ProductId::new(row.product_id),
            quantity: row.quantity,
            price: Money::from_minor(row.price),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow_core::Entity;

    #[test]
    fn connectivity_errors_map_to_unavailable() {
        assert!(map_sqlx_error("save", sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(map_sqlx_error("save", sqlx::Error::PoolClosed).is_unavailable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(map_sqlx_error("save", sqlx::Error::Io(io)).is_unavailable());
    }

    #[test]
    fn shape_errors_map_to_corrupt() {
        let err = map_sqlx_error("decode_order", sqlx::Error::ColumnNotFound("total".to_string()));
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn other_errors_map_to_backend() {
        let err = map_sqlx_error("load_order", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn default_pool_settings() {
        let config = DbConfig::new("postgres://localhost/ordersdb");
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let row = OrderRow {
            id: 1,
            customer_id: 42,
            total: 1998,
            status: "SHIPPED".to_string(),
            created_at: Utc::now(),
            idempotency_key: None,
        };
        assert!(matches!(row.into_order(vec![]), Err(StoreError::Corrupt(_))));
    }

    /// Runs against a real database when `TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn round_trip_and_replay_against_postgres() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let mut config = DbConfig::new(url);
        config.min_connections = 0;
        let store = PostgresOrderStore::connect(&config).await.unwrap();
        store.ensure_schema().await.unwrap();

        let key = format!("pg-test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let draft = NewOrder::create(
            CustomerId::new(42),
            vec![orderflow_orders::OrderItemInput {
                product_id: ProductId::new(1),
                quantity: 2,
                price: Some(Money::from_minor(999)),
            }],
            Some(&key),
            Utc::now(),
        )
        .unwrap();

        let created = store.save(draft.clone()).await.unwrap();
        assert!(!created.is_replay());
        let loaded = store.find_by_id(*created.order().id()).await.unwrap();
        assert_eq!(&loaded, created.order());

        let replayed = store.save(draft).await.unwrap();
        assert!(replayed.is_replay());
        assert_eq!(replayed.order(), created.order());

        store.close().await;
    }
}
