//! Postgres-backed ledger store.
//!
//! Row locks are Postgres row locks: a unit of work runs inside one
//! transaction with `SET LOCAL lock_timeout`, and locks rows with
//! `SELECT ... ORDER BY id FOR UPDATE`. Dropping the unit rolls the
//! transaction back.
//!
//! ## Expected schema
//!
//! ```sql
//! CREATE TABLE batch_statuses (id UUID PRIMARY KEY, name TEXT NOT NULL UNIQUE, description TEXT);
//! CREATE TABLE event_types    (id UUID PRIMARY KEY, name TEXT NOT NULL UNIQUE, description TEXT);
//!
//! CREATE TABLE batches (
//!     id                 UUID PRIMARY KEY,
//!     code               TEXT NOT NULL UNIQUE,
//!     product_id         UUID NOT NULL,
//!     parent_id          UUID REFERENCES batches (id),
//!     custodian_id       UUID NOT NULL,
//!     custodian_role     TEXT,
//!     status             TEXT NOT NULL REFERENCES batch_statuses (name),
//!     initial_quantity   NUMERIC NOT NULL CHECK (initial_quantity > 0),
//!     remaining_quantity NUMERIC NOT NULL CHECK (remaining_quantity >= 0),
//!     unit               TEXT NOT NULL,
//!     origin_date        DATE NOT NULL,
//!     created_at         TIMESTAMPTZ NOT NULL,
//!     CHECK (remaining_quantity <= initial_quantity)
//! );
//! CREATE INDEX batches_parent_idx ON batches (parent_id);
//!
//! CREATE TABLE batch_events (
//!     id               UUID PRIMARY KEY,
//!     batch_id         UUID NOT NULL REFERENCES batches (id),
//!     event_type       TEXT NOT NULL REFERENCES event_types (name),
//!     actor_id         UUID NOT NULL,
//!     custodian_role   TEXT,
//!     recorded_at      TIMESTAMPTZ NOT NULL,
//!     location         TEXT,
//!     attachments      JSONB NOT NULL DEFAULT '[]',
//!     sensor_readings  JSONB NOT NULL DEFAULT '[]',
//!     external_tx_hash TEXT
//! );
//! CREATE INDEX batch_events_batch_idx ON batch_events (batch_id, recorded_at, id);
//!
//! CREATE TABLE orders (
//!     id             UUID PRIMARY KEY,
//!     order_number   TEXT NOT NULL UNIQUE,
//!     buyer_id       UUID NOT NULL,
//!     seller_id      UUID NOT NULL,
//!     total_amount   NUMERIC NOT NULL,
//!     transporter_id UUID,
//!     is_completed   BOOLEAN NOT NULL DEFAULT FALSE,
//!     created_at     TIMESTAMPTZ NOT NULL,
//!     completed_at   TIMESTAMPTZ
//! );
//!
//! CREATE TABLE order_lines (
//!     order_id            UUID NOT NULL REFERENCES orders (id),
//!     line_no             INTEGER NOT NULL,
//!     source_batch_id     UUID NOT NULL REFERENCES batches (id),
//!     downstream_batch_id UUID NOT NULL REFERENCES batches (id),
//!     quantity            NUMERIC NOT NULL,
//!     unit_price          NUMERIC NOT NULL,
//!     line_total          NUMERIC NOT NULL,
//!     PRIMARY KEY (order_id, line_no)
//! );
//! ```
//!
//! ## Error mapping
//!
//! | SQLSTATE | Meaning | StoreError |
//! |----------|---------|------------|
//! | `55P03` | lock_not_available (lock_timeout hit) | `Contention` |
//! | `40P01` | deadlock_detected | `Contention` |
//! | `23505` | unique_violation | `Duplicate` (catalog inserts re-read instead) |
//! | other / driver errors | | `Backend` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use agritrace_core::{BatchId, CatalogId, Entity, EventId, OrderId, PartyId, ProductId, Quantity};
use agritrace_ledger::{
    Attachment, Batch, BatchSnapshot, BatchStatus, CatalogEntry, CatalogKind, EventKind, Order,
    OrderLine, PartyRef, PartyRole, SensorReading, TraceEvent,
};

use super::{LedgerStore, LedgerTx, StoreError, lock_sequence};

const BATCH_COLUMNS: &str = "id, code, product_id, parent_id, custodian_id, custodian_role, status, \
     initial_quantity, remaining_quantity, unit, origin_date, created_at";

const EVENT_COLUMNS: &str = "id, batch_id, event_type, actor_id, custodian_role, recorded_at, \
     location, attachments, sensor_readings, external_tx_hash";

const ORDER_COLUMNS: &str = "id, order_number, buyer_id, seller_id, total_amount, transporter_id, \
     is_completed, created_at, completed_at";

/// Postgres ledger store.
///
/// `Send + Sync`; every call borrows a connection from the shared pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    async fn load_order(&self, row: &PgRow) -> Result<Order, StoreError> {
        let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("decode_order", e))?;
        let lines = sqlx::query(
            "SELECT source_batch_id, downstream_batch_id, quantity, unit_price, line_total \
             FROM order_lines WHERE order_id = $1 ORDER BY line_no",
        )
        .bind(id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_order_lines", e))?;
        order_from_row(row, &lines)
    }

    async fn load_orders(&self, rows: Vec<PgRow>) -> Result<Vec<Order>, StoreError> {
        let mut orders = Vec::with_capacity(rows.len());
        for row in &rows {
            orders.push(self.load_order(row).await?);
        }
        Ok(orders)
    }
}

/// One Postgres transaction.
struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PostgresTx {
    #[instrument(skip(self), fields(batch_count = ids.len()), err)]
    async fn lock_batches(&mut self, ids: &[BatchId]) -> Result<Vec<Batch>, StoreError> {
        let ids = lock_sequence(ids);
        let raw: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(&raw)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_batches", e))?;

        let batches = rows
            .iter()
            .map(batch_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(missing) = ids
            .iter()
            .find(|id| !batches.iter().any(|b| b.id() == *id))
        {
            return Err(StoreError::NotFound(format!("batch {missing}")));
        }
        Ok(batches)
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn lock_order(&mut self, id: OrderId) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_order", e))?
        .ok_or_else(|| StoreError::NotFound(format!("order {id}")))?;

        let lines = sqlx::query(
            "SELECT source_batch_id, downstream_batch_id, quantity, unit_price, line_total \
             FROM order_lines WHERE order_id = $1 ORDER BY line_no",
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_order_lines", e))?;

        order_from_row(&row, &lines)
    }

    async fn insert_batch(&mut self, batch: &Batch) -> Result<(), StoreError> {
        let row = batch.snapshot();
        sqlx::query(&format!(
            "INSERT INTO batches ({BATCH_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(row.id.as_uuid())
        .bind(&row.code)
        .bind(row.product_id.as_uuid())
        .bind(row.parent_id.map(Uuid::from))
        .bind(row.custodian.id.as_uuid())
        .bind(row.custodian.role.map(PartyRole::as_str))
        .bind(row.status.name())
        .bind(row.initial_quantity.value())
        .bind(row.remaining_quantity.value())
        .bind(&row.unit)
        .bind(row.origin_date)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_batch", e))?;
        Ok(())
    }

    async fn update_batch(&mut self, batch: &Batch) -> Result<(), StoreError> {
        // parent_id, initial_quantity and origin_date never change.
        let result = sqlx::query(
            "UPDATE batches SET custodian_id = $2, custodian_role = $3, status = $4, \
             remaining_quantity = $5 WHERE id = $1",
        )
        .bind(batch.id().as_uuid())
        .bind(batch.custodian().id.as_uuid())
        .bind(batch.custodian().role.map(PartyRole::as_str))
        .bind(batch.status().name())
        .bind(batch.remaining_quantity().value())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_batch", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("batch {}", batch.id())));
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(order.id.as_uuid())
        .bind(&order.order_number)
        .bind(order.buyer.as_uuid())
        .bind(order.seller.as_uuid())
        .bind(order.total_amount)
        .bind(order.transporter.map(Uuid::from))
        .bind(order.is_completed)
        .bind(order.created_at)
        .bind(order.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for (line_no, line) in order.lines.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_lines (order_id, line_no, source_batch_id, downstream_batch_id, \
                 quantity, unit_price, line_total) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(order.id.as_uuid())
            .bind(line_no as i32)
            .bind(line.source_batch_id.as_uuid())
            .bind(line.downstream_batch_id.as_uuid())
            .bind(line.quantity.value())
            .bind(line.unit_price)
            .bind(line.line_total)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_line", e))?;
        }
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE orders SET transporter_id = $2, is_completed = $3, completed_at = $4 \
             WHERE id = $1",
        )
        .bind(order.id.as_uuid())
        .bind(order.transporter.map(Uuid::from))
        .bind(order.is_completed)
        .bind(order.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    async fn append_event(&mut self, event: &TraceEvent) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO batch_events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(event.id.as_uuid())
        .bind(event.batch_id.as_uuid())
        .bind(event.kind.name())
        .bind(event.actor.as_uuid())
        .bind(event.custodian_role.map(PartyRole::as_str))
        .bind(event.recorded_at)
        .bind(&event.location)
        .bind(Json(&event.attachments))
        .bind(Json(&event.sensor_readings))
        .bind(&event.external_tx_hash)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_event", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is an integer we format.
        let millis = self.lock_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = '{millis}ms'"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PostgresTx { tx }))
    }

    #[instrument(skip(self), fields(batch_id = %id), err)]
    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_batch", e))?
            .as_ref()
            .map(batch_from_row)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn batch_by_code(&self, code: &str) -> Result<Option<Batch>, StoreError> {
        sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE code = $1"))
            .bind(code)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_batch_by_code", e))?
            .as_ref()
            .map(batch_from_row)
            .transpose()
    }

    #[instrument(skip(self), fields(batch_id = %parent), err)]
    async fn children(&self, parent: BatchId) -> Result<Vec<Batch>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE parent_id = $1 ORDER BY id"
        ))
        .bind(parent.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_children", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    #[instrument(skip(self), fields(batch_id = %batch), err)]
    async fn events_for_batch(&self, batch: BatchId) -> Result<Vec<TraceEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM batch_events WHERE batch_id = $1 \
             ORDER BY recorded_at ASC, id ASC"
        ))
        .bind(batch.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_events", e))?;
        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_order", e))?;
        match row {
            Some(row) => Ok(Some(self.load_order(&row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn orders_by_buyer(&self, buyer: PartyId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE buyer_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(buyer.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_orders_by_buyer", e))?;
        self.load_orders(rows).await
    }

    #[instrument(skip(self), err)]
    async fn orders_by_seller(&self, seller: PartyId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE seller_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(seller.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_orders_by_seller", e))?;
        self.load_orders(rows).await
    }

    #[instrument(skip(self, description), err)]
    async fn find_or_create_catalog(
        &self,
        kind: CatalogKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<CatalogEntry, StoreError> {
        let table = catalog_table(kind);

        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} (id, name, description) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO NOTHING RETURNING id, name, description"
        ))
        .bind(CatalogId::new().as_uuid())
        .bind(name)
        .bind(description)
        .fetch_optional(&*self.pool)
        .await;

        let row = match inserted {
            Ok(Some(row)) => row,
            // Lost the race to a concurrent creator: read theirs.
            Ok(None) => select_catalog(&self.pool, table, name).await?,
            Err(e) if is_unique_violation(&e) => select_catalog(&self.pool, table, name).await?,
            Err(e) => return Err(map_sqlx_error("insert_catalog", e)),
        };
        catalog_from_row(kind, &row)
    }
}

fn catalog_table(kind: CatalogKind) -> &'static str {
    match kind {
        CatalogKind::Status => "batch_statuses",
        CatalogKind::EventType => "event_types",
    }
}

async fn select_catalog(pool: &PgPool, table: &str, name: &str) -> Result<PgRow, StoreError> {
    sqlx::query(&format!(
        "SELECT id, name, description FROM {table} WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(|e| map_sqlx_error("select_catalog", e))?
    .ok_or_else(|| StoreError::NotFound(format!("catalog entry {name}")))
}

fn decode<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("column {column}: {e}")))
}

fn role_from_column(value: Option<String>) -> Option<PartyRole> {
    value.as_deref().and_then(PartyRole::parse)
}

fn batch_from_row(row: &PgRow) -> Result<Batch, StoreError> {
    let status: String = decode(row, "status")?;
    let initial: Decimal = decode(row, "initial_quantity")?;
    let remaining: Decimal = decode(row, "remaining_quantity")?;

    let snapshot = BatchSnapshot {
        id: BatchId::from_uuid(decode(row, "id")?),
        code: decode(row, "code")?,
        product_id: ProductId::from_uuid(decode(row, "product_id")?),
        parent_id: decode::<Option<Uuid>>(row, "parent_id")?.map(BatchId::from_uuid),
        custodian: PartyRef {
            id: PartyId::from_uuid(decode(row, "custodian_id")?),
            role: role_from_column(decode(row, "custodian_role")?),
        },
        status: status.parse::<BatchStatus>().map_err(StoreError::corrupt)?,
        initial_quantity: Quantity::new(initial).map_err(StoreError::corrupt)?,
        remaining_quantity: Quantity::new(remaining).map_err(StoreError::corrupt)?,
        unit: decode(row, "unit")?,
        origin_date: decode::<NaiveDate>(row, "origin_date")?,
        created_at: decode::<DateTime<Utc>>(row, "created_at")?,
    };
    Batch::from_snapshot(snapshot).map_err(StoreError::corrupt)
}

fn event_from_row(row: &PgRow) -> Result<TraceEvent, StoreError> {
    let kind: String = decode(row, "event_type")?;
    let attachments: Json<Vec<Attachment>> = decode(row, "attachments")?;
    let sensor_readings: Json<Vec<SensorReading>> = decode(row, "sensor_readings")?;

    Ok(TraceEvent {
        id: EventId::from_uuid(decode(row, "id")?),
        batch_id: BatchId::from_uuid(decode(row, "batch_id")?),
        kind: kind.parse::<EventKind>().map_err(StoreError::corrupt)?,
        actor: PartyId::from_uuid(decode(row, "actor_id")?),
        custodian_role: role_from_column(decode(row, "custodian_role")?),
        recorded_at: decode(row, "recorded_at")?,
        location: decode(row, "location")?,
        attachments: attachments.0,
        sensor_readings: sensor_readings.0,
        external_tx_hash: decode(row, "external_tx_hash")?,
    })
}

fn order_from_row(row: &PgRow, lines: &[PgRow]) -> Result<Order, StoreError> {
    let lines = lines
        .iter()
        .map(|line| {
            let quantity: Decimal = decode(line, "quantity")?;
            Ok(OrderLine {
                source_batch_id: BatchId::from_uuid(decode(line, "source_batch_id")?),
                downstream_batch_id: BatchId::from_uuid(decode(line, "downstream_batch_id")?),
                quantity: Quantity::new(quantity).map_err(StoreError::corrupt)?,
                unit_price: decode(line, "unit_price")?,
                line_total: decode(line, "line_total")?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(Order {
        id: OrderId::from_uuid(decode(row, "id")?),
        order_number: decode(row, "order_number")?,
        buyer: PartyId::from_uuid(decode(row, "buyer_id")?),
        seller: PartyId::from_uuid(decode(row, "seller_id")?),
        lines,
        total_amount: decode(row, "total_amount")?,
        transporter: decode::<Option<Uuid>>(row, "transporter_id")?.map(PartyId::from_uuid),
        is_completed: decode(row, "is_completed")?,
        created_at: decode(row, "created_at")?,
        completed_at: decode(row, "completed_at")?,
    })
}

fn catalog_from_row(kind: CatalogKind, row: &PgRow) -> Result<CatalogEntry, StoreError> {
    Ok(CatalogEntry {
        id: CatalogId::from_uuid(decode(row, "id")?),
        kind,
        name: decode(row, "name")?,
        description: decode(row, "description")?,
    })
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(code) => map_sqlstate(code, msg),
                None => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Backend(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

fn map_sqlstate(code: &str, msg: String) -> StoreError {
    match code {
        // lock_not_available / deadlock_detected
        "55P03" | "40P01" => StoreError::Contention(msg),
        // unique_violation
        "23505" => StoreError::Duplicate(msg),
        _ => StoreError::Backend(msg),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
