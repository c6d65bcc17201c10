//! Batch store: transactional, row-locking persistence for the ledger.
//!
//! ```text
//! LedgerStore::begin() ──► LedgerTx
//!                            ├─ lock_order / lock_batches   (exclusive, bounded wait)
//!                            ├─ insert_* / update_* / append_event   (staged)
//!                            └─ commit()   (all or nothing; dropping = rollback)
//! ```
//!
//! ## Lock discipline
//!
//! - An order lock, when needed, is taken before any batch lock.
//! - Batch locks are taken in ascending id order, all in one call.
//! - The whole unit shares one lock-wait budget; running out of it fails with
//!   [`StoreError::Contention`] and nothing is written.
//!
//! Plain reads (`batch`, `children`, `events_for_batch`, ...) never lock and
//! only see committed state.

mod in_memory;
mod locks;
mod postgres;

pub use in_memory::InMemoryLedgerStore;
pub use locks::{LockTable, RowGuard};
pub use postgres::PostgresLedgerStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use agritrace_core::{BatchId, LedgerError, OrderId, PartyId};
use agritrace_ledger::{Batch, CatalogEntry, CatalogKind, Order, TraceEvent};

/// Storage-level error.
///
/// These are infrastructure failures; business rule violations never come
/// from the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row lock was not acquired within the lock-wait budget.
    #[error("lock wait exceeded: {0}")]
    Contention(String),

    /// A row the unit of work asked for does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A unique key (batch code, order number, id) is already taken.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// A stored row does not decode into a valid domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Connection, driver or poisoned-lock failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn corrupt(err: LedgerError) -> Self {
        let detail = err
            .internal_detail()
            .map(str::to_owned)
            .unwrap_or_else(|| err.to_string());
        StoreError::Corrupt(detail)
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Contention(msg) => LedgerError::contention(msg),
            // Keys are generated per attempt, so a clash clears on retry.
            StoreError::Duplicate(key) => {
                LedgerError::contention(format!("key already taken: {key}"))
            }
            StoreError::NotFound(what) => LedgerError::not_found(what),
            other => LedgerError::internal(other.to_string()),
        }
    }
}

/// One atomic unit of work. Dropping it without `commit` discards every
/// staged write and releases every lock.
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock the given batches (deduplicated, ascending id order) and return
    /// their current state in that order. Missing ids fail with `NotFound`.
    async fn lock_batches(&mut self, ids: &[BatchId]) -> Result<Vec<Batch>, StoreError>;

    /// Lock an order row and return its current state.
    async fn lock_order(&mut self, id: OrderId) -> Result<Order, StoreError>;

    async fn insert_batch(&mut self, batch: &Batch) -> Result<(), StoreError>;

    /// Write back a batch previously returned by `lock_batches`.
    async fn update_batch(&mut self, batch: &Batch) -> Result<(), StoreError>;

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Write back an order previously returned by `lock_order`.
    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn append_event(&mut self, event: &TraceEvent) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Ledger persistence.
///
/// Implementations must be `Send + Sync` so one store can serve concurrent
/// operations.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError>;

    async fn batch_by_code(&self, code: &str) -> Result<Option<Batch>, StoreError>;

    /// Direct children, ascending by id.
    async fn children(&self, parent: BatchId) -> Result<Vec<Batch>, StoreError>;

    /// Events recorded on one batch, ascending by recorded time then id.
    async fn events_for_batch(&self, batch: BatchId) -> Result<Vec<TraceEvent>, StoreError>;

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Newest first.
    async fn orders_by_buyer(&self, buyer: PartyId) -> Result<Vec<Order>, StoreError>;

    /// Newest first.
    async fn orders_by_seller(&self, seller: PartyId) -> Result<Vec<Order>, StoreError>;

    /// Idempotent by `(kind, name)`, including under concurrent first use.
    async fn find_or_create_catalog(
        &self,
        kind: CatalogKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<CatalogEntry, StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        (**self).begin().await
    }

    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        (**self).batch(id).await
    }

    async fn batch_by_code(&self, code: &str) -> Result<Option<Batch>, StoreError> {
        (**self).batch_by_code(code).await
    }

    async fn children(&self, parent: BatchId) -> Result<Vec<Batch>, StoreError> {
        (**self).children(parent).await
    }

    async fn events_for_batch(&self, batch: BatchId) -> Result<Vec<TraceEvent>, StoreError> {
        (**self).events_for_batch(batch).await
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).order(id).await
    }

    async fn orders_by_buyer(&self, buyer: PartyId) -> Result<Vec<Order>, StoreError> {
        (**self).orders_by_buyer(buyer).await
    }

    async fn orders_by_seller(&self, seller: PartyId) -> Result<Vec<Order>, StoreError> {
        (**self).orders_by_seller(seller).await
    }

    async fn find_or_create_catalog(
        &self,
        kind: CatalogKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<CatalogEntry, StoreError> {
        (**self).find_or_create_catalog(kind, name, description).await
    }
}

/// Sorted, deduplicated copy of `ids`: the order every unit locks batches in.
pub fn lock_sequence(ids: &[BatchId]) -> Vec<BatchId> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}
