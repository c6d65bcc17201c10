use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use agritrace_core::{BatchId, CatalogId, Entity, OrderId, PartyId};
use agritrace_ledger::{Batch, CatalogEntry, CatalogKind, Order, TraceEvent};

use crate::config::DEFAULT_LOCK_TIMEOUT;

use super::locks::{LockTable, RowGuard};
use super::{LedgerStore, LedgerTx, StoreError, lock_sequence};

#[derive(Debug, Default)]
struct State {
    batches: HashMap<BatchId, Batch>,
    codes: HashMap<String, BatchId>,
    children: HashMap<BatchId, BTreeSet<BatchId>>,
    events: HashMap<BatchId, Vec<TraceEvent>>,
    orders: HashMap<OrderId, Order>,
    order_numbers: HashSet<String>,
    catalog: HashMap<(CatalogKind, String), CatalogEntry>,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<State>,
    batch_locks: LockTable<BatchId>,
    order_locks: LockTable<OrderId>,
    lock_timeout: Duration,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".to_string()))
    }
}

/// In-memory ledger store.
///
/// - Row locks are per-id async mutexes with a bounded wait
/// - Writes are staged in the unit of work and applied under one write lock at commit
/// - Cloning shares the same underlying state
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                batch_locks: LockTable::new(),
                order_locks: LockTable::new(),
                lock_timeout,
            }),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.shared.lock_timeout
    }

    /// Take a batch's row lock outside any unit of work and hold it until the
    /// guard is dropped. Used to simulate a long-running competing operation.
    pub async fn hold_batch_lock(&self, id: BatchId) -> Result<RowGuard<BatchId>, StoreError> {
        let deadline = Instant::now() + self.shared.lock_timeout;
        self.shared.batch_locks.acquire(id, deadline).await
    }
}

#[derive(Debug)]
enum Staged {
    InsertBatch(Batch),
    UpdateBatch(Batch),
    InsertOrder(Order),
    UpdateOrder(Order),
    AppendEvent(TraceEvent),
}

struct InMemoryTx {
    shared: Arc<Shared>,
    deadline: Instant,
    batch_guards: HashMap<BatchId, RowGuard<BatchId>>,
    order_guards: HashMap<OrderId, RowGuard<OrderId>>,
    staged: Vec<Staged>,
}

fn check(staged: &[Staged], state: &State) -> Result<(), StoreError> {
    let mut new_codes = HashSet::new();
    let mut new_batches = HashSet::new();

    for write in staged {
        match write {
            Staged::InsertBatch(batch) => {
                let id = *batch.id();
                if state.batches.contains_key(&id) || !new_batches.insert(id) {
                    return Err(StoreError::Duplicate(format!("batch {id}")));
                }
                if state.codes.contains_key(batch.code())
                    || !new_codes.insert(batch.code().to_string())
                {
                    return Err(StoreError::Duplicate(format!(
                        "batch code {}",
                        batch.code()
                    )));
                }
            }
            Staged::UpdateBatch(batch) => {
                if !state.batches.contains_key(batch.id()) {
                    return Err(StoreError::NotFound(format!("batch {}", batch.id())));
                }
            }
            Staged::InsertOrder(order) => {
                if state.orders.contains_key(&order.id)
                    || state.order_numbers.contains(&order.order_number)
                {
                    return Err(StoreError::Duplicate(format!(
                        "order {}",
                        order.order_number
                    )));
                }
            }
            Staged::UpdateOrder(order) => {
                if !state.orders.contains_key(&order.id) {
                    return Err(StoreError::NotFound(format!("order {}", order.id)));
                }
            }
            Staged::AppendEvent(event) => {
                let known = state.batches.contains_key(&event.batch_id)
                    || new_batches.contains(&event.batch_id);
                if !known {
                    return Err(StoreError::NotFound(format!("batch {}", event.batch_id)));
                }
            }
        }
    }
    Ok(())
}

fn apply(staged: Vec<Staged>, state: &mut State) {
    for write in staged {
        match write {
            Staged::InsertBatch(batch) => {
                let id = *batch.id();
                state.codes.insert(batch.code().to_string(), id);
                if let Some(parent) = batch.parent_id() {
                    state.children.entry(parent).or_default().insert(id);
                }
                state.batches.insert(id, batch);
            }
            Staged::UpdateBatch(batch) => {
                state.batches.insert(*batch.id(), batch);
            }
            Staged::InsertOrder(order) => {
                state.order_numbers.insert(order.order_number.clone());
                state.orders.insert(order.id, order);
            }
            Staged::UpdateOrder(order) => {
                state.orders.insert(order.id, order);
            }
            Staged::AppendEvent(event) => {
                state.events.entry(event.batch_id).or_default().push(event);
            }
        }
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_batches(&mut self, ids: &[BatchId]) -> Result<Vec<Batch>, StoreError> {
        let ids = lock_sequence(ids);

        for id in &ids {
            if self.batch_guards.contains_key(id) {
                continue;
            }
            let guard = self.shared.batch_locks.acquire(*id, self.deadline).await?;
            self.batch_guards.insert(*id, guard);
        }

        let state = self.shared.read()?;
        ids.iter()
            .map(|id| {
                state
                    .batches
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))
            })
            .collect()
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Order, StoreError> {
        if !self.order_guards.contains_key(&id) {
            let guard = self.shared.order_locks.acquire(id, self.deadline).await?;
            self.order_guards.insert(id, guard);
        }

        let state = self.shared.read()?;
        state
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("order {id}")))
    }

    async fn insert_batch(&mut self, batch: &Batch) -> Result<(), StoreError> {
        self.staged.push(Staged::InsertBatch(batch.clone()));
        Ok(())
    }

    async fn update_batch(&mut self, batch: &Batch) -> Result<(), StoreError> {
        if !self.batch_guards.contains_key(batch.id()) {
            return Err(StoreError::Backend(format!(
                "batch {} written without its row lock",
                batch.id()
            )));
        }
        self.staged.push(Staged::UpdateBatch(batch.clone()));
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.staged.push(Staged::InsertOrder(order.clone()));
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        if !self.order_guards.contains_key(&order.id) {
            return Err(StoreError::Backend(format!(
                "order {} written without its row lock",
                order.id
            )));
        }
        self.staged.push(Staged::UpdateOrder(order.clone()));
        Ok(())
    }

    async fn append_event(&mut self, event: &TraceEvent) -> Result<(), StoreError> {
        self.staged.push(Staged::AppendEvent(event.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let tx = *self;
        {
            let mut state = tx.shared.write()?;
            check(&tx.staged, &state)?;
            apply(tx.staged, &mut state);
        }

        // Row locks are released only once the writes are visible.
        drop(tx.batch_guards);
        drop(tx.order_guards);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(InMemoryTx {
            shared: self.shared.clone(),
            deadline: Instant::now() + self.shared.lock_timeout,
            batch_guards: HashMap::new(),
            order_guards: HashMap::new(),
            staged: Vec::new(),
        }))
    }

    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        Ok(self.shared.read()?.batches.get(&id).cloned())
    }

    async fn batch_by_code(&self, code: &str) -> Result<Option<Batch>, StoreError> {
        let state = self.shared.read()?;
        Ok(state
            .codes
            .get(code)
            .and_then(|id| state.batches.get(id))
            .cloned())
    }

    async fn children(&self, parent: BatchId) -> Result<Vec<Batch>, StoreError> {
        let state = self.shared.read()?;
        Ok(state
            .children
            .get(&parent)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.batches.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn events_for_batch(&self, batch: BatchId) -> Result<Vec<TraceEvent>, StoreError> {
        let mut events = self
            .shared
            .read()?
            .events
            .get(&batch)
            .cloned()
            .unwrap_or_default();
        events.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.shared.read()?.orders.get(&id).cloned())
    }

    async fn orders_by_buyer(&self, buyer: PartyId) -> Result<Vec<Order>, StoreError> {
        let state = self.shared.read()?;
        Ok(newest_first(state.orders.values().filter(|o| o.buyer == buyer)))
    }

    async fn orders_by_seller(&self, seller: PartyId) -> Result<Vec<Order>, StoreError> {
        let state = self.shared.read()?;
        Ok(newest_first(state.orders.values().filter(|o| o.seller == seller)))
    }

    async fn find_or_create_catalog(
        &self,
        kind: CatalogKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<CatalogEntry, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Corrupt("catalog name cannot be empty".to_string()));
        }

        let mut state = self.shared.write()?;
        let entry = state
            .catalog
            .entry((kind, name.to_string()))
            .or_insert_with(|| CatalogEntry {
                id: CatalogId::new(),
                kind,
                name: name.to_string(),
                description: description.map(str::to_owned),
            });
        Ok(entry.clone())
    }
}

fn newest_first<'a>(orders: impl Iterator<Item = &'a Order>) -> Vec<Order> {
    let mut orders: Vec<Order> = orders.cloned().collect();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    orders
}
