//! Ledger operations as atomic units of work.
//!
//! Every mutating operation follows the same pipeline:
//!
//! ```text
//! 1. begin unit of work
//! 2. lock every batch it will read-then-write (ascending id, bounded wait)
//! 3. validate + mutate through the pure rules in `agritrace_ledger`
//! 4. stage batch/order writes and event appends
//! 5. commit (or drop = rollback on any error)
//! 6. publish audit records to the bus (never fails the operation)
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use agritrace_core::{BatchId, Entity, LedgerError, LedgerResult, OrderId, PartyId, Quantity};
use agritrace_events::{Event, EventBus, EventEnvelope};
use agritrace_ledger::{
    Attachment, Batch, BatchStatus, CatalogKind, EventKind, HarvestBatch, LineItemRequest, Order,
    OrderLine, PartyRef, SensorReading, TraceEvent, Transition, code, requested_per_batch,
    reverse, validate_basket,
};

use crate::audit::{AuditOperation, AuditRecord};
use crate::store::{LedgerStore, LedgerTx};

/// Split `batch_id` into one child per quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub batch_id: BatchId,
    pub actor: PartyId,
    pub quantities: Vec<Decimal>,
    pub custodian: PartyRef,
    pub status: BatchStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitOutcome {
    pub parent: Batch,
    pub children: Vec<Batch>,
}

/// Result of a purchase. For an in-place transfer `acquired` is the source
/// batch itself under its new custodian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseOutcome {
    pub source: Batch,
    pub acquired: Batch,
    pub in_place: bool,
}

#[derive(Debug, Copy, Clone)]
enum Acquire {
    Whole,
    Part(Quantity),
    /// In place when the quantity equals what remains, otherwise a part.
    Matching(Quantity),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReversalOutcome {
    pub returned: Batch,
    pub parent: Batch,
    pub quantity: Quantity,
}

/// A caller-described event, optionally moving the batch's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEventRequest {
    pub batch_id: BatchId,
    pub actor: PartyId,
    pub kind: EventKind,
    pub location: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sensor_readings: Vec<SensorReading>,
    pub new_status: Option<BatchStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedOrder {
    pub order: Order,
    /// Buyer-owned batches, in line order.
    pub downstream: Vec<Batch>,
}

/// Runs ledger operations against a store and announces committed ones on
/// an audit bus.
#[derive(Debug)]
pub struct LedgerOrchestrator<S, B> {
    store: S,
    bus: B,
    sequence: AtomicU64,
    catalog: OnceCell<()>,
}

impl<S, B> LedgerOrchestrator<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            sequence: AtomicU64::new(0),
            catalog: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, B> LedgerOrchestrator<S, B>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<AuditRecord>>,
{
    /// Make sure every status and event type row exists before anything
    /// references it. Runs once per orchestrator.
    async fn ensure_catalog(&self) -> LedgerResult<()> {
        self.catalog
            .get_or_try_init(|| async {
                for status in BatchStatus::ALL {
                    self.store
                        .find_or_create_catalog(
                            CatalogKind::Status,
                            status.name(),
                            Some(status.description()),
                        )
                        .await?;
                }
                for kind in EventKind::ALL {
                    self.store
                        .find_or_create_catalog(
                            CatalogKind::EventType,
                            kind.name(),
                            Some(kind.description()),
                        )
                        .await?;
                }
                Ok::<(), LedgerError>(())
            })
            .await?;
        Ok(())
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        self.ensure_catalog().await?;
        Ok(self.store.begin().await?)
    }

    fn publish(&self, record: AuditRecord) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let operation = record.event_type();

        if let Err(err) = self.bus.publish(EventEnvelope::wrap(sequence, record)) {
            warn!(operation, sequence, error = ?err, "audit record not published");
        }
    }

    /// Create a root batch in `Harvested` and log its `Harvest` event.
    #[instrument(skip(self, cmd), fields(custodian = %cmd.custodian.id), err)]
    pub async fn create_root(
        &self,
        cmd: &HarvestBatch,
        location: Option<String>,
    ) -> LedgerResult<Batch> {
        let batch = Batch::harvest(BatchId::new(), code::root_code(cmd.occurred_at), cmd)?;
        let event = TraceEvent::record(&batch, EventKind::Harvest, cmd.custodian.id, cmd.occurred_at)
            .with_location(location)?;

        let mut tx = self.begin().await?;
        tx.insert_batch(&batch).await?;
        tx.append_event(&event).await?;
        tx.commit().await?;

        info!(batch_code = batch.code(), quantity = %batch.initial_quantity(), "batch harvested");
        self.publish(AuditRecord {
            operation: AuditOperation::Harvest,
            batch_code: batch.code().to_string(),
            actor: cmd.custodian.id,
            counterparty: cmd.custodian.id,
            metadata: json!({
                "product_id": batch.product_id(),
                "quantity": batch.initial_quantity(),
                "unit": batch.unit(),
                "origin_date": batch.origin_date(),
            }),
            occurred_at: cmd.occurred_at,
        });
        Ok(batch)
    }

    #[instrument(skip(self, request), fields(batch_id = %request.batch_id), err)]
    pub async fn split(&self, request: &SplitRequest) -> LedgerResult<SplitOutcome> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut parent = single(tx.lock_batches(&[request.batch_id]).await?, request.batch_id)?;

        let parent_code = parent.code().to_string();
        let children = parent.split(
            request.actor,
            &request.quantities,
            request.custodian,
            request.status,
            now,
            |n| code::split_code(&parent_code, n),
        )?;
        let event = TraceEvent::record(&parent, EventKind::Split, request.actor, now);

        tx.update_batch(&parent).await?;
        for child in &children {
            tx.insert_batch(child).await?;
        }
        tx.append_event(&event).await?;
        tx.commit().await?;

        info!(
            batch_code = parent.code(),
            children = children.len(),
            remaining = %parent.remaining_quantity(),
            "batch split"
        );
        self.publish(AuditRecord {
            operation: AuditOperation::Split,
            batch_code: parent.code().to_string(),
            actor: request.actor,
            counterparty: request.custodian.id,
            metadata: json!({
                "children": children
                    .iter()
                    .map(|c| json!({ "code": c.code(), "quantity": c.initial_quantity() }))
                    .collect::<Vec<_>>(),
                "parent_remaining": parent.remaining_quantity(),
            }),
            occurred_at: now,
        });
        Ok(SplitOutcome { parent, children })
    }

    /// Hand the whole batch to `buyer` in place.
    pub async fn transfer_whole(
        &self,
        batch_id: BatchId,
        buyer: PartyRef,
        status: BatchStatus,
    ) -> LedgerResult<Batch> {
        let outcome = self.acquire(batch_id, Acquire::Whole, buyer, status).await?;
        Ok(outcome.acquired)
    }

    /// Draw `quantity` from `batch_id` into a new batch owned by `buyer`.
    pub async fn transfer_partial(
        &self,
        batch_id: BatchId,
        quantity: Decimal,
        buyer: PartyRef,
        status: BatchStatus,
    ) -> LedgerResult<PurchaseOutcome> {
        let quantity = Quantity::positive(quantity)?;
        self.acquire(batch_id, Acquire::Part(quantity), buyer, status).await
    }

    /// Buy from a batch: the whole remaining quantity moves in place, anything
    /// less is drawn into a new batch.
    pub async fn purchase(
        &self,
        batch_id: BatchId,
        quantity: Decimal,
        buyer: PartyRef,
        status: BatchStatus,
    ) -> LedgerResult<PurchaseOutcome> {
        let quantity = Quantity::positive(quantity)?;
        self.acquire(batch_id, Acquire::Matching(quantity), buyer, status).await
    }

    #[instrument(skip(self), fields(buyer = %buyer.id), err)]
    async fn acquire(
        &self,
        batch_id: BatchId,
        how: Acquire,
        buyer: PartyRef,
        status: BatchStatus,
    ) -> LedgerResult<PurchaseOutcome> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut source = single(tx.lock_batches(&[batch_id]).await?, batch_id)?;
        let seller = source.custodian();

        let part = match how {
            Acquire::Whole => None,
            Acquire::Part(quantity) => Some(quantity),
            Acquire::Matching(quantity) if quantity == source.remaining_quantity() => None,
            Acquire::Matching(quantity) => Some(quantity),
        };

        let acquired = match part {
            None => {
                source.transfer_whole(buyer, status)?;
                None
            }
            Some(quantity) => {
                let child_code = code::purchase_code(source.code());
                let child =
                    source.transfer_partial(quantity.value(), buyer, status, child_code, now)?;
                Some(child)
            }
        };
        let event = TraceEvent::record(&source, EventKind::Purchased, buyer.id, now);

        tx.update_batch(&source).await?;
        if let Some(child) = &acquired {
            tx.insert_batch(child).await?;
        }
        tx.append_event(&event).await?;
        tx.commit().await?;

        let in_place = acquired.is_none();
        let acquired = acquired.unwrap_or_else(|| source.clone());
        info!(
            batch_code = source.code(),
            acquired_code = acquired.code(),
            in_place,
            "batch purchased"
        );
        self.publish(AuditRecord {
            operation: AuditOperation::DistributorPurchase,
            batch_code: source.code().to_string(),
            actor: buyer.id,
            counterparty: seller.id,
            metadata: json!({
                "acquired_batch_code": acquired.code(),
                "quantity": acquired.remaining_quantity(),
                "in_place": in_place,
                "status": acquired.status(),
            }),
            occurred_at: now,
        });
        Ok(PurchaseOutcome {
            source,
            acquired,
            in_place,
        })
    }

    /// Return the whole remaining quantity of `batch_id` to its parent.
    #[instrument(skip(self), fields(actor = %actor), err)]
    pub async fn reverse(
        &self,
        batch_id: BatchId,
        actor: PartyId,
        restore_status: BatchStatus,
    ) -> LedgerResult<ReversalOutcome> {
        // parent_id never changes once set, so reading it unlocked is safe.
        let parent_id = self
            .store
            .batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("batch {batch_id}")))?
            .parent_id();

        let now = Utc::now();
        let mut tx = self.begin().await?;
        let ids: Vec<BatchId> = std::iter::once(batch_id).chain(parent_id).collect();
        let mut locked = tx.lock_batches(&ids).await?;

        let child_at = position(&locked, batch_id)?;
        let mut child = locked.swap_remove(child_at);
        let Some(parent_id) = parent_id else {
            child.ensure_custodian(actor)?;
            return Err(LedgerError::not_reversible(batch_id, "batch has no parent"));
        };
        let parent_at = position(&locked, parent_id)?;
        let mut parent = locked.swap_remove(parent_at);

        let quantity = reverse(&mut child, &mut parent, actor, restore_status)?;
        let event = TraceEvent::record(&child, EventKind::Returned, actor, now);

        tx.update_batch(&parent).await?;
        tx.update_batch(&child).await?;
        tx.append_event(&event).await?;
        tx.commit().await?;

        info!(
            batch_code = child.code(),
            parent_code = parent.code(),
            quantity = %quantity,
            "batch returned to parent"
        );
        self.publish(AuditRecord {
            operation: AuditOperation::Return,
            batch_code: child.code().to_string(),
            actor,
            counterparty: parent.custodian().id,
            metadata: json!({
                "parent_batch_code": parent.code(),
                "returned_quantity": quantity,
                "parent_status": parent.status(),
            }),
            occurred_at: now,
        });
        Ok(ReversalOutcome {
            returned: child,
            parent,
            quantity,
        })
    }

    /// Logged consumption of part or all of a batch by its custodian.
    #[instrument(skip(self), fields(actor = %actor), err)]
    pub async fn consume(
        &self,
        batch_id: BatchId,
        actor: PartyId,
        quantity: Decimal,
    ) -> LedgerResult<Batch> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut batch = single(tx.lock_batches(&[batch_id]).await?, batch_id)?;

        let consumed = batch.consume(actor, quantity)?;
        let event = TraceEvent::record(&batch, EventKind::Consumed, actor, now);

        tx.update_batch(&batch).await?;
        tx.append_event(&event).await?;
        tx.commit().await?;

        info!(batch_code = batch.code(), quantity = %consumed, "quantity consumed");
        self.publish(AuditRecord {
            operation: AuditOperation::Consumed,
            batch_code: batch.code().to_string(),
            actor,
            counterparty: actor,
            metadata: json!({
                "quantity": consumed,
                "remaining": batch.remaining_quantity(),
            }),
            occurred_at: now,
        });
        Ok(batch)
    }

    /// Append a caller-described event (field activity, inspection,
    /// shipment progress), optionally moving the batch's status.
    #[instrument(skip(self, request), fields(batch_id = %request.batch_id, kind = %request.kind), err)]
    pub async fn record_event(&self, request: RecordEventRequest) -> LedgerResult<TraceEvent> {
        if request.kind.is_operation_owned() {
            return Err(LedgerError::validation(format!(
                "{} events are written by their own operation",
                request.kind
            )));
        }

        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut batch = single(tx.lock_batches(&[request.batch_id]).await?, request.batch_id)?;

        if let Some(status) = request.new_status {
            batch.transition(status, Transition::Advance)?;
        }
        let event = TraceEvent::record(&batch, request.kind, request.actor, now)
            .with_location(request.location)?
            .with_attachments(request.attachments)?
            .with_sensor_readings(request.sensor_readings)?;

        if request.new_status.is_some() {
            tx.update_batch(&batch).await?;
        }
        tx.append_event(&event).await?;
        tx.commit().await?;

        info!(batch_code = batch.code(), kind = %event.kind, "event recorded");
        self.publish(AuditRecord {
            operation: AuditOperation::EventRecorded,
            batch_code: batch.code().to_string(),
            actor: request.actor,
            counterparty: batch.custodian().id,
            metadata: json!({
                "event_type": event.kind,
                "status": batch.status(),
                "location": event.location,
                "attachments": event.attachments.len(),
                "sensor_readings": event.sensor_readings.len(),
            }),
            occurred_at: now,
        });
        Ok(event)
    }

    /// Atomically buy every line of a basket from a single seller.
    #[instrument(skip(self, items), fields(buyer = %buyer.id, lines = items.len()), err)]
    pub async fn place_order(
        &self,
        buyer: PartyRef,
        items: &[LineItemRequest],
    ) -> LedgerResult<PlacedOrder> {
        let lines = validate_basket(items)?;
        let requested = requested_per_batch(&lines)?;
        let ids: Vec<BatchId> = requested.keys().copied().collect();

        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut sources: BTreeMap<BatchId, Batch> = tx
            .lock_batches(&ids)
            .await?
            .into_iter()
            .map(|b| (*b.id(), b))
            .collect();

        let seller = single_seller(&sources)?;
        if seller == buyer.id {
            return Err(LedgerError::validation("buyer already holds these batches"));
        }
        for (id, quantity) in &requested {
            source_mut(&mut sources, *id)?.ensure_available(*quantity)?;
        }

        let order_number = code::order_number(now);
        let mut order_lines = Vec::with_capacity(lines.len());
        let mut downstream = Vec::with_capacity(lines.len());
        let mut events = Vec::with_capacity(lines.len());

        for (line, child_code) in lines.iter().zip(code::root_codes(now, lines.len())) {
            let source = source_mut(&mut sources, line.batch_id)?;
            let child = source.derive_child(
                BatchId::new(),
                child_code,
                line.quantity,
                buyer,
                BatchStatus::PendingDelivery,
                now,
            )?;
            source.draw(line.quantity)?;
            if source.remaining_quantity().is_zero() {
                source.transition(BatchStatus::Sold, Transition::Advance)?;
            }

            events.push(TraceEvent::record(source, EventKind::Sold, buyer.id, now));
            order_lines.push(OrderLine {
                source_batch_id: line.batch_id,
                downstream_batch_id: *child.id(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                line_total: line.line_total,
            });
            downstream.push(child);
        }

        let order = Order::place(OrderId::new(), order_number, buyer.id, seller, order_lines, now)?;

        for source in sources.values() {
            tx.update_batch(source).await?;
        }
        for child in &downstream {
            tx.insert_batch(child).await?;
        }
        tx.insert_order(&order).await?;
        for event in &events {
            tx.append_event(event).await?;
        }
        tx.commit().await?;

        info!(
            order_number = %order.order_number,
            lines = order.lines.len(),
            total = %order.total_amount,
            "order placed"
        );
        for (line, child) in order.lines.iter().zip(&downstream) {
            let source_code = sources
                .get(&line.source_batch_id)
                .map(|b| b.code().to_string())
                .unwrap_or_default();
            self.publish(AuditRecord {
                operation: AuditOperation::OrderCreated,
                batch_code: source_code,
                actor: buyer.id,
                counterparty: seller,
                metadata: json!({
                    "order_number": order.order_number,
                    "downstream_batch_code": child.code(),
                    "quantity": line.quantity,
                    "unit_price": line.unit_price,
                    "line_total": line.line_total,
                }),
                occurred_at: now,
            });
        }
        Ok(PlacedOrder { order, downstream })
    }

    /// Hand an open order to a transporter: every downstream batch moves from
    /// `Pending Delivery` to `In Transit`.
    #[instrument(skip(self), fields(transporter = %transporter.id), err)]
    pub async fn assign_shipment(
        &self,
        order_id: OrderId,
        transporter: PartyRef,
    ) -> LedgerResult<Order> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut order = tx.lock_order(order_id).await?;
        order.assign_transporter(transporter.id)?;

        let mut batches = tx.lock_batches(&order.downstream_batch_ids()).await?;
        let mut events = Vec::with_capacity(batches.len());
        for batch in &mut batches {
            match batch.status() {
                BatchStatus::PendingDelivery => {
                    batch.transition(BatchStatus::InTransit, Transition::Advance)?;
                }
                BatchStatus::InTransit => {}
                other => {
                    return Err(LedgerError::validation(format!(
                        "batch {} is {other}, not awaiting pickup",
                        batch.code()
                    )));
                }
            }
            events.push(TraceEvent::record(batch, EventKind::ShipmentAssigned, transporter.id, now));
        }

        tx.update_order(&order).await?;
        for batch in &batches {
            tx.update_batch(batch).await?;
        }
        for event in &events {
            tx.append_event(event).await?;
        }
        tx.commit().await?;

        info!(order_number = %order.order_number, "shipment assigned");
        for batch in &batches {
            self.publish(AuditRecord {
                operation: AuditOperation::ShipmentAssigned,
                batch_code: batch.code().to_string(),
                actor: transporter.id,
                counterparty: order.buyer,
                metadata: json!({ "order_number": order.order_number }),
                occurred_at: now,
            });
        }
        Ok(order)
    }

    /// Complete an open order: every downstream batch moves to `In Shop`.
    #[instrument(skip(self), fields(actor = %actor), err)]
    pub async fn confirm_delivery(&self, order_id: OrderId, actor: PartyId) -> LedgerResult<Order> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let mut order = tx.lock_order(order_id).await?;
        order.complete(now)?;

        let mut batches = tx.lock_batches(&order.downstream_batch_ids()).await?;
        let mut events = Vec::with_capacity(batches.len());
        for batch in &mut batches {
            batch.transition(BatchStatus::InShop, Transition::Advance)?;
            events.push(TraceEvent::record(batch, EventKind::Delivered, actor, now));
        }

        tx.update_order(&order).await?;
        for batch in &batches {
            tx.update_batch(batch).await?;
        }
        for event in &events {
            tx.append_event(event).await?;
        }
        tx.commit().await?;

        info!(order_number = %order.order_number, "order delivered");
        for batch in &batches {
            self.publish(AuditRecord {
                operation: AuditOperation::Delivered,
                batch_code: batch.code().to_string(),
                actor,
                counterparty: order.buyer,
                metadata: json!({ "order_number": order.order_number }),
                occurred_at: now,
            });
        }
        Ok(order)
    }

    pub async fn order(&self, order_id: OrderId) -> LedgerResult<Order> {
        self.store
            .order(order_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("order {order_id}")))
    }

    pub async fn orders_for_buyer(&self, buyer: PartyId) -> LedgerResult<Vec<Order>> {
        Ok(self.store.orders_by_buyer(buyer).await?)
    }

    pub async fn orders_for_seller(&self, seller: PartyId) -> LedgerResult<Vec<Order>> {
        Ok(self.store.orders_by_seller(seller).await?)
    }
}

fn single(mut locked: Vec<Batch>, id: BatchId) -> LedgerResult<Batch> {
    match locked.pop() {
        Some(batch) if locked.is_empty() && *batch.id() == id => Ok(batch),
        _ => Err(LedgerError::internal(format!(
            "locking batch {id} returned an unexpected row set"
        ))),
    }
}

fn position(locked: &[Batch], id: BatchId) -> LedgerResult<usize> {
    locked
        .iter()
        .position(|b| *b.id() == id)
        .ok_or_else(|| LedgerError::internal(format!("batch {id} missing from locked set")))
}

fn source_mut(sources: &mut BTreeMap<BatchId, Batch>, id: BatchId) -> LedgerResult<&mut Batch> {
    sources
        .get_mut(&id)
        .ok_or_else(|| LedgerError::internal(format!("batch {id} missing from locked set")))
}

fn single_seller(sources: &BTreeMap<BatchId, Batch>) -> LedgerResult<PartyId> {
    let mut custodians = sources.values().map(|b| b.custodian().id);
    let seller = custodians
        .next()
        .ok_or_else(|| LedgerError::validation("order must contain at least one item"))?;
    if custodians.any(|c| c != seller) {
        return Err(LedgerError::validation(
            "all batches in an order must belong to the same seller",
        ));
    }
    Ok(seller)
}
