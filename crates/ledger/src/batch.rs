//! Batch state machine and quantity-conservation rules.
//!
//! Every method here either fully applies its change or returns an error with
//! the batch untouched. Locking and persistence are the caller's concern.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use agritrace_core::{BatchId, Entity, LedgerError, LedgerResult, PartyId, ProductId, Quantity};

use crate::catalog::BatchStatus;
use crate::party::PartyRef;

pub const DEFAULT_UNIT: &str = "kg";

/// How a status change is being made.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Ordinary forward movement (transfer, shipment, delivery, consumption).
    Advance,
    /// Stock restored by a reversal; the only way back to `Harvested` or out of `Sold`.
    Restore,
}

/// Checks a status change against the lifecycle rules.
pub fn ensure_transition(
    from: BatchStatus,
    to: BatchStatus,
    transition: Transition,
) -> LedgerResult<()> {
    if from.is_terminal() {
        return Err(LedgerError::validation(format!(
            "status {from} is terminal"
        )));
    }

    match transition {
        Transition::Restore => {
            if !to.is_available() {
                return Err(LedgerError::validation(format!(
                    "restored stock must be Harvested, In Warehouse or In Shop (got {to})"
                )));
            }
            Ok(())
        }
        Transition::Advance => {
            if from == to {
                return Ok(());
            }
            if from == BatchStatus::Sold {
                return Err(LedgerError::validation(
                    "a sold batch only changes status when stock is returned to it",
                ));
            }
            match to {
                BatchStatus::Harvested => Err(LedgerError::validation(
                    "Harvested is only set at creation or by a reversal",
                )),
                BatchStatus::Returned => Err(LedgerError::validation(
                    "Returned is only set by a reversal",
                )),
                _ => Ok(()),
            }
        }
    }
}

/// Command: create a root batch at harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestBatch {
    pub product_id: ProductId,
    pub custodian: PartyRef,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub origin_date: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Plain row form of a batch, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub code: String,
    pub product_id: ProductId,
    pub parent_id: Option<BatchId>,
    pub custodian: PartyRef,
    pub status: BatchStatus,
    pub initial_quantity: Quantity,
    pub remaining_quantity: Quantity,
    pub unit: String,
    pub origin_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// A quantity of one product held by exactly one custodian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    id: BatchId,
    code: String,
    product_id: ProductId,
    parent_id: Option<BatchId>,
    custodian: PartyRef,
    status: BatchStatus,
    initial_quantity: Quantity,
    remaining_quantity: Quantity,
    unit: String,
    origin_date: NaiveDate,
    created_at: DateTime<Utc>,
}

impl Entity for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Batch {
    /// New root batch in `Harvested` with `initial == remaining == quantity`.
    pub fn harvest(id: BatchId, code: String, cmd: &HarvestBatch) -> LedgerResult<Batch> {
        let quantity = Quantity::positive(cmd.quantity)?;
        let unit = match cmd.unit.as_deref().map(str::trim) {
            Some("") | None => DEFAULT_UNIT.to_string(),
            Some(unit) => unit.to_string(),
        };

        Ok(Batch {
            id,
            code,
            product_id: cmd.product_id,
            parent_id: None,
            custodian: cmd.custodian,
            status: BatchStatus::Harvested,
            initial_quantity: quantity,
            remaining_quantity: quantity,
            unit,
            origin_date: cmd.origin_date,
            created_at: cmd.occurred_at,
        })
    }

    /// Rebuild a batch from its stored row, rejecting rows that break the
    /// quantity bounds.
    pub fn from_snapshot(row: BatchSnapshot) -> LedgerResult<Batch> {
        if row.remaining_quantity > row.initial_quantity {
            return Err(LedgerError::internal(format!(
                "batch {} has remaining {} above initial {}",
                row.id, row.remaining_quantity, row.initial_quantity
            )));
        }
        if row.parent_id == Some(row.id) {
            return Err(LedgerError::internal(format!(
                "batch {} is its own parent",
                row.id
            )));
        }

        Ok(Batch {
            id: row.id,
            code: row.code,
            product_id: row.product_id,
            parent_id: row.parent_id,
            custodian: row.custodian,
            status: row.status,
            initial_quantity: row.initial_quantity,
            remaining_quantity: row.remaining_quantity,
            unit: row.unit,
            origin_date: row.origin_date,
            created_at: row.created_at,
        })
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            id: self.id,
            code: self.code.clone(),
            product_id: self.product_id,
            parent_id: self.parent_id,
            custodian: self.custodian,
            status: self.status,
            initial_quantity: self.initial_quantity,
            remaining_quantity: self.remaining_quantity,
            unit: self.unit.clone(),
            origin_date: self.origin_date,
            created_at: self.created_at,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn parent_id(&self) -> Option<BatchId> {
        self.parent_id
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn custodian(&self) -> PartyRef {
        self.custodian
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn initial_quantity(&self) -> Quantity {
        self.initial_quantity
    }

    pub fn remaining_quantity(&self) -> Quantity {
        self.remaining_quantity
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn origin_date(&self) -> NaiveDate {
        self.origin_date
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ensure_custodian(&self, actor: PartyId) -> LedgerResult<()> {
        if self.custodian.id != actor {
            return Err(LedgerError::Ownership {
                batch_id: self.id,
                actor,
            });
        }
        Ok(())
    }

    /// Fails with `InsufficientQuantity` when `requested` exceeds what is left.
    pub fn ensure_available(&self, requested: Quantity) -> LedgerResult<()> {
        if requested > self.remaining_quantity {
            return Err(self.insufficient(requested));
        }
        Ok(())
    }

    fn insufficient(&self, requested: Quantity) -> LedgerError {
        LedgerError::InsufficientQuantity {
            batch_id: self.id,
            available: self.remaining_quantity.value(),
            requested: requested.value(),
        }
    }

    /// Remove `amount` from the remaining pool.
    pub fn draw(&mut self, amount: Quantity) -> LedgerResult<()> {
        let rest = self
            .remaining_quantity
            .checked_sub(amount)
            .ok_or_else(|| self.insufficient(amount))?;
        self.remaining_quantity = rest;
        Ok(())
    }

    pub fn transition(&mut self, to: BatchStatus, how: Transition) -> LedgerResult<()> {
        ensure_transition(self.status, to, how)?;
        self.status = to;
        Ok(())
    }

    /// A new batch carved out of this one. Does not touch this batch's pool;
    /// callers pair it with [`Batch::draw`].
    pub fn derive_child(
        &self,
        id: BatchId,
        code: String,
        quantity: Quantity,
        custodian: PartyRef,
        status: BatchStatus,
        created_at: DateTime<Utc>,
    ) -> LedgerResult<Batch> {
        if quantity.is_zero() {
            return Err(LedgerError::validation("child quantity must be greater than zero"));
        }
        if !status.is_valid_for_new_batch() {
            return Err(LedgerError::validation(format!(
                "a new batch cannot start as {status}"
            )));
        }

        Ok(Batch {
            id,
            code,
            product_id: self.product_id,
            parent_id: Some(self.id),
            custodian,
            status,
            initial_quantity: quantity,
            remaining_quantity: quantity,
            unit: self.unit.clone(),
            origin_date: self.origin_date,
            created_at,
        })
    }

    /// Divide part of the remaining pool into one child per requested quantity.
    ///
    /// `child_code` receives the 1-based position of each child.
    pub fn split(
        &mut self,
        actor: PartyId,
        quantities: &[Decimal],
        custodian: PartyRef,
        status: BatchStatus,
        occurred_at: DateTime<Utc>,
        mut child_code: impl FnMut(usize) -> String,
    ) -> LedgerResult<Vec<Batch>> {
        self.ensure_custodian(actor)?;
        if quantities.is_empty() {
            return Err(LedgerError::validation("split needs at least one quantity"));
        }

        let quantities = quantities
            .iter()
            .map(|q| Quantity::positive(*q))
            .collect::<LedgerResult<Vec<_>>>()?;
        let total = Quantity::try_sum(quantities.iter().copied())?;
        self.ensure_available(total)?;

        let children = quantities
            .iter()
            .enumerate()
            .map(|(i, q)| {
                self.derive_child(
                    BatchId::new(),
                    child_code(i + 1),
                    *q,
                    custodian,
                    status,
                    occurred_at,
                )
            })
            .collect::<LedgerResult<Vec<_>>>()?;

        self.draw(total)?;
        Ok(children)
    }

    /// Hand the whole batch to a new custodian in place.
    pub fn transfer_whole(&mut self, custodian: PartyRef, status: BatchStatus) -> LedgerResult<()> {
        if self.remaining_quantity.is_zero() {
            return Err(LedgerError::validation(format!(
                "batch {} has nothing left to transfer",
                self.id
            )));
        }
        self.transition(status, Transition::Advance)?;
        self.custodian = custodian;
        Ok(())
    }

    /// Draw `quantity` into a new batch owned by `buyer`. Custody is not
    /// required: the buyer draws from the seller's pool.
    pub fn transfer_partial(
        &mut self,
        quantity: Decimal,
        buyer: PartyRef,
        status: BatchStatus,
        code: String,
        occurred_at: DateTime<Utc>,
    ) -> LedgerResult<Batch> {
        let quantity = Quantity::positive(quantity)?;
        self.ensure_available(quantity)?;
        let child = self.derive_child(BatchId::new(), code, quantity, buyer, status, occurred_at)?;
        self.draw(quantity)?;
        Ok(child)
    }

    /// Logged consumption by the custodian; status becomes `Consumed` once drained.
    pub fn consume(&mut self, actor: PartyId, quantity: Decimal) -> LedgerResult<Quantity> {
        self.ensure_custodian(actor)?;
        if self.status.is_terminal() {
            return Err(LedgerError::validation(format!(
                "batch {} is {}",
                self.id, self.status
            )));
        }
        let quantity = Quantity::positive(quantity)?;
        let rest = self
            .remaining_quantity
            .checked_sub(quantity)
            .ok_or_else(|| self.insufficient(quantity))?;
        if rest.is_zero() {
            self.status = BatchStatus::Consumed;
        }
        self.remaining_quantity = rest;
        Ok(quantity)
    }
}

/// Return the whole remaining quantity of `child` to `parent`.
///
/// The parent's status is reset to `restore_status` (an available status) and
/// the child ends at zero in `Returned`. Returns the quantity moved.
pub fn reverse(
    child: &mut Batch,
    parent: &mut Batch,
    actor: PartyId,
    restore_status: BatchStatus,
) -> LedgerResult<Quantity> {
    child.ensure_custodian(actor)?;

    let parent_id = child
        .parent_id
        .ok_or_else(|| LedgerError::not_reversible(child.id, "batch has no parent"))?;
    if parent_id != parent.id {
        return Err(LedgerError::internal(format!(
            "batch {} was paired with {} but its parent is {}",
            child.id, parent.id, parent_id
        )));
    }
    if child.remaining_quantity.is_zero() || child.status == BatchStatus::Returned {
        return Err(LedgerError::AlreadyReturned(child.id));
    }
    if parent.status.is_terminal() {
        return Err(LedgerError::not_reversible(
            child.id,
            format!("parent batch is {}", parent.status),
        ));
    }
    ensure_transition(parent.status, restore_status, Transition::Restore)?;

    let returned = child.remaining_quantity;
    let restored = parent.remaining_quantity.checked_add(returned)?;
    if restored > parent.initial_quantity {
        return Err(LedgerError::internal(format!(
            "returning {returned} to batch {} would exceed its initial {}",
            parent.id, parent.initial_quantity
        )));
    }

    parent.remaining_quantity = restored;
    parent.status = restore_status;
    child.remaining_quantity = Quantity::ZERO;
    child.status = BatchStatus::Returned;
    Ok(returned)
}
