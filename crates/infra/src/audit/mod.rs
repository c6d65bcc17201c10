//! Best-effort forwarding of committed ledger operations to an external
//! append-only audit log.
//!
//! ```text
//! Orchestrator (commit) → EventBus<EventEnvelope<AuditRecord>> → AuditWorker → AuditSink
//! ```
//!
//! Nothing on this path can fail or slow down a ledger operation: records are
//! published after commit, the worker runs on its own thread, and sink
//! failures end as `warn!` lines.

mod http;
mod worker;

pub use http::{DEFAULT_ADDRESS_SALT, HttpAuditSink, party_address};
pub use worker::{AuditWorker, WorkerHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use agritrace_core::PartyId;
use agritrace_events::Event;

/// Kind of committed operation being audited.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Harvest,
    Split,
    DistributorPurchase,
    OrderCreated,
    Return,
    ShipmentAssigned,
    Delivered,
    Consumed,
    EventRecorded,
}

impl AuditOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOperation::Harvest => "HARVEST",
            AuditOperation::Split => "SPLIT",
            AuditOperation::DistributorPurchase => "DISTRIBUTOR_PURCHASE",
            AuditOperation::OrderCreated => "ORDER_CREATED",
            AuditOperation::Return => "RETURN",
            AuditOperation::ShipmentAssigned => "SHIPMENT_ASSIGNED",
            AuditOperation::Delivered => "DELIVERED",
            AuditOperation::Consumed => "CONSUMED",
            AuditOperation::EventRecorded => "EVENT_RECORDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation: AuditOperation,
    pub batch_code: String,
    pub actor: PartyId,
    pub counterparty: PartyId,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event for AuditRecord {
    fn event_type(&self) -> &'static str {
        self.operation.as_str()
    }

    fn subject(&self) -> String {
        self.batch_code.clone()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// What the audit log handed back for an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuditReceipt {
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unreachable: {0}")]
    Transport(String),

    #[error("audit sink rejected the record with status {status}")]
    Rejected { status: u16 },

    #[error("audit record could not be encoded: {0}")]
    Encode(String),
}

/// Destination for audit records. Runs on the audit worker thread, so
/// implementations may block.
pub trait AuditSink: Send {
    fn submit(&mut self, record: &AuditRecord) -> Result<AuditReceipt, AuditError>;
}

impl<S> AuditSink for Box<S>
where
    S: AuditSink + ?Sized,
{
    fn submit(&mut self, record: &AuditRecord) -> Result<AuditReceipt, AuditError> {
        (**self).submit(record)
    }
}

/// Sink used when no audit log is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardAuditSink;

impl AuditSink for DiscardAuditSink {
    fn submit(&mut self, record: &AuditRecord) -> Result<AuditReceipt, AuditError> {
        debug!(
            operation = record.operation.as_str(),
            batch_code = %record.batch_code,
            "audit log not configured; record dropped"
        );
        Ok(AuditReceipt::default())
    }
}
