//! Batch lifecycle domain module.
//!
//! This crate contains the business rules of the provenance ledger, implemented
//! purely as deterministic domain logic (no IO, no locking, no storage). The
//! infrastructure crate loads and locks rows, calls into these rules and
//! persists what they decide.

pub mod batch;
pub mod catalog;
pub mod code;
pub mod event_log;
pub mod order;
pub mod party;
pub mod stage;

pub use batch::{Batch, BatchSnapshot, HarvestBatch, Transition, reverse};
pub use catalog::{BatchStatus, CatalogEntry, CatalogKind, EventKind};
pub use event_log::{Attachment, SensorReading, TraceEvent};
pub use order::{LineItemRequest, Order, OrderLine, ValidatedLine, requested_per_batch, validate_basket};
pub use party::{PartyRef, PartyRole};
pub use stage::{JourneyMilestone, LifecycleStages, Stage, classify, classify_events, journey_summary};
