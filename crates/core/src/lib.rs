//! `agritrace-core`: ledger foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the ledger and its
//! infrastructure: identifiers, the quantity value object and the error taxonomy.

pub mod entity;
pub mod error;
pub mod id;
pub mod quantity;

pub use entity::Entity;
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use id::{BatchId, CatalogId, EventId, OrderId, PartyId, ProductId};
pub use quantity::Quantity;
