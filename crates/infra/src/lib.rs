//! Infrastructure layer: batch stores, the ledger orchestrator, provenance
//! queries, audit forwarding and configuration.

pub mod audit;
pub mod config;
pub mod orchestrator;
pub mod provenance;
pub mod store;

mod integration_tests;

pub use config::LedgerConfig;
pub use orchestrator::{
    LedgerOrchestrator, PlacedOrder, PurchaseOutcome, RecordEventRequest, ReversalOutcome,
    SplitOutcome, SplitRequest,
};
pub use provenance::{
    EventHistory, Genealogy, GenealogyNode, Omission, ProvenanceResolver, TraceReport,
};
pub use store::{InMemoryLedgerStore, LedgerStore, LedgerTx, PostgresLedgerStore, StoreError};
