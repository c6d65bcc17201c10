//! Post-commit notification plumbing.
//!
//! Ledger operations publish a record of what they committed; workers subscribe
//! and forward it (for example to the external audit sink).

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{Delivery, EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
