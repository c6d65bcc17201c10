use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

/// Envelope for a published event.
///
/// Notes:
/// - `subject` is the human-readable key the event is about (a batch code),
///   never an internal row id.
/// - `sequence_number` is monotonically increasing per publisher, so consumers
///   can detect gaps and duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    subject: String,

    /// Monotonically increasing position in the publisher's stream.
    sequence_number: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        subject: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            subject: subject.into(),
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Envelope with a fresh id and the event's own subject.
    pub fn wrap(sequence_number: u64, event: E) -> Self {
        Self::new(Uuid::now_v7(), event.subject(), sequence_number, event)
    }
}
