use chrono::{DateTime, Utc};

/// A record of something the ledger has already committed.
///
/// Published only after the change it describes is durable, so subscribers
/// may treat every event as fact.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Wire name of the event (e.g. `"HARVEST"`).
    fn event_type(&self) -> &'static str;

    /// Human-readable key the event is about, such as a batch code.
    fn subject(&self) -> String;

    fn occurred_at(&self) -> DateTime<Utc>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventEnvelope;

    #[derive(Debug, Clone)]
    struct Shipped {
        code: &'static str,
        at: DateTime<Utc>,
    }

    impl Event for Shipped {
        fn event_type(&self) -> &'static str {
            "SHIPPED"
        }

        fn subject(&self) -> String {
            self.code.to_string()
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn wrapping_takes_the_subject_from_the_event() {
        let event = Shipped {
            code: "BATCH-20260101-000000-ABCD",
            at: Utc::now(),
        };
        let first = EventEnvelope::wrap(1, event.clone());
        let second = EventEnvelope::wrap(2, event);

        assert_eq!(first.subject(), "BATCH-20260101-000000-ABCD");
        assert_eq!(first.payload().event_type(), "SHIPPED");
        assert_ne!(first.event_id(), second.event_id());
    }
}
