//! In-memory event bus.

use std::sync::{Mutex, mpsc};

use tracing::debug;

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Unbounded channels: `publish` never blocks on a slow subscriber
/// - Subscribers that hung up are dropped on the next publish
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let before = subs.len();
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        if subs.len() != before {
            debug!(dropped = before - subs.len(), "dropped disconnected subscribers");
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still hands out a subscription; it just never
        // receives anything.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bus::Delivery;

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.drain(), vec![7]);
        assert_eq!(b.drain(), vec![7]);
    }

    #[test]
    fn late_subscribers_miss_earlier_messages() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        bus.publish(1).unwrap();
        let late = bus.subscribe();
        bus.publish(2).unwrap();

        assert_eq!(late.wait(Duration::from_millis(10)), Delivery::Message(2));
        assert_eq!(late.wait(Duration::from_millis(10)), Delivery::Idle);
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        let bus: InMemoryEventBus<&'static str> = InMemoryEventBus::new();
        assert!(bus.publish("nobody listening").is_ok());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(1).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.next_pending(), Some(1));
    }
}
