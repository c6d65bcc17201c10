//! Post-commit pub/sub.
//!
//! Ledger operations publish after their unit of work commits; consumers
//! such as the audit forwarder subscribe. Delivery is in-process and
//! unacknowledged: the ledger store stays the record of truth, so a lost
//! notification loses no ledger state.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Outcome of waiting on a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<M> {
    Message(M),
    /// Nothing arrived before the timeout.
    Idle,
    /// The bus dropped this subscriber; nothing more will arrive.
    Closed,
}

/// Broadcast receiver: every message published after `subscribe` returned is
/// delivered once, in publish order. Meant for a single consuming thread.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.wait(Duration::from_millis(250)) {
///         Delivery::Message(envelope) => forward(envelope),
///         Delivery::Idle => continue,
///         Delivery::Closed => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block for up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Delivery<M> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Delivery::Message(message),
            Err(RecvTimeoutError::Timeout) => Delivery::Idle,
            Err(RecvTimeoutError::Disconnected) => Delivery::Closed,
        }
    }

    /// The next already-delivered message, without blocking.
    pub fn next_pending(&self) -> Option<M> {
        match self.receiver.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything delivered so far, oldest first.
    pub fn drain(&self) -> Vec<M> {
        std::iter::from_fn(|| self.next_pending()).collect()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Operation → Store (commit) → EventBus (publish) → Consumers
///                                                     └─ audit forwarder
/// ```
///
/// Events are committed first, then published. A publish failure is the
/// caller's to log; it never unwinds the commit.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
