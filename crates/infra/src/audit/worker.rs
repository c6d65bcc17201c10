use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use agritrace_events::{Delivery, Event, EventBus, EventEnvelope, Subscription};

use super::{AuditRecord, AuditSink};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Forwards published audit records to an [`AuditSink`].
///
/// - Subscribes before returning, so nothing published afterwards is missed
/// - The sink is built on the worker thread (blocking HTTP clients must not
///   live on the async runtime)
/// - A failed submission is logged and skipped; there is no retry queue
#[derive(Debug)]
pub struct AuditWorker;

impl AuditWorker {
    pub fn spawn<B, F, S>(name: &'static str, bus: B, make_sink: F) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<AuditRecord>>,
        F: FnOnce() -> S + Send + 'static,
        S: AuditSink + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut sink = make_sink();
                worker_loop(name, sub, shutdown_rx, &mut sink);
            })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<S: AuditSink>(
    name: &'static str,
    sub: Subscription<EventEnvelope<AuditRecord>>,
    shutdown_rx: mpsc::Receiver<()>,
    sink: &mut S,
) {
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.wait(tick) {
            Delivery::Message(envelope) => {
                let record = envelope.payload();
                match sink.submit(record) {
                    Ok(receipt) => debug!(
                        worker = name,
                        sequence = envelope.sequence_number(),
                        batch_code = %record.batch_code,
                        transaction_hash = ?receipt.transaction_hash,
                        "audit record accepted"
                    ),
                    Err(err) => warn!(
                        worker = name,
                        sequence = envelope.sequence_number(),
                        operation = record.event_type(),
                        batch_code = %record.batch_code,
                        error = %err,
                        "audit submission failed; ledger state unaffected"
                    ),
                }
            }
            Delivery::Idle => continue,
            Delivery::Closed => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use uuid::Uuid;

    use agritrace_core::PartyId;
    use agritrace_events::InMemoryEventBus;

    use crate::audit::{AuditError, AuditOperation, AuditReceipt};

    #[derive(Clone, Default)]
    struct CollectingSink {
        seen: Arc<Mutex<Vec<String>>>,
        fail_first: bool,
    }

    impl AuditSink for CollectingSink {
        fn submit(&mut self, record: &AuditRecord) -> Result<AuditReceipt, AuditError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(record.batch_code.clone());
            if self.fail_first && seen.len() == 1 {
                return Err(AuditError::Transport("connection refused".into()));
            }
            Ok(AuditReceipt::default())
        }
    }

    fn test_envelope(seq: u64, code: &str) -> EventEnvelope<AuditRecord> {
        EventEnvelope::new(
            Uuid::now_v7(),
            code,
            seq,
            AuditRecord {
                operation: AuditOperation::Harvest,
                batch_code: code.into(),
                actor: PartyId::new(),
                counterparty: PartyId::new(),
                metadata: serde_json::Value::Null,
                occurred_at: Utc::now(),
            },
        )
    }

    fn wait_for(seen: &Arc<Mutex<Vec<String>>>, n: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn forwards_records_and_survives_sink_failures() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<AuditRecord>>> = Arc::new(InMemoryEventBus::new());
        let sink = CollectingSink {
            fail_first: true,
            ..CollectingSink::default()
        };
        let seen = sink.seen.clone();

        let handle = AuditWorker::spawn("audit-test", bus.clone(), move || sink).unwrap();
        bus.publish(test_envelope(1, "A")).unwrap();
        bus.publish(test_envelope(2, "B")).unwrap();
        wait_for(&seen, 2);
        handle.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);
    }
}
