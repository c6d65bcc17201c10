//! Integration tests for the full ledger pipeline.
//!
//! Tests: Orchestrator → Store (locks, unit of work) → EventBus → AuditWorker,
//! and Provenance reads over what the orchestrator committed.
//!
//! Verifies:
//! - Quantity is conserved across splits, purchases and reversals
//! - Concurrent draws never overdraw a batch
//! - Lock contention aborts cleanly
//! - Audit failures never reach the caller

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use agritrace_core::{Entity, ErrorKind, LedgerError, PartyId, ProductId, Quantity};
    use agritrace_events::{EventEnvelope, InMemoryEventBus};
    use agritrace_ledger::{
        BatchStatus, CatalogKind, EventKind, HarvestBatch, JourneyMilestone, LineItemRequest,
        PartyRef, PartyRole, Stage,
    };

    use crate::audit::{AuditError, AuditReceipt, AuditRecord, AuditSink, AuditWorker};
    use crate::orchestrator::{LedgerOrchestrator, RecordEventRequest, SplitRequest};
    use crate::provenance::ProvenanceResolver;
    use crate::store::{InMemoryLedgerStore, LedgerStore};

    type TestBus = Arc<InMemoryEventBus<EventEnvelope<AuditRecord>>>;
    type TestLedger = LedgerOrchestrator<InMemoryLedgerStore, TestBus>;

    fn setup_with(store: InMemoryLedgerStore) -> (Arc<TestLedger>, TestBus) {
        let bus: TestBus = Arc::new(InMemoryEventBus::new());
        (Arc::new(LedgerOrchestrator::new(store, bus.clone())), bus)
    }

    fn setup() -> (Arc<TestLedger>, TestBus) {
        setup_with(InMemoryLedgerStore::new())
    }

    fn test_party(role: PartyRole) -> PartyRef {
        PartyRef::new(PartyId::new(), role)
    }

    fn test_harvest(farmer: PartyRef, quantity: Decimal) -> HarvestBatch {
        HarvestBatch {
            product_id: ProductId::new(),
            custodian: farmer,
            quantity,
            unit: None,
            origin_date: NaiveDate::from_ymd_opt(2026, 4, 12).unwrap(),
            occurred_at: Utc::now(),
        }
    }

    fn qty(value: Decimal) -> Quantity {
        Quantity::new(value).unwrap()
    }

    #[tokio::test]
    async fn harvest_split_purchase_reverse_scenario() {
        let (ledger, _bus) = setup();
        let farmer = test_party(PartyRole::Farmer);
        let distributor = test_party(PartyRole::Distributor);

        let root = ledger.create_root(&test_harvest(farmer, dec!(1000)), None).await.unwrap();
        assert_eq!(root.unit(), "kg");

        let split = ledger
            .split(&SplitRequest {
                batch_id: *root.id(),
                actor: farmer.id,
                quantities: vec![dec!(400), dec!(600)],
                custodian: farmer,
                status: BatchStatus::Harvested,
            })
            .await
            .unwrap();
        let six_hundred = split.children[1].clone();
        assert_eq!(six_hundred.initial_quantity(), qty(dec!(600)));

        let bought = ledger
            .purchase(*six_hundred.id(), dec!(250), distributor, BatchStatus::InWarehouse)
            .await
            .unwrap();
        assert!(!bought.in_place);
        assert_eq!(bought.source.remaining_quantity(), qty(dec!(350)));
        assert_eq!(bought.acquired.remaining_quantity(), qty(dec!(250)));

        let reversal = ledger
            .reverse(*bought.acquired.id(), distributor.id, BatchStatus::Harvested)
            .await
            .unwrap();
        assert_eq!(reversal.quantity, qty(dec!(250)));

        let store = ledger.store();
        let parent = store.batch(*six_hundred.id()).await.unwrap().unwrap();
        assert_eq!(parent.remaining_quantity(), qty(dec!(600)));
        assert_eq!(parent.status(), BatchStatus::Harvested);

        let returned = store.batch(*bought.acquired.id()).await.unwrap().unwrap();
        assert_eq!(returned.remaining_quantity(), Quantity::ZERO);
        assert_eq!(returned.status(), BatchStatus::Returned);

        // Root pool plus everything handed to children equals the harvest.
        let root_now = store.batch(*root.id()).await.unwrap().unwrap();
        let children = store.children(*root.id()).await.unwrap();
        let handed_out = Quantity::try_sum(children.iter().map(|c| c.initial_quantity())).unwrap();
        assert_eq!(
            root_now.remaining_quantity().checked_add(handed_out).unwrap(),
            qty(dec!(1000))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_draws_never_overdraw() {
        let (ledger, _bus) = setup();
        let farmer = test_party(PartyRole::Farmer);
        let root = ledger.create_root(&test_harvest(farmer, dec!(100)), None).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            let id = *root.id();
            tasks.push(tokio::spawn(async move {
                ledger
                    .transfer_partial(
                        id,
                        dec!(15),
                        test_party(PartyRole::Distributor),
                        BatchStatus::InWarehouse,
                    )
                    .await
            }));
        }

        let mut accepted = 0;
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::InsufficientQuantity);
                    refused += 1;
                }
            }
        }

        assert_eq!(accepted, 6);
        assert_eq!(refused, 4);
        let after = ledger.store().batch(*root.id()).await.unwrap().unwrap();
        assert_eq!(after.remaining_quantity(), qty(dec!(10)));
        assert_eq!(ledger.store().children(*root.id()).await.unwrap().len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn crossing_baskets_over_shared_batches_all_complete() {
        let (ledger, _bus) = setup();
        let distributor = test_party(PartyRole::Distributor);
        let a = ledger.create_root(&test_harvest(distributor, dec!(50)), None).await.unwrap();
        let b = ledger.create_root(&test_harvest(distributor, dec!(50)), None).await.unwrap();
        let buyer = test_party(PartyRole::Retailer);

        let mut tasks = Vec::new();
        for n in 0..20 {
            let ledger = ledger.clone();
            let (first, second) = if n % 2 == 0 {
                (*a.id(), *b.id())
            } else {
                (*b.id(), *a.id())
            };
            tasks.push(tokio::spawn(async move {
                ledger
                    .place_order(
                        buyer,
                        &[
                            LineItemRequest { batch_id: first, quantity: dec!(1), unit_price: dec!(2) },
                            LineItemRequest { batch_id: second, quantity: dec!(2), unit_price: dec!(2) },
                        ],
                    )
                    .await
            }));
        }

        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            let mut placed = 0;
            for task in tasks {
                task.await.unwrap().unwrap();
                placed += 1;
            }
            placed
        })
        .await
        .expect("baskets locking in opposite orders must not deadlock");
        assert_eq!(finished, 20);

        // Ten baskets drew 1 from `a` and 2 from `b`; ten did the reverse.
        for id in [*a.id(), *b.id()] {
            let batch = ledger.store().batch(id).await.unwrap().unwrap();
            assert_eq!(batch.remaining_quantity(), qty(dec!(20)));
        }
        assert_eq!(ledger.orders_for_buyer(buyer.id).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn reversal_restores_parent_and_cannot_repeat() {
        let (ledger, _bus) = setup();
        let farmer = test_party(PartyRole::Farmer);
        let distributor = test_party(PartyRole::Distributor);
        let root = ledger.create_root(&test_harvest(farmer, dec!(80)), None).await.unwrap();

        let bought = ledger
            .transfer_partial(*root.id(), dec!(30), distributor, BatchStatus::InWarehouse)
            .await
            .unwrap();

        let stranger = ledger
            .reverse(*bought.acquired.id(), farmer.id, BatchStatus::InWarehouse)
            .await
            .unwrap_err();
        assert_eq!(stranger.kind(), ErrorKind::Ownership);

        ledger
            .reverse(*bought.acquired.id(), distributor.id, BatchStatus::InWarehouse)
            .await
            .unwrap();
        let parent = ledger.store().batch(*root.id()).await.unwrap().unwrap();
        assert_eq!(parent.remaining_quantity(), qty(dec!(80)));
        assert_eq!(parent.status(), BatchStatus::InWarehouse);

        let again = ledger
            .reverse(*bought.acquired.id(), distributor.id, BatchStatus::InWarehouse)
            .await
            .unwrap_err();
        assert_eq!(again, LedgerError::AlreadyReturned(*bought.acquired.id()));
        assert_eq!(again.kind(), ErrorKind::NotReversible);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn catalog_creation_is_idempotent_under_concurrency() {
        let store = InMemoryLedgerStore::new();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .find_or_create_catalog(CatalogKind::Status, "In Warehouse", None)
                    .await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn history_of_a_three_batch_chain_is_ascending() {
        let (ledger, _bus) = setup();
        let farmer = test_party(PartyRole::Farmer);
        let distributor = test_party(PartyRole::Distributor);
        let retailer = test_party(PartyRole::Retailer);

        let root = ledger.create_root(&test_harvest(farmer, dec!(90)), None).await.unwrap();
        let middle = ledger
            .transfer_partial(*root.id(), dec!(60), distributor, BatchStatus::InWarehouse)
            .await
            .unwrap()
            .acquired;
        ledger
            .record_event(RecordEventRequest {
                batch_id: *middle.id(),
                actor: distributor.id,
                kind: EventKind::QualityCheck,
                location: Some("6.93,79.85".into()),
                attachments: Vec::new(),
                sensor_readings: Vec::new(),
                new_status: None,
            })
            .await
            .unwrap();
        let leaf = ledger
            .transfer_partial(*middle.id(), dec!(20), retailer, BatchStatus::InShop)
            .await
            .unwrap()
            .acquired;

        let resolver = ProvenanceResolver::new(ledger.store().clone());
        let history = resolver.full_event_history(*leaf.id()).await.unwrap();

        let kinds: Vec<_> = history.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Harvest,
                EventKind::Purchased,
                EventKind::QualityCheck,
                EventKind::Purchased,
            ]
        );
        assert!(history
            .events
            .windows(2)
            .all(|w| w[0].recorded_at <= w[1].recorded_at));
        assert!(history.omissions.is_empty());
    }

    #[tokio::test]
    async fn held_row_lock_yields_contention_and_no_writes() {
        let store = InMemoryLedgerStore::with_lock_timeout(Duration::from_millis(50));
        let (ledger, _bus) = setup_with(store.clone());
        let farmer = test_party(PartyRole::Farmer);
        let root = ledger.create_root(&test_harvest(farmer, dec!(10)), None).await.unwrap();

        let guard = store.hold_batch_lock(*root.id()).await.unwrap();
        let err = ledger
            .split(&SplitRequest {
                batch_id: *root.id(),
                actor: farmer.id,
                quantities: vec![dec!(4)],
                custodian: farmer,
                status: BatchStatus::Harvested,
            })
            .await
            .unwrap_err();
        drop(guard);

        assert_eq!(err.kind(), ErrorKind::Contention);
        assert!(err.is_retryable());
        let untouched = store.batch(*root.id()).await.unwrap().unwrap();
        assert_eq!(untouched.remaining_quantity(), qty(dec!(10)));
        assert!(store.children(*root.id()).await.unwrap().is_empty());
        assert_eq!(store.events_for_batch(*root.id()).await.unwrap().len(), 1);
    }

    struct RefusingSink {
        attempts: Arc<AtomicUsize>,
    }

    impl AuditSink for RefusingSink {
        fn submit(&mut self, _record: &AuditRecord) -> Result<AuditReceipt, AuditError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AuditError::Rejected { status: 503 })
        }
    }

    #[tokio::test]
    async fn failing_audit_sink_never_fails_the_operation() {
        let (ledger, bus) = setup();
        let attempts = Arc::new(AtomicUsize::new(0));
        let sink_attempts = attempts.clone();
        let worker = AuditWorker::spawn("audit-refusing", bus, move || RefusingSink {
            attempts: sink_attempts,
        })
        .unwrap();

        let farmer = test_party(PartyRole::Farmer);
        let root = ledger.create_root(&test_harvest(farmer, dec!(5)), None).await.unwrap();
        ledger.consume(*root.id(), farmer.id, dec!(1)).await.unwrap();

        for _ in 0..100 {
            if attempts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let stored = ledger.store().batch(*root.id()).await.unwrap().unwrap();
        assert_eq!(stored.remaining_quantity(), qty(dec!(4)));
    }

    #[tokio::test]
    async fn order_delivery_shows_up_in_the_trace_report() {
        let (ledger, _bus) = setup();
        let farmer = test_party(PartyRole::Farmer);
        let distributor = test_party(PartyRole::Distributor);
        let retailer = test_party(PartyRole::Retailer);
        let transporter = test_party(PartyRole::Transporter);

        let root = ledger.create_root(&test_harvest(farmer, dec!(40)), None).await.unwrap();
        let whole = ledger
            .purchase(*root.id(), dec!(40), distributor, BatchStatus::InWarehouse)
            .await
            .unwrap();
        assert!(whole.in_place);

        let placed = ledger
            .place_order(
                retailer,
                &[LineItemRequest {
                    batch_id: *root.id(),
                    quantity: dec!(15),
                    unit_price: dec!(3.20),
                }],
            )
            .await
            .unwrap();
        ledger.assign_shipment(placed.order.id, transporter).await.unwrap();
        ledger.confirm_delivery(placed.order.id, transporter.id).await.unwrap();

        let shelf = &placed.downstream[0];
        let resolver = ProvenanceResolver::new(ledger.store().clone());
        let report = resolver.trace(shelf.code()).await.unwrap();

        assert!(!report.is_root);
        assert_eq!(report.parent_code.as_deref(), Some(root.code()));
        assert_eq!(report.batch.status(), BatchStatus::InShop);
        assert_eq!(
            report.journey,
            vec![
                JourneyMilestone::Harvested,
                JourneyMilestone::Sold,
                JourneyMilestone::Delivered,
            ]
        );
        assert_eq!(report.stages.bucket(Stage::Origin).len(), 1);
        assert_eq!(report.stages.bucket(Stage::Processing).len(), 2);
        assert_eq!(report.stages.bucket(Stage::Retail).len(), 2);

        let root_tree = resolver.genealogy(*root.id()).await.unwrap();
        assert_eq!(root_tree.focus.children.len(), 1);
        assert_eq!(root_tree.focus.children[0].batch.id(), shelf.id());
    }
}
