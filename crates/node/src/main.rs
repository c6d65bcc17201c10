//! Single-process ledger node: wires the store, the audit worker and the
//! orchestrator from environment configuration, then walks one batch from
//! harvest to a retailer shelf and prints its trace report.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use agritrace_core::{Entity, PartyId, ProductId};
use agritrace_events::{EventEnvelope, InMemoryEventBus};
use agritrace_infra::audit::{AuditRecord, AuditSink, AuditWorker, DiscardAuditSink, HttpAuditSink};
use agritrace_infra::{
    InMemoryLedgerStore, LedgerConfig, LedgerOrchestrator, LedgerStore, PostgresLedgerStore,
    ProvenanceResolver, SplitRequest,
};
use agritrace_ledger::{BatchStatus, HarvestBatch, LineItemRequest, PartyRef, PartyRole};

type AuditBus = Arc<InMemoryEventBus<EventEnvelope<AuditRecord>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agritrace_observability::init();

    let config = LedgerConfig::from_env();
    let store = open_store(&config).await?;

    let bus: AuditBus = Arc::new(InMemoryEventBus::new());
    let audit_url = config.audit_url.clone();
    let audit_timeout = config.audit_timeout;
    let worker = AuditWorker::spawn("audit-forwarder", bus.clone(), move || -> Box<dyn AuditSink> {
        match audit_url {
            Some(url) => match HttpAuditSink::new(&url, audit_timeout) {
                Ok(sink) => Box::new(sink),
                Err(err) => {
                    warn!(error = %err, "audit client unavailable; records will be dropped");
                    Box::new(DiscardAuditSink)
                }
            },
            None => Box::new(DiscardAuditSink),
        }
    })
    .context("failed to start audit worker")?;

    let ledger = LedgerOrchestrator::new(store.clone(), bus);
    let resolver = ProvenanceResolver::from_config(store, &config);

    let report = walkthrough(&ledger, &resolver).await;
    worker.shutdown();

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn open_store(config: &LedgerConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            info!("using Postgres ledger store");
            Ok(Arc::new(PostgresLedgerStore::new(pool, config.lock_timeout)))
        }
        None => Ok(Arc::new(InMemoryLedgerStore::with_lock_timeout(
            config.lock_timeout,
        ))),
    }
}

/// Harvest, split, sell to a distributor, sell on to a retailer, ship,
/// deliver, then trace the shelf batch.
async fn walkthrough(
    ledger: &LedgerOrchestrator<Arc<dyn LedgerStore>, AuditBus>,
    resolver: &ProvenanceResolver<Arc<dyn LedgerStore>>,
) -> anyhow::Result<agritrace_infra::TraceReport> {
    let farmer = PartyRef::new(PartyId::new(), PartyRole::Farmer);
    let distributor = PartyRef::new(PartyId::new(), PartyRole::Distributor);
    let retailer = PartyRef::new(PartyId::new(), PartyRole::Retailer);
    let transporter = PartyRef::new(PartyId::new(), PartyRole::Transporter);

    let now = Utc::now();
    let root = ledger
        .create_root(
            &HarvestBatch {
                product_id: ProductId::new(),
                custodian: farmer,
                quantity: dec!(1000),
                unit: Some("kg".into()),
                origin_date: now.date_naive(),
                occurred_at: now,
            },
            Some("7.2906,80.6337".into()),
        )
        .await?;

    let split = ledger
        .split(&SplitRequest {
            batch_id: *root.id(),
            actor: farmer.id,
            quantities: vec![dec!(400), dec!(600)],
            custodian: farmer,
            status: BatchStatus::Harvested,
        })
        .await?;

    let bought = ledger
        .purchase(
            *split.children[1].id(),
            dec!(250),
            distributor,
            BatchStatus::InWarehouse,
        )
        .await?;

    let placed = ledger
        .place_order(
            retailer,
            &[LineItemRequest {
                batch_id: *bought.acquired.id(),
                quantity: dec!(100),
                unit_price: dec!(2.40),
            }],
        )
        .await?;
    ledger
        .assign_shipment(placed.order.id, transporter)
        .await?;
    ledger
        .confirm_delivery(placed.order.id, transporter.id)
        .await?;

    let shelf = placed
        .downstream
        .first()
        .context("order produced no downstream batch")?;
    Ok(resolver.trace(shelf.code()).await?)
}
