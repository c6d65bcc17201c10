//! Read-only provenance queries: genealogy trees, ancestor event history and
//! the consumer trace report.
//!
//! Nothing here locks. A read that fails for one ancestor or one branch is
//! recorded as an [`Omission`] and the walk carries on with what it has.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{instrument, warn};

use agritrace_core::{BatchId, Entity, LedgerError, LedgerResult};
use agritrace_ledger::{
    Batch, JourneyMilestone, LifecycleStages, TraceEvent, classify_events, journey_summary,
};

use crate::config::{DEFAULT_MAX_ANCESTOR_DEPTH, DEFAULT_MAX_DESCENDANTS, LedgerConfig};
use crate::store::LedgerStore;

/// A part of the graph the resolver could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Omission {
    pub batch_id: BatchId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenealogyNode {
    pub batch: Batch,
    pub children: Vec<GenealogyNode>,
}

/// A batch with its full descendant tree and its parent lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Genealogy {
    pub focus: GenealogyNode,
    /// Nearest parent first.
    pub ancestors: Vec<Batch>,
    pub omissions: Vec<Omission>,
}

impl Genealogy {
    /// The whole thing as one tree hanging from the furthest ancestor reached.
    /// Ancestors carry only the lineage child.
    pub fn into_tree(self) -> GenealogyNode {
        self.ancestors
            .into_iter()
            .fold(self.focus, |child, ancestor| GenealogyNode {
                batch: ancestor,
                children: vec![child],
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventHistory {
    /// Every event on the batch and its ancestors, oldest first.
    pub events: Vec<TraceEvent>,
    pub omissions: Vec<Omission>,
}

/// Everything a consumer scan of a batch code shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceReport {
    pub batch: Batch,
    pub is_root: bool,
    pub parent_code: Option<String>,
    pub genealogy: Genealogy,
    pub timeline: Vec<TraceEvent>,
    pub stages: LifecycleStages<TraceEvent>,
    pub journey: Vec<JourneyMilestone>,
    pub omissions: Vec<Omission>,
}

struct Lineage {
    ancestors: Vec<Batch>,
    omissions: Vec<Omission>,
}

#[derive(Debug, Clone)]
pub struct ProvenanceResolver<S> {
    store: S,
    max_ancestor_depth: usize,
    max_descendants: usize,
}

impl<S> ProvenanceResolver<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            max_descendants: DEFAULT_MAX_DESCENDANTS,
        }
    }

    pub fn from_config(store: S, config: &LedgerConfig) -> Self {
        Self {
            store,
            max_ancestor_depth: config.max_ancestor_depth,
            max_descendants: config.max_descendants,
        }
    }

    pub fn with_max_ancestor_depth(mut self, depth: usize) -> Self {
        self.max_ancestor_depth = depth;
        self
    }

    pub fn with_max_descendants(mut self, ceiling: usize) -> Self {
        self.max_descendants = ceiling;
        self
    }
}

impl<S: LedgerStore> ProvenanceResolver<S> {
    async fn focus(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.store
            .batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("batch {batch_id}")))
    }

    #[instrument(skip(self), err)]
    pub async fn genealogy(&self, batch_id: BatchId) -> LedgerResult<Genealogy> {
        let batch = self.focus(batch_id).await?;
        Ok(self.genealogy_of(batch).await)
    }

    #[instrument(skip(self), err)]
    pub async fn full_event_history(&self, batch_id: BatchId) -> LedgerResult<EventHistory> {
        let batch = self.focus(batch_id).await?;
        let lineage = self.lineage(&batch).await;
        Ok(self.history_of(&batch, lineage).await)
    }

    /// Bucket events by supply-chain stage.
    pub fn classify_by_role(&self, events: &[TraceEvent]) -> LifecycleStages<TraceEvent> {
        classify_events(events)
    }

    /// The consumer report behind a scanned batch code.
    #[instrument(skip(self), err)]
    pub async fn trace(&self, batch_code: &str) -> LedgerResult<TraceReport> {
        let batch = self
            .store
            .batch_by_code(batch_code)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("batch code {batch_code}")))?;

        let genealogy = self.genealogy_of(batch.clone()).await;
        let lineage = Lineage {
            ancestors: genealogy.ancestors.clone(),
            omissions: Vec::new(),
        };
        let history = self.history_of(&batch, lineage).await;

        let mut omissions = genealogy.omissions.clone();
        omissions.extend(history.omissions);

        Ok(TraceReport {
            is_root: batch.is_root(),
            parent_code: genealogy.ancestors.first().map(|p| p.code().to_string()),
            stages: classify_events(&history.events),
            journey: journey_summary(&history.events),
            timeline: history.events,
            batch,
            genealogy,
            omissions,
        })
    }

    async fn genealogy_of(&self, batch: Batch) -> Genealogy {
        let Lineage {
            ancestors,
            mut omissions,
        } = self.lineage(&batch).await;
        let (focus, below) = self.descendants(batch).await;
        omissions.extend(below);

        Genealogy {
            focus,
            ancestors,
            omissions,
        }
    }

    /// Follow `parent_id` upwards until a root, the depth bound, a cycle or a
    /// failed read.
    async fn lineage(&self, batch: &Batch) -> Lineage {
        let mut ancestors = Vec::new();
        let mut omissions = Vec::new();
        let mut visited = HashSet::from([*batch.id()]);
        let mut current = batch.clone();

        while let Some(parent_id) = current.parent_id() {
            if ancestors.len() >= self.max_ancestor_depth {
                omissions.push(omit(*current.id(), "ancestor depth limit reached"));
                break;
            }
            if !visited.insert(parent_id) {
                omissions.push(omit(parent_id, "parent cycle detected"));
                break;
            }

            match self.store.batch(parent_id).await {
                Ok(Some(parent)) => {
                    ancestors.push(parent.clone());
                    current = parent;
                }
                Ok(None) => {
                    omissions.push(omit(parent_id, "parent batch not found"));
                    break;
                }
                Err(err) => {
                    omissions.push(omit(parent_id, err.to_string()));
                    break;
                }
            }
        }

        for omission in &omissions {
            warn!(batch_id = %omission.batch_id, reason = %omission.reason, "lineage truncated");
        }
        Lineage {
            ancestors,
            omissions,
        }
    }

    /// Breadth-first over child lookups, then assembled bottom-up.
    async fn descendants(&self, batch: Batch) -> (GenealogyNode, Vec<Omission>) {
        let root_id = *batch.id();
        let mut omissions = Vec::new();
        let mut visited = HashSet::from([root_id]);
        let mut below = Vec::new();
        let mut children_of: HashMap<BatchId, Vec<BatchId>> = HashMap::new();
        let mut queue = VecDeque::from([root_id]);

        'walk: while let Some(id) = queue.pop_front() {
            let children = match self.store.children(id).await {
                Ok(children) => children,
                Err(err) => {
                    omissions.push(omit(id, err.to_string()));
                    continue;
                }
            };

            let kept = children_of.entry(id).or_default();
            for child in children {
                let child_id = *child.id();
                if visited.len() >= self.max_descendants {
                    omissions.push(omit(id, "descendant limit reached"));
                    break 'walk;
                }
                if !visited.insert(child_id) {
                    omissions.push(omit(child_id, "batch reached twice"));
                    continue;
                }
                kept.push(child_id);
                queue.push_back(child_id);
                below.push(child);
            }
        }

        for omission in &omissions {
            warn!(batch_id = %omission.batch_id, reason = %omission.reason, "genealogy branch omitted");
        }

        // Breadth-first order reversed puts every child before its parent.
        let mut built: HashMap<BatchId, GenealogyNode> = HashMap::with_capacity(below.len());
        let mut take_children = |id: BatchId, built: &mut HashMap<BatchId, GenealogyNode>| {
            children_of
                .remove(&id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|child| built.remove(&child))
                .collect::<Vec<_>>()
        };
        for child in below.into_iter().rev() {
            let id = *child.id();
            let children = take_children(id, &mut built);
            built.insert(id, GenealogyNode { batch: child, children });
        }

        let children = take_children(root_id, &mut built);
        (GenealogyNode { batch, children }, omissions)
    }

    async fn history_of(&self, batch: &Batch, lineage: Lineage) -> EventHistory {
        let Lineage {
            ancestors,
            mut omissions,
        } = lineage;

        let mut events = Vec::new();
        for id in std::iter::once(*batch.id()).chain(ancestors.iter().map(|b| *b.id())) {
            match self.store.events_for_batch(id).await {
                Ok(found) => events.extend(found),
                Err(err) => {
                    warn!(batch_id = %id, error = %err, "events omitted from history");
                    omissions.push(omit(id, err.to_string()));
                }
            }
        }
        events.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));

        EventHistory { events, omissions }
    }
}

fn omit(batch_id: BatchId, reason: impl Into<String>) -> Omission {
    Omission {
        batch_id,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal_macros::dec;

    use agritrace_core::{OrderId, PartyId, ProductId, Quantity};
    use agritrace_ledger::{
        BatchSnapshot, BatchStatus, CatalogEntry, CatalogKind, EventKind, Order, PartyRef,
        PartyRole, Stage,
    };

    use crate::store::{LedgerTx, StoreError};

    /// Read-only store over hand-built rows, with optional failing reads.
    #[derive(Default)]
    struct MapStore {
        batches: HashMap<BatchId, Batch>,
        events: HashMap<BatchId, Vec<TraceEvent>>,
        broken_children: HashSet<BatchId>,
        broken_batches: HashSet<BatchId>,
    }

    impl MapStore {
        fn add(&mut self, batch: Batch) {
            self.batches.insert(*batch.id(), batch);
        }
    }

    #[async_trait]
    impl LedgerStore for MapStore {
        async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
            Err(StoreError::Backend("read-only".into()))
        }

        async fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
            if self.broken_batches.contains(&id) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            Ok(self.batches.get(&id).cloned())
        }

        async fn batch_by_code(&self, code: &str) -> Result<Option<Batch>, StoreError> {
            Ok(self.batches.values().find(|b| b.code() == code).cloned())
        }

        async fn children(&self, parent: BatchId) -> Result<Vec<Batch>, StoreError> {
            if self.broken_children.contains(&parent) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            let mut children: Vec<_> = self
                .batches
                .values()
                .filter(|b| b.parent_id() == Some(parent))
                .cloned()
                .collect();
            children.sort_by_key(|b| *b.id());
            Ok(children)
        }

        async fn events_for_batch(&self, batch: BatchId) -> Result<Vec<TraceEvent>, StoreError> {
            Ok(self.events.get(&batch).cloned().unwrap_or_default())
        }

        async fn order(&self, _id: OrderId) -> Result<Option<Order>, StoreError> {
            Ok(None)
        }

        async fn orders_by_buyer(&self, _buyer: PartyId) -> Result<Vec<Order>, StoreError> {
            Ok(Vec::new())
        }

        async fn orders_by_seller(&self, _seller: PartyId) -> Result<Vec<Order>, StoreError> {
            Ok(Vec::new())
        }

        async fn find_or_create_catalog(
            &self,
            _kind: CatalogKind,
            _name: &str,
            _description: Option<&str>,
        ) -> Result<CatalogEntry, StoreError> {
            Err(StoreError::Backend("read-only".into()))
        }
    }

    fn test_batch(id: BatchId, parent: Option<BatchId>, role: PartyRole) -> Batch {
        Batch::from_snapshot(BatchSnapshot {
            id,
            code: format!("BATCH-{}", id),
            product_id: ProductId::new(),
            parent_id: parent,
            custodian: PartyRef::new(PartyId::new(), role),
            status: BatchStatus::InWarehouse,
            initial_quantity: Quantity::new(dec!(10)).unwrap(),
            remaining_quantity: Quantity::new(dec!(10)).unwrap(),
            unit: "kg".into(),
            origin_date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            created_at: Utc::now(),
        })
        .unwrap()
    }

    fn ids(n: usize) -> Vec<BatchId> {
        let mut ids: Vec<_> = (0..n).map(|_| BatchId::new()).collect();
        ids.sort();
        ids
    }

    /// root ← mid ← leaf, plus a sibling of mid.
    fn chain() -> (MapStore, Vec<BatchId>) {
        let ids = ids(4);
        let (root, mid, leaf, sibling) = (ids[0], ids[1], ids[2], ids[3]);
        let mut store = MapStore::default();
        store.add(test_batch(root, None, PartyRole::Farmer));
        store.add(test_batch(mid, Some(root), PartyRole::Distributor));
        store.add(test_batch(leaf, Some(mid), PartyRole::Retailer));
        store.add(test_batch(sibling, Some(root), PartyRole::Distributor));
        (store, ids)
    }

    #[tokio::test]
    async fn genealogy_has_lineage_and_descendants() {
        let (store, ids) = chain();
        let resolver = ProvenanceResolver::new(store);

        let genealogy = resolver.genealogy(ids[1]).await.unwrap();

        assert_eq!(genealogy.focus.children.len(), 1);
        assert_eq!(*genealogy.focus.children[0].batch.id(), ids[2]);
        assert_eq!(genealogy.ancestors.len(), 1);
        assert_eq!(*genealogy.ancestors[0].id(), ids[0]);
        assert!(genealogy.omissions.is_empty());

        // The sibling is not expanded under the ancestor.
        let tree = genealogy.into_tree();
        assert_eq!(*tree.batch.id(), ids[0]);
        assert_eq!(tree.children.len(), 1);
    }

    #[tokio::test]
    async fn root_genealogy_covers_the_whole_tree() {
        let (store, ids) = chain();
        let resolver = ProvenanceResolver::new(store);

        let genealogy = resolver.genealogy(ids[0]).await.unwrap();

        assert!(genealogy.ancestors.is_empty());
        let children: Vec<_> = genealogy.focus.children.iter().map(|c| *c.batch.id()).collect();
        assert_eq!(children, vec![ids[1], ids[3]]);
        assert_eq!(genealogy.focus.children[0].children.len(), 1);
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let resolver = ProvenanceResolver::new(MapStore::default());
        let err = resolver.genealogy(BatchId::new()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn parent_cycle_terminates() {
        let ids = ids(2);
        let mut store = MapStore::default();
        store.add(test_batch(ids[0], Some(ids[1]), PartyRole::Farmer));
        store.add(test_batch(ids[1], Some(ids[0]), PartyRole::Farmer));
        let resolver = ProvenanceResolver::new(store);

        let genealogy = resolver.genealogy(ids[0]).await.unwrap();

        assert_eq!(genealogy.ancestors.len(), 1);
        assert!(genealogy.omissions.iter().any(|o| o.reason.contains("cycle")));
        let history = resolver.full_event_history(ids[0]).await.unwrap();
        assert!(history.events.is_empty());
    }

    #[tokio::test]
    async fn ancestor_walk_is_depth_bounded() {
        let ids = ids(5);
        let mut store = MapStore::default();
        store.add(test_batch(ids[0], None, PartyRole::Farmer));
        for pair in ids.windows(2) {
            store.add(test_batch(pair[1], Some(pair[0]), PartyRole::Farmer));
        }
        let resolver = ProvenanceResolver::new(store).with_max_ancestor_depth(2);

        let genealogy = resolver.genealogy(ids[4]).await.unwrap();

        assert_eq!(genealogy.ancestors.len(), 2);
        assert_eq!(genealogy.omissions.len(), 1);
        assert_eq!(genealogy.omissions[0].reason, "ancestor depth limit reached");
    }

    #[tokio::test]
    async fn descendant_walk_respects_the_ceiling() {
        let ids = ids(4);
        let mut store = MapStore::default();
        store.add(test_batch(ids[0], None, PartyRole::Farmer));
        for child in &ids[1..] {
            store.add(test_batch(*child, Some(ids[0]), PartyRole::Farmer));
        }
        let resolver = ProvenanceResolver::new(store).with_max_descendants(2);

        let genealogy = resolver.genealogy(ids[0]).await.unwrap();

        assert_eq!(genealogy.focus.children.len(), 1);
        assert_eq!(genealogy.omissions[0].reason, "descendant limit reached");
    }

    #[tokio::test]
    async fn failed_branch_becomes_an_omission() {
        let (mut store, ids) = chain();
        store.broken_children.insert(ids[1]);
        let resolver = ProvenanceResolver::new(store);

        let genealogy = resolver.genealogy(ids[0]).await.unwrap();

        assert_eq!(genealogy.focus.children.len(), 2);
        assert!(genealogy.focus.children[0].children.is_empty());
        assert_eq!(genealogy.omissions.len(), 1);
        assert_eq!(genealogy.omissions[0].batch_id, ids[1]);
    }

    #[tokio::test]
    async fn failed_ancestor_read_keeps_what_was_found() {
        let (mut store, ids) = chain();
        store.broken_batches.insert(ids[0]);
        let resolver = ProvenanceResolver::new(store);

        let genealogy = resolver.genealogy(ids[2]).await.unwrap();

        assert_eq!(genealogy.ancestors.len(), 1);
        assert_eq!(genealogy.omissions[0].batch_id, ids[0]);
    }

    #[tokio::test]
    async fn history_spans_ancestors_in_time_order() {
        let (mut store, ids) = chain();
        let start = Utc::now();
        for (offset, id) in [(2, ids[2]), (0, ids[0]), (1, ids[1])] {
            let batch = store.batches[&id].clone();
            let event = TraceEvent::record(
                &batch,
                EventKind::QualityCheck,
                PartyId::new(),
                start + Duration::minutes(offset),
            );
            store.events.entry(id).or_default().push(event);
        }
        let resolver = ProvenanceResolver::new(store);

        let history = resolver.full_event_history(ids[2]).await.unwrap();

        let batches: Vec<_> = history.events.iter().map(|e| e.batch_id).collect();
        assert_eq!(batches, vec![ids[0], ids[1], ids[2]]);

        let stages = resolver.classify_by_role(&history.events);
        assert_eq!(stages.bucket(Stage::Origin).len(), 1);
        assert_eq!(stages.bucket(Stage::Processing).len(), 1);
        assert_eq!(stages.bucket(Stage::Retail).len(), 1);
    }

    #[tokio::test]
    async fn trace_by_code_reports_parent_and_journey() {
        let (mut store, ids) = chain();
        let root = store.batches[&ids[0]].clone();
        let harvest = TraceEvent::record(&root, EventKind::Harvest, PartyId::new(), Utc::now());
        store.events.insert(ids[0], vec![harvest]);
        let leaf_code = store.batches[&ids[2]].code().to_string();
        let mid_code = store.batches[&ids[1]].code().to_string();
        let resolver = ProvenanceResolver::new(Arc::new(store));

        let report = resolver.trace(&leaf_code).await.unwrap();

        assert!(!report.is_root);
        assert_eq!(report.parent_code.as_deref(), Some(mid_code.as_str()));
        assert_eq!(report.timeline.len(), 1);
        assert_eq!(report.journey, vec![JourneyMilestone::Harvested]);
        assert!(report.omissions.is_empty());

        let err = resolver.trace("BATCH-NOPE").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
