//! Supply-chain stage attribution for provenance reports.

use serde::{Deserialize, Serialize};

use crate::catalog::EventKind;
use crate::event_log::TraceEvent;
use crate::party::PartyRole;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Origin,
    Processing,
    Transport,
    Retail,
}

fn stage_for_role(role: PartyRole) -> Option<Stage> {
    match role {
        PartyRole::Farmer => Some(Stage::Origin),
        PartyRole::Distributor => Some(Stage::Processing),
        PartyRole::Transporter => Some(Stage::Transport),
        PartyRole::Retailer => Some(Stage::Retail),
        PartyRole::Consumer | PartyRole::Admin => None,
    }
}

fn stage_for_kind(kind: EventKind) -> Option<Stage> {
    match kind {
        EventKind::Harvest
        | EventKind::FertilizerApplied
        | EventKind::PesticideApplied
        | EventKind::Irrigation => Some(Stage::Origin),
        EventKind::ShipmentAssigned
        | EventKind::PickedUp
        | EventKind::InTransit
        | EventKind::Delivered => Some(Stage::Transport),
        EventKind::Sold | EventKind::Split | EventKind::Purchased => Some(Stage::Processing),
        EventKind::QualityCheck | EventKind::Returned | EventKind::Consumed => None,
    }
}

/// Stage of one event.
///
/// Harvest events are always origin. Otherwise the custodian role recorded on
/// the event wins, and the event kind is the fallback. `None` means no rule
/// applies.
pub fn classify(kind: EventKind, custodian_role: Option<PartyRole>) -> Option<Stage> {
    if kind == EventKind::Harvest {
        return Some(Stage::Origin);
    }
    custodian_role
        .and_then(stage_for_role)
        .or_else(|| stage_for_kind(kind))
}

/// Events bucketed by stage, each bucket keeping the input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStages<T> {
    pub origin: Vec<T>,
    pub processing: Vec<T>,
    pub transport: Vec<T>,
    pub retail: Vec<T>,
    pub unattributed: Vec<T>,
}

impl<T> Default for LifecycleStages<T> {
    fn default() -> Self {
        Self {
            origin: Vec::new(),
            processing: Vec::new(),
            transport: Vec::new(),
            retail: Vec::new(),
            unattributed: Vec::new(),
        }
    }
}

impl<T> LifecycleStages<T> {
    pub fn bucket(&self, stage: Stage) -> &[T] {
        match stage {
            Stage::Origin => &self.origin,
            Stage::Processing => &self.processing,
            Stage::Transport => &self.transport,
            Stage::Retail => &self.retail,
        }
    }

    fn push(&mut self, stage: Option<Stage>, item: T) {
        match stage {
            Some(Stage::Origin) => self.origin.push(item),
            Some(Stage::Processing) => self.processing.push(item),
            Some(Stage::Transport) => self.transport.push(item),
            Some(Stage::Retail) => self.retail.push(item),
            None => self.unattributed.push(item),
        }
    }
}

pub fn classify_events(events: &[TraceEvent]) -> LifecycleStages<TraceEvent> {
    let mut stages = LifecycleStages::default();
    for event in events {
        stages.push(classify(event.kind, event.custodian_role), event.clone());
    }
    stages
}

/// Consumer-facing highlights of a batch's journey.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyMilestone {
    Harvested,
    Fertilized,
    PestTreated,
    Irrigated,
    Transported,
    QualityChecked,
    Split,
    Sold,
    Delivered,
    /// Placeholder when no other milestone applies.
    Tracked,
}

impl JourneyMilestone {
    pub fn label(self) -> &'static str {
        match self {
            JourneyMilestone::Harvested => "Harvested from farm",
            JourneyMilestone::Fertilized => "Fertilizer applied",
            JourneyMilestone::PestTreated => "Pesticide applied",
            JourneyMilestone::Irrigated => "Irrigated",
            JourneyMilestone::Transported => "Transported",
            JourneyMilestone::QualityChecked => "Quality checked",
            JourneyMilestone::Split => "Split into smaller batches",
            JourneyMilestone::Sold => "Sold",
            JourneyMilestone::Delivered => "Delivered to the shop",
            JourneyMilestone::Tracked => "Product journey tracked",
        }
    }
}

/// Milestones present in `events`, in a fixed narrative order.
pub fn journey_summary(events: &[TraceEvent]) -> Vec<JourneyMilestone> {
    let has = |kinds: &[EventKind]| events.iter().any(|e| kinds.contains(&e.kind));

    let checks: [(&[EventKind], JourneyMilestone); 9] = [
        (&[EventKind::Harvest], JourneyMilestone::Harvested),
        (&[EventKind::FertilizerApplied], JourneyMilestone::Fertilized),
        (&[EventKind::PesticideApplied], JourneyMilestone::PestTreated),
        (&[EventKind::Irrigation], JourneyMilestone::Irrigated),
        (
            &[EventKind::PickedUp, EventKind::InTransit],
            JourneyMilestone::Transported,
        ),
        (&[EventKind::QualityCheck], JourneyMilestone::QualityChecked),
        (&[EventKind::Split], JourneyMilestone::Split),
        (&[EventKind::Sold], JourneyMilestone::Sold),
        (&[EventKind::Delivered], JourneyMilestone::Delivered),
    ];

    let milestones: Vec<_> = checks
        .into_iter()
        .filter(|(kinds, _)| has(kinds))
        .map(|(_, milestone)| milestone)
        .collect();

    if milestones.is_empty() {
        vec![JourneyMilestone::Tracked]
    } else {
        milestones
    }
}
