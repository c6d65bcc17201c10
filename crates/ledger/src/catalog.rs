//! Status and event-type vocabularies.
//!
//! Both catalogs are closed: the ledger only ever writes the values listed
//! here. The store additionally keeps one row per name (created lazily with
//! find-or-create semantics) so external reporting can join on them.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use agritrace_core::{CatalogId, LedgerError};

/// Lifecycle status of a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    #[serde(rename = "Harvested")]
    Harvested,
    #[serde(rename = "In Warehouse")]
    InWarehouse,
    #[serde(rename = "In Transit")]
    InTransit,
    #[serde(rename = "Pending Delivery")]
    PendingDelivery,
    #[serde(rename = "In Shop")]
    InShop,
    #[serde(rename = "Sold")]
    Sold,
    #[serde(rename = "Consumed")]
    Consumed,
    #[serde(rename = "Returned")]
    Returned,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 8] = [
        BatchStatus::Harvested,
        BatchStatus::InWarehouse,
        BatchStatus::InTransit,
        BatchStatus::PendingDelivery,
        BatchStatus::InShop,
        BatchStatus::Sold,
        BatchStatus::Consumed,
        BatchStatus::Returned,
    ];

    /// Catalog name (what the status table stores).
    pub fn name(self) -> &'static str {
        match self {
            BatchStatus::Harvested => "Harvested",
            BatchStatus::InWarehouse => "In Warehouse",
            BatchStatus::InTransit => "In Transit",
            BatchStatus::PendingDelivery => "Pending Delivery",
            BatchStatus::InShop => "In Shop",
            BatchStatus::Sold => "Sold",
            BatchStatus::Consumed => "Consumed",
            BatchStatus::Returned => "Returned",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BatchStatus::Harvested => "Harvested at the farm",
            BatchStatus::InWarehouse => "Held in a distributor warehouse",
            BatchStatus::InTransit => "Moving between custodians",
            BatchStatus::PendingDelivery => "Order placed, awaiting transporter pickup",
            BatchStatus::InShop => "Available in a retail shop",
            BatchStatus::Sold => "Fully sold to downstream buyers",
            BatchStatus::Consumed => "Fully consumed",
            BatchStatus::Returned => "Returned to the parent batch",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Consumed | BatchStatus::Returned)
    }

    /// Statuses that make a batch show up again in buyer listings; the only
    /// valid targets when stock is restored by a reversal.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            BatchStatus::Harvested | BatchStatus::InWarehouse | BatchStatus::InShop
        )
    }

    /// Statuses a freshly split or purchased batch may start in.
    pub fn is_valid_for_new_batch(self) -> bool {
        !matches!(
            self,
            BatchStatus::Sold | BatchStatus::Consumed | BatchStatus::Returned
        )
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BatchStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LedgerError::validation(format!("unknown status \"{s}\"")))
    }
}

/// Kind of action recorded in the event log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Harvest")]
    Harvest,
    #[serde(rename = "Fertilizer Applied")]
    FertilizerApplied,
    #[serde(rename = "Pesticide Applied")]
    PesticideApplied,
    #[serde(rename = "Irrigation")]
    Irrigation,
    #[serde(rename = "Quality Check")]
    QualityCheck,
    #[serde(rename = "Split")]
    Split,
    #[serde(rename = "Purchased")]
    Purchased,
    #[serde(rename = "Sold")]
    Sold,
    #[serde(rename = "Shipment Assigned")]
    ShipmentAssigned,
    #[serde(rename = "Picked Up")]
    PickedUp,
    #[serde(rename = "In Transit")]
    InTransit,
    #[serde(rename = "Delivered")]
    Delivered,
    #[serde(rename = "Returned")]
    Returned,
    #[serde(rename = "Consumed")]
    Consumed,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::Harvest,
        EventKind::FertilizerApplied,
        EventKind::PesticideApplied,
        EventKind::Irrigation,
        EventKind::QualityCheck,
        EventKind::Split,
        EventKind::Purchased,
        EventKind::Sold,
        EventKind::ShipmentAssigned,
        EventKind::PickedUp,
        EventKind::InTransit,
        EventKind::Delivered,
        EventKind::Returned,
        EventKind::Consumed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Harvest => "Harvest",
            EventKind::FertilizerApplied => "Fertilizer Applied",
            EventKind::PesticideApplied => "Pesticide Applied",
            EventKind::Irrigation => "Irrigation",
            EventKind::QualityCheck => "Quality Check",
            EventKind::Split => "Split",
            EventKind::Purchased => "Purchased",
            EventKind::Sold => "Sold",
            EventKind::ShipmentAssigned => "Shipment Assigned",
            EventKind::PickedUp => "Picked Up",
            EventKind::InTransit => "In Transit",
            EventKind::Delivered => "Delivered",
            EventKind::Returned => "Returned",
            EventKind::Consumed => "Consumed",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            EventKind::Harvest => "Produce harvested at the farm",
            EventKind::FertilizerApplied => "Fertilizer applied to the crop",
            EventKind::PesticideApplied => "Pesticide applied to the crop",
            EventKind::Irrigation => "Crop irrigated",
            EventKind::QualityCheck => "Quality inspection performed",
            EventKind::Split => "Batch split into smaller batches",
            EventKind::Purchased => "Batch bought by a downstream party",
            EventKind::Sold => "Quantity sold from this batch",
            EventKind::ShipmentAssigned => "Order assigned to a transporter",
            EventKind::PickedUp => "Picked up by the transporter",
            EventKind::InTransit => "Shipment in transit",
            EventKind::Delivered => "Delivered to the buyer",
            EventKind::Returned => "Quantity returned to the parent batch",
            EventKind::Consumed => "Quantity consumed",
        }
    }

    /// Kinds written only by the ledger operation they describe (harvest,
    /// split, sale, purchase, return, consumption), never recorded directly.
    pub fn is_operation_owned(self) -> bool {
        matches!(
            self,
            EventKind::Harvest
                | EventKind::Split
                | EventKind::Purchased
                | EventKind::Sold
                | EventKind::Returned
                | EventKind::Consumed
        )
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LedgerError::validation(format!("unknown event type \"{s}\"")))
    }
}

/// Which catalog a row belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Status,
    EventType,
}

impl CatalogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CatalogKind::Status => "status",
            CatalogKind::EventType => "event_type",
        }
    }
}

/// A persisted catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: CatalogId,
    pub kind: CatalogKind,
    pub name: String,
    pub description: Option<String>,
}
