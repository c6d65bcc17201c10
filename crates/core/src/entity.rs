//! Identity for ledger rows that change over time.

/// Something with a stable identity across state changes: a batch keeps its
/// id while custodian, status and remaining quantity move.
///
/// Ids are `Copy + Ord` so they can be sorted into lock order.
pub trait Entity {
    type Id: Copy + Ord + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    fn id(&self) -> &Self::Id;
}
