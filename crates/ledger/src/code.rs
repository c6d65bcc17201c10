//! Human-readable batch codes and order numbers.
//!
//! Codes are what gets printed on labels and QR stickers, so they carry the
//! lineage visibly (`<parent>-S2-…`). Tails are the low hex digits of a
//! random (v4) UUID; uniqueness is still enforced by the store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Batch codes share a one-second prefix, so 32 random bits.
const BATCH_TAIL: usize = 8;
/// Order numbers share a whole day, so 48 random bits.
const ORDER_TAIL: usize = 12;

fn random_tail(width: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[hex.len() - width..].to_ascii_uppercase()
}

/// `BATCH-YYYYMMDD-HHMMSS-XXXXXXXX`
pub fn root_code(at: DateTime<Utc>) -> String {
    format!("BATCH-{}-{}", at.format("%Y%m%d-%H%M%S"), random_tail(BATCH_TAIL))
}

/// `count` distinct root codes stamped with the same instant, one per
/// downstream batch of a basket.
pub fn root_codes(at: DateTime<Utc>, count: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut codes = Vec::with_capacity(count);
    while codes.len() < count {
        let code = root_code(at);
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }
    codes
}

/// `<parent>-S<n>-XXXXXXXX`, `n` being the 1-based position in the split.
pub fn split_code(parent_code: &str, n: usize) -> String {
    format!("{parent_code}-S{n}-{}", random_tail(BATCH_TAIL))
}

/// `<parent>-D-XXXXXXXX` for a partial purchase.
pub fn purchase_code(parent_code: &str) -> String {
    format!("{parent_code}-D-{}", random_tail(BATCH_TAIL))
}

/// `ORD-YYYYMMDD-XXXXXXXXXXXX`
pub fn order_number(at: DateTime<Utc>) -> String {
    format!("ORD-{}-{}", at.format("%Y%m%d"), random_tail(ORDER_TAIL))
}
