//! Exact, non-negative quantities of produce.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// A non-negative decimal amount (in the batch's unit).
///
/// Decimal arithmetic keeps the conservation equalities exact: 0.1 kg split
/// off 0.3 kg leaves exactly 0.2 kg.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Any non-negative amount (remaining quantities may be zero).
    pub fn new(value: Decimal) -> LedgerResult<Self> {
        if value < Decimal::ZERO {
            return Err(LedgerError::validation(format!(
                "quantity cannot be negative (got {value})"
            )));
        }
        Ok(Self(value.normalize()))
    }

    /// A strictly positive amount, as required for every requested draw.
    pub fn positive(value: Decimal) -> LedgerResult<Self> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::validation(format!(
                "quantity must be greater than zero (got {value})"
            )));
        }
        Ok(Self(value.normalize()))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `self - other`, or `None` if the result would be negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        let diff = self.0 - other.0;
        if diff < Decimal::ZERO {
            None
        } else {
            Some(Quantity(diff.normalize()))
        }
    }

    /// `self + other`; a sum past `Decimal::MAX` is a validation error
    /// rather than a panic.
    pub fn checked_add(self, other: Quantity) -> LedgerResult<Quantity> {
        self.0
            .checked_add(other.0)
            .map(|sum| Quantity(sum.normalize()))
            .ok_or_else(|| {
                LedgerError::validation(format!("quantity {self} + {other} is out of range"))
            })
    }

    /// Total of `quantities`, failing on overflow like [`Quantity::checked_add`].
    pub fn try_sum(quantities: impl IntoIterator<Item = Quantity>) -> LedgerResult<Quantity> {
        quantities
            .into_iter()
            .try_fold(Quantity::ZERO, Quantity::checked_add)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
