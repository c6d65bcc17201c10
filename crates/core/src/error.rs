//! Ledger error model.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::id::{BatchId, PartyId};

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Stable, caller-facing classification of a [`LedgerError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    InsufficientQuantity,
    NotFound,
    Ownership,
    NotReversible,
    Contention,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientQuantity => "insufficient_quantity",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Ownership => "ownership",
            ErrorKind::NotReversible => "not_reversible",
            ErrorKind::Contention => "contention",
            ErrorKind::Internal => "internal",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger-level error.
///
/// Every ledger and orchestrator operation is all-or-nothing: when one of these
/// is returned, no change made by the operation is visible.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or missing input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested amount exceeds the batch's remaining quantity.
    #[error(
        "insufficient quantity in batch {batch_id}: available {available}, requested {requested}"
    )]
    InsufficientQuantity {
        batch_id: BatchId,
        available: Decimal,
        requested: Decimal,
    },

    /// Unknown batch, order or catalog entry.
    #[error("{0} not found")]
    NotFound(String),

    /// The actor is not the batch's current custodian.
    #[error("party {actor} is not the custodian of batch {batch_id}")]
    Ownership { batch_id: BatchId, actor: PartyId },

    /// Reversal attempted on a batch without a parent.
    #[error("batch {batch_id} cannot be reversed: {reason}")]
    NotReversible { batch_id: BatchId, reason: String },

    /// Reversal attempted on a batch whose remaining quantity is already zero.
    #[error("batch {0} has already been returned")]
    AlreadyReturned(BatchId),

    /// Row locks could not be acquired in time, or a generated code was
    /// already taken. Safe to retry.
    #[error("contention: {0}")]
    Contention(String),

    /// Storage fault. The detail is kept for logs and never rendered.
    #[error("internal storage error")]
    Internal(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn not_reversible(batch_id: BatchId, reason: impl Into<String>) -> Self {
        Self::NotReversible {
            batch_id,
            reason: reason.into(),
        }
    }

    pub fn contention(msg: impl Into<String>) -> Self {
        Self::Contention(msg.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::InsufficientQuantity { .. } => ErrorKind::InsufficientQuantity,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::Ownership { .. } => ErrorKind::Ownership,
            LedgerError::NotReversible { .. } | LedgerError::AlreadyReturned(_) => {
                ErrorKind::NotReversible
            }
            LedgerError::Contention(_) => ErrorKind::Contention,
            LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }

    /// Storage detail for logging; `None` for every non-internal error.
    pub fn internal_detail(&self) -> Option<&str> {
        match self {
            LedgerError::Internal(detail) => Some(detail),
            _ => None,
        }
    }
}
