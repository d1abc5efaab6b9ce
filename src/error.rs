use sled::transaction::TransactionError;

use crate::ledger::CreditStatus;
use crate::verification::{Verification, VerificationStatus};

/// What kind of record a [`EngineError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Farm,
    Verification,
    CreditRecord,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Farm => f.write_str("farm"),
            RecordKind::Verification => f.write_str("verification"),
            RecordKind::CreditRecord => f.write_str("credit record"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("No {kind} found for {key}")]
    NotFound { kind: RecordKind, key: String },
    #[error("No ground truth data available for period {period}")]
    InsufficientData { farm_id: String, period: String },
    #[error("Carbon credits for period {period} have already been calculated (status: {status})")]
    DuplicatePeriod {
        farm_id: String,
        period: String,
        status: CreditStatus,
    },
    #[error("Verification already exists for period {period}")]
    DuplicateVerification {
        farm_id: String,
        period: String,
        existing_id: String,
    },
    // internals are logged where the failure happens, never carried here
    #[error("Failed to calculate carbon credits")]
    Calculation,
    #[error("Verification {} was approved but the credit ledger could not be updated: {source}", verification.id)]
    Reconciliation {
        verification: Box<Verification>,
        source: Box<EngineError>,
    },
    #[error("Verification cannot move from {from} to {to}")]
    InvalidTransition {
        from: VerificationStatus,
        to: VerificationStatus,
    },
    #[error("Credit record cannot move from {from} to {to}")]
    InvalidCreditTransition { from: CreditStatus, to: CreditStatus },
    #[error("Awarded credits must be a finite, non-negative amount, got {0}")]
    InvalidAward(f64),
    #[error("Verification {0} awarded no credits, nothing to record in the ledger")]
    NoAwardToSync(String),
    #[error("Invalid period '{0}', expected YYYY-Qn")]
    InvalidPeriod(String),
    #[error("Invalid farm: {0}")]
    InvalidFarm(String),
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),
    #[error("Failed to generate identifier: {0}")]
    Identifier(String),
    #[error("Failed to encode or decode a stored record: {0}")]
    Codec(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
}

impl EngineError {
    pub fn not_found(kind: RecordKind, key: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }

    /// Duplicate period or verification: the caller picked a key that is already taken.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicatePeriod { .. } | EngineError::DuplicateVerification { .. }
        )
    }

    /// True when retrying the same call can succeed once the caller changes something
    /// outside the engine (more observations, a manual ledger fix).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. } | EngineError::Reconciliation { .. }
        )
    }
}

impl From<TransactionError<EngineError>> for EngineError {
    fn from(value: TransactionError<EngineError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => EngineError::Storage(e),
        }
    }
}
