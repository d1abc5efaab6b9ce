//! Per-farm, per-period credit ledger.
//!
//! One [`CreditRecord`] per `(farm, period)`, stored under the key
//! `farm_id/period`. Every check-then-write runs inside a sled transaction so
//! two concurrent calculations for the same key cannot both insert.
use std::fmt;

use serde::{Deserialize, Serialize};
use sled::Batch;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use tracing::{debug, info};

use crate::clock::TimeStamp;
use crate::error::{EngineError, RecordKind};
use crate::period::Period;
use crate::utils;
use crate::validation::ValidationReport;

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Verified,
    #[n(2)]
    Rejected,
    #[n(3)]
    Issued,
    #[n(4)]
    RequiresData,
}

impl CreditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditStatus::Pending => "pending",
            CreditStatus::Verified => "verified",
            CreditStatus::Rejected => "rejected",
            CreditStatus::Issued => "issued",
            CreditStatus::RequiresData => "requires_data",
        }
    }
}

impl fmt::Display for CreditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreditRecord {
    #[n(0)]
    pub farm_id: String,
    #[n(1)]
    pub period: Period,
    #[n(2)]
    pub calculated_credits: f64, // tons CO2e
    #[n(3)]
    pub verified_credits: f64,
    #[n(4)]
    pub status: CreditStatus,
    #[n(5)]
    pub verification_date: Option<TimeStamp>,
    #[n(6)]
    pub verifier_id: Option<String>,
    #[n(7)]
    pub notes: Option<String>,
    #[n(8)]
    pub calculated_at: TimeStamp,
}

/// Source states from which a recalculation may overwrite an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecalculationPolicy {
    pub allowed_from: Vec<CreditStatus>,
}

impl Default for RecalculationPolicy {
    fn default() -> Self {
        Self {
            allowed_from: vec![CreditStatus::Rejected],
        }
    }
}

impl RecalculationPolicy {
    pub fn allows(&self, status: CreditStatus) -> bool {
        self.allowed_from.contains(&status)
    }
}

#[derive(Clone)]
pub struct CreditLedger {
    tree: sled::Tree,
    policy: RecalculationPolicy,
}

impl CreditLedger {
    pub fn new(tree: sled::Tree, policy: RecalculationPolicy) -> Self {
        Self { tree, policy }
    }

    pub fn with_policy(self, policy: RecalculationPolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn policy(&self) -> &RecalculationPolicy {
        &self.policy
    }

    /// Insert the period's record, or overwrite it when the policy allows.
    /// Anything else is a [`EngineError::DuplicatePeriod`].
    pub fn upsert(
        &self,
        farm_id: &str,
        period: &Period,
        calculated_credits: f64,
        validation: &ValidationReport,
        now: TimeStamp,
    ) -> Result<CreditRecord, EngineError> {
        let key = utils::period_key(farm_id, period);
        let status = if validation.is_valid {
            CreditStatus::Pending
        } else {
            CreditStatus::RequiresData
        };

        let record = self.tree.transaction(|tx| -> ConflictableTransactionResult<CreditRecord, EngineError> {
            if let Some(existing) = tx.get(key.as_bytes())? {
                let existing: CreditRecord = utils::from_cbor(&existing).map_err(ConflictableTransactionError::Abort)?;
                if !self.policy.allows(existing.status) {
                    return Err(ConflictableTransactionError::Abort(EngineError::DuplicatePeriod {
                        farm_id: farm_id.to_string(),
                        period: period.to_string(),
                        status: existing.status,
                    }));
                }
                debug!(farm_id, %period, from = %existing.status, "overwriting credit record");
            }

            let record = CreditRecord {
                farm_id: farm_id.to_string(),
                period: *period,
                calculated_credits,
                verified_credits: 0.0,
                status,
                verification_date: None,
                verifier_id: None,
                notes: None,
                calculated_at: now,
            };
            tx.insert(key.as_bytes(), utils::to_cbor(&record).map_err(ConflictableTransactionError::Abort)?)?;
            Ok(record)
        })?;

        info!(farm_id, %period, credits = calculated_credits, status = %record.status, "credit record stored");
        Ok(record)
    }

    /// Marks the period verified. `verified_credits` defaults to the calculated amount.
    pub fn mark_verified(
        &self,
        farm_id: &str,
        period: &Period,
        verified_credits: Option<f64>,
        verifier_id: &str,
        notes: Option<String>,
        now: TimeStamp,
    ) -> Result<CreditRecord, EngineError> {
        if let Some(amount) = verified_credits.filter(|a| !a.is_finite() || *a < 0.0) {
            return Err(EngineError::InvalidAward(amount));
        }

        let record = self.update(farm_id, period, |record| {
            if record.status == CreditStatus::Issued {
                return Err(EngineError::InvalidCreditTransition {
                    from: record.status,
                    to: CreditStatus::Verified,
                });
            }
            record.status = CreditStatus::Verified;
            record.verified_credits = verified_credits.unwrap_or(record.calculated_credits);
            record.verification_date = Some(now);
            record.verifier_id = Some(verifier_id.to_string());
            if notes.is_some() {
                record.notes = notes.clone();
            }
            Ok(())
        })?;

        info!(farm_id, %period, verified = record.verified_credits, verifier_id, "credit record verified");
        Ok(record)
    }

    /// Marks the period rejected, which re-opens it for recalculation.
    pub fn mark_rejected(
        &self,
        farm_id: &str,
        period: &Period,
        verifier_id: &str,
        notes: Option<String>,
        now: TimeStamp,
    ) -> Result<CreditRecord, EngineError> {
        let record = self.update(farm_id, period, |record| {
            if record.status == CreditStatus::Issued {
                return Err(EngineError::InvalidCreditTransition {
                    from: record.status,
                    to: CreditStatus::Rejected,
                });
            }
            record.status = CreditStatus::Rejected;
            record.verification_date = Some(now);
            record.verifier_id = Some(verifier_id.to_string());
            if notes.is_some() {
                record.notes = notes.clone();
            }
            Ok(())
        })?;

        info!(farm_id, %period, verifier_id, "credit record rejected");
        Ok(record)
    }

    /// Verified -> issued. Registry settlement happens elsewhere.
    pub fn mark_issued(&self, farm_id: &str, period: &Period) -> Result<CreditRecord, EngineError> {
        let record = self.update(farm_id, period, |record| {
            if record.status != CreditStatus::Verified {
                return Err(EngineError::InvalidCreditTransition {
                    from: record.status,
                    to: CreditStatus::Issued,
                });
            }
            record.status = CreditStatus::Issued;
            Ok(())
        })?;

        info!(farm_id, %period, credits = record.verified_credits, "credit record issued");
        Ok(record)
    }

    pub fn get(&self, farm_id: &str, period: &Period) -> Result<Option<CreditRecord>, EngineError> {
        self.tree
            .get(utils::period_key(farm_id, period))?
            .map(|bytes| utils::from_cbor(&bytes))
            .transpose()
    }

    /// All records of a farm, oldest period first.
    pub fn list(&self, farm_id: &str) -> Result<Vec<CreditRecord>, EngineError> {
        self.tree
            .scan_prefix(utils::farm_prefix(farm_id))
            .values()
            .map(|bytes| utils::from_cbor(&bytes?))
            .collect()
    }

    pub fn total_verified(&self, farm_id: &str) -> Result<f64, EngineError> {
        Ok(self.list(farm_id)?.iter().map(|r| r.verified_credits).sum())
    }

    pub fn list_by_status(&self, status: CreditStatus) -> Result<Vec<CreditRecord>, EngineError> {
        let mut records = vec![];
        for bytes in self.tree.iter().values() {
            let record: CreditRecord = utils::from_cbor(&bytes?)?;
            if record.status == status {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Drops every record of the farm in one batch. Returns how many were removed.
    pub fn remove_farm(&self, farm_id: &str) -> Result<usize, EngineError> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for key in self.tree.scan_prefix(utils::farm_prefix(farm_id)).keys() {
            batch.remove(key?);
            removed += 1;
        }
        self.tree.apply_batch(batch)?;
        Ok(removed)
    }

    // read-modify-write of a single record inside a transaction
    fn update<F>(&self, farm_id: &str, period: &Period, apply: F) -> Result<CreditRecord, EngineError>
    where
        F: Fn(&mut CreditRecord) -> Result<(), EngineError>,
    {
        let key = utils::period_key(farm_id, period);

        let record = self.tree.transaction(|tx| -> ConflictableTransactionResult<CreditRecord, EngineError> {
            let Some(bytes) = tx.get(key.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(EngineError::not_found(
                    RecordKind::CreditRecord,
                    key.clone(),
                )));
            };
            let mut record: CreditRecord = utils::from_cbor(&bytes).map_err(ConflictableTransactionError::Abort)?;
            apply(&mut record).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(key.as_bytes(), utils::to_cbor(&record).map_err(ConflictableTransactionError::Abort)?)?;
            Ok(record)
        })?;
        Ok(record)
    }
}
