//! Service layer API for credit calculation and verification workflows
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock, TimeStamp};
use crate::config::MethodologyConfig;
use crate::error::{EngineError, RecordKind};
use crate::farm::{CropType, Farm, FarmDetails, GroundTruthObservation, SatelliteObservation};
use crate::ledger::{CreditLedger, CreditRecord, CreditStatus, RecalculationPolicy};
use crate::methodology::{self, CreditBreakdown, MethodologyError};
use crate::period::Period;
use crate::store::FarmStore;
use crate::validation::{self, ValidationReport};
use crate::verification::{Evidence, TransitionFields, Verification, VerificationRegistry, VerificationStatus};

/// Result of a successful calculation, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationOutcome {
    pub period: Period,
    pub calculated_credits: f64,
    pub methodology: String,
    pub validation: ValidationReport,
    pub breakdown: CreditBreakdown,
    pub status: CreditStatus,
}

/// Review-queue row: a pending ledger entry joined with its farm.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingVerification {
    pub farm_id: String,
    pub farm_name: String,
    pub farmer_name: String,
    pub period: Period,
    pub calculated_credits: f64,
    pub crop_type: CropType,
}

pub struct CarbonService {
    instance: Arc<sled::Db>,
    farms: FarmStore,
    ledger: CreditLedger,
    verifications: VerificationRegistry,
    config: MethodologyConfig,
    clock: Arc<dyn Clock>,
}

impl CarbonService {
    /// Default methodology parameters and the system clock.
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, EngineError> {
        Self::with_config(instance, MethodologyConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(
        instance: Arc<sled::Db>,
        config: MethodologyConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let farms = FarmStore::new(instance.open_tree("farms")?);
        let ledger = CreditLedger::new(instance.open_tree("credits")?, RecalculationPolicy::default());
        let verifications = VerificationRegistry::new(
            instance.open_tree("verifications")?,
            instance.open_tree("active_verifications")?,
        );

        Ok(Self {
            instance,
            farms,
            ledger,
            verifications,
            config,
            clock,
        })
    }

    pub fn with_recalculation_policy(mut self, policy: RecalculationPolicy) -> Self {
        self.ledger = self.ledger.with_policy(policy);
        self
    }

    pub fn config(&self) -> &MethodologyConfig {
        &self.config
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<usize, EngineError> {
        Ok(self.instance.flush()?)
    }

    // FARMS

    pub fn register_farm(&self, details: FarmDetails) -> Result<Farm, EngineError> {
        let farm = details.validate_and_finalise()?;
        self.farms.register(&farm)?;
        Ok(farm)
    }

    pub fn get_farm(&self, farm_id: &str) -> Result<Farm, EngineError> {
        self.farms.get(farm_id)
    }

    pub fn list_farms(&self) -> Result<Vec<Farm>, EngineError> {
        self.farms.list()
    }

    pub fn record_ground_truth(&self, farm_id: &str, observation: GroundTruthObservation) -> Result<Farm, EngineError> {
        self.farms.record_ground_truth(farm_id, observation)
    }

    pub fn record_satellite_observation(
        &self,
        farm_id: &str,
        observation: SatelliteObservation,
    ) -> Result<Farm, EngineError> {
        self.farms.record_satellite(farm_id, observation)
    }

    /// Removes the farm and its ledger. Verifications are audit records and stay.
    pub fn remove_farm(&self, farm_id: &str) -> Result<(), EngineError> {
        self.ensure_farm(farm_id)?;
        let removed = self.ledger.remove_farm(farm_id)?;
        self.farms.remove(farm_id)?;

        info!(farm_id, credit_records = removed, "farm removed");
        Ok(())
    }

    // CALCULATION

    pub fn validate(&self, farm_id: &str, period: &Period) -> Result<ValidationReport, EngineError> {
        let farm = self.farms.get(farm_id)?;
        Ok(validation::validate(&farm, period, &self.config.validation))
    }

    /// Calculates and stores the period's credits. Without a period the
    /// quarter containing the clock's current date is used.
    pub fn calculate(&self, farm_id: &str, period: Option<Period>) -> Result<CalculationOutcome, EngineError> {
        let now = self.clock.now();
        let period = period.unwrap_or_else(|| Period::containing(now.date()));
        let farm = self.farms.get(farm_id)?;

        // cheap early refusal, the ledger re-checks atomically on write
        let existing = self.ledger.get(farm_id, &period)?;
        if let Some(existing) = existing.filter(|r| !self.ledger.policy().allows(r.status)) {
            return Err(EngineError::DuplicatePeriod {
                farm_id: farm_id.to_string(),
                period: period.to_string(),
                status: existing.status,
            });
        }

        let (result, label) =
            methodology::calculate_credits(&farm, &period, now.date(), &self.config).map_err(|e| match e {
                MethodologyError::InsufficientData(period) => EngineError::InsufficientData {
                    farm_id: farm_id.to_string(),
                    period: period.to_string(),
                },
                other => {
                    error!(farm_id, %period, error = %other, "carbon calculation failed");
                    EngineError::Calculation
                }
            })?;
        let validation = validation::validate(&farm, &period, &self.config.validation);
        if !validation.is_valid {
            warn!(farm_id, %period, issues = ?validation.messages(), "period lacks verification data");
        }

        let record = self.ledger.upsert(farm_id, &period, result.credits, &validation, now)?;

        Ok(CalculationOutcome {
            period,
            calculated_credits: record.calculated_credits,
            methodology: label.to_string(),
            validation,
            breakdown: result.breakdown,
            status: record.status,
        })
    }

    // LEDGER

    pub fn list_credits(&self, farm_id: &str) -> Result<Vec<CreditRecord>, EngineError> {
        self.ensure_farm(farm_id)?;
        self.ledger.list(farm_id)
    }

    pub fn total_verified_credits(&self, farm_id: &str) -> Result<f64, EngineError> {
        self.ensure_farm(farm_id)?;
        self.ledger.total_verified(farm_id)
    }

    /// Rejects a ledger entry directly, opening it for recalculation.
    pub fn reject_credits(
        &self,
        farm_id: &str,
        period: &Period,
        verifier_id: &str,
        notes: Option<String>,
    ) -> Result<CreditRecord, EngineError> {
        self.ensure_farm(farm_id)?;
        self.ledger
            .mark_rejected(farm_id, period, verifier_id, notes, self.clock.now())
    }

    pub fn issue_credits(&self, farm_id: &str, period: &Period) -> Result<CreditRecord, EngineError> {
        self.ensure_farm(farm_id)?;
        self.ledger.mark_issued(farm_id, period)
    }

    /// Pending ledger entries joined with their farms, for review queues.
    pub fn list_pending_verifications(&self) -> Result<Vec<PendingVerification>, EngineError> {
        let mut pending = vec![];
        for record in self.ledger.list_by_status(CreditStatus::Pending)? {
            let farm = match self.farms.get(&record.farm_id) {
                Ok(farm) => farm,
                Err(e) if e.is_not_found() => {
                    warn!(farm_id = %record.farm_id, period = %record.period, "pending credits without a farm");
                    continue;
                }
                Err(e) => return Err(e),
            };
            pending.push(PendingVerification {
                farm_id: farm.id,
                farm_name: farm.name,
                farmer_name: farm.farmer_name,
                period: record.period,
                calculated_credits: record.calculated_credits,
                crop_type: farm.crop_type,
            });
        }
        Ok(pending)
    }

    // VERIFICATION

    pub fn open_verification(
        &self,
        farm_id: &str,
        period: &Period,
        verifier_id: &str,
    ) -> Result<Verification, EngineError> {
        self.ensure_farm(farm_id)?;
        self.verifications
            .open(farm_id, period, verifier_id, self.clock.now())
    }

    pub fn get_verification(&self, verification_id: &str) -> Result<Verification, EngineError> {
        self.verifications.get(verification_id)
    }

    pub fn verifications_for_farm(&self, farm_id: &str) -> Result<Vec<Verification>, EngineError> {
        self.verifications.list_for_farm(farm_id)
    }

    pub fn verifications_by_status(&self, status: VerificationStatus) -> Result<Vec<Verification>, EngineError> {
        self.verifications.list_by_status(status)
    }

    pub fn attach_evidence(&self, verification_id: &str, items: Vec<Evidence>) -> Result<Verification, EngineError> {
        self.verifications
            .attach_evidence(verification_id, items, self.clock.now())
    }

    /// Commits the transition, then syncs an approval with a non-zero award
    /// into the ledger. A failed sync never undoes the committed transition:
    /// it comes back as [`EngineError::Reconciliation`] carrying the
    /// verification as stored.
    pub fn transition_verification(
        &self,
        verification_id: &str,
        status: VerificationStatus,
        fields: TransitionFields,
        actor: &str,
    ) -> Result<Verification, EngineError> {
        let now = self.clock.now();
        let verification = self
            .verifications
            .transition(verification_id, status, &fields, actor, now)?;

        if verification.status == VerificationStatus::Approved && verification.carbon_credits_awarded > 0.0 {
            self.sync_ledger(verification, actor, now)
        } else {
            Ok(verification)
        }
    }

    /// Replays the ledger sync for an approved verification, for operators
    /// resolving a [`EngineError::Reconciliation`]. Approvals without an
    /// award are refused with [`EngineError::NoAwardToSync`].
    pub fn reconcile_verification(&self, verification_id: &str) -> Result<CreditRecord, EngineError> {
        let verification = self.verifications.get(verification_id)?;
        if verification.status != VerificationStatus::Approved {
            return Err(EngineError::InvalidTransition {
                from: verification.status,
                to: VerificationStatus::Approved,
            });
        }
        // zero awards never sync, so there is nothing to replay
        if verification.carbon_credits_awarded <= 0.0 {
            return Err(EngineError::NoAwardToSync(verification.id));
        }
        let approver = verification
            .history
            .iter()
            .rev()
            .find(|change| change.to == VerificationStatus::Approved)
            .map(|change| change.actor.clone())
            .unwrap_or_else(|| verification.verifier_id.clone());

        let record = self.ledger.mark_verified(
            &verification.farm_id,
            &verification.period,
            Some(verification.carbon_credits_awarded),
            &approver,
            verification.notes.clone(),
            self.clock.now(),
        )?;

        info!(verification_id, farm_id = %record.farm_id, period = %record.period, "ledger reconciled");
        Ok(record)
    }

    fn sync_ledger(&self, verification: Verification, actor: &str, now: TimeStamp) -> Result<Verification, EngineError> {
        let synced = self.ledger.mark_verified(
            &verification.farm_id,
            &verification.period,
            Some(verification.carbon_credits_awarded),
            actor,
            verification.notes.clone(),
            now,
        );

        match synced {
            Ok(_) => Ok(verification),
            Err(source) => {
                error!(
                    verification_id = %verification.id,
                    farm_id = %verification.farm_id,
                    period = %verification.period,
                    error = %source,
                    "verification approved but credit ledger sync failed"
                );
                Err(EngineError::Reconciliation {
                    verification: Box::new(verification),
                    source: Box::new(source),
                })
            }
        }
    }

    fn ensure_farm(&self, farm_id: &str) -> Result<(), EngineError> {
        if self.farms.contains(farm_id)? {
            Ok(())
        } else {
            Err(EngineError::not_found(RecordKind::Farm, farm_id))
        }
    }
}
