//! Verification audit records and their state machine.
//!
//! A [`Verification`] is owned by no farm document. It is keyed by its own
//! id, and a second tree indexes the one non-rejected review allowed per
//! `(farm, period)`. Both trees change in the same sled transaction.
use std::fmt;

use serde::{Deserialize, Serialize};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use tracing::{info, warn};

use crate::clock::TimeStamp;
use crate::error::{EngineError, RecordKind};
use crate::period::Period;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    RequiresChanges,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Approved => "approved",
            VerificationStatus::Rejected => "rejected",
            VerificationStatus::RequiresChanges => "requires_changes",
        }
    }

    /// Pending and requires_changes may still move; approved and rejected are final.
    pub fn accepts_transitions(&self) -> bool {
        matches!(self, VerificationStatus::Pending | VerificationStatus::RequiresChanges)
    }

    /// Statuses a review may be moved into.
    pub fn is_transition_target(&self) -> bool {
        !matches!(self, VerificationStatus::Pending)
    }

    /// Everything but a rejection holds the `(farm, period)` slot.
    pub fn holds_period(&self) -> bool {
        !matches!(self, VerificationStatus::Rejected)
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    #[n(0)]
    Image,
    #[n(1)]
    Document,
    #[n(2)]
    Satellite,
    #[n(3)]
    GroundTruth,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    #[n(0)]
    #[serde(rename = "type")]
    pub kind: EvidenceKind,
    #[n(1)]
    pub url: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub timestamp: TimeStamp,
}

impl Evidence {
    pub fn new(kind: EvidenceKind, url: impl Into<String>, description: impl Into<String>, timestamp: TimeStamp) -> Self {
        Self {
            kind,
            url: url.into(),
            description: description.into(),
            timestamp,
        }
    }
}

/// One entry in a verification's history, written on every transition.
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    #[n(0)]
    pub from: VerificationStatus,
    #[n(1)]
    pub to: VerificationStatus,
    #[n(2)]
    pub actor: String,
    #[n(3)]
    pub timestamp: TimeStamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    #[n(0)]
    pub id: String, // bech32 `verif_1...`
    #[n(1)]
    pub farm_id: String,
    #[n(2)]
    pub verifier_id: String,
    #[n(3)]
    pub period: Period,
    #[n(4)]
    pub status: VerificationStatus,
    #[n(5)]
    pub verification_date: TimeStamp,
    #[n(6)]
    pub notes: Option<String>,
    #[n(7)]
    pub evidence: Vec<Evidence>,
    #[n(8)]
    pub carbon_credits_awarded: f64,
    #[n(9)]
    pub rejection_reason: Option<String>,
    #[n(10)]
    pub requires_action: bool,
    #[n(11)]
    pub action_items: Vec<String>,
    #[n(12)]
    pub history: Vec<StatusChange>,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub updated_at: TimeStamp,
}

/// Optional fields carried by a status transition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransitionFields {
    pub notes: Option<String>,
    pub carbon_credits_awarded: Option<f64>,
    pub rejection_reason: Option<String>,
    pub requires_action: Option<bool>,
    pub action_items: Vec<String>,
    pub evidence: Vec<Evidence>,
}

impl TransitionFields {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
    pub fn set_award(mut self, tons: f64) -> Self {
        self.carbon_credits_awarded = Some(tons);
        self
    }
    pub fn set_rejection_reason(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = Some(reason.into());
        self
    }
    pub fn add_action_item(mut self, item: impl Into<String>) -> Self {
        self.requires_action = Some(true);
        self.action_items.push(item.into());
        self
    }
    pub fn add_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }
}

#[derive(Clone)]
pub struct VerificationRegistry {
    records: sled::Tree,
    active: sled::Tree, // farm_id/period -> verification id
}

impl VerificationRegistry {
    pub fn new(records: sled::Tree, active: sled::Tree) -> Self {
        Self { records, active }
    }

    /// Opens a pending review. Fails with [`EngineError::DuplicateVerification`]
    /// while a non-rejected review exists for the same `(farm, period)`.
    pub fn open(
        &self,
        farm_id: &str,
        period: &Period,
        verifier_id: &str,
        now: TimeStamp,
    ) -> Result<Verification, EngineError> {
        let key = utils::period_key(farm_id, period);
        let verification = Verification {
            id: utils::new_uuid_to_bech32("verif_")?,
            farm_id: farm_id.to_string(),
            verifier_id: verifier_id.to_string(),
            period: *period,
            status: VerificationStatus::Pending,
            verification_date: now,
            notes: None,
            evidence: vec![],
            carbon_credits_awarded: 0.0,
            rejection_reason: None,
            requires_action: false,
            action_items: vec![],
            history: vec![],
            created_at: now,
            updated_at: now,
        };
        let encoded = utils::to_cbor(&verification)?;

        (&self.records, &self.active).transaction(
            |(records, active)| -> ConflictableTransactionResult<(), EngineError> {
                if let Some(existing_id) = active.get(key.as_bytes())? {
                    let existing = match records.get(&existing_id)? {
                        Some(bytes) => Some(
                            utils::from_cbor::<Verification>(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        ),
                        None => None,
                    };
                    if let Some(existing) = existing.filter(|v| v.status.holds_period()) {
                        return Err(ConflictableTransactionError::Abort(EngineError::DuplicateVerification {
                            farm_id: farm_id.to_string(),
                            period: period.to_string(),
                            existing_id: existing.id,
                        }));
                    }
                }
                records.insert(verification.id.as_bytes(), encoded.clone())?;
                active.insert(key.as_bytes(), verification.id.as_bytes())?;
                Ok(())
            },
        )?;

        info!(verification_id = %verification.id, farm_id, %period, verifier_id, "verification opened");
        Ok(verification)
    }

    pub fn get(&self, id: &str) -> Result<Verification, EngineError> {
        match self.records.get(id)? {
            Some(bytes) => utils::from_cbor(&bytes),
            None => Err(EngineError::not_found(RecordKind::Verification, id)),
        }
    }

    /// Appends evidence in order. Prior items are never touched.
    pub fn attach_evidence(&self, id: &str, items: Vec<Evidence>, now: TimeStamp) -> Result<Verification, EngineError> {
        let count = items.len();
        let verification = self.records.transaction(|records| -> ConflictableTransactionResult<Verification, EngineError> {
            let Some(bytes) = records.get(id)? else {
                return Err(ConflictableTransactionError::Abort(EngineError::not_found(
                    RecordKind::Verification,
                    id,
                )));
            };
            let mut verification: Verification =
                utils::from_cbor(&bytes).map_err(ConflictableTransactionError::Abort)?;
            verification.evidence.extend(items.iter().cloned());
            verification.updated_at = now;
            records.insert(id.as_bytes(), utils::to_cbor(&verification).map_err(ConflictableTransactionError::Abort)?)?;
            Ok(verification)
        })?;

        info!(verification_id = id, count, total = verification.evidence.len(), "evidence attached");
        Ok(verification)
    }

    /// Moves a pending or requires_changes review to `to`.
    pub fn transition(
        &self,
        id: &str,
        to: VerificationStatus,
        fields: &TransitionFields,
        actor: &str,
        now: TimeStamp,
    ) -> Result<Verification, EngineError> {
        let award = match (to, fields.carbon_credits_awarded) {
            (VerificationStatus::Approved, None) => {
                warn!(verification_id = id, "approved without an award, recording 0 credits");
                Some(0.0)
            }
            (_, award) => award,
        };
        if let Some(award) = award.filter(|a| !a.is_finite() || *a < 0.0) {
            return Err(EngineError::InvalidAward(award));
        }
        if to == VerificationStatus::Rejected && fields.rejection_reason.is_none() {
            warn!(verification_id = id, "rejected without a reason");
        }

        let verification = (&self.records, &self.active).transaction(
            |(records, active)| -> ConflictableTransactionResult<Verification, EngineError> {
                let Some(bytes) = records.get(id)? else {
                    return Err(ConflictableTransactionError::Abort(EngineError::not_found(
                        RecordKind::Verification,
                        id,
                    )));
                };
                let mut verification: Verification =
                    utils::from_cbor(&bytes).map_err(ConflictableTransactionError::Abort)?;

                let from = verification.status;
                if !from.accepts_transitions() || !to.is_transition_target() {
                    return Err(ConflictableTransactionError::Abort(EngineError::InvalidTransition { from, to }));
                }

                verification.status = to;
                verification.verification_date = now;
                verification.updated_at = now;
                if let Some(award) = award {
                    verification.carbon_credits_awarded = award;
                }
                if fields.notes.is_some() {
                    verification.notes = fields.notes.clone();
                }
                if fields.rejection_reason.is_some() {
                    verification.rejection_reason = fields.rejection_reason.clone();
                }
                if let Some(requires_action) = fields.requires_action {
                    verification.requires_action = requires_action;
                }
                verification.action_items.extend(fields.action_items.iter().cloned());
                verification.evidence.extend(fields.evidence.iter().cloned());
                verification.history.push(StatusChange {
                    from,
                    to,
                    actor: actor.to_string(),
                    timestamp: now,
                });

                if !to.holds_period() {
                    let key = utils::period_key(&verification.farm_id, &verification.period);
                    // only free the slot if it still points at this review
                    if active.get(key.as_bytes())?.as_deref() == Some(id.as_bytes()) {
                        active.remove(key.as_bytes())?;
                    }
                }
                records.insert(id.as_bytes(), utils::to_cbor(&verification).map_err(ConflictableTransactionError::Abort)?)?;
                Ok(verification)
            },
        )?;

        info!(
            verification_id = id,
            farm_id = %verification.farm_id,
            period = %verification.period,
            status = %verification.status,
            awarded = verification.carbon_credits_awarded,
            actor,
            "verification transitioned"
        );
        Ok(verification)
    }

    /// The review currently holding `(farm, period)`, if any.
    pub fn active_for(&self, farm_id: &str, period: &Period) -> Result<Option<Verification>, EngineError> {
        match self.active.get(utils::period_key(farm_id, period))? {
            Some(id) => {
                let id = String::from_utf8(id.to_vec()).map_err(|e| EngineError::Codec(e.to_string()))?;
                self.get(&id).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Reviews of a farm, most recent verification date first.
    pub fn list_for_farm(&self, farm_id: &str) -> Result<Vec<Verification>, EngineError> {
        let mut found = self.filter(|v| v.farm_id == farm_id)?;
        found.sort_by(|a, b| b.verification_date.cmp(&a.verification_date));
        Ok(found)
    }

    /// Reviews in `status`, newest first.
    pub fn list_by_status(&self, status: VerificationStatus) -> Result<Vec<Verification>, EngineError> {
        let mut found = self.filter(|v| v.status == status)?;
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn filter(&self, keep: impl Fn(&Verification) -> bool) -> Result<Vec<Verification>, EngineError> {
        let mut found = vec![];
        for bytes in self.records.iter().values() {
            let verification: Verification = utils::from_cbor(&bytes?)?;
            if keep(&verification) {
                found.push(verification);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, VerificationRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("verifications.db")).unwrap();
        let registry = VerificationRegistry::new(
            db.open_tree("verifications").unwrap(),
            db.open_tree("active_verifications").unwrap(),
        );
        (dir, registry)
    }

    fn q3() -> Period {
        "2023-Q3".parse().unwrap()
    }

    #[test]
    fn open_creates_pending_review() {
        let (_dir, registry) = registry();

        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();
        assert!(v.id.starts_with("verif_1"));
        assert_eq!(v.status, VerificationStatus::Pending);
        assert_eq!(registry.get(&v.id).unwrap(), v);
        assert_eq!(registry.active_for("farm_1a", &q3()).unwrap(), Some(v));
    }

    #[test]
    fn second_open_for_same_period_is_duplicate() {
        let (_dir, registry) = registry();
        let first = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();

        let err = registry.open("farm_1a", &q3(), "user_1w", TimeStamp::new()).unwrap_err();
        match err {
            EngineError::DuplicateVerification { existing_id, .. } => assert_eq!(existing_id, first.id),
            other => panic!("unexpected error: {other}"),
        }

        // other periods and farms are independent
        assert!(registry.open("farm_1a", &"2023-Q4".parse().unwrap(), "user_1v", TimeStamp::new()).is_ok());
        assert!(registry.open("farm_1b", &q3(), "user_1v", TimeStamp::new()).is_ok());
    }

    #[test]
    fn rejection_frees_the_period_but_approval_does_not() {
        let (_dir, registry) = registry();
        let first = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();
        registry
            .transition(&first.id, VerificationStatus::Rejected, &TransitionFields::new(), "user_1v", TimeStamp::new())
            .unwrap();

        let second = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();
        registry
            .transition(&second.id, VerificationStatus::Approved, &TransitionFields::new().set_award(3.0), "user_1v", TimeStamp::new())
            .unwrap();

        assert!(registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).is_err());
    }

    #[test]
    fn terminal_states_refuse_transitions() {
        let (_dir, registry) = registry();
        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();
        registry
            .transition(&v.id, VerificationStatus::Approved, &TransitionFields::new().set_award(1.0), "user_1v", TimeStamp::new())
            .unwrap();

        let err = registry
            .transition(&v.id, VerificationStatus::Rejected, &TransitionFields::new(), "user_1v", TimeStamp::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: VerificationStatus::Approved,
                to: VerificationStatus::Rejected
            }
        ));
    }

    #[test]
    fn requires_changes_loops_back_for_review() {
        let (_dir, registry) = registry();
        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();

        let fields = TransitionFields::new().add_action_item("Upload soil lab report");
        let v = registry
            .transition(&v.id, VerificationStatus::RequiresChanges, &fields, "user_1v", TimeStamp::new())
            .unwrap();
        assert!(v.requires_action);
        assert_eq!(v.action_items, vec!["Upload soil lab report".to_string()]);

        let v = registry
            .transition(&v.id, VerificationStatus::Approved, &TransitionFields::new().set_award(2.5), "user_1v", TimeStamp::new())
            .unwrap();
        let path: Vec<_> = v.history.iter().map(|h| (h.from, h.to)).collect();
        assert_eq!(
            path,
            vec![
                (VerificationStatus::Pending, VerificationStatus::RequiresChanges),
                (VerificationStatus::RequiresChanges, VerificationStatus::Approved),
            ]
        );
    }

    #[test]
    fn pending_is_not_a_transition_target() {
        let (_dir, registry) = registry();
        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();

        assert!(registry
            .transition(&v.id, VerificationStatus::Pending, &TransitionFields::new(), "user_1v", TimeStamp::new())
            .is_err());
    }

    #[test]
    fn approval_award_defaults_to_zero_and_rejects_negative() {
        let (_dir, registry) = registry();
        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();

        let err = registry
            .transition(&v.id, VerificationStatus::Approved, &TransitionFields::new().set_award(-1.0), "user_1v", TimeStamp::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAward(_)));
        assert_eq!(registry.get(&v.id).unwrap().status, VerificationStatus::Pending);

        let v = registry
            .transition(&v.id, VerificationStatus::Approved, &TransitionFields::new(), "user_1v", TimeStamp::new())
            .unwrap();
        assert_eq!(v.carbon_credits_awarded, 0.0);
    }

    #[test]
    fn rejection_reason_is_optional() {
        let (_dir, registry) = registry();
        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();

        let v = registry
            .transition(&v.id, VerificationStatus::Rejected, &TransitionFields::new(), "user_1v", TimeStamp::new())
            .unwrap();
        assert_eq!(v.rejection_reason, None);
    }

    #[test]
    fn evidence_is_appended_in_order() {
        let (_dir, registry) = registry();
        let v = registry.open("farm_1a", &q3(), "user_1v", TimeStamp::new()).unwrap();
        let photo = Evidence::new(EvidenceKind::Image, "https://img/1.jpg", "canopy", TimeStamp::new());
        let scene = Evidence::new(EvidenceKind::Satellite, "https://sat/2.tif", "NDVI scene", TimeStamp::new());
        let report = Evidence::new(EvidenceKind::Document, "https://doc/3.pdf", "soil lab", TimeStamp::new());

        registry.attach_evidence(&v.id, vec![photo.clone()], TimeStamp::new()).unwrap();
        let v = registry
            .attach_evidence(&v.id, vec![scene.clone(), report.clone()], TimeStamp::new())
            .unwrap();

        assert_eq!(v.evidence, vec![photo, scene, report]);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let (_dir, registry) = registry();

        assert!(registry.get("verif_1missing").unwrap_err().is_not_found());
        assert!(registry
            .attach_evidence("verif_1missing", vec![], TimeStamp::new())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn evidence_kind_serialises_as_type() {
        let e = Evidence::new(EvidenceKind::GroundTruth, "u", "d", TimeStamp::new());
        let json = serde_json::to_value(&e).unwrap();

        assert_eq!(json["type"], "ground_truth");
    }
}
