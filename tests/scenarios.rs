use std::sync::Arc;

use anyhow::Context;
use carbon_credit_engine::{
    CarbonService, CreditStatus, CropType, EngineError, Evidence, EvidenceKind, FarmDetails, FixedClock,
    GroundTruthObservation, MethodologyConfig, Period, Practice, SatelliteObservation, TimeStamp,
    TransitionFields, VerificationStatus,
};
use sled::open;
use tempfile::{TempDir, tempdir};

// Sled uses file-based locking, so every test gets its own database under a
// temp dir that is cleaned up when the TempDir drops.
fn service_at(name: &str, now: TimeStamp) -> anyhow::Result<(TempDir, CarbonService)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join(name))?);
    let service = CarbonService::with_config(db, MethodologyConfig::default(), Arc::new(FixedClock(now)))?;
    Ok((temp_dir, service))
}

fn day(year: i32, month: u32, d: u32) -> TimeStamp {
    TimeStamp::on(year, month, d).expect("valid test date")
}

fn rice_farm(service: &CarbonService) -> anyhow::Result<String> {
    let farm = service.register_farm(
        FarmDetails::new()
            .set_name("Paddy North")
            .set_farmer("user_1farmer", "Asha")
            .set_area(2.0)
            .set_crop_type(CropType::Rice)
            .add_practice(Practice::AlternateWettingDrying)
            .set_establishment_date(day(2019, 5, 1)),
    )?;
    Ok(farm.id)
}

fn observe(service: &CarbonService, farm_id: &str, date: TimeStamp, soc: f64, cloud: f64) -> anyhow::Result<()> {
    service.record_ground_truth(
        farm_id,
        GroundTruthObservation::new(date, "user_1farmer").with_soil_organic_carbon(soc),
    )?;
    service.record_satellite_observation(farm_id, SatelliteObservation::new(date, "sentinel-2", cloud, 0.62))?;
    Ok(())
}

#[test]
fn calculate_rice_credits_for_current_quarter() -> anyhow::Result<()> {
    let (_dir, service) = service_at("calculate_rice.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 11, 2), 1.5, 0.1)?;

    // no period supplied: resolved from the clock
    let outcome = service.calculate(&farm_id, None).context("calculation failed")?;

    assert_eq!(outcome.period.to_string(), "2023-Q4");
    assert_eq!(outcome.methodology, "rice_AWD");
    assert!((outcome.calculated_credits - 11.8272).abs() < 1e-9);
    assert!(outcome.validation.is_valid);
    assert_eq!(outcome.status, CreditStatus::Pending);

    let credits = service.list_credits(&farm_id)?;
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].status, CreditStatus::Pending);
    assert_eq!(credits[0].verified_credits, 0.0);

    Ok(())
}

#[test]
fn recalculation_is_refused_until_rejected() -> anyhow::Result<()> {
    let (_dir, service) = service_at("recalculation.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 11, 2), 1.5, 0.1)?;
    let q4: Period = "2023-Q4".parse()?;

    service.calculate(&farm_id, Some(q4))?;

    let err = service.calculate(&farm_id, Some(q4)).unwrap_err();
    assert!(matches!(err, EngineError::DuplicatePeriod { .. }));
    assert!(err.is_conflict());

    // new evidence arrives, then the period is rejected and recalculated
    service.record_ground_truth(
        &farm_id,
        GroundTruthObservation::new(day(2023, 12, 1), "user_1verifier").with_soil_organic_carbon(2.0),
    )?;
    service.reject_credits(&farm_id, &q4, "user_1verifier", Some("stale soil sample".into()))?;

    let outcome = service.calculate(&farm_id, Some(q4))?;
    // 21.504 - 2 x 3.2 x 0.5 x 0.8 x 120 x 28 / 1000
    assert!((outcome.calculated_credits - 12.9024).abs() < 1e-9);

    let credits = service.list_credits(&farm_id)?;
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].status, CreditStatus::Pending);
    assert!((credits[0].calculated_credits - 12.9024).abs() < 1e-9);

    Ok(())
}

#[test]
fn missing_imagery_stores_requires_data() -> anyhow::Result<()> {
    let (_dir, service) = service_at("requires_data.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    service.record_ground_truth(
        &farm_id,
        GroundTruthObservation::new(day(2023, 10, 20), "user_1farmer").with_soil_organic_carbon(1.5),
    )?;

    let outcome = service.calculate(&farm_id, None)?;

    assert!(!outcome.validation.is_valid);
    assert_eq!(outcome.status, CreditStatus::RequiresData);
    assert!(outcome.calculated_credits > 0.0);
    assert!(service.list_pending_verifications()?.is_empty());

    Ok(())
}

#[test]
fn calculation_errors_are_typed() -> anyhow::Result<()> {
    let (_dir, service) = service_at("errors.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    // only data from the previous quarter
    observe(&service, &farm_id, day(2023, 9, 30), 1.5, 0.1)?;

    let err = service.calculate(&farm_id, None).unwrap_err();
    assert!(matches!(err, EngineError::InsufficientData { ref period, .. } if period == "2023-Q4"));
    assert!(err.is_retryable());
    assert!(service.list_credits(&farm_id)?.is_empty());

    let err = service.calculate("farm_1unknown", None).unwrap_err();
    assert!(err.is_not_found());

    Ok(())
}

#[test]
fn approval_writes_verified_credits_back_to_ledger() -> anyhow::Result<()> {
    let (_dir, service) = service_at("approval.db", day(2023, 9, 28))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 8, 14), 1.5, 0.05)?;
    let q3: Period = "2023-Q3".parse()?;
    let calculated = service.calculate(&farm_id, Some(q3))?.calculated_credits;

    let verification = service.open_verification(&farm_id, &q3, "user_1verifier")?;
    service.attach_evidence(
        &verification.id,
        vec![Evidence::new(
            EvidenceKind::GroundTruth,
            "https://evidence.example/soil.pdf",
            "soil sample",
            day(2023, 9, 20),
        )],
    )?;

    let approved = service
        .transition_verification(
            &verification.id,
            VerificationStatus::Approved,
            TransitionFields::new().set_award(14.8).set_notes("field visit confirmed AWD"),
            "user_1verifier",
        )
        .context("approval failed")?;
    assert_eq!(approved.status, VerificationStatus::Approved);
    assert_eq!(approved.evidence.len(), 1);

    let record = &service.list_credits(&farm_id)?[0];
    assert_eq!(record.status, CreditStatus::Verified);
    assert_eq!(record.verified_credits, 14.8);
    assert_eq!(record.verifier_id.as_deref(), Some("user_1verifier"));
    assert_eq!(record.verification_date, Some(day(2023, 9, 28)));
    assert_eq!(record.calculated_credits, calculated);
    assert_eq!(service.total_verified_credits(&farm_id)?, 14.8);

    let issued = service.issue_credits(&farm_id, &q3)?;
    assert_eq!(issued.status, CreditStatus::Issued);

    Ok(())
}

#[test]
fn failed_ledger_sync_keeps_the_approval() -> anyhow::Result<()> {
    let (_dir, service) = service_at("reconciliation.db", day(2023, 9, 28))?;
    let farm_id = rice_farm(&service)?;
    let q3: Period = "2023-Q3".parse()?;

    // no ledger entry for the period yet
    let verification = service.open_verification(&farm_id, &q3, "user_1verifier")?;
    let err = service
        .transition_verification(
            &verification.id,
            VerificationStatus::Approved,
            TransitionFields::new().set_award(5.0),
            "user_1verifier",
        )
        .unwrap_err();

    match &err {
        EngineError::Reconciliation { verification: committed, source } => {
            assert_eq!(committed.status, VerificationStatus::Approved);
            assert!(source.is_not_found());
        }
        other => panic!("expected a reconciliation error, got {other}"),
    }
    assert_eq!(service.get_verification(&verification.id)?.status, VerificationStatus::Approved);

    // operator fixes the ledger and replays the sync
    observe(&service, &farm_id, day(2023, 8, 14), 1.5, 0.05)?;
    service.calculate(&farm_id, Some(q3))?;
    let record = service.reconcile_verification(&verification.id)?;

    assert_eq!(record.status, CreditStatus::Verified);
    assert_eq!(record.verified_credits, 5.0);

    Ok(())
}

#[test]
fn zero_award_approval_leaves_ledger_alone() -> anyhow::Result<()> {
    let (_dir, service) = service_at("zero_award.db", day(2023, 9, 28))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 8, 14), 1.5, 0.05)?;
    let q3: Period = "2023-Q3".parse()?;
    service.calculate(&farm_id, Some(q3))?;

    let verification = service.open_verification(&farm_id, &q3, "user_1verifier")?;
    let approved = service.transition_verification(
        &verification.id,
        VerificationStatus::Approved,
        TransitionFields::new(),
        "user_1verifier",
    )?;

    assert_eq!(approved.carbon_credits_awarded, 0.0);
    assert_eq!(service.list_credits(&farm_id)?[0].status, CreditStatus::Pending);

    // replaying the sync must not write a zero verified amount either
    let err = service.reconcile_verification(&verification.id).unwrap_err();
    assert!(matches!(err, EngineError::NoAwardToSync(ref id) if *id == verification.id));
    assert_eq!(service.list_credits(&farm_id)?[0].status, CreditStatus::Pending);

    Ok(())
}

#[test]
fn one_active_verification_per_period() -> anyhow::Result<()> {
    let (_dir, service) = service_at("duplicate_verification.db", day(2023, 9, 28))?;
    let farm_id = rice_farm(&service)?;
    let q3: Period = "2023-Q3".parse()?;

    let first = service.open_verification(&farm_id, &q3, "user_1verifier")?;
    let err = service.open_verification(&farm_id, &q3, "user_1other").unwrap_err();
    assert!(matches!(err, EngineError::DuplicateVerification { .. }));

    service.transition_verification(
        &first.id,
        VerificationStatus::Rejected,
        TransitionFields::new().set_rejection_reason("imagery does not match boundary"),
        "user_1verifier",
    )?;
    let second = service.open_verification(&farm_id, &q3, "user_1other")?;

    let history = service.verifications_for_farm(&farm_id)?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|v| v.id == first.id && v.status == VerificationStatus::Rejected));
    assert_eq!(service.verifications_by_status(VerificationStatus::Pending)?[0].id, second.id);

    assert!(service.open_verification("farm_1unknown", &q3, "user_1verifier").unwrap_err().is_not_found());

    Ok(())
}

#[test]
fn pending_queue_is_denormalised() -> anyhow::Result<()> {
    let (_dir, service) = service_at("pending_queue.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 11, 2), 1.5, 0.1)?;
    let outcome = service.calculate(&farm_id, None)?;

    let pending = service.list_pending_verifications()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].farm_id, farm_id);
    assert_eq!(pending[0].farm_name, "Paddy North");
    assert_eq!(pending[0].farmer_name, "Asha");
    assert_eq!(pending[0].crop_type, CropType::Rice);
    assert_eq!(pending[0].calculated_credits, outcome.calculated_credits);

    let json = serde_json::to_value(&pending[0])?;
    assert_eq!(json["farmName"], "Paddy North");
    assert_eq!(json["period"], "2023-Q4");
    assert_eq!(json["cropType"], "rice");

    Ok(())
}

#[test]
fn removing_a_farm_drops_its_ledger_but_not_verifications() -> anyhow::Result<()> {
    let (_dir, service) = service_at("remove_farm.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 11, 2), 1.5, 0.1)?;
    service.calculate(&farm_id, None)?;
    let verification = service.open_verification(&farm_id, &"2023-Q4".parse()?, "user_1verifier")?;

    service.remove_farm(&farm_id)?;

    assert!(service.get_farm(&farm_id).unwrap_err().is_not_found());
    assert!(service.list_credits(&farm_id).unwrap_err().is_not_found());
    assert!(service.list_pending_verifications()?.is_empty());
    assert_eq!(service.get_verification(&verification.id)?.farm_id, farm_id);

    Ok(())
}

#[test]
fn credit_records_keep_their_field_names() -> anyhow::Result<()> {
    let (_dir, service) = service_at("field_names.db", day(2023, 12, 15))?;
    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 11, 2), 1.5, 0.1)?;
    service.calculate(&farm_id, None)?;

    let json = serde_json::to_value(&service.list_credits(&farm_id)?[0])?;
    for field in ["period", "calculatedCredits", "verifiedCredits", "status", "verificationDate", "verifierId"] {
        assert!(json.get(field).is_some(), "missing {field}");
    }
    assert_eq!(json["status"], "pending");

    Ok(())
}

#[test]
fn farms_and_ledger_survive_a_reopen_with_custom_parameters() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let path = temp_dir.path().join("reopen.db");
    let mut config = MethodologyConfig::default();
    config.rice.emission_factor = 6.4;

    let clock = Arc::new(FixedClock(day(2023, 12, 15)));
    let service = CarbonService::with_config(Arc::new(open(&path)?), config, clock.clone())?;
    assert_eq!(service.config().rice.emission_factor, 6.4);

    let farm_id = rice_farm(&service)?;
    observe(&service, &farm_id, day(2023, 11, 2), 1.5, 0.1)?;
    let outcome = service.calculate(&farm_id, None)?;
    // both emissions scale with the factor, so the worked example doubles
    assert!((outcome.calculated_credits - 2.0 * 11.8272).abs() < 1e-9);

    service.flush().context("flush failed")?;
    drop(service);

    let reopened = CarbonService::with_config(Arc::new(open(&path)?), MethodologyConfig::default(), clock)?;
    let farms = reopened.list_farms()?;
    assert_eq!(farms.len(), 1);
    assert_eq!(farms[0].id, farm_id);
    assert_eq!(farms[0].ground_truth_data.len(), 1);
    assert_eq!(reopened.config().rice.emission_factor, 3.2);
    assert_eq!(reopened.list_credits(&farm_id)?[0].calculated_credits, outcome.calculated_credits);

    Ok(())
}
