//! Per-crop credit methodologies.
//!
//! Every calculator is a pure function of the farm aggregate, the reporting
//! period and an explicit `as_of` date. Nothing here reads the clock or the
//! store.
mod agroforestry;
mod rice;

pub use agroforestry::{Agroforestry, soil_carbon, tree_carbon};
pub use rice::{Rice, baseline_emission, project_emission_factor};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MethodologyConfig;
use crate::farm::{CropType, Farm, GroundTruthObservation};
use crate::period::Period;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MethodologyError {
    #[error("No ground truth data available for period {0}")]
    InsufficientData(Period),
    #[error("{component} evaluated to a non-finite value ({value})")]
    NonFinite { component: &'static str, value: f64 },
}

/// Components behind a credit figure, in tons CO2e. Terms a methodology does
/// not use stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBreakdown {
    pub baseline_emission: f64,
    pub project_emission: f64,
    pub tree_carbon: f64,
    pub soil_carbon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodologyResult {
    pub credits: f64,
    pub breakdown: CreditBreakdown,
}

pub trait CreditMethodology {
    /// Label reported to callers alongside the figure.
    fn label(&self) -> &'static str;

    fn calculate(
        &self,
        farm: &Farm,
        period: &Period,
        as_of: NaiveDate,
    ) -> Result<MethodologyResult, MethodologyError>;
}

/// Rice and agroforestry computed independently over the same observations.
pub struct Mixed<'a> {
    rice: Rice<'a>,
    agroforestry: Agroforestry<'a>,
}

impl<'a> Mixed<'a> {
    pub fn new(config: &'a MethodologyConfig) -> Self {
        Self {
            rice: Rice::new(&config.rice),
            agroforestry: Agroforestry::new(&config.agroforestry),
        }
    }
}

impl CreditMethodology for Mixed<'_> {
    fn label(&self) -> &'static str {
        "mixed_rice_agroforestry"
    }

    fn calculate(
        &self,
        farm: &Farm,
        period: &Period,
        as_of: NaiveDate,
    ) -> Result<MethodologyResult, MethodologyError> {
        let rice = self.rice.calculate(farm, period, as_of)?;
        let trees = self.agroforestry.calculate(farm, period, as_of)?;

        Ok(MethodologyResult {
            credits: rice.credits + trees.credits,
            breakdown: CreditBreakdown {
                baseline_emission: rice.breakdown.baseline_emission,
                project_emission: rice.breakdown.project_emission,
                tree_carbon: trees.breakdown.tree_carbon,
                soil_carbon: trees.breakdown.soil_carbon,
            },
        })
    }
}

pub fn methodology_for(crop_type: CropType, config: &MethodologyConfig) -> Box<dyn CreditMethodology + '_> {
    match crop_type {
        CropType::Rice => Box::new(Rice::new(&config.rice)),
        CropType::Agroforestry => Box::new(Agroforestry::new(&config.agroforestry)),
        CropType::Mixed => Box::new(Mixed::new(config)),
    }
}

/// Runs the farm's methodology, rejecting non-finite results and clamping at zero.
pub fn calculate_credits(
    farm: &Farm,
    period: &Period,
    as_of: NaiveDate,
    config: &MethodologyConfig,
) -> Result<(MethodologyResult, &'static str), MethodologyError> {
    let methodology = methodology_for(farm.crop_type, config);
    let mut result = methodology.calculate(farm, period, as_of)?;

    let breakdown = result.breakdown;
    for (component, value) in [
        ("baseline emission", breakdown.baseline_emission),
        ("project emission", breakdown.project_emission),
        ("tree carbon", breakdown.tree_carbon),
        ("soil carbon", breakdown.soil_carbon),
        ("credits", result.credits),
    ] {
        if !value.is_finite() {
            return Err(MethodologyError::NonFinite { component, value });
        }
    }
    result.credits = result.credits.max(0.0);

    Ok((result, methodology.label()))
}

// shared by both calculators: the latest in-period observation or InsufficientData
fn latest_observation<'f>(farm: &'f Farm, period: &Period) -> Result<&'f GroundTruthObservation, MethodologyError> {
    farm.latest_ground_truth(period)
        .ok_or(MethodologyError::InsufficientData(*period))
}
