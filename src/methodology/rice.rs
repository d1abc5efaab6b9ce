//! Rice methane methodology: baseline flooding emissions minus project emissions.
use chrono::NaiveDate;

use super::{CreditBreakdown, CreditMethodology, MethodologyError, MethodologyResult, latest_observation};
use crate::config::RiceParameters;
use crate::farm::{Farm, GroundTruthObservation, Practice};
use crate::period::Period;

/// Conventional-practice emissions for `area` hectares, tons CO2e.
pub fn baseline_emission(area: f64, params: &RiceParameters) -> f64 {
    area * params.emission_factor * params.cultivation_days * params.ch4_gwp / 1000.0
}

/// Per-hectare daily emission factor after practice reductions and the soil
/// organic carbon correction, kg CH4/ha/day.
pub fn project_emission_factor(farm: &Farm, latest: &GroundTruthObservation, params: &RiceParameters) -> f64 {
    let mut factor = params.emission_factor;

    if farm.has_practice(Practice::AlternateWettingDrying) {
        factor *= params.awd_factor;
    }
    if farm.has_practice(Practice::CompostApplication) {
        factor *= params.compost_factor;
    }

    // an absent or zero reading means SOC was not measured
    if let Some(soc) = latest.soil_organic_carbon.filter(|soc| *soc != 0.0) {
        factor *= params
            .soc_floor
            .max(1.0 - (soc - params.soc_reference) * params.soc_slope);
    }

    factor
}

pub struct Rice<'a> {
    params: &'a RiceParameters,
}

impl<'a> Rice<'a> {
    pub fn new(params: &'a RiceParameters) -> Self {
        Self { params }
    }
}

impl CreditMethodology for Rice<'_> {
    fn label(&self) -> &'static str {
        "rice_AWD"
    }

    fn calculate(
        &self,
        farm: &Farm,
        period: &Period,
        _as_of: NaiveDate,
    ) -> Result<MethodologyResult, MethodologyError> {
        let latest = latest_observation(farm, period)?;

        let baseline = baseline_emission(farm.area, self.params);
        let project = farm.area
            * project_emission_factor(farm, latest, self.params)
            * self.params.cultivation_days
            * self.params.ch4_gwp
            / 1000.0;

        Ok(MethodologyResult {
            credits: (baseline - project).max(0.0),
            breakdown: CreditBreakdown {
                baseline_emission: baseline,
                project_emission: project,
                ..CreditBreakdown::default()
            },
        })
    }
}
