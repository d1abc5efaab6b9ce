//! Agroforestry methodology: tree sequestration plus soil carbon gain.
use chrono::{Datelike, NaiveDate};

use super::{CreditBreakdown, CreditMethodology, MethodologyError, MethodologyResult, latest_observation};
use crate::config::AgroforestryParameters;
use crate::farm::Farm;
use crate::period::Period;

/// Whole years since establishment, at least one.
pub fn tree_age(established: NaiveDate, as_of: NaiveDate) -> f64 {
    f64::from((as_of.year() - established.year()).max(1))
}

/// Whole-farm tree sequestration, tons CO2.
pub fn tree_carbon(tree_count: u32, species: &[String], tree_age: f64, params: &AgroforestryParameters) -> f64 {
    if tree_count == 0 {
        return 0.0;
    }
    let species_factor = params.species.combined_factor(species);
    let maturity_factor = (tree_age / params.maturity_age).min(1.0);

    f64::from(tree_count) * params.carbon_per_tree * tree_age * species_factor * maturity_factor / 1000.0
}

/// Soil carbon gain over the baseline SOC, tons CO2 per hectare.
pub fn soil_carbon(soil_organic_carbon: f64, params: &AgroforestryParameters) -> f64 {
    let carbon_fraction = (soil_organic_carbon - params.baseline_soc) / 100.0;
    // 10,000 m2 x depth
    let volume_per_hectare = 10_000.0 * params.soil_depth_cm / 100.0;
    let mass_per_hectare = volume_per_hectare * params.bulk_density * 1000.0; // kg

    let sequestered = carbon_fraction * mass_per_hectare * params.co2_per_carbon;
    sequestered.max(0.0) / 1000.0
}

pub struct Agroforestry<'a> {
    params: &'a AgroforestryParameters,
}

impl<'a> Agroforestry<'a> {
    pub fn new(params: &'a AgroforestryParameters) -> Self {
        Self { params }
    }
}

impl CreditMethodology for Agroforestry<'_> {
    fn label(&self) -> &'static str {
        "agroforestry_standard"
    }

    fn calculate(
        &self,
        farm: &Farm,
        period: &Period,
        as_of: NaiveDate,
    ) -> Result<MethodologyResult, MethodologyError> {
        let latest = latest_observation(farm, period)?;

        let age = tree_age(farm.establishment_date.date(), as_of);
        let trees = tree_carbon(latest.tree_count.unwrap_or(0), &latest.tree_species, age, self.params);

        let mut soil = match latest.soil_organic_carbon {
            Some(soc) if soc != 0.0 => soil_carbon(soc, self.params),
            _ => 0.0,
        };
        if self.params.scale_soil_carbon_by_area {
            soil *= farm.area;
        }

        Ok(MethodologyResult {
            credits: trees + soil,
            breakdown: CreditBreakdown {
                tree_carbon: trees,
                soil_carbon: soil,
                ..CreditBreakdown::default()
            },
        })
    }
}
