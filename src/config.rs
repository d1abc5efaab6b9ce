//! Methodology parameters.
//!
//! Every constant the calculators and the validation gate use lives here so it
//! can be recalibrated without touching code. Missing fields fall back to the
//! defaults below.
//!
//! Load from: env `CARBON_METHODOLOGY_CONFIG_PATH`, or `./config/methodology.json`,
//! or `./methodology.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodologyConfig {
    pub rice: RiceParameters,
    pub agroforestry: AgroforestryParameters,
    pub validation: ValidationParameters,
}

/// IPCC default values for rice cultivation methane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiceParameters {
    /// kg CH4 / ha / day under continuous flooding.
    pub emission_factor: f64,
    pub cultivation_days: f64,
    /// CH4 global-warming potential over 100 years.
    pub ch4_gwp: f64,
    pub awd_factor: f64,
    pub compost_factor: f64,
    /// Soil organic carbon (%) at which no correction is applied.
    pub soc_reference: f64,
    pub soc_slope: f64,
    pub soc_floor: f64,
}

impl Default for RiceParameters {
    fn default() -> Self {
        Self {
            emission_factor: 3.2,
            cultivation_days: 120.0,
            ch4_gwp: 28.0,
            awd_factor: 0.5,
            compost_factor: 0.8,
            soc_reference: 1.0,
            soc_slope: 0.2,
            soc_floor: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgroforestryParameters {
    /// kg CO2 sequestered per tree per year.
    pub carbon_per_tree: f64,
    /// Age in years at which the maturity factor reaches 1.0.
    pub maturity_age: f64,
    pub species: SpeciesTable,
    /// Soil organic carbon (%) of conventional agriculture.
    pub baseline_soc: f64,
    /// g/cm3
    pub bulk_density: f64,
    pub soil_depth_cm: f64,
    /// CO2/C molar ratio (44/12).
    pub co2_per_carbon: f64,
    /// Soil carbon is reported per hectare unless this is set. Tree carbon is
    /// always whole-farm, so the two terms are in different units by default.
    pub scale_soil_carbon_by_area: bool,
}

impl Default for AgroforestryParameters {
    fn default() -> Self {
        Self {
            carbon_per_tree: 22.0,
            maturity_age: 10.0,
            species: SpeciesTable::default(),
            baseline_soc: 1.0,
            bulk_density: 1.3,
            soil_depth_cm: 30.0,
            co2_per_carbon: 3.67,
            scale_soil_carbon_by_area: false,
        }
    }
}

/// How per-species factors combine when several species are observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeciesReduction {
    /// Highest factor, never below the default factor.
    #[default]
    Max,
    /// Mean of the observed species' factors.
    Mean,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesTable {
    /// Lowercase species name -> sequestration multiplier.
    pub factors: BTreeMap<String, f64>,
    pub default_factor: f64,
    pub reduction: SpeciesReduction,
}

impl Default for SpeciesTable {
    fn default() -> Self {
        let factors = [
            ("teak", 1.2),
            ("bamboo", 1.5),
            ("mango", 0.9),
            ("neem", 1.1),
            ("eucalyptus", 1.3),
            ("acacia", 1.0),
        ]
        .into_iter()
        .map(|(name, factor)| (name.to_string(), factor))
        .collect();

        Self {
            factors,
            default_factor: 1.0,
            reduction: SpeciesReduction::Max,
        }
    }
}

impl SpeciesTable {
    /// Case-insensitive lookup; unknown species get the default factor.
    pub fn factor_for(&self, species: &str) -> f64 {
        self.factors
            .get(&species.trim().to_lowercase())
            .copied()
            .unwrap_or(self.default_factor)
    }

    /// Combined factor for the observed species. No species -> default factor.
    pub fn combined_factor(&self, species: &[String]) -> f64 {
        if species.is_empty() {
            return self.default_factor;
        }
        match self.reduction {
            SpeciesReduction::Max => species
                .iter()
                .map(|s| self.factor_for(s))
                .fold(self.default_factor, f64::max),
            SpeciesReduction::Mean => {
                let total: f64 = species.iter().map(|s| self.factor_for(s)).sum();
                total / species.len() as f64
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationParameters {
    /// Imagery at or above this cloud-cover fraction does not count as clear.
    pub max_cloud_cover: f64,
}

impl Default for ValidationParameters {
    fn default() -> Self {
        Self {
            max_cloud_cover: 0.3,
        }
    }
}

impl MethodologyConfig {
    /// Load config from path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load config: env CARBON_METHODOLOGY_CONFIG_PATH, then ./config/methodology.json,
    /// then ./methodology.json. Falls back to defaults when none loads.
    pub fn load() -> Self {
        let from_env = std::env::var("CARBON_METHODOLOGY_CONFIG_PATH").ok();
        let candidates = from_env
            .iter()
            .map(Path::new)
            .chain([Path::new("./config/methodology.json"), Path::new("./methodology.json")]);

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_path(candidate) {
                Ok(config) => return config,
                Err(error) => {
                    warn!(path = %candidate.display(), %error, "ignoring unreadable methodology config");
                }
            }
        }
        Self::default()
    }
}
