//! Farm aggregate and the observations recorded against it
use serde::{Deserialize, Serialize};

use crate::clock::TimeStamp;
use crate::error::EngineError;
use crate::period::Period;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CropType {
    #[n(0)]
    Rice,
    #[n(1)]
    Agroforestry,
    #[n(2)]
    Mixed,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Practice {
    #[n(0)]
    AlternateWettingDrying,
    #[n(1)]
    CompostApplication,
    #[n(2)]
    CoverCropping,
    #[n(3)]
    ReducedTillage,
    #[n(4)]
    TreeIntegration,
}

/// Field-measured data. Immutable once recorded.
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthObservation {
    #[n(0)]
    pub date: TimeStamp,
    #[n(1)]
    pub collected_by: String, // farmer or verifier id
    #[n(2)]
    pub tree_count: Option<u32>,
    #[n(3)]
    pub tree_species: Vec<String>,
    #[n(4)]
    pub soil_organic_carbon: Option<f64>, // percent
    #[n(5)]
    pub notes: Option<String>,
    #[n(6)]
    pub images: Vec<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SatelliteObservation {
    #[n(0)]
    pub date: TimeStamp,
    #[n(1)]
    pub source: String,
    #[n(2)]
    pub cloud_cover: f64,
    #[n(3)]
    pub vegetation_index: f64, // NDVI, supplied upstream
    #[n(4)]
    pub url: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Farm {
    #[n(0)]
    pub id: String, // bech32 `farm_1...`
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub farmer_id: String,
    #[n(3)]
    pub farmer_name: String,
    #[n(4)]
    pub area: f64, // hectares
    #[n(5)]
    pub crop_type: CropType,
    #[n(6)]
    pub practices: Vec<Practice>,
    #[n(7)]
    pub establishment_date: TimeStamp,
    #[n(8)]
    pub ground_truth_data: Vec<GroundTruthObservation>,
    #[n(9)]
    pub satellite_imagery: Vec<SatelliteObservation>,
    #[n(10)]
    pub is_active: bool,
}

impl Farm {
    pub fn has_practice(&self, practice: Practice) -> bool {
        self.practices.contains(&practice)
    }

    pub fn ground_truth_in(&self, period: &Period) -> impl Iterator<Item = &GroundTruthObservation> {
        self.ground_truth_data
            .iter()
            .filter(move |obs| period.contains(obs.date.date()))
    }

    pub fn imagery_in(&self, period: &Period) -> impl Iterator<Item = &SatelliteObservation> {
        self.satellite_imagery
            .iter()
            .filter(move |img| period.contains(img.date.date()))
    }

    /// The in-period observation with the latest date. Ties go to the one recorded last.
    pub fn latest_ground_truth(&self, period: &Period) -> Option<&GroundTruthObservation> {
        self.ground_truth_in(period).max_by_key(|obs| obs.date)
    }
}

// Used for constructing farms before registration, id is assigned on finalise
#[derive(Debug, Default, Clone)]
pub struct FarmDetails {
    name: Option<String>,
    farmer_id: Option<String>,
    farmer_name: Option<String>,
    area: Option<f64>,
    crop_type: Option<CropType>,
    practices: Vec<Practice>,
    establishment_date: Option<TimeStamp>,
}

impl FarmDetails {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_farmer(mut self, farmer_id: impl Into<String>, farmer_name: impl Into<String>) -> Self {
        self.farmer_id = Some(farmer_id.into());
        self.farmer_name = Some(farmer_name.into());
        self
    }
    pub fn set_area(mut self, hectares: f64) -> Self {
        self.area = Some(hectares);
        self
    }
    pub fn set_crop_type(mut self, crop_type: CropType) -> Self {
        self.crop_type = Some(crop_type);
        self
    }
    pub fn add_practice(mut self, practice: Practice) -> Self {
        if !self.practices.contains(&practice) {
            self.practices.push(practice);
        }
        self
    }
    pub fn set_establishment_date(mut self, date: TimeStamp) -> Self {
        self.establishment_date = Some(date);
        self
    }

    /// Checks required fields and assigns a fresh `farm_` id.
    pub fn validate_and_finalise(self) -> Result<Farm, EngineError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| EngineError::InvalidFarm("name is not set".into()))?;
        let farmer_id = self
            .farmer_id
            .ok_or_else(|| EngineError::InvalidFarm("farmer is not set".into()))?;
        let farmer_name = self.farmer_name.unwrap_or_default();
        let area = self
            .area
            .ok_or_else(|| EngineError::InvalidFarm("area is not set".into()))?;
        if !area.is_finite() || area <= 0.0 {
            return Err(EngineError::InvalidFarm(format!(
                "area must be a positive number of hectares, got {area}"
            )));
        }
        let crop_type = self
            .crop_type
            .ok_or_else(|| EngineError::InvalidFarm("crop type is not set".into()))?;
        let establishment_date = self
            .establishment_date
            .ok_or_else(|| EngineError::InvalidFarm("establishment date is not set".into()))?;
        if !establishment_date.is_storable() {
            return Err(EngineError::InvalidFarm(format!(
                "establishment date {} is outside the storable range",
                establishment_date.date()
            )));
        }

        Ok(Farm {
            id: utils::new_uuid_to_bech32("farm_")?,
            name,
            farmer_id,
            farmer_name,
            area,
            crop_type,
            practices: self.practices,
            establishment_date,
            ground_truth_data: vec![],
            satellite_imagery: vec![],
            is_active: true,
        })
    }
}

impl GroundTruthObservation {
    pub fn new(date: TimeStamp, collected_by: impl Into<String>) -> Self {
        Self {
            date,
            collected_by: collected_by.into(),
            tree_count: None,
            tree_species: vec![],
            soil_organic_carbon: None,
            notes: None,
            images: vec![],
        }
    }
    pub fn with_trees(mut self, count: u32, species: &[&str]) -> Self {
        self.tree_count = Some(count);
        self.tree_species = species.iter().map(|s| s.to_string()).collect();
        self
    }
    pub fn with_soil_organic_carbon(mut self, percent: f64) -> Self {
        self.soil_organic_carbon = Some(percent);
        self
    }
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.images.push(url.into());
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        check_observation_date(&self.date)?;
        match self.soil_organic_carbon {
            Some(soc) if !soc.is_finite() || soc < 0.0 => Err(EngineError::InvalidObservation(
                format!("soil organic carbon must be a non-negative percentage, got {soc}"),
            )),
            _ => Ok(()),
        }
    }
}

impl SatelliteObservation {
    pub fn new(date: TimeStamp, source: impl Into<String>, cloud_cover: f64, vegetation_index: f64) -> Self {
        Self {
            date,
            source: source.into(),
            cloud_cover,
            vegetation_index,
            url: None,
        }
    }
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        check_observation_date(&self.date)?;
        if !(0.0..=1.0).contains(&self.cloud_cover) {
            return Err(EngineError::InvalidObservation(format!(
                "cloud cover must be within [0, 1], got {}",
                self.cloud_cover
            )));
        }
        if !(-1.0..=1.0).contains(&self.vegetation_index) {
            return Err(EngineError::InvalidObservation(format!(
                "vegetation index must be within [-1, 1], got {}",
                self.vegetation_index
            )));
        }
        Ok(())
    }
}

fn check_observation_date(date: &TimeStamp) -> Result<(), EngineError> {
    if date.is_storable() {
        Ok(())
    } else {
        Err(EngineError::InvalidObservation(format!(
            "observation date {} is outside the storable range",
            date.date()
        )))
    }
}
