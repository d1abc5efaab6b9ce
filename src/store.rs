//! sled-backed farm registry. Observation lists are append-only.
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use tracing::info;

use crate::error::{EngineError, RecordKind};
use crate::farm::{Farm, GroundTruthObservation, SatelliteObservation};
use crate::utils;

#[derive(Clone)]
pub struct FarmStore {
    tree: sled::Tree,
}

impl FarmStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Stores a freshly finalised farm. Ids are never reused.
    pub fn register(&self, farm: &Farm) -> Result<(), EngineError> {
        let encoded = utils::to_cbor(farm)?;
        self.tree
            .compare_and_swap(farm.id.as_bytes(), None::<&[u8]>, Some(encoded))?
            .map_err(|_| EngineError::InvalidFarm(format!("farm {} is already registered", farm.id)))?;

        info!(farm_id = %farm.id, crop_type = ?farm.crop_type, area = farm.area, "farm registered");
        Ok(())
    }

    pub fn get(&self, farm_id: &str) -> Result<Farm, EngineError> {
        match self.tree.get(farm_id)? {
            Some(bytes) => utils::from_cbor(&bytes),
            None => Err(EngineError::not_found(RecordKind::Farm, farm_id)),
        }
    }

    pub fn contains(&self, farm_id: &str) -> Result<bool, EngineError> {
        Ok(self.tree.contains_key(farm_id)?)
    }

    pub fn list(&self) -> Result<Vec<Farm>, EngineError> {
        self.tree
            .iter()
            .values()
            .map(|bytes| utils::from_cbor(&bytes?))
            .collect()
    }

    pub fn record_ground_truth(&self, farm_id: &str, observation: GroundTruthObservation) -> Result<Farm, EngineError> {
        observation.validate()?;
        let farm = self.update(farm_id, |farm| farm.ground_truth_data.push(observation.clone()))?;

        info!(farm_id, date = %observation.date.date(), collected_by = %observation.collected_by, "ground truth recorded");
        Ok(farm)
    }

    pub fn record_satellite(&self, farm_id: &str, observation: SatelliteObservation) -> Result<Farm, EngineError> {
        observation.validate()?;
        let farm = self.update(farm_id, |farm| farm.satellite_imagery.push(observation.clone()))?;

        info!(farm_id, date = %observation.date.date(), source = %observation.source, "satellite observation recorded");
        Ok(farm)
    }

    /// Returns whether the farm existed.
    pub fn remove(&self, farm_id: &str) -> Result<bool, EngineError> {
        Ok(self.tree.remove(farm_id)?.is_some())
    }

    fn update(&self, farm_id: &str, apply: impl Fn(&mut Farm)) -> Result<Farm, EngineError> {
        let farm = self.tree.transaction(|tx| -> ConflictableTransactionResult<Farm, EngineError> {
            let Some(bytes) = tx.get(farm_id)? else {
                return Err(ConflictableTransactionError::Abort(EngineError::not_found(
                    RecordKind::Farm,
                    farm_id,
                )));
            };
            let mut farm: Farm = utils::from_cbor(&bytes).map_err(ConflictableTransactionError::Abort)?;
            apply(&mut farm);
            tx.insert(farm_id.as_bytes(), utils::to_cbor(&farm).map_err(ConflictableTransactionError::Abort)?)?;
            Ok(farm)
        })?;
        Ok(farm)
    }
}
