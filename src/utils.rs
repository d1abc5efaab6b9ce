//! Utility functions for identifiers, storage keys and CBOR encoding

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::EngineError;
use crate::period::Period;

// construct a unique id then encode using bech32m, e.g. `farm_1...`
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, EngineError> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| EngineError::Identifier(e.to_string()))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| EngineError::Identifier(e.to_string()))
}

/// Storage key shared by the ledger and the verification index: `farm_id/period`.
pub fn period_key(farm_id: &str, period: &Period) -> String {
    format!("{farm_id}/{period}")
}

/// Prefix matching every period key of a farm.
pub fn farm_prefix(farm_id: &str) -> String {
    format!("{farm_id}/")
}

pub fn to_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, EngineError> {
    minicbor::to_vec(value).map_err(|e| EngineError::Codec(e.to_string()))
}

pub fn from_cbor<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, EngineError> {
    minicbor::decode(bytes).map_err(|e| EngineError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix_and_are_unique() {
        let a = new_uuid_to_bech32("farm_").unwrap();
        let b = new_uuid_to_bech32("farm_").unwrap();

        assert!(a.starts_with("farm_1"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn period_keys_share_the_farm_prefix() {
        let period: Period = "2023-Q4".parse().unwrap();
        let key = period_key("farm_1abc", &period);

        assert_eq!(key, "farm_1abc/2023-Q4");
        assert!(key.starts_with(&farm_prefix("farm_1abc")));
    }
}
