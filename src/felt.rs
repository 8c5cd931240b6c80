use serde::{Deserialize, Deserializer, Serializer};
use sha3::{Digest, Keccak256};
use starknet_api::hash::StarkFelt;

/// Builds a felt from its 32 big-endian bytes.
pub fn felt_from_bytes(bytes: &[u8]) -> Option<StarkFelt> {
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    StarkFelt::new(bytes).ok()
}

/// Address of a Cairo storage variable: `sn_keccak(name)`, keccak-256 masked to 250 bits.
pub fn storage_var_address(name: &str) -> StarkFelt {
    let digest = Keccak256::digest(name.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    bytes[0] &= 0x03;
    // Below 2^250, always inside the field.
    StarkFelt::new(bytes).unwrap_or(StarkFelt::ZERO)
}

/// Lowercase hex of the felt bytes without prefix, used in cache keys and file names.
pub fn felt_hex(felt: &StarkFelt) -> String {
    hex::encode(felt.bytes())
}

/// Serde adapter storing felts as raw bytes, for the bincode-encoded store rows.
pub mod serde_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(felt: &StarkFelt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(felt.bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StarkFelt, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        felt_from_bytes(&bytes).ok_or_else(|| serde::de::Error::custom("invalid felt bytes"))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            felt: &Option<StarkFelt>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match felt {
                Some(felt) => serializer.serialize_some(felt.bytes()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<StarkFelt>, D::Error> {
            match Option::<Vec<u8>>::deserialize(deserializer)? {
                Some(bytes) => felt_from_bytes(&bytes)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom("invalid felt bytes")),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn felt(hex: &str) -> StarkFelt {
    StarkFelt::try_from(hex).expect("valid felt")
}
