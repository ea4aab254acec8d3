//! Entity keys and incarnation encoding.
//!
//! Accounts are keyed by the 32-byte hash of their address. Contract storage
//! is keyed by address-hash ++ incarnation ++ slot-hash (72 bytes), where the
//! incarnation — a generation counter bumped on self-destruct + recreate —
//! is stored bit-inverted so that byte order matches the intended sort order.

use crate::error::StructuralError;
use alloy_primitives::B256;

/// Length of an address or slot hash.
pub const HASH_LENGTH: usize = 32;
/// Length of the incarnation field inside a storage key.
pub const INCARNATION_LENGTH: usize = 8;
/// Length of an account entity key.
pub const ACCOUNT_KEY_LENGTH: usize = HASH_LENGTH;
/// Length of a storage entity key.
pub const STORAGE_KEY_LENGTH: usize = 2 * HASH_LENGTH + INCARNATION_LENGTH;
/// Length of an encoded block-number table key.
pub const BLOCK_KEY_LENGTH: usize = 8;

/// Sentinel incarnation meaning "the entity's current incarnation".
pub const DEFAULT_INCARNATION: u64 = !1u64;

/// The two entity shapes the history layer stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// 32-byte address-hash keys.
    Account,
    /// 72-byte composite storage keys.
    Storage,
}

impl EntityKind {
    /// Infers the kind from an entity key length.
    pub const fn from_key_length(len: usize) -> Result<Self, StructuralError> {
        match len {
            ACCOUNT_KEY_LENGTH => Ok(Self::Account),
            STORAGE_KEY_LENGTH => Ok(Self::Storage),
            other => Err(StructuralError::BadKeyLength(other)),
        }
    }

    /// Entity key length for this kind.
    pub const fn key_length(&self) -> usize {
        match self {
            Self::Account => ACCOUNT_KEY_LENGTH,
            Self::Storage => STORAGE_KEY_LENGTH,
        }
    }
}

/// Builds a composite storage key from its parts. The incarnation is written
/// bit-inverted.
pub fn composite_storage_key(
    address_hash: &B256,
    incarnation: u64,
    slot_hash: &B256,
) -> [u8; STORAGE_KEY_LENGTH] {
    let mut key = [0u8; STORAGE_KEY_LENGTH];
    key[..HASH_LENGTH].copy_from_slice(address_hash.as_slice());
    key[HASH_LENGTH..HASH_LENGTH + INCARNATION_LENGTH]
        .copy_from_slice(&(!incarnation).to_be_bytes());
    key[HASH_LENGTH + INCARNATION_LENGTH..].copy_from_slice(slot_hash.as_slice());
    key
}

/// Reads the incarnation out of a composite storage key, undoing the bit
/// inversion.
pub fn incarnation_from_key(key: &[u8]) -> Result<u64, StructuralError> {
    if key.len() != STORAGE_KEY_LENGTH {
        return Err(StructuralError::BadKeyLength(key.len()));
    }
    let mut raw = [0u8; INCARNATION_LENGTH];
    raw.copy_from_slice(&key[HASH_LENGTH..HASH_LENGTH + INCARNATION_LENGTH]);
    Ok(!u64::from_be_bytes(raw))
}

/// Change-set table key for a block.
pub fn encode_block_key(block: u64) -> [u8; BLOCK_KEY_LENGTH] {
    block.to_be_bytes()
}

/// Decodes a change-set table key back into a block number.
pub fn decode_block_key(key: &[u8]) -> Result<u64, StructuralError> {
    let raw: [u8; BLOCK_KEY_LENGTH] = key
        .try_into()
        .map_err(|_| StructuralError::BadKeyLength(key.len()))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn incarnation_round_trips_through_key() {
        let address_hash = keccak256([1u8]);
        let slot_hash = keccak256([2u8]);
        for incarnation in [1u64, 2, 7, DEFAULT_INCARNATION] {
            let key = composite_storage_key(&address_hash, incarnation, &slot_hash);
            assert_eq!(incarnation_from_key(&key).unwrap(), incarnation);
        }
        assert_eq!(!(!7u64), 7);
    }

    #[test]
    fn inverted_incarnations_sort_newest_first() {
        let address_hash = keccak256([1u8]);
        let slot_hash = keccak256([2u8]);
        let old = composite_storage_key(&address_hash, 1, &slot_hash);
        let new = composite_storage_key(&address_hash, 2, &slot_hash);
        assert!(new < old);
    }

    #[test]
    fn kind_inference() {
        assert_eq!(EntityKind::from_key_length(32).unwrap(), EntityKind::Account);
        assert_eq!(EntityKind::from_key_length(72).unwrap(), EntityKind::Storage);
        assert_eq!(
            EntityKind::from_key_length(40),
            Err(StructuralError::BadKeyLength(40))
        );
    }

    #[test]
    fn block_key_round_trip() {
        assert_eq!(decode_block_key(&encode_block_key(12345)).unwrap(), 12345);
        assert!(decode_block_key(&[0; 7]).is_err());
    }
}
