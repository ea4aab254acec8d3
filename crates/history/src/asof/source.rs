//! Where historical values come from once the index names a block.
//!
//! The index only answers *when* a key changed. The pre-image itself lives
//! either in the change-set table for that block (the compact layout) or
//! inline in a dedicated history-value table (the thin layout, one more
//! write per change but a point read at query time). The trade-off is picked
//! once, at engine construction.

use crate::{
    changeset::{AccountChangeSetBytes, StorageChangeSetBytes},
    error::{HistoryError, StructuralError},
    keys::{encode_block_key, EntityKind, HASH_LENGTH, INCARNATION_LENGTH},
    tables::Tables,
};
use aion_kv::{KvError, KvRead};
use serde::{Deserialize, Serialize};

/// Resolves the pre-image recorded for `key` by the change at `block`.
///
/// Implementations are only consulted after a successful index hit, so an
/// absent value is a structural inconsistency, not a plain miss.
pub trait HistoricalValueSource {
    /// Fetches the pre-image of `key` recorded at `block`.
    fn historical_value<DB: KvRead>(
        &self,
        db: &DB,
        tables: &Tables,
        kind: EntityKind,
        key: &[u8],
        block: u64,
    ) -> Result<Vec<u8>, HistoryError>;
}

/// Change-set lookup mode: read the block's change-set and search it for the
/// key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeSetLookup;

impl HistoricalValueSource for ChangeSetLookup {
    fn historical_value<DB: KvRead>(
        &self,
        db: &DB,
        tables: &Tables,
        kind: EntityKind,
        key: &[u8],
        block: u64,
    ) -> Result<Vec<u8>, HistoryError> {
        let missing = || HistoryError::Decode(StructuralError::MissingChange { block });
        let encoded = match db.get(tables.change_set_bucket(kind), &encode_block_key(block)) {
            Ok(encoded) => encoded,
            Err(KvError::NotFound) => return Err(missing()),
            Err(err) => return Err(err.into()),
        };
        let value = match kind {
            EntityKind::Account => AccountChangeSetBytes(&encoded).find(key)?,
            EntityKind::Storage => StorageChangeSetBytes(&encoded).find(
                &key[..HASH_LENGTH],
                &key[HASH_LENGTH + INCARNATION_LENGTH..],
            )?,
        };
        value.map(<[u8]>::to_vec).ok_or_else(missing)
    }
}

/// Thin-history mode: the value sits inline under `key ++ block`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThinHistory;

impl HistoricalValueSource for ThinHistory {
    fn historical_value<DB: KvRead>(
        &self,
        db: &DB,
        tables: &Tables,
        kind: EntityKind,
        key: &[u8],
        block: u64,
    ) -> Result<Vec<u8>, HistoryError> {
        match db.get(tables.history_values_bucket(kind), &history_value_key(key, block)) {
            Ok(value) => Ok(value),
            Err(KvError::NotFound) => {
                Err(HistoryError::Decode(StructuralError::MissingChange { block }))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Thin-history table key: `entityKey ++ big-endian block`.
pub fn history_value_key(entity_key: &[u8], block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(entity_key.len() + 8);
    key.extend_from_slice(entity_key);
    key.extend_from_slice(&encode_block_key(block));
    key
}

/// Configuration-level selection between the two layouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryLayout {
    /// Historical values resolved through the change-set tables.
    #[default]
    ChangeSets,
    /// Historical values stored inline in the history-value tables.
    Thin,
}

impl HistoricalValueSource for HistoryLayout {
    fn historical_value<DB: KvRead>(
        &self,
        db: &DB,
        tables: &Tables,
        kind: EntityKind,
        key: &[u8],
        block: u64,
    ) -> Result<Vec<u8>, HistoryError> {
        match self {
            Self::ChangeSets => ChangeSetLookup.historical_value(db, tables, kind, key, block),
            Self::Thin => ThinHistory.historical_value(db, tables, kind, key, block),
        }
    }
}
