//! Bucket layout.
//!
//! Names are configuration, not wire format: embedders map them onto whatever
//! physical tables their store provides. [`Tables::default`] gives the
//! canonical layout.

use crate::keys::EntityKind;
use aion_kv::Bucket;

/// Current encoded entity per entity key.
pub const CURRENT_STATE: Bucket = "CurrentState";
/// Encoded account change-set per block-number key.
pub const ACCOUNT_CHANGE_SETS: Bucket = "AccountChangeSets";
/// Encoded storage change-set per block-number key.
pub const STORAGE_CHANGE_SETS: Bucket = "StorageChangeSets";
/// Account history index chunks, keyed entity key + chunk boundary.
pub const ACCOUNTS_HISTORY: Bucket = "AccountsHistory";
/// Storage history index chunks, keyed entity key + chunk boundary.
pub const STORAGES_HISTORY: Bucket = "StoragesHistory";
/// Inline historical account values (thin-history layout only).
pub const ACCOUNT_HISTORY_VALUES: Bucket = "AccountHistoryValues";
/// Inline historical storage values (thin-history layout only).
pub const STORAGE_HISTORY_VALUES: Bucket = "StorageHistoryValues";
/// Index generator progress, keyed by target history bucket name.
pub const INDEX_CHECKPOINTS: Bucket = "IndexCheckpoints";

/// Bucket-name configuration consumed by the query engine and the index
/// generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    /// Current-state bucket.
    pub current_state: Bucket,
    /// Account change-set bucket.
    pub account_change_sets: Bucket,
    /// Storage change-set bucket.
    pub storage_change_sets: Bucket,
    /// Account history index bucket.
    pub accounts_history: Bucket,
    /// Storage history index bucket.
    pub storages_history: Bucket,
    /// Inline account history values (thin layout).
    pub account_history_values: Bucket,
    /// Inline storage history values (thin layout).
    pub storage_history_values: Bucket,
    /// Generator checkpoint bucket.
    pub index_checkpoints: Bucket,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            current_state: CURRENT_STATE,
            account_change_sets: ACCOUNT_CHANGE_SETS,
            storage_change_sets: STORAGE_CHANGE_SETS,
            accounts_history: ACCOUNTS_HISTORY,
            storages_history: STORAGES_HISTORY,
            account_history_values: ACCOUNT_HISTORY_VALUES,
            storage_history_values: STORAGE_HISTORY_VALUES,
            index_checkpoints: INDEX_CHECKPOINTS,
        }
    }
}

impl Tables {
    /// Change-set bucket for `kind`.
    pub const fn change_set_bucket(&self, kind: EntityKind) -> Bucket {
        match kind {
            EntityKind::Account => self.account_change_sets,
            EntityKind::Storage => self.storage_change_sets,
        }
    }

    /// History index bucket for `kind`.
    pub const fn history_bucket(&self, kind: EntityKind) -> Bucket {
        match kind {
            EntityKind::Account => self.accounts_history,
            EntityKind::Storage => self.storages_history,
        }
    }

    /// Inline history value bucket for `kind` (thin layout).
    pub const fn history_values_bucket(&self, kind: EntityKind) -> Bucket {
        match kind {
            EntityKind::Account => self.account_history_values,
            EntityKind::Storage => self.storage_history_values,
        }
    }
}
