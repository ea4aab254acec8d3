//! Shared test fixtures: a minimal stand-in for the mutation writer.

use crate::{
    asof::{history_value_key, HistoryLayout},
    changeset::{encode_accounts, encode_storage, ChangeSet},
    index::{get_index_chunk, HistoryChunk, HistoryChunks},
    keys::{composite_storage_key, encode_block_key, EntityKind},
    tables::Tables,
};
use aion_kv::{KvWrite, MemKv};
use alloy_primitives::keccak256;

/// Deterministic account entity key.
pub(crate) fn account_key(i: u64) -> Vec<u8> {
    keccak256(i.to_be_bytes()).to_vec()
}

/// Deterministic composite storage key.
pub(crate) fn storage_key(address: u64, incarnation: u64, slot: u64) -> Vec<u8> {
    composite_storage_key(
        &keccak256(address.to_be_bytes()),
        incarnation,
        &keccak256(slot.to_be_bytes()),
    )
    .to_vec()
}

/// One change: `(entity key, pre-image, new current value)`. A `None`
/// current value deletes the entity from current state.
pub(crate) type TestChange = (Vec<u8>, Vec<u8>, Option<Vec<u8>>);

/// Writes blocks the way the (external) mutation writer would: change-set,
/// incremental index update, optional inline history value, current state.
pub(crate) struct TestWriter<'a> {
    pub(crate) db: &'a MemKv,
    pub(crate) tables: Tables,
    pub(crate) layout: HistoryLayout,
    write_index: bool,
}

impl<'a> TestWriter<'a> {
    pub(crate) fn new(db: &'a MemKv) -> Self {
        Self { db, tables: Tables::default(), layout: HistoryLayout::ChangeSets, write_index: true }
    }

    /// Writes inline history values as well (thin layout).
    pub(crate) fn thin(mut self) -> Self {
        self.layout = HistoryLayout::Thin;
        self
    }

    /// Skips index maintenance, leaving it to the generator under test.
    pub(crate) fn without_index(mut self) -> Self {
        self.write_index = false;
        self
    }

    pub(crate) fn commit_block(&self, kind: EntityKind, block: u64, changes: &[TestChange]) {
        let mut set = match kind {
            EntityKind::Account => ChangeSet::account(),
            EntityKind::Storage => ChangeSet::storage(),
        };
        for (key, pre, _) in changes {
            set.push(key.clone(), pre.clone()).unwrap();
        }
        let encoded = match kind {
            EntityKind::Account => encode_accounts(&set),
            EntityKind::Storage => encode_storage(&set),
        }
        .unwrap();
        self.db
            .put(
                self.tables.change_set_bucket(kind),
                encode_block_key(block).to_vec(),
                encoded,
            )
            .unwrap();

        for (key, pre, post) in changes {
            if self.write_index {
                let history = self.tables.history_bucket(kind);
                let mut chunks = match get_index_chunk(self.db, history, key, block) {
                    Ok((bytes, _)) => HistoryChunks::seeded(HistoryChunk::decode(&bytes).unwrap()),
                    Err(_) => HistoryChunks::new(),
                };
                chunks.append(block).unwrap();
                for chunk in chunks.chunks() {
                    self.db
                        .put(history, chunk.chunk_key(key).unwrap(), chunk.encode())
                        .unwrap();
                }
            }
            if self.layout == HistoryLayout::Thin {
                self.db
                    .put(
                        self.tables.history_values_bucket(kind),
                        history_value_key(key, block),
                        pre.clone(),
                    )
                    .unwrap();
            }
            match post {
                Some(value) => {
                    self.db.put(self.tables.current_state, key.clone(), value.clone()).unwrap()
                }
                None => self.db.delete(self.tables.current_state, key).unwrap(),
            }
        }
    }
}
