//! Batch history-index construction.
//!
//! The generator replays persisted change-sets in ascending block order and
//! appends each block number to the open chunk of every key that block
//! touched. Open chunks are cached in a per-run arena; when the arena
//! outgrows its threshold the whole batch is serialized, sorted for write
//! locality and committed in one atomic multi-put together with the
//! checkpoint. Re-running after a crash therefore reprocesses at most one
//! batch, and reseeding open chunks from storage keeps that replay
//! idempotent.

use crate::{
    changeset::{AccountChangeSetBytes, StorageChangeSetBytes},
    error::HistoryError,
    index::{get_index_chunk, HistoryChunk, HistoryChunks},
    keys::{decode_block_key, encode_block_key, EntityKind},
    tables::Tables,
};
use aion_kv::{Bucket, KvError, KvRead, KvWrite, PutTuple};
use std::collections::HashMap;
use tracing::{debug, info};

type ChunkCache = HashMap<Vec<u8>, HistoryChunks>;

/// Builds the history index of one entity kind from its change-set table.
#[derive(Debug)]
pub struct IndexGenerator<'db, DB> {
    db: &'db DB,
    kind: EntityKind,
    tables: Tables,
    batch_size: usize,
}

impl<'db, DB: KvWrite> IndexGenerator<'db, DB> {
    /// Generator over `db` for `kind`, with the canonical table names and a
    /// batch threshold of three times the store's ideal batch size.
    pub fn new(db: &'db DB, kind: EntityKind) -> Self {
        let batch_size = db.ideal_batch_size().saturating_mul(3);
        Self { db, kind, tables: Tables::default(), batch_size }
    }

    /// Overrides the bucket layout.
    pub fn with_tables(mut self, tables: Tables) -> Self {
        self.tables = tables;
        self
    }

    /// Overrides the batch threshold (number of cached keys that triggers a
    /// flush).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Indexes every change-set past the persisted checkpoint.
    pub fn generate(&self) -> Result<(), HistoryError> {
        let change_sets = self.tables.change_set_bucket(self.kind);
        let index_bucket = self.tables.history_bucket(self.kind);
        let mut start_key = self.resume_key(index_bucket)?;
        let mut cache = ChunkCache::new();
        let mut batches = 0usize;

        loop {
            let mut last_processed: Option<Vec<u8>> = None;
            let mut interrupted = false;
            self.db.walk::<HistoryError, _>(change_sets, &start_key, 0, |key, value| {
                let block = decode_block_key(key)?;
                self.index_changes(value, block, index_bucket, &mut cache)?;
                last_processed = Some(key.to_vec());
                if cache.len() > self.batch_size {
                    interrupted = true;
                    return Ok(false);
                }
                Ok(true)
            })?;

            let Some(checkpoint) = last_processed else { break };
            self.flush(&mut cache, index_bucket, &checkpoint)?;
            batches += 1;
            if !interrupted {
                break;
            }
            start_key = encode_block_key(decode_block_key(&checkpoint)? + 1).to_vec();
        }

        info!(
            target: "aion::history",
            bucket = index_bucket,
            batches,
            "history index generation finished"
        );
        Ok(())
    }

    /// Appends `block` to the cached open chunk of every key in `encoded`,
    /// seeding cache misses from storage.
    fn index_changes(
        &self,
        encoded: &[u8],
        block: u64,
        index_bucket: Bucket,
        cache: &mut ChunkCache,
    ) -> Result<(), HistoryError> {
        let mut record = |key: &[u8]| -> Result<(), HistoryError> {
            if let Some(chunks) = cache.get_mut(key) {
                chunks.append(block)?;
                return Ok(());
            }
            let mut chunks = match get_index_chunk(self.db, index_bucket, key, block) {
                Ok((bytes, _)) => HistoryChunks::seeded(HistoryChunk::decode(&bytes)?),
                Err(HistoryError::NotFound) => HistoryChunks::new(),
                Err(err) => return Err(err),
            };
            chunks.append(block)?;
            cache.insert(key.to_vec(), chunks);
            Ok(())
        };
        match self.kind {
            EntityKind::Account => {
                AccountChangeSetBytes(encoded).walk::<HistoryError, _>(|key, _| record(key))
            }
            EntityKind::Storage => {
                StorageChangeSetBytes(encoded).walk::<HistoryError, _>(|key, _| record(key))
            }
        }
    }

    /// Serializes the cached chunks, sorts the tuples and commits them with
    /// the checkpoint in one atomic multi-put. The cache is left empty.
    fn flush(
        &self,
        cache: &mut ChunkCache,
        index_bucket: Bucket,
        checkpoint: &[u8],
    ) -> Result<(), HistoryError> {
        let mut tuples: Vec<PutTuple> = Vec::new();
        for (key, chunks) in cache.drain() {
            for chunk in chunks.chunks() {
                tuples.push((index_bucket, chunk.chunk_key(&key)?, chunk.encode()));
            }
        }
        let chunk_count = tuples.len();
        tuples.push((
            self.tables.index_checkpoints,
            index_bucket.as_bytes().to_vec(),
            checkpoint.to_vec(),
        ));
        tuples.sort();
        self.db.multi_put(tuples)?;
        debug!(
            target: "aion::history",
            bucket = index_bucket,
            chunks = chunk_count,
            "flushed index batch"
        );
        Ok(())
    }

    /// First change-set key to process: the successor of the persisted
    /// checkpoint, or the beginning of the table.
    fn resume_key(&self, index_bucket: Bucket) -> Result<Vec<u8>, HistoryError> {
        match self.db.get(self.tables.index_checkpoints, index_bucket.as_bytes()) {
            Ok(checkpoint) => {
                Ok(encode_block_key(decode_block_key(&checkpoint)? + 1).to_vec())
            }
            Err(KvError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Rolls the tip block out of the index: removes the block from every
    /// affected key's chunk (dropping chunks that become empty) and deletes
    /// the block's change-set entry.
    pub fn unwind_block(&self, block: u64) -> Result<(), HistoryError> {
        let change_sets = self.tables.change_set_bucket(self.kind);
        let index_bucket = self.tables.history_bucket(self.kind);
        let block_key = encode_block_key(block);

        let encoded = match self.db.get(change_sets, &block_key) {
            Ok(encoded) => encoded,
            Err(KvError::NotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut unwind_key = |key: &[u8]| -> Result<(), HistoryError> {
            let (bytes, stored_key) = match get_index_chunk(self.db, index_bucket, key, block) {
                Ok(found) => found,
                Err(HistoryError::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            };
            let mut chunk = HistoryChunk::decode(&bytes)?;
            if !chunk.remove(block) {
                return Ok(());
            }
            if chunk.is_empty() {
                self.db.delete(index_bucket, &stored_key)?;
            } else {
                let new_key = chunk.chunk_key(key)?;
                if new_key != stored_key {
                    self.db.delete(index_bucket, &stored_key)?;
                }
                self.db.put(index_bucket, new_key, chunk.encode())?;
            }
            Ok(())
        };
        match self.kind {
            EntityKind::Account => {
                AccountChangeSetBytes(&encoded).walk::<HistoryError, _>(|key, _| unwind_key(key))?
            }
            EntityKind::Storage => {
                StorageChangeSetBytes(&encoded).walk::<HistoryError, _>(|key, _| unwind_key(key))?
            }
        }
        self.db.delete(change_sets, &block_key)?;

        // Pull the checkpoint back so a later generate() revisits the spot.
        if let Ok(checkpoint) = self.db.get(self.tables.index_checkpoints, index_bucket.as_bytes())
        {
            if decode_block_key(&checkpoint)? >= block {
                if block == 0 {
                    self.db.delete(self.tables.index_checkpoints, index_bucket.as_bytes())?;
                } else {
                    self.db.put(
                        self.tables.index_checkpoints,
                        index_bucket.as_bytes().to_vec(),
                        encode_block_key(block - 1).to_vec(),
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tables::{ACCOUNTS_HISTORY, INDEX_CHECKPOINTS},
        test_utils::{account_key, TestWriter},
    };
    use aion_kv::{KvRead, MemKv};

    /// Dumps the whole account history index for equality comparisons.
    fn dump_index(db: &MemKv) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = Vec::new();
        db.walk::<KvError, _>(ACCOUNTS_HISTORY, &[], 0, |k, v| {
            entries.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })
        .unwrap();
        entries
    }

    fn write_blocks(writer: &TestWriter<'_>, blocks: impl Iterator<Item = u64>) {
        for block in blocks {
            let changes = vec![
                (account_key(1), format!("a before {block}").into_bytes(), Some(b"a".to_vec())),
                (account_key(2), format!("b before {block}").into_bytes(), Some(b"b".to_vec())),
            ];
            writer.commit_block(EntityKind::Account, block, &changes);
        }
    }

    #[test]
    fn builds_index_from_change_sets() {
        let db = MemKv::new();
        let writer = TestWriter::new(&db).without_index();
        write_blocks(&writer, 1..=5);
        writer.commit_block(
            EntityKind::Account,
            6,
            &[(account_key(3), b"c before 6".to_vec(), Some(b"c".to_vec()))],
        );

        IndexGenerator::new(&db, EntityKind::Account).generate().unwrap();

        let (bytes, _) =
            get_index_chunk(&db, ACCOUNTS_HISTORY, &account_key(1), 1).unwrap();
        assert_eq!(HistoryChunk::decode(&bytes).unwrap().blocks(), &[1, 2, 3, 4, 5]);
        let (bytes, _) =
            get_index_chunk(&db, ACCOUNTS_HISTORY, &account_key(3), 1).unwrap();
        assert_eq!(HistoryChunk::decode(&bytes).unwrap().blocks(), &[6]);

        let checkpoint = db.get(INDEX_CHECKPOINTS, ACCOUNTS_HISTORY.as_bytes()).unwrap();
        assert_eq!(decode_block_key(&checkpoint).unwrap(), 6);
    }

    #[test]
    fn generation_matches_incremental_writer() {
        let generated = MemKv::new();
        write_blocks(&TestWriter::new(&generated).without_index(), 1..=40);
        IndexGenerator::new(&generated, EntityKind::Account).generate().unwrap();

        let incremental = MemKv::new();
        write_blocks(&TestWriter::new(&incremental), 1..=40);

        assert_eq!(dump_index(&generated), dump_index(&incremental));
    }

    #[test]
    fn small_batches_and_resume_produce_identical_index() {
        let reference = MemKv::new();
        write_blocks(&TestWriter::new(&reference).without_index(), 1..=30);
        IndexGenerator::new(&reference, EntityKind::Account).generate().unwrap();

        // Tiny batch threshold: every block flushes its own batch.
        let batched = MemKv::new();
        let writer = TestWriter::new(&batched).without_index();
        write_blocks(&writer, 1..=12);
        IndexGenerator::new(&batched, EntityKind::Account)
            .with_batch_size(1)
            .generate()
            .unwrap();
        // More blocks arrive later; a second run resumes from the checkpoint.
        write_blocks(&writer, 13..=30);
        IndexGenerator::new(&batched, EntityKind::Account)
            .with_batch_size(1)
            .generate()
            .unwrap();

        assert_eq!(dump_index(&reference), dump_index(&batched));

        // Re-running with nothing new must change nothing.
        IndexGenerator::new(&batched, EntityKind::Account).generate().unwrap();
        assert_eq!(dump_index(&reference), dump_index(&batched));
    }

    #[test]
    fn generator_splits_chunks_at_budget() {
        let db = MemKv::new();
        let writer = TestWriter::new(&db).without_index();
        for block in 0u64..250 {
            writer.commit_block(
                EntityKind::Account,
                block,
                &[(account_key(9), b"pre".to_vec(), Some(b"post".to_vec()))],
            );
        }
        IndexGenerator::new(&db, EntityKind::Account).generate().unwrap();

        let entries = dump_index(&db);
        assert_eq!(entries.len(), 2);
        let first = HistoryChunk::decode(&entries[1].1).unwrap();
        let second = HistoryChunk::decode(&entries[0].1).unwrap();
        let expected: Vec<u64> = (0..247).collect();
        assert_eq!(first.blocks(), expected.as_slice());
        assert_eq!(second.blocks(), &[247, 248, 249]);
    }

    #[test]
    fn unwind_block_removes_change_set_and_index_entries() {
        let db = MemKv::new();
        let writer = TestWriter::new(&db);
        write_blocks(&writer, 1..=3);
        writer.commit_block(
            EntityKind::Account,
            4,
            &[(account_key(7), b"fresh before 4".to_vec(), Some(b"fresh".to_vec()))],
        );

        let generator = IndexGenerator::new(&db, EntityKind::Account);
        generator.unwind_block(4).unwrap();

        // The change-set entry is gone and so is the only-block index entry.
        assert_eq!(
            db.get(writer.tables.account_change_sets, &encode_block_key(4)),
            Err(KvError::NotFound)
        );
        assert_eq!(
            get_index_chunk(&db, ACCOUNTS_HISTORY, &account_key(7), 1),
            Err(HistoryError::NotFound)
        );

        // Unwinding the new tip trims multi-block chunks without dropping them.
        generator.unwind_block(3).unwrap();
        let (bytes, _) = get_index_chunk(&db, ACCOUNTS_HISTORY, &account_key(1), 1).unwrap();
        assert_eq!(HistoryChunk::decode(&bytes).unwrap().blocks(), &[1, 2]);

        // Unwinding a block with no change-set is a no-op.
        generator.unwind_block(9).unwrap();
    }
}
