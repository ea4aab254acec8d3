//! Chunked per-key history index.
//!
//! For every entity key the index is a logically infinite ascending list of
//! the block numbers at which the key changed, stored as bounded chunks.
//! A chunk is keyed `entityKey ++ ~firstBlock` (big-endian, bit-inverted),
//! which keeps the open chunk's key stable for its whole life and makes an
//! ordered seek with `entityKey ++ ~block` land on the chunk covering
//! `block`. Chunks other than the open (most recent) one are sealed and
//! never touched again.
//!
//! Wire form of a chunk: a big-endian u64 element count followed by one
//! 4-byte big-endian entry per block number.

use crate::error::{HistoryError, StructuralError};
use aion_kv::{Bucket, Cursor, KvRead};

/// Byte budget of one encoded chunk.
pub const CHUNK_SIZE_LIMIT: usize = 1000;
/// Encoded chunk header: element count.
pub const CHUNK_HEADER_LENGTH: usize = 8;
/// Encoded size of one block-number entry.
pub const CHUNK_ENTRY_LENGTH: usize = 4;
/// Chunk-boundary suffix appended to the entity key.
pub const CHUNK_BOUNDARY_LENGTH: usize = 8;

/// One chunk of a key's history index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryChunk {
    blocks: Vec<u64>,
}

impl HistoryChunk {
    /// Empty chunk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an encoded chunk, validating the count against the byte
    /// length and the entries against the ascending-order invariant.
    pub fn decode(data: &[u8]) -> Result<Self, StructuralError> {
        if data.len() < CHUNK_HEADER_LENGTH {
            return Err(StructuralError::InputTooShort {
                have: data.len(),
                need: CHUNK_HEADER_LENGTH,
            });
        }
        let mut header = [0u8; CHUNK_HEADER_LENGTH];
        header.copy_from_slice(&data[..CHUNK_HEADER_LENGTH]);
        let count = usize::try_from(u64::from_be_bytes(header))
            .map_err(|_| StructuralError::BadChunk("element count out of range"))?;
        let need = CHUNK_HEADER_LENGTH + count * CHUNK_ENTRY_LENGTH;
        if data.len() != need {
            return Err(StructuralError::InputTooShort { have: data.len(), need });
        }

        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let offset = CHUNK_HEADER_LENGTH + i * CHUNK_ENTRY_LENGTH;
            let mut raw = [0u8; CHUNK_ENTRY_LENGTH];
            raw.copy_from_slice(&data[offset..offset + CHUNK_ENTRY_LENGTH]);
            let block = u32::from_be_bytes(raw) as u64;
            if blocks.last().is_some_and(|last| *last >= block) {
                return Err(StructuralError::BadChunk("entries not strictly ascending"));
            }
            blocks.push(block);
        }
        Ok(Self { blocks })
    }

    /// Encodes the chunk.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.blocks.len() as u64).to_be_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&(*block as u32).to_be_bytes());
        }
        out
    }

    /// Number of recorded block numbers.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the chunk records nothing.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The recorded block numbers, ascending.
    pub fn blocks(&self) -> &[u64] {
        &self.blocks
    }

    /// First (lowest) recorded block.
    pub fn first_block(&self) -> Option<u64> {
        self.blocks.first().copied()
    }

    /// Encoded byte length.
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_LENGTH + self.blocks.len() * CHUNK_ENTRY_LENGTH
    }

    /// Whether another entry still fits the budget. The slack is one
    /// full-width entry, so a chunk at the boundary seals before growing.
    pub fn has_room(&self) -> bool {
        self.encoded_len() + 8 <= CHUNK_SIZE_LIMIT
    }

    /// Appends one block number. Appends must be ascending; re-appending the
    /// current last block is a no-op, which keeps replays idempotent.
    pub fn append(&mut self, block: u64) -> Result<(), StructuralError> {
        if block > u32::MAX as u64 {
            return Err(StructuralError::BlockOutOfRange(block));
        }
        match self.blocks.last() {
            Some(last) if *last == block => Ok(()),
            Some(last) if *last > block => {
                Err(StructuralError::BadChunk("appends must be ascending"))
            }
            _ => {
                self.blocks.push(block);
                Ok(())
            }
        }
    }

    /// Removes one block number. Returns whether it was present.
    pub fn remove(&mut self, block: u64) -> bool {
        match self.blocks.binary_search(&block) {
            Ok(i) => {
                self.blocks.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Smallest recorded block `>= block`.
    pub fn search_ge(&self, block: u64) -> Option<u64> {
        let i = self.blocks.partition_point(|b| *b < block);
        self.blocks.get(i).copied()
    }

    /// Storage key of this chunk under `entity_key`.
    pub fn chunk_key(&self, entity_key: &[u8]) -> Result<Vec<u8>, StructuralError> {
        let first = self
            .first_block()
            .ok_or(StructuralError::BadChunk("empty chunk has no key"))?;
        Ok(index_chunk_key(entity_key, first))
    }
}

/// The chunk sequence of one entity key: zero or more sealed chunks followed
/// by the open one. [`HistoryChunks::append`] rolls over to a fresh chunk
/// when the open chunk runs out of room.
#[derive(Debug, Clone, Default)]
pub struct HistoryChunks {
    chunks: Vec<HistoryChunk>,
}

impl HistoryChunks {
    /// Empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence seeded from a chunk read back from storage.
    pub fn seeded(chunk: HistoryChunk) -> Self {
        Self { chunks: vec![chunk] }
    }

    /// Appends to the open chunk, starting a new one first if the open chunk
    /// would exceed the size budget.
    pub fn append(&mut self, block: u64) -> Result<(), StructuralError> {
        match self.chunks.last_mut() {
            Some(open) if open.has_room() => open.append(block),
            _ => {
                let mut open = HistoryChunk::new();
                open.append(block)?;
                self.chunks.push(open);
                Ok(())
            }
        }
    }

    /// The chunks, oldest first.
    pub fn chunks(&self) -> &[HistoryChunk] {
        &self.chunks
    }
}

/// Index-table key for the chunk of `entity_key` whose first recorded block
/// is `block`. The boundary is bit-inverted so that ascending key order runs
/// from the newest chunk to the oldest and a seek lands on the covering
/// chunk.
pub fn index_chunk_key(entity_key: &[u8], block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(entity_key.len() + CHUNK_BOUNDARY_LENGTH);
    key.extend_from_slice(entity_key);
    key.extend_from_slice(&(!block).to_be_bytes());
    key
}

/// Splits a chunk storage key into the entity key and the chunk's first
/// block.
pub fn chunk_boundary(chunk_key: &[u8]) -> Result<(&[u8], u64), StructuralError> {
    let split = chunk_key
        .len()
        .checked_sub(CHUNK_BOUNDARY_LENGTH)
        .ok_or(StructuralError::BadKeyLength(chunk_key.len()))?;
    let mut raw = [0u8; CHUNK_BOUNDARY_LENGTH];
    raw.copy_from_slice(&chunk_key[split..]);
    Ok((&chunk_key[..split], !u64::from_be_bytes(raw)))
}

/// Whether `stored` is a chunk key of `entity_key`.
pub(crate) fn is_chunk_of(stored: &[u8], entity_key: &[u8]) -> bool {
    stored.len() == entity_key.len() + CHUNK_BOUNDARY_LENGTH
        && &stored[..entity_key.len()] == entity_key
}

/// Returns the encoded chunk covering `block` for `key`, together with its
/// storage key.
///
/// The seek target `key ++ ~block` lands on the chunk whose first block is
/// the largest one `<= block`; when `block` precedes every recorded block the
/// seek overshoots past the key's chunks and one `prev` step lands on the
/// oldest chunk instead.
pub fn get_index_chunk<DB: KvRead>(
    db: &DB,
    bucket: Bucket,
    key: &[u8],
    block: u64,
) -> Result<(Vec<u8>, Vec<u8>), HistoryError> {
    let mut cursor = db.cursor(bucket)?;
    if let Some((stored, value)) = cursor.seek(&index_chunk_key(key, block))? {
        if is_chunk_of(&stored, key) {
            return Ok((value, stored));
        }
    }
    if let Some((stored, value)) = cursor.prev()? {
        if is_chunk_of(&stored, key) {
            return Ok((value, stored));
        }
    }
    Err(HistoryError::NotFound)
}
