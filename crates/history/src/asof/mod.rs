//! Point-in-time state queries.
//!
//! A query for "the value of key K as of block B" resolves in three steps:
//! the history index names the first block `>= B` at which K changed; the
//! pre-image recorded by that change is the answer; if no such change exists
//! the key has not moved since B and the current-state table answers. Range
//! queries merge-walk the index-derived historical entries with the
//! current-state entries in ascending key order.

mod source;

pub use source::{
    history_value_key, ChangeSetLookup, HistoricalValueSource, HistoryLayout, ThinHistory,
};

use crate::{
    error::HistoryError,
    index::{chunk_boundary, is_chunk_of, index_chunk_key, HistoryChunk},
    keys::EntityKind,
    tables::Tables,
};
use aion_kv::{bytes_mask, cursor::KvPair, matches_fixed_bits, Bucket, Cursor, KvRead};
use tokio_util::sync::CancellationToken;

/// As-of query engine over one store.
///
/// The value source `V` is fixed at construction ([`HistoryLayout`] for
/// configuration-driven selection, or one of the concrete sources directly).
#[derive(Debug)]
pub struct HistoricalState<'db, DB, V = HistoryLayout> {
    db: &'db DB,
    tables: Tables,
    source: V,
    cancel: CancellationToken,
}

impl<'db, DB: KvRead> HistoricalState<'db, DB, HistoryLayout> {
    /// Engine with the configured layout and canonical table names.
    pub fn new(db: &'db DB, layout: HistoryLayout) -> Self {
        Self::with_source(db, layout)
    }
}

impl<'db, DB: KvRead, V: HistoricalValueSource> HistoricalState<'db, DB, V> {
    /// Engine with an explicit value source.
    pub fn with_source(db: &'db DB, source: V) -> Self {
        Self { db, tables: Tables::default(), source, cancel: CancellationToken::new() }
    }

    /// Overrides the bucket layout.
    pub fn with_tables(mut self, tables: Tables) -> Self {
        self.tables = tables;
        self
    }

    /// Attaches a cancellation signal checked at every walk step.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self) -> Result<(), HistoryError> {
        if self.cancel.is_cancelled() {
            return Err(HistoryError::Cancelled);
        }
        Ok(())
    }

    /// First recorded change of `key` at or after `block`, according to the
    /// index in `history`.
    ///
    /// The seek lands on the chunk covering `block`. Two boundary cases take
    /// one `prev` step: a query below the oldest recorded block (the seek
    /// overshoots every chunk of the key), and a covering chunk whose
    /// entries all precede `block` (the answer opens the next-newer chunk,
    /// readable from its key without decoding).
    pub fn first_change_at_or_after(
        &self,
        history: Bucket,
        key: &[u8],
        block: u64,
    ) -> Result<Option<u64>, HistoryError> {
        let mut cursor = self.db.cursor(history)?;
        match cursor.seek(&index_chunk_key(key, block))? {
            Some((stored, value)) if is_chunk_of(&stored, key) => {
                let chunk = HistoryChunk::decode(&value)?;
                if let Some(hit) = chunk.search_ge(block) {
                    return Ok(Some(hit));
                }
                match cursor.prev()? {
                    Some((newer, _)) if is_chunk_of(&newer, key) => {
                        Ok(Some(chunk_boundary(&newer)?.1))
                    }
                    _ => Ok(None),
                }
            }
            _ => match cursor.prev()? {
                Some((stored, value)) if is_chunk_of(&stored, key) => {
                    Ok(HistoryChunk::decode(&value)?.search_ge(block))
                }
                _ => Ok(None),
            },
        }
    }

    /// Value of `key` as of `block`.
    ///
    /// Returns the recorded pre-image of the first change at or after
    /// `block`, the current value when no such change exists, and
    /// [`HistoryError::NotFound`] only when the key exists in neither
    /// history nor current state.
    pub fn get_as_of(
        &self,
        current: Bucket,
        history: Bucket,
        key: &[u8],
        block: u64,
    ) -> Result<Vec<u8>, HistoryError> {
        self.check_cancelled()?;
        let kind = EntityKind::from_key_length(key.len())?;
        if let Some(hit) = self.first_change_at_or_after(history, key, block)? {
            return self.source.historical_value(self.db, &self.tables, kind, key, hit);
        }
        Ok(self.db.get(current, key)?)
    }

    /// Walks every key matching the first `fixed_bits` of `start_key`, in
    /// ascending key order, yielding each key's as-of value at `block`.
    /// Historical entries win over current-state entries for the same key;
    /// an empty recorded pre-image means the key did not exist at `block`
    /// and suppresses it entirely. The walker returns `Ok(false)` to stop.
    pub fn walk_as_of<F>(
        &self,
        current: Bucket,
        history: Bucket,
        start_key: &[u8],
        fixed_bits: usize,
        block: u64,
        mut f: F,
    ) -> Result<(), HistoryError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, HistoryError>,
    {
        let kind = EntityKind::from_key_length(start_key.len())?;
        let (fixed_bytes, mask) = bytes_mask(fixed_bits);

        let mut hist = IndexWalker::new(self.db.cursor(history)?, start_key, fixed_bits, block)?;
        let mut hist_item = hist.next_hit()?;

        let mut current_cursor = self.db.cursor(current)?;
        let seeded = current_cursor.seek(start_key)?;
        let mut cur = settle_current(
            &mut current_cursor,
            seeded,
            start_key,
            fixed_bytes,
            mask,
            kind.key_length(),
        )?;

        loop {
            self.check_cancelled()?;
            let take_hist = match (&hist_item, &cur) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some((hist_key, _)), Some((cur_key, _))) => hist_key <= cur_key,
            };
            if take_hist {
                if let Some((key, hit)) = hist_item.take() {
                    if cur.as_ref().is_some_and(|(cur_key, _)| *cur_key == key) {
                        let seeded = current_cursor.next()?;
                        cur = settle_current(
                            &mut current_cursor,
                            seeded,
                            start_key,
                            fixed_bytes,
                            mask,
                            kind.key_length(),
                        )?;
                    }
                    let value =
                        self.source.historical_value(self.db, &self.tables, kind, &key, hit)?;
                    if !value.is_empty() && !f(&key, &value)? {
                        return Ok(());
                    }
                    hist_item = hist.next_hit()?;
                }
            } else if let Some((key, value)) = cur.take() {
                if !f(&key, &value)? {
                    return Ok(());
                }
                let seeded = current_cursor.next()?;
                cur = settle_current(
                    &mut current_cursor,
                    seeded,
                    start_key,
                    fixed_bytes,
                    mask,
                    kind.key_length(),
                )?;
            }
        }
        Ok(())
    }

    /// Runs the [`Self::walk_as_of`] logic independently for every start
    /// key, tagging results with the start key's position. Ordering holds
    /// within one index only. The walker returns `Ok(false)` to stop the
    /// whole operation.
    pub fn multi_walk_as_of<F>(
        &self,
        current: Bucket,
        history: Bucket,
        start_keys: &[Vec<u8>],
        fixed_bits: &[usize],
        block: u64,
        mut f: F,
    ) -> Result<(), HistoryError>
    where
        F: FnMut(usize, &[u8], &[u8]) -> Result<bool, HistoryError>,
    {
        for (index, start_key) in start_keys.iter().enumerate() {
            let bits = fixed_bits.get(index).copied().unwrap_or(0);
            let mut stopped = false;
            self.walk_as_of(current, history, start_key, bits, block, |key, value| {
                let keep_going = f(index, key, value)?;
                if !keep_going {
                    stopped = true;
                }
                Ok(keep_going)
            })?;
            if stopped {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Skips current-state entries of foreign key shapes and stops at the walk
/// boundary.
fn settle_current<C: Cursor>(
    cursor: &mut C,
    seeded: Option<KvPair>,
    start_key: &[u8],
    fixed_bytes: usize,
    mask: u8,
    key_length: usize,
) -> Result<Option<KvPair>, HistoryError> {
    let mut entry = seeded;
    loop {
        match entry {
            Some((key, value)) => {
                if !matches_fixed_bits(&key, start_key, fixed_bytes, mask) {
                    return Ok(None);
                }
                if key.len() == key_length {
                    return Ok(Some((key, value)));
                }
                entry = cursor.next()?;
            }
            None => return Ok(None),
        }
    }
}

/// Forward iterator over the history index, yielding one `(entity key,
/// qualifying change block)` pair per entity that changed at or after the
/// walk block.
struct IndexWalker<C: Cursor> {
    cursor: C,
    start_key: Vec<u8>,
    fixed_bytes: usize,
    mask: u8,
    block: u64,
    pending: Option<KvPair>,
    done: bool,
}

impl<C: Cursor> IndexWalker<C> {
    fn new(
        mut cursor: C,
        start_key: &[u8],
        fixed_bits: usize,
        block: u64,
    ) -> Result<Self, HistoryError> {
        let (fixed_bytes, mask) = bytes_mask(fixed_bits);
        let pending = cursor.seek(start_key)?;
        Ok(Self {
            cursor,
            start_key: start_key.to_vec(),
            fixed_bytes,
            mask,
            block,
            pending,
            done: false,
        })
    }

    fn take_matching(&mut self) -> Result<Option<KvPair>, HistoryError> {
        if self.done {
            return Ok(None);
        }
        match self.pending.take() {
            Some((key, value))
                if matches_fixed_bits(&key, &self.start_key, self.fixed_bytes, self.mask) =>
            {
                Ok(Some((key, value)))
            }
            _ => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn next_hit(&mut self) -> Result<Option<(Vec<u8>, u64)>, HistoryError> {
        loop {
            let Some((chunk_key, chunk_value)) = self.take_matching()? else {
                return Ok(None);
            };
            let (entity, first) = chunk_boundary(&chunk_key)?;
            let entity = entity.to_vec();

            // Chunks of one entity arrive newest first. Skipped newer chunks
            // leave their first block as the fallback answer for the case
            // where the covering chunk holds nothing at or above the block.
            let mut fallback: Option<u64> = None;
            let mut answer: Option<u64> = None;
            let mut decided = false;
            let mut chunk = Some((first, chunk_value));
            loop {
                if let Some((chunk_first, value)) = chunk.take() {
                    if !decided {
                        if chunk_first > self.block {
                            fallback = Some(chunk_first);
                        } else {
                            answer =
                                HistoryChunk::decode(&value)?.search_ge(self.block).or(fallback);
                            decided = true;
                        }
                    }
                }
                self.pending = self.cursor.next()?;
                match self.take_matching()? {
                    Some((key, value)) => {
                        let (next_entity, next_first) = chunk_boundary(&key)?;
                        if next_entity == entity.as_slice() {
                            chunk = Some((next_first, value));
                        } else {
                            self.pending = Some((key, value));
                            break;
                        }
                    }
                    None => break,
                }
            }
            if !decided {
                answer = fallback;
            }
            if let Some(hit) = answer {
                return Ok(Some((entity, hit)));
            }
        }
    }
}
