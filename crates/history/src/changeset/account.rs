//! Plain (account) change-set codec.
//!
//! Layout, big-endian:
//!
//! ```text
//! u32 count
//! count × 32-byte keys, canonically sorted
//! count × u32 cumulative value lengths
//! concatenated value bytes
//! ```

use super::{encoded_count, read_u32, slice, ChangeSet};
use crate::{
    error::StructuralError,
    keys::{EntityKind, ACCOUNT_KEY_LENGTH},
};
use bytes::BufMut;

const COUNT_LENGTH: usize = 4;
const LENGTH_ENTRY: usize = 4;

/// Encodes an account change-set into its canonical wire form.
pub fn encode_accounts(set: &ChangeSet) -> Result<Vec<u8>, StructuralError> {
    if set.kind() != EntityKind::Account {
        return Err(StructuralError::BadKeyLength(set.kind().key_length()));
    }
    let sorted = set.sorted()?;

    let values_len: usize = sorted.iter().map(|c| c.value.len()).sum();
    let mut buf = Vec::with_capacity(
        COUNT_LENGTH + sorted.len() * (ACCOUNT_KEY_LENGTH + LENGTH_ENTRY) + values_len,
    );
    buf.put_u32(sorted.len() as u32);
    for change in &sorted {
        buf.put_slice(&change.key);
    }
    let mut cumulative = 0u32;
    for change in &sorted {
        cumulative += change.value.len() as u32;
        buf.put_u32(cumulative);
    }
    for change in &sorted {
        buf.put_slice(&change.value);
    }
    Ok(buf)
}

/// A borrowed encoded account change-set.
///
/// All accessors work directly off the encoded bytes; nothing is decoded up
/// front.
#[derive(Debug, Clone, Copy)]
pub struct AccountChangeSetBytes<'a>(pub &'a [u8]);

impl<'a> AccountChangeSetBytes<'a> {
    /// Number of encoded changes.
    pub fn count(&self) -> Result<usize, StructuralError> {
        encoded_count(self.0)
    }

    fn key_at(&self, i: usize) -> Result<&'a [u8], StructuralError> {
        slice(self.0, COUNT_LENGTH + i * ACCOUNT_KEY_LENGTH, ACCOUNT_KEY_LENGTH)
    }

    /// Cumulative value length up to and including element `j`.
    fn cumulative(&self, count: usize, j: usize) -> Result<usize, StructuralError> {
        let table = COUNT_LENGTH + count * ACCOUNT_KEY_LENGTH;
        read_u32(self.0, table + j * LENGTH_ENTRY).map(|v| v as usize)
    }

    fn value_at(&self, count: usize, i: usize) -> Result<&'a [u8], StructuralError> {
        let values = COUNT_LENGTH + count * (ACCOUNT_KEY_LENGTH + LENGTH_ENTRY);
        let start = if i == 0 { 0 } else { self.cumulative(count, i - 1)? };
        let end = self.cumulative(count, i)?;
        if start > end {
            return Err(StructuralError::InvalidLengthTable);
        }
        slice(self.0, values + start, end - start)
    }

    /// Decodes into a [`ChangeSet`] in canonical order.
    pub fn decode(&self) -> Result<ChangeSet, StructuralError> {
        let mut set = ChangeSet::account();
        let count = self.count()?;
        for i in 0..count {
            let key = self.key_at(i)?;
            let value = self.value_at(count, i)?;
            set.push(key.to_vec(), value.to_vec())?;
        }
        Ok(set)
    }

    /// Binary-searches for `key` and returns its pre-image value.
    ///
    /// An empty returned slice is a recorded pre-image ("created in this
    /// block"), distinct from `None`.
    pub fn find(&self, key: &[u8]) -> Result<Option<&'a [u8]>, StructuralError> {
        let count = self.count()?;
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < count && self.key_at(lo)? == key {
            return Ok(Some(self.value_at(count, lo)?));
        }
        Ok(None)
    }

    /// Streams `(key, value)` pairs in encoded order. A callback error aborts
    /// the walk immediately.
    pub fn walk<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<StructuralError>,
        F: FnMut(&[u8], &[u8]) -> Result<(), E>,
    {
        let count = self.count().map_err(E::from)?;
        for i in 0..count {
            let key = self.key_at(i).map_err(E::from)?;
            let value = self.value_at(count, i).map_err(E::from)?;
            f(key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    fn sample(n: usize) -> ChangeSet {
        let mut set = ChangeSet::account();
        for i in 0..n {
            let key = keccak256((i as u64).to_be_bytes());
            set.push(key.to_vec(), format!("account {i}").into_bytes()).unwrap();
        }
        set
    }

    #[test]
    fn round_trip() {
        let mut set = sample(10);
        let encoded = encode_accounts(&set).unwrap();
        set.canonicalize().unwrap();
        assert_eq!(AccountChangeSetBytes(&encoded).decode().unwrap(), set);
    }

    #[test]
    fn empty_round_trip() {
        let set = ChangeSet::account();
        let encoded = encode_accounts(&set).unwrap();
        let decoded = AccountChangeSetBytes(&encoded).decode().unwrap();
        assert!(decoded.is_empty());
        assert!(AccountChangeSetBytes(&[]).decode().unwrap().is_empty());
    }

    #[test]
    fn count_peek_matches() {
        let encoded = encode_accounts(&sample(7)).unwrap();
        assert_eq!(AccountChangeSetBytes(&encoded).count().unwrap(), 7);
    }

    #[test]
    fn find_hits_every_key_and_misses_absent() {
        let mut set = sample(9);
        set.canonicalize().unwrap();
        let encoded = encode_accounts(&set).unwrap();
        let bytes = AccountChangeSetBytes(&encoded);
        for change in set.changes() {
            assert_eq!(bytes.find(&change.key).unwrap(), Some(change.value.as_slice()));
        }
        let absent = keccak256(b"absent");
        assert_eq!(bytes.find(absent.as_slice()).unwrap(), None);
    }

    #[test]
    fn walk_yields_sorted_order_and_aborts_on_error() {
        let mut set = sample(5);
        set.canonicalize().unwrap();
        let encoded = encode_accounts(&set).unwrap();

        let mut keys = Vec::new();
        AccountChangeSetBytes(&encoded)
            .walk::<StructuralError, _>(|k, _| {
                keys.push(k.to_vec());
                Ok(())
            })
            .unwrap();
        let expected: Vec<_> = set.changes().iter().map(|c| c.key.clone()).collect();
        assert_eq!(keys, expected);

        let mut visited = 0;
        let err = AccountChangeSetBytes(&encoded).walk::<StructuralError, _>(|_, _| {
            visited += 1;
            Err(StructuralError::DuplicateKey)
        });
        assert!(err.is_err());
        assert_eq!(visited, 1);
    }

    #[test]
    fn truncated_input_is_structural_error() {
        let encoded = encode_accounts(&sample(3)).unwrap();
        let truncated = &encoded[..encoded.len() - 2];
        assert!(matches!(
            AccountChangeSetBytes(truncated).decode(),
            Err(StructuralError::InputTooShort { .. })
        ));
    }
}
