//! Ordered key-value store contract.
//!
//! This crate defines the storage interface the history layer is written
//! against: byte-ordered buckets with point reads, ordered cursors, prefix
//! walks, and an atomic multi-put. Real deployments back this with an
//! ordered embedded database; [`mem::MemKv`] is the in-memory reference
//! implementation used by tests and embedders that do not need persistence.
//!
//! Transaction discipline is owned by the backend: every [`KvRead`] method is
//! expected to run inside a read (snapshot) transaction and every [`KvWrite`]
//! method inside an exclusive write transaction. [`KvWrite::multi_put`] must
//! be atomic — either every tuple becomes visible or none does.

#![warn(missing_debug_implementations, missing_docs, unreachable_pub, rustdoc::all)]

pub mod cursor;
pub mod error;
pub mod mem;

pub use cursor::Cursor;
pub use error::KvError;
pub use mem::MemKv;

/// Logical table name. Bucket names are configuration, not wire format.
pub type Bucket = &'static str;

/// A `(bucket, key, value)` tuple for [`KvWrite::multi_put`].
pub type PutTuple = (Bucket, Vec<u8>, Vec<u8>);

/// Read half of the store contract.
pub trait KvRead {
    /// Cursor type over one bucket.
    type Cursor: Cursor;

    /// Point lookup. Returns [`KvError::NotFound`] if the key is absent.
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>, KvError>;

    /// Opens an ordered cursor over `bucket`.
    ///
    /// The cursor observes a snapshot taken at open time; writes performed
    /// after opening are not visible through it.
    fn cursor(&self, bucket: Bucket) -> Result<Self::Cursor, KvError>;

    /// Walks `bucket` in ascending key order starting at `start_key`,
    /// visiting every key whose first `fixed_bits` bits equal those of
    /// `start_key` (`fixed_bits == 0` walks to the end of the bucket).
    ///
    /// The walker returns `Ok(false)` to stop early. Any walker error aborts
    /// the walk and is returned verbatim.
    fn walk<E, F>(
        &self,
        bucket: Bucket,
        start_key: &[u8],
        fixed_bits: usize,
        mut f: F,
    ) -> Result<(), E>
    where
        E: From<KvError>,
        F: FnMut(&[u8], &[u8]) -> Result<bool, E>,
    {
        let (fixed_bytes, mask) = bytes_mask(fixed_bits);
        let mut cursor = self.cursor(bucket)?;
        let mut entry = cursor.seek(start_key)?;
        while let Some((key, value)) = entry {
            if !matches_fixed_bits(&key, start_key, fixed_bytes, mask) {
                break;
            }
            if !f(&key, &value)? {
                break;
            }
            entry = cursor.next()?;
        }
        Ok(())
    }
}

/// Write half of the store contract.
pub trait KvWrite: KvRead {
    /// Inserts or overwrites one key.
    fn put(&self, bucket: Bucket, key: Vec<u8>, value: Vec<u8>) -> Result<(), KvError>;

    /// Removes one key. Removing an absent key is not an error.
    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<(), KvError>;

    /// Applies every tuple atomically.
    fn multi_put(&self, tuples: Vec<PutTuple>) -> Result<(), KvError>;

    /// Number of pending writes this backend absorbs efficiently in one
    /// batch. Callers accumulating work size their flush thresholds off this.
    fn ideal_batch_size(&self) -> usize;
}

/// Splits a bit count into whole bytes plus a mask for the trailing partial
/// byte (`0xff` when the count is byte-aligned).
pub fn bytes_mask(fixed_bits: usize) -> (usize, u8) {
    let fixed_bytes = (fixed_bits + 7) / 8;
    let shift = fixed_bits & 7;
    let mask = if shift == 0 { 0xff } else { 0xffu8 << (8 - shift) };
    (fixed_bytes, mask)
}

/// Whether `key` agrees with `start` on the first `fixed_bytes` bytes, the
/// last of them compared under `mask`.
pub fn matches_fixed_bits(key: &[u8], start: &[u8], fixed_bytes: usize, mask: u8) -> bool {
    if fixed_bytes == 0 {
        return true;
    }
    if key.len() < fixed_bytes || start.len() < fixed_bytes {
        return false;
    }
    let whole = fixed_bytes - 1;
    key[..whole] == start[..whole] && key[whole] & mask == start[whole] & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_mask_boundaries() {
        assert_eq!(bytes_mask(0), (0, 0xff));
        assert_eq!(bytes_mask(8), (1, 0xff));
        assert_eq!(bytes_mask(12), (2, 0xf0));
        assert_eq!(bytes_mask(256), (32, 0xff));
    }

    #[test]
    fn fixed_bits_matching() {
        let start = [0xab, 0xcd];
        assert!(matches_fixed_bits(&[0xab, 0xcd, 0x01], &start, 2, 0xff));
        assert!(!matches_fixed_bits(&[0xab, 0xce], &start, 2, 0xff));
        // 12 bits: second byte compared through the high nibble only.
        assert!(matches_fixed_bits(&[0xab, 0xcf], &start, 2, 0xf0));
        assert!(matches_fixed_bits(&[0x00], &[0xff], 0, 0xff));
    }
}
