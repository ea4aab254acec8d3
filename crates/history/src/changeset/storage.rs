//! Dictionary-compressed (storage) change-set codec.
//!
//! Layout, big-endian throughout:
//!
//! ```text
//! u32 numElements
//! u16 numUniqueAddrHashes (= D)
//! D × 32B address-hash dictionary, first-seen order
//! numElements × (w + 32B) entry rows: [dictIndex][slotHash], w = widthFor(D)
//! u16 numUint8Values, u16 numUint16Values, u16 numUint32Values
//! cumulative value-length table: numUint8×1B ++ numUint16×2B ++ numUint32×4B
//! concatenated value bytes (total = last cumulative entry)
//! optional trailing records { u32 elementIndex, u64 invertedIncarnation }
//!   for every address whose incarnation != DEFAULT_INCARNATION
//! ```
//!
//! Because the change-set is canonically sorted before encoding, the
//! dictionary comes out in ascending address-hash order and the entry rows in
//! ascending (dictIndex, slotHash) order, so both support binary search.

use super::{
    encoded_count, read_u16, read_u32, read_uint_by_width, slice, width_for, write_uint_by_width,
    ChangeSet,
};
use crate::{
    error::StructuralError,
    keys::{DEFAULT_INCARNATION, HASH_LENGTH, INCARNATION_LENGTH, STORAGE_KEY_LENGTH},
};
use bytes::BufMut;
use std::collections::HashMap;

const COUNT_LENGTH: usize = 4;
const DICT_LENGTH: usize = 2;
const BUCKET_COUNT_LENGTH: usize = 2;
const INCARNATION_RECORD: usize = 12;

/// Encodes a storage change-set into its canonical wire form.
pub fn encode_storage(set: &ChangeSet) -> Result<Vec<u8>, StructuralError> {
    let sorted = set.sorted()?;
    for change in &sorted {
        if change.key.len() != STORAGE_KEY_LENGTH {
            return Err(StructuralError::BadKeyLength(change.key.len()));
        }
    }
    let n = sorted.len();

    let mut buf = Vec::new();
    buf.put_u32(n as u32);

    // Dictionary and incarnation exceptions, in one pass over the sorted
    // changes.
    let mut dict_ids: HashMap<&[u8], u64> = HashMap::new();
    let mut dict = Vec::new();
    let mut exceptions = Vec::new();
    for (i, change) in sorted.iter().enumerate() {
        let address_hash = &change.key[..HASH_LENGTH];
        if !dict_ids.contains_key(address_hash) {
            dict_ids.insert(address_hash, dict_ids.len() as u64);
            dict.extend_from_slice(address_hash);

            let raw = read_uint_by_width(
                &change.key[HASH_LENGTH..HASH_LENGTH + INCARNATION_LENGTH],
            )?;
            if !raw != DEFAULT_INCARNATION {
                exceptions.put_u32(i as u32);
                exceptions.put_u64(raw);
            }
        }
    }
    if dict_ids.len() >= 65536 {
        return Err(StructuralError::TooLarge("address dictionary"));
    }
    buf.put_u16(dict_ids.len() as u16);
    buf.put_slice(&dict);

    let width = width_for(dict_ids.len());
    for change in &sorted {
        let id = dict_ids[&change.key[..HASH_LENGTH]];
        write_uint_by_width(&mut buf, id, width)?;
        buf.put_slice(&change.key[HASH_LENGTH + INCARNATION_LENGTH..]);
    }

    // Cumulative length table, each entry landing in the first width bucket
    // that can hold the running sum.
    let mut table = Vec::new();
    let (mut num_u8, mut num_u16, mut num_u32) = (0u64, 0u64, 0u64);
    let mut cumulative = 0u64;
    for change in &sorted {
        cumulative += change.value.len() as u64;
        match cumulative {
            0..=255 => {
                num_u8 += 1;
                table.put_u8(cumulative as u8);
            }
            256..=65535 => {
                num_u16 += 1;
                table.put_u16(cumulative as u16);
            }
            _ => {
                num_u32 += 1;
                table.put_u32(cumulative as u32);
            }
        }
    }
    if num_u8 > 65535 || num_u16 > 65535 || num_u32 > 65535 {
        return Err(StructuralError::TooLarge("value length buckets"));
    }
    buf.put_u16(num_u8 as u16);
    buf.put_u16(num_u16 as u16);
    buf.put_u16(num_u32 as u16);
    buf.put_slice(&table);

    for change in &sorted {
        buf.put_slice(&change.value);
    }
    buf.put_slice(&exceptions);
    Ok(buf)
}

/// Structural offsets of one encoded storage change-set, computed purely
/// arithmetically.
#[derive(Debug, Clone, Copy)]
struct Layout {
    count: usize,
    dict_len: usize,
    width: usize,
    entries_offset: usize,
    num_u8: usize,
    num_u16: usize,
    num_u32: usize,
    table_offset: usize,
    values_offset: usize,
    exceptions_offset: usize,
}

impl Layout {
    fn parse(data: &[u8]) -> Result<Self, StructuralError> {
        let count = read_u32(data, 0)? as usize;
        let dict_len = read_u16(data, COUNT_LENGTH)? as usize;
        let width = width_for(dict_len);
        let dict_offset = COUNT_LENGTH + DICT_LENGTH;
        let entries_offset = dict_offset + dict_len * HASH_LENGTH;
        let counts_offset = entries_offset + count * (width + HASH_LENGTH);

        let num_u8 = read_u16(data, counts_offset)? as usize;
        let num_u16 = read_u16(data, counts_offset + BUCKET_COUNT_LENGTH)? as usize;
        let num_u32 = read_u16(data, counts_offset + 2 * BUCKET_COUNT_LENGTH)? as usize;
        if num_u8 + num_u16 + num_u32 != count {
            return Err(StructuralError::InconsistentCounts {
                expected: count,
                found: num_u8 + num_u16 + num_u32,
            });
        }

        let table_offset = counts_offset + 3 * BUCKET_COUNT_LENGTH;
        let values_offset = table_offset + num_u8 + 2 * num_u16 + 4 * num_u32;

        let layout = Self {
            count,
            dict_len,
            width,
            entries_offset,
            num_u8,
            num_u16,
            num_u32,
            table_offset,
            values_offset,
            exceptions_offset: values_offset,
        };
        let values_len =
            if count == 0 { 0 } else { layout.cumulative(data, count - 1)? };
        let exceptions_offset = values_offset + values_len;

        let trailing = data
            .len()
            .checked_sub(exceptions_offset)
            .ok_or(StructuralError::InputTooShort { have: data.len(), need: exceptions_offset })?;
        if trailing % INCARNATION_RECORD != 0 {
            return Err(StructuralError::BadIncarnationRegion(trailing));
        }
        Ok(Self { exceptions_offset, ..layout })
    }

    fn dict_entry<'a>(&self, data: &'a [u8], id: usize) -> Result<&'a [u8], StructuralError> {
        slice(data, COUNT_LENGTH + DICT_LENGTH + id * HASH_LENGTH, HASH_LENGTH)
    }

    fn entry_row<'a>(&self, data: &'a [u8], i: usize) -> Result<&'a [u8], StructuralError> {
        slice(data, self.entries_offset + i * (self.width + HASH_LENGTH), self.width + HASH_LENGTH)
    }

    fn entry<'a>(&self, data: &'a [u8], i: usize) -> Result<(usize, &'a [u8]), StructuralError> {
        let row = self.entry_row(data, i)?;
        let id = read_uint_by_width(&row[..self.width])? as usize;
        Ok((id, &row[self.width..]))
    }

    /// Cumulative value length up to and including element `j`, crossing
    /// width-bucket boundaries.
    fn cumulative(&self, data: &[u8], j: usize) -> Result<usize, StructuralError> {
        if j < self.num_u8 {
            Ok(slice(data, self.table_offset + j, 1)?[0] as usize)
        } else if j < self.num_u8 + self.num_u16 {
            let offset = self.table_offset + self.num_u8 + (j - self.num_u8) * 2;
            Ok(read_u16(data, offset)? as usize)
        } else if j < self.num_u8 + self.num_u16 + self.num_u32 {
            let offset = self.table_offset
                + self.num_u8
                + 2 * self.num_u16
                + (j - self.num_u8 - self.num_u16) * 4;
            Ok(read_u32(data, offset)? as usize)
        } else {
            Err(StructuralError::ElementOutOfRange { index: j, count: self.count })
        }
    }

    /// Value slice of element `i`: a pure range lookup into the values
    /// region, bounded by neighboring cumulative entries.
    fn value<'a>(&self, data: &'a [u8], i: usize) -> Result<&'a [u8], StructuralError> {
        let start = if i == 0 { 0 } else { self.cumulative(data, i - 1)? };
        let end = self.cumulative(data, i)?;
        if start > end {
            return Err(StructuralError::InvalidLengthTable);
        }
        slice(data, self.values_offset + start, end - start)
    }

    /// Incarnation exceptions as a dictionary-index → raw (inverted) value
    /// map. The wire records carry the element index of the address's first
    /// change; it is resolved through the entry rows here.
    fn exceptions(&self, data: &[u8]) -> Result<HashMap<usize, u64>, StructuralError> {
        let mut map = HashMap::new();
        let mut offset = self.exceptions_offset;
        while offset < data.len() {
            let element = read_u32(data, offset)? as usize;
            if element >= self.count {
                return Err(StructuralError::ElementOutOfRange {
                    index: element,
                    count: self.count,
                });
            }
            let raw = read_uint_by_width(slice(data, offset + 4, 8)?)?;
            let (dict_id, _) = self.entry(data, element)?;
            map.insert(dict_id, raw);
            offset += INCARNATION_RECORD;
        }
        Ok(map)
    }

    fn key(
        &self,
        data: &[u8],
        i: usize,
        exceptions: &HashMap<usize, u64>,
    ) -> Result<[u8; STORAGE_KEY_LENGTH], StructuralError> {
        let (dict_id, slot) = self.entry(data, i)?;
        let address_hash = self.dict_entry(data, dict_id)?;
        let raw = exceptions.get(&dict_id).copied().unwrap_or(!DEFAULT_INCARNATION);

        let mut key = [0u8; STORAGE_KEY_LENGTH];
        key[..HASH_LENGTH].copy_from_slice(address_hash);
        key[HASH_LENGTH..HASH_LENGTH + INCARNATION_LENGTH].copy_from_slice(&raw.to_be_bytes());
        key[HASH_LENGTH + INCARNATION_LENGTH..].copy_from_slice(slot);
        Ok(key)
    }
}

/// A borrowed encoded storage change-set.
#[derive(Debug, Clone, Copy)]
pub struct StorageChangeSetBytes<'a>(pub &'a [u8]);

impl<'a> StorageChangeSetBytes<'a> {
    /// Number of encoded changes.
    pub fn count(&self) -> Result<usize, StructuralError> {
        encoded_count(self.0)
    }

    /// Decodes into a [`ChangeSet`] in canonical order.
    pub fn decode(&self) -> Result<ChangeSet, StructuralError> {
        let mut set = ChangeSet::storage();
        if self.0.is_empty() {
            return Ok(set);
        }
        let layout = Layout::parse(self.0)?;
        if layout.count == 0 {
            return Ok(set);
        }
        let exceptions = layout.exceptions(self.0)?;
        for i in 0..layout.count {
            let key = layout.key(self.0, i, &exceptions)?;
            let value = layout.value(self.0, i)?;
            set.push(key.to_vec(), value.to_vec())?;
        }
        Ok(set)
    }

    /// Looks up the pre-image value recorded for `(address_hash, slot_hash)`,
    /// binary-searching the dictionary and then the entry rows.
    pub fn find(
        &self,
        address_hash: &[u8],
        slot_hash: &[u8],
    ) -> Result<Option<&'a [u8]>, StructuralError> {
        if self.0.is_empty() {
            return Ok(None);
        }
        let layout = Layout::parse(self.0)?;
        if layout.count == 0 {
            return Ok(None);
        }

        // Dictionary is in ascending address-hash order.
        let (mut lo, mut hi) = (0usize, layout.dict_len);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if layout.dict_entry(self.0, mid)? < address_hash {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= layout.dict_len || layout.dict_entry(self.0, lo)? != address_hash {
            return Ok(None);
        }

        // Entry rows are in ascending (dictIndex, slotHash) order; a row
        // compares like the concatenation searched for here.
        let mut target = Vec::with_capacity(layout.width + HASH_LENGTH);
        write_uint_by_width(&mut target, lo as u64, layout.width)?;
        target.extend_from_slice(slot_hash);

        let (mut lo, mut hi) = (0usize, layout.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if layout.entry_row(self.0, mid)? < target.as_slice() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < layout.count && layout.entry_row(self.0, lo)? == target.as_slice() {
            return Ok(Some(layout.value(self.0, lo)?));
        }
        Ok(None)
    }

    /// Streams `(composite key, value)` pairs in encoded order without
    /// materializing a [`ChangeSet`]. A callback error aborts the walk
    /// immediately.
    pub fn walk<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<StructuralError>,
        F: FnMut(&[u8], &[u8]) -> Result<(), E>,
    {
        if self.0.is_empty() {
            return Ok(());
        }
        let layout = Layout::parse(self.0).map_err(E::from)?;
        let exceptions = layout.exceptions(self.0).map_err(E::from)?;
        for i in 0..layout.count {
            let key = layout.key(self.0, i, &exceptions).map_err(E::from)?;
            let value = layout.value(self.0, i).map_err(E::from)?;
            f(&key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::composite_storage_key;
    use alloy_primitives::keccak256;
    use proptest::prelude::*;

    fn sample(addresses: usize, slots_per_address: usize) -> ChangeSet {
        let mut set = ChangeSet::storage();
        for a in 0..addresses {
            let address_hash = keccak256((a as u64).to_be_bytes());
            for s in 0..slots_per_address {
                let slot_hash = keccak256(((a * 1000 + s) as u64).to_be_bytes());
                let key = composite_storage_key(&address_hash, DEFAULT_INCARNATION, &slot_hash);
                set.push(key.to_vec(), format!("value {a}/{s}").into_bytes()).unwrap();
            }
        }
        set
    }

    /// Reference linear scan `find` used to validate the binary-search one.
    fn find_linear(data: &[u8], address_hash: &[u8], slot_hash: &[u8]) -> Option<Vec<u8>> {
        let mut result = None;
        StorageChangeSetBytes(data)
            .walk::<StructuralError, _>(|key, value| {
                if result.is_none()
                    && &key[..HASH_LENGTH] == address_hash
                    && &key[HASH_LENGTH + INCARNATION_LENGTH..] == slot_hash
                {
                    result = Some(value.to_vec());
                }
                Ok(())
            })
            .unwrap();
        result
    }

    #[test]
    fn round_trip() {
        let mut set = sample(5, 3);
        let encoded = encode_storage(&set).unwrap();
        set.canonicalize().unwrap();
        assert_eq!(StorageChangeSetBytes(&encoded).decode().unwrap(), set);
    }

    #[test]
    fn empty_round_trip() {
        let encoded = encode_storage(&ChangeSet::storage()).unwrap();
        assert!(StorageChangeSetBytes(&encoded).decode().unwrap().is_empty());
        assert!(StorageChangeSetBytes(&[]).decode().unwrap().is_empty());
    }

    #[test]
    fn dictionary_holds_each_address_once() {
        let set = sample(7, 4);
        let encoded = encode_storage(&set).unwrap();
        let dict_len = read_u16(&encoded, COUNT_LENGTH).unwrap();
        assert_eq!(dict_len, 7);
        assert_eq!(StorageChangeSetBytes(&encoded).count().unwrap(), 28);
    }

    #[test]
    fn non_default_incarnation_round_trips_exactly() {
        let address_hash = keccak256([1u8]);
        let other_hash = keccak256([2u8]);
        let slot_hash = keccak256([3u8]);

        let mut set = ChangeSet::storage();
        let excepted = composite_storage_key(&address_hash, 3, &slot_hash);
        let defaulted = composite_storage_key(&other_hash, DEFAULT_INCARNATION, &slot_hash);
        set.push(excepted.to_vec(), b"a".to_vec()).unwrap();
        set.push(defaulted.to_vec(), b"b".to_vec()).unwrap();

        let encoded = encode_storage(&set).unwrap();
        let decoded = StorageChangeSetBytes(&encoded).decode().unwrap();
        let mut incarnations: Vec<u64> = decoded
            .changes()
            .iter()
            .map(|c| crate::keys::incarnation_from_key(&c.key).unwrap())
            .collect();
        incarnations.sort_unstable();
        assert_eq!(incarnations, vec![3, DEFAULT_INCARNATION]);
    }

    #[test]
    fn incarnation_exception_applies_to_every_change_of_the_address() {
        let address_hash = keccak256([1u8]);
        let mut set = ChangeSet::storage();
        for s in 0..4u8 {
            let slot_hash = keccak256([10 + s]);
            let key = composite_storage_key(&address_hash, 5, &slot_hash);
            set.push(key.to_vec(), vec![s]).unwrap();
        }
        let encoded = encode_storage(&set).unwrap();
        let decoded = StorageChangeSetBytes(&encoded).decode().unwrap();
        for change in decoded.changes() {
            assert_eq!(crate::keys::incarnation_from_key(&change.key).unwrap(), 5);
        }
        // One 12-byte record for the one excepted address.
        let layout = Layout::parse(&encoded).unwrap();
        assert_eq!(encoded.len() - layout.exceptions_offset, 12);
    }

    #[test]
    fn cumulative_table_crosses_width_buckets() {
        // Values sized so the running sum crosses the 255 boundary mid-set.
        let mut set = ChangeSet::storage();
        let address_hash = keccak256([1u8]);
        for s in 0..5u8 {
            let slot_hash = keccak256([20 + s]);
            let key = composite_storage_key(&address_hash, DEFAULT_INCARNATION, &slot_hash);
            set.push(key.to_vec(), vec![s; 100]).unwrap();
        }
        set.canonicalize().unwrap();
        let encoded = encode_storage(&set).unwrap();
        let layout = Layout::parse(&encoded).unwrap();
        assert_eq!(layout.num_u8, 2);
        assert_eq!(layout.num_u16, 3);
        let decoded = StorageChangeSetBytes(&encoded).decode().unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn find_matches_values() {
        let mut set = sample(6, 3);
        set.canonicalize().unwrap();
        let encoded = encode_storage(&set).unwrap();
        let bytes = StorageChangeSetBytes(&encoded);
        for change in set.changes() {
            let found = bytes
                .find(&change.key[..HASH_LENGTH], &change.key[HASH_LENGTH + INCARNATION_LENGTH..])
                .unwrap();
            assert_eq!(found, Some(change.value.as_slice()));
        }
        let absent = keccak256(b"absent");
        assert_eq!(bytes.find(absent.as_slice(), absent.as_slice()).unwrap(), None);
    }

    #[test]
    fn malformed_incarnation_region_is_structural_error() {
        let set = sample(2, 2);
        let mut encoded = encode_storage(&set).unwrap();
        encoded.extend_from_slice(&[0u8; 5]);
        assert_eq!(
            StorageChangeSetBytes(&encoded).decode(),
            Err(StructuralError::BadIncarnationRegion(5))
        );
    }

    #[test]
    fn truncated_input_is_structural_error() {
        let encoded = encode_storage(&sample(3, 2)).unwrap();
        for cut in [3, 5, encoded.len() / 2] {
            assert!(matches!(
                StorageChangeSetBytes(&encoded[..cut]).decode(),
                Err(StructuralError::InputTooShort { .. } | StructuralError::BadIncarnationRegion(_))
            ));
        }
    }

    proptest! {
        #[test]
        fn binary_search_find_matches_linear_scan(
            addresses in 1usize..12,
            slots in 1usize..6,
            probe_address in 0usize..14,
            probe_slot in 0usize..8,
        ) {
            let mut set = sample(addresses, slots);
            set.canonicalize().unwrap();
            let encoded = encode_storage(&set).unwrap();

            let address_hash = keccak256((probe_address as u64).to_be_bytes());
            let slot_hash = keccak256(((probe_address * 1000 + probe_slot) as u64).to_be_bytes());
            let fast = StorageChangeSetBytes(&encoded)
                .find(address_hash.as_slice(), slot_hash.as_slice())
                .unwrap()
                .map(<[u8]>::to_vec);
            let reference = find_linear(&encoded, address_hash.as_slice(), slot_hash.as_slice());
            prop_assert_eq!(fast, reference);
        }

        #[test]
        fn round_trip_random_shapes(addresses in 0usize..9, slots in 1usize..5) {
            let mut set = sample(addresses, slots);
            let encoded = encode_storage(&set).unwrap();
            set.canonicalize().unwrap();
            prop_assert_eq!(StorageChangeSetBytes(&encoded).decode().unwrap(), set);
        }
    }
}
