//! Ordered cursor contract.

use crate::KvError;

/// An owned key-value pair yielded by a cursor.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Ordered cursor over one bucket.
///
/// Positioning methods return the entry they land on, or `None` when the
/// cursor moves past either end of the bucket.
pub trait Cursor {
    /// Positions at the first entry.
    fn first(&mut self) -> Result<Option<KvPair>, KvError>;

    /// Positions at the first entry with key `>= key`. When no such entry
    /// exists the cursor parks past the end; a following [`Cursor::prev`]
    /// lands on the last entry below the sought key.
    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, KvError>;

    /// Advances to the next entry.
    fn next(&mut self) -> Result<Option<KvPair>, KvError>;

    /// Steps back to the previous entry (relative to the current position,
    /// or to the last unsuccessful seek target).
    fn prev(&mut self) -> Result<Option<KvPair>, KvError>;
}
