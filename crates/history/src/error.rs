use aion_kv::KvError;
use thiserror::Error;

/// Failures surfaced by the history layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// Key absent from both history and current state.
    #[error("key not found")]
    NotFound,
    /// Encoded input violated the wire format. Never recovered silently:
    /// encoded bytes come from storage and may be corrupted.
    #[error("structural decode error: {0}")]
    Decode(#[from] StructuralError),
    /// Operation aborted by the caller-supplied cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
    /// Store-level failure.
    #[error(transparent)]
    Kv(KvError),
}

impl From<KvError> for HistoryError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound => Self::NotFound,
            other => Self::Kv(other),
        }
    }
}

/// Wire-format violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// Fewer bytes than the layout arithmetic requires.
    #[error("input too short: have {have} bytes, need {need}")]
    InputTooShort {
        /// Bytes available.
        have: usize,
        /// Bytes the structure requires.
        need: usize,
    },
    /// Trailing incarnation region is not a whole number of 12-byte records.
    #[error("incarnation region length {0} is not a multiple of 12")]
    BadIncarnationRegion(usize),
    /// A value-derived byte width outside {1, 2, 4, 8}.
    #[error("invalid element width {0}")]
    InvalidWidth(usize),
    /// An element index outside the encoded element count.
    #[error("element index {index} out of range for {count} elements")]
    ElementOutOfRange {
        /// Requested element.
        index: usize,
        /// Encoded element count.
        count: usize,
    },
    /// Entity key length is neither the account nor the storage shape.
    #[error("unsupported entity key length {0}")]
    BadKeyLength(usize),
    /// Cumulative value-length table decreased between elements.
    #[error("length table is not monotonically non-decreasing")]
    InvalidLengthTable,
    /// Per-width value counts do not add up to the element count.
    #[error("value count buckets sum to {found}, expected {expected}")]
    InconsistentCounts {
        /// Encoded element count.
        expected: usize,
        /// Sum of the three width-bucket counts.
        found: usize,
    },
    /// Change-set exceeds a fixed-width field of the wire format.
    #[error("change-set too large for wire format: {0}")]
    TooLarge(&'static str),
    /// Duplicate key in a change-set about to be encoded.
    #[error("duplicate key in change-set")]
    DuplicateKey,
    /// A block number too large for the index entry encoding.
    #[error("block number {0} exceeds index entry range")]
    BlockOutOfRange(u64),
    /// History chunk bytes with an impossible shape.
    #[error("malformed history chunk: {0}")]
    BadChunk(&'static str),
    /// The history index referenced a change the change-set tables do not
    /// contain.
    #[error("history index references missing change at block {block}")]
    MissingChange {
        /// Block number the index hit resolved to.
        block: u64,
    },
}
