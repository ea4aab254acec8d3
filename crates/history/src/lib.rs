//! Point-in-time historical state access.
//!
//! This crate implements the as-of layer of a node's storage engine:
//!
//! - [`changeset`] — per-block change-set codecs (plain account variant and
//!   dictionary-compressed storage variant), recording pre-image values.
//! - [`index`] — the chunked per-key history index mapping entity keys to
//!   the blocks at which they changed.
//! - [`generator`] — batch construction of the index from persisted
//!   change-sets, restart-safe via persisted checkpoints.
//! - [`asof`] — point ([`asof::HistoricalState::get_as_of`]) and range
//!   ([`asof::HistoricalState::walk_as_of`]) queries combining the index,
//!   the change-sets and current state.
//!
//! The storage backend is abstracted behind the `aion-kv` contract; block
//! commit (the mutation writer) is an external collaborator that persists
//! one change-set per block and keeps the index current.

#![warn(missing_debug_implementations, missing_docs, unreachable_pub, rustdoc::all)]

pub mod asof;
pub mod changeset;
pub mod error;
pub mod generator;
pub mod index;
pub mod keys;
pub mod tables;

#[cfg(test)]
mod test_utils;

pub use asof::{HistoricalState, HistoryLayout};
pub use error::{HistoryError, StructuralError};
pub use generator::IndexGenerator;
pub use index::{get_index_chunk, HistoryChunk, HistoryChunks, CHUNK_SIZE_LIMIT};
pub use keys::{EntityKind, DEFAULT_INCARNATION};
pub use tables::Tables;
