//! Persistent inverted index for searching in 32-bit integers.
//!
//! The underlying structure is a `u32 -> u32` (term -> docID) multimap
//! built for fingerprint-style lookup: clients submit documents as sets of
//! 32-bit hashes and queries return, per candidate document, how many query
//! hashes it shares with the stored document.
//!
//! Storage is log-structured: writes accumulate in transactions and land as
//! immutable sorted segments, a manifest names the segments making up each
//! committed state, readers pin a manifest through snapshots, and a
//! background tiered merge keeps the segment count in check.

pub mod error;
pub mod index;
pub mod vfs;

pub use error::{IndexError, Result};
pub use index::{
    read_all_items, Batch, Database, Item, ItemBuffer, ItemReader, MergedItemReader, Options,
    Searcher, Snapshot, Transaction,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
