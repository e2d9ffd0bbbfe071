//! Segmented, log-structured inverted index engine.
//!
//! # Architecture
//!
//! - `ItemBuffer`: in-memory staging for recent writes
//! - `Segment`: immutable sorted item run with a deletion set
//! - `Manifest`: versioned list of segments forming a committed state
//! - `Snapshot`: read view pinned to one manifest
//! - `Transaction`: staging context committed atomically onto the current
//!   manifest
//! - `Database`: commit serialisation, file lifecycle and background merges

mod buffer;
mod codec;
mod db;
mod item;
mod manifest;
mod merge;
mod oracle;
mod segment;
mod snapshot;
mod transaction;

pub use buffer::{BufferReader, ItemBuffer};
pub use db::{Database, Options, WRITE_LOCK_FILE};
pub use item::{read_all_items, Item, ItemReader, MergedItemReader};
pub use manifest::Manifest;
pub use merge::{MergePlan, TieredMergePolicy};
pub use oracle::DocFilter;
pub use segment::{Segment, SegmentItemReader};
pub use snapshot::Snapshot;
pub use transaction::Transaction;

use std::collections::HashMap;

use crate::error::Result;

/// A consistent read view over the index.
pub trait Searcher {
    /// For each document sharing at least one hash with the query, count
    /// how many of the deduplicated query hashes it contains.
    fn search(&self, query: &[u32]) -> Result<HashMap<u32, usize>>;

    /// Sorted stream over all live items in the view.
    fn reader(&self) -> Box<dyn ItemReader>;
}

/// A set of write operations applied atomically on commit.
pub trait Batch {
    /// Add a document to the index. If the document already exists, it is
    /// updated.
    fn add(&mut self, docid: u32, terms: &[u32]) -> Result<()>;

    /// Delete a document from the index.
    fn delete(&mut self, docid: u32) -> Result<()>;

    /// Add a pre-sorted stream of document terms to the index.
    fn import(&mut self, items: &mut dyn ItemReader) -> Result<()>;

    /// Apply all previous operations to the index atomically.
    fn commit(&mut self) -> Result<()>;
}
