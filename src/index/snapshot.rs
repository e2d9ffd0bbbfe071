//! Point-in-time read views.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::db::DbInner;
use super::item::{ItemReader, MergedItemReader};
use super::manifest::Manifest;
use super::Searcher;
use crate::error::Result;

/// A consistent read-only view pinned to one manifest.
///
/// Holding a snapshot keeps every file of its manifest alive; dropping (or
/// closing) it releases those references and may queue orphaned files for
/// deletion.
pub struct Snapshot {
    inner: Arc<DbInner>,
    manifest: Arc<Manifest>,
    closed: bool,
}

impl Snapshot {
    pub(crate) fn new(inner: Arc<DbInner>, manifest: Arc<Manifest>) -> Self {
        Self {
            inner,
            manifest,
            closed: false,
        }
    }

    pub(crate) fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Manifest id this view is pinned to.
    pub fn id(&self) -> u32 {
        self.manifest.id()
    }

    /// True when the view holds a live copy of the doc.
    pub fn contains(&self, docid: u32) -> bool {
        self.manifest
            .segments()
            .iter()
            .any(|segment| segment.contains(docid))
    }

    /// Release the view. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.release_snapshot(&self.manifest);
            debug!(manifest = self.manifest.id(), "closed snapshot");
        }
    }
}

impl Searcher for Snapshot {
    fn search(&self, query: &[u32]) -> Result<HashMap<u32, usize>> {
        let mut terms = query.to_vec();
        terms.sort_unstable();
        terms.dedup();

        let mut hits = HashMap::new();
        for segment in self.manifest.segments() {
            segment.search(&terms, &mut hits)?;
        }
        Ok(hits)
    }

    fn reader(&self) -> Box<dyn ItemReader> {
        let readers: Vec<Box<dyn ItemReader>> = self
            .manifest
            .segments()
            .iter()
            .map(|segment| Box::new(segment.reader()) as Box<dyn ItemReader>)
            .collect();
        Box::new(MergedItemReader::new(readers))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.close();
    }
}
