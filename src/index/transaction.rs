//! Write transactions.

use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::debug;

use super::buffer::ItemBuffer;
use super::db::DbInner;
use super::item::ItemReader;
use super::segment::{self, Segment};
use super::snapshot::Snapshot;
use super::Batch;
use crate::error::{IndexError, Result};

/// A private staging area on top of a snapshot.
///
/// Adds and deletes accumulate in memory; `import` streams straight into
/// segment files owned by the transaction. Nothing is visible to readers
/// until [`Transaction::commit`], which re-bases the staged effects onto
/// the database's current manifest, so the outcome between overlapping
/// transactions is decided purely by commit order.
pub struct Transaction {
    inner: Arc<DbInner>,
    snapshot: Snapshot,
    buffer: ItemBuffer,
    pending_deletes: RoaringBitmap,
    imported: Vec<Segment>,
    committed: bool,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<DbInner>, snapshot: Snapshot) -> Self {
        Self {
            inner,
            snapshot,
            buffer: ItemBuffer::new(),
            pending_deletes: RoaringBitmap::new(),
            imported: Vec::new(),
            committed: false,
            closed: false,
        }
    }

    /// Base manifest id this transaction was opened against.
    pub fn base_id(&self) -> u32 {
        self.snapshot.id()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed || self.committed {
            return Err(IndexError::AlreadyClosed);
        }
        Ok(())
    }

    /// Mark the docID for tombstoning in every older copy at commit time.
    fn tombstone_older(&mut self, docid: u32) {
        self.pending_deletes.insert(docid);
    }

    /// Release the transaction. Uncommitted staged segments are discarded.
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for segment in self.imported.drain(..) {
            // Never referenced by a manifest; the file can go right away.
            self.inner
                .enqueue_orphan(segment::data_file_name(segment.id()));
        }
        self.snapshot.close();
        self.inner.note_transaction_closed();
        debug!(base = self.snapshot.id(), "closed transaction");
    }
}

impl Batch for Transaction {
    fn add(&mut self, docid: u32, terms: &[u32]) -> Result<()> {
        self.check_open()?;
        if docid == 0 {
            return Err(IndexError::InvalidDocId);
        }
        if terms.is_empty() {
            return Err(IndexError::EmptyTerms);
        }

        // Adding an existing doc is delete-then-insert: older copies in the
        // base view, in earlier imports, or in this buffer all give way.
        if self.buffer.contains(docid) {
            self.buffer.delete(docid);
            self.tombstone_older(docid);
        }
        for segment in &mut self.imported {
            if segment.delete_doc(docid) {
                self.pending_deletes.insert(docid);
            }
        }
        if self.snapshot.contains(docid) {
            self.tombstone_older(docid);
        }

        self.buffer.add(docid, terms);
        Ok(())
    }

    fn delete(&mut self, docid: u32) -> Result<()> {
        self.check_open()?;
        if docid == 0 {
            return Err(IndexError::InvalidDocId);
        }
        self.tombstone_older(docid);
        self.buffer.delete(docid);
        for segment in &mut self.imported {
            segment.delete_doc(docid);
        }
        Ok(())
    }

    fn import(&mut self, items: &mut dyn ItemReader) -> Result<()> {
        self.check_open()?;
        let id = self.inner.next_txid();
        let segment = Segment::create(self.inner.fs().as_ref(), id, items)?;
        if segment.num_items() == 0 {
            self.inner.enqueue_orphan(segment::data_file_name(id));
            return Ok(());
        }

        // Imported docs replace older copies the same way add does: staged
        // items, earlier imports and the base view all give way.
        for docid in segment.docs() {
            if docid == 0 {
                self.inner.enqueue_orphan(segment::data_file_name(id));
                return Err(IndexError::InvalidDocId);
            }
            if self.buffer.contains(docid) {
                self.buffer.delete(docid);
                self.pending_deletes.insert(docid);
            }
            for earlier in &mut self.imported {
                if earlier.delete_doc(docid) {
                    self.pending_deletes.insert(docid);
                }
            }
            if self.snapshot.contains(docid) {
                self.pending_deletes.insert(docid);
            }
        }

        debug!(
            segment = id,
            docs = segment.num_docs(),
            items = segment.num_items(),
            "imported segment"
        );
        self.imported.push(segment);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.check_open()?;

        let buffer = std::mem::take(&mut self.buffer);
        let mut new_segments = std::mem::take(&mut self.imported);
        let pending_deletes = std::mem::take(&mut self.pending_deletes);

        let inner = Arc::clone(&self.inner);
        let result = inner.commit(|base| {
            let mut manifest = base.clone();

            if !buffer.is_empty() {
                let id = inner.next_txid();
                let segment = Segment::create(inner.fs().as_ref(), id, &mut buffer.reader())?;
                if segment.num_items() == 0 {
                    inner.enqueue_orphan(segment::data_file_name(id));
                } else {
                    new_segments.push(segment);
                }
            }

            // Every docID written or deleted by this transaction tombstones
            // its copies in the pre-existing segments; the transaction's own
            // segments are excluded from the sweep.
            let mut deletes = pending_deletes;
            for segment in &new_segments {
                deletes |= segment.docs();
            }
            if !deletes.is_empty() {
                for idx in 0..manifest.segments().len() {
                    let segment = &manifest.segments()[idx];
                    let present = &deletes & segment.docs();
                    if !present.is_empty() && !present.is_subset(segment.deleted_docs()) {
                        manifest.segment_mut_at(idx).delete_docs(&present);
                    }
                }
            }

            for segment in new_segments.drain(..) {
                manifest.add_segment(Arc::new(segment));
            }
            Ok(manifest)
        });

        if result.is_ok() {
            self.committed = true;
        }
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}
