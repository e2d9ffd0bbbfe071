//! Database orchestration: open, commit serialisation, reference-counted
//! file lifecycle and the background merge / compaction / orphan-deletion
//! workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::item::{ItemReader, MergedItemReader};
use super::manifest::{self, Manifest};
use super::merge::TieredMergePolicy;
use super::segment;
use super::snapshot::Snapshot;
use super::transaction::Transaction;
use super::{Batch, Searcher};
use crate::error::{IndexError, Result};
use crate::vfs::{DirLock, Directory};

pub const WRITE_LOCK_FILE: &str = "write.lock";

/// Options that can be set when opening a database.
#[derive(Clone, Debug)]
pub struct Options {
    /// Run compactions automatically in the background.
    pub enable_auto_compact: bool,

    /// How often to run automatic compactions. Only used if
    /// `enable_auto_compact` is set.
    pub auto_compact_interval: Duration,

    /// Reset the backed-off compaction interval after a success. With
    /// `false` the interval keeps growing across failures for the lifetime
    /// of the process.
    pub auto_compact_backoff_reset: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_auto_compact: false,
            auto_compact_interval: Duration::from_secs(10),
            auto_compact_backoff_reset: true,
        }
    }
}

type MergeReply = Sender<Result<()>>;

#[derive(Default)]
struct DbState {
    refs: HashMap<String, i64>,
    write_lock: Option<Box<dyn DirLock>>,
    closed: bool,
    num_snapshots: i64,
    num_transactions: i64,
}

/// Shared engine state behind the public [`Database`] handle.
pub(crate) struct DbInner {
    fs: Arc<dyn Directory>,
    opts: Options,
    policy: TieredMergePolicy,
    txid: AtomicU32,
    current: ArcSwap<Manifest>,
    state: Mutex<DbState>,
    merge_tx: Mutex<Option<Sender<MergeReply>>>,
    orphan_tx: Mutex<Option<Sender<String>>>,
}

impl DbInner {
    pub(crate) fn fs(&self) -> &Arc<dyn Directory> {
        &self.fs
    }

    pub(crate) fn next_txid(&self) -> u32 {
        self.txid.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn inc_file_refs(state: &mut DbState, manifest: &Manifest) {
        for name in manifest.file_names() {
            *state.refs.entry(name).or_insert(0) += 1;
        }
    }

    /// Returns the names whose reference count dropped to zero.
    fn dec_file_refs(state: &mut DbState, manifest: &Manifest) -> Vec<String> {
        let mut orphans = Vec::new();
        for name in manifest.file_names() {
            if let Some(count) = state.refs.get_mut(&name) {
                *count -= 1;
                if *count <= 0 {
                    state.refs.remove(&name);
                    debug!(file = %name, "file no longer referenced");
                    orphans.push(name);
                }
            }
        }
        orphans
    }

    pub(crate) fn new_snapshot(self: &Arc<Self>) -> Snapshot {
        let mut state = self.state.lock();
        let manifest = self.current.load_full();
        Self::inc_file_refs(&mut state, &manifest);
        state.num_snapshots += 1;
        drop(state);
        debug!(manifest = manifest.id(), "created snapshot");
        Snapshot::new(Arc::clone(self), manifest)
    }

    pub(crate) fn release_snapshot(&self, manifest: &Manifest) {
        let mut state = self.state.lock();
        let orphans = Self::dec_file_refs(&mut state, manifest);
        state.num_snapshots -= 1;
        drop(state);
        for name in orphans {
            self.enqueue_orphan(name);
        }
    }

    pub(crate) fn note_transaction_closed(&self) {
        self.state.lock().num_transactions -= 1;
    }

    /// Serialised commit: apply `prepare` to the current manifest, persist
    /// dirty segment metadata and the new manifest, swap the current
    /// pointer and retire files the old revision no longer needs.
    pub(crate) fn commit<F>(&self, prepare: F) -> Result<()>
    where
        F: FnOnce(&Manifest) -> Result<Manifest>,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(IndexError::AlreadyClosed);
        }

        let base = self.current.load_full();
        let mut manifest = prepare(&base)?;
        manifest.set_id(self.next_txid());

        let txid = manifest.id();
        for idx in 0..manifest.segments().len() {
            if manifest.segments()[idx].is_dirty() {
                manifest.segment_mut_at(idx).save_update(self.fs.as_ref(), txid)?;
            }
        }
        manifest.refresh_stats();
        manifest.save(self.fs.as_ref())?;

        let manifest = Arc::new(manifest);
        Self::inc_file_refs(&mut state, &manifest);
        let orphans = Self::dec_file_refs(&mut state, &base);
        self.current.store(Arc::clone(&manifest));

        info!(
            txid,
            docs = manifest.num_docs() - manifest.num_deleted_docs(),
            items = manifest.num_items(),
            segments = manifest.segments().len(),
            checksum = manifest.checksum(),
            "committed transaction"
        );

        drop(state);
        for name in orphans {
            self.enqueue_orphan(name);
        }
        Ok(())
    }

    pub(crate) fn compact(&self) -> Result<()> {
        let tx = self.merge_tx.lock().clone();
        let tx = tx.ok_or(IndexError::AlreadyClosed)?;
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(reply_tx).map_err(|_| IndexError::AlreadyClosed)?;
        reply_rx.recv().map_err(|_| IndexError::AlreadyClosed)?
    }

    /// Hand a file to the deletion worker; after shutdown the queue is gone
    /// and the file is removed inline, best-effort.
    pub(crate) fn enqueue_orphan(&self, name: String) {
        let tx = self.orphan_tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(name.clone()).is_err() {
                    self.remove_file(&name);
                }
            }
            None => self.remove_file(&name),
        }
    }

    fn remove_file(&self, name: &str) {
        match self.fs.remove(name) {
            Ok(()) => debug!(file = %name, "deleted file"),
            Err(IndexError::NotFound(_)) => {}
            Err(err) => error!(file = %name, %err, "failed to delete file"),
        }
    }

    /// Remove crash leftovers: index-owned files the current manifest does
    /// not reference.
    fn collect_stale_files(&self) -> Result<()> {
        let state = self.state.lock();
        let mut stale = Vec::new();
        for name in self.fs.read_dir()? {
            if name == WRITE_LOCK_FILE || state.refs.contains_key(&name) {
                continue;
            }
            let owned = manifest::parse_file_name(&name).is_some()
                || segment::parse_data_file_name(&name).is_some()
                || segment::parse_meta_file_name(&name).is_some()
                || name.contains(".tmp.");
            if owned {
                stale.push(name);
            }
        }
        drop(state);
        for name in stale {
            debug!(file = %name, "removing stale file");
            self.remove_file(&name);
        }
        Ok(())
    }
}

fn run_one_merge(db: &Arc<DbInner>, max_size: u64) -> Result<()> {
    let snapshot = db.new_snapshot();
    let plan = db.policy.find_best_merge(snapshot.manifest(), max_size);
    match plan {
        Some(plan) => plan.run(db),
        None => Ok(()),
    }
}

fn merge_worker(inner: Arc<DbInner>, requests: Receiver<MergeReply>) {
    for reply in requests.iter() {
        let result = run_one_merge(&inner, 0);
        let _ = reply.send(result);
    }
}

fn orphan_worker(inner: Arc<DbInner>, orphans: Receiver<String>) {
    for name in orphans.iter() {
        inner.remove_file(&name);
    }
}

fn auto_compact_worker(inner: Arc<DbInner>, closing: Receiver<()>) {
    let base = inner.opts.auto_compact_interval;
    let mut interval = base;
    info!(?interval, "scheduling auto-compact");
    loop {
        crossbeam_channel::select! {
            // Fires on disconnect when the database shuts down.
            recv(closing) -> _ => return,
            recv(crossbeam_channel::after(interval)) -> _ => {
                match inner.compact() {
                    Ok(()) => {
                        if inner.opts.auto_compact_backoff_reset {
                            interval = base;
                        }
                    }
                    Err(IndexError::AlreadyClosed) => return,
                    Err(err) => {
                        interval += interval / 2;
                        warn!(%err, ?interval, "auto-compact failed, backing off");
                    }
                }
            }
        }
    }
}

/// A persistent inverted index over 32-bit terms and docIDs.
///
/// One process owns the directory; all handles share the same engine, and
/// the last handle dropping (or an explicit [`Database::close`]) shuts the
/// background workers down.
pub struct Database {
    inner: Arc<DbInner>,
    merge_worker: Mutex<Option<JoinHandle<()>>>,
    compact_worker: Mutex<Option<JoinHandle<()>>>,
    orphan_worker: Mutex<Option<JoinHandle<()>>>,
    closing_tx: Mutex<Option<Sender<()>>>,
}

impl Database {
    /// Open the index stored in `fs`, creating an empty one when `create`
    /// is set and no manifest exists yet.
    pub fn open(fs: Arc<dyn Directory>, create: bool, opts: Options) -> Result<Database> {
        let manifest = Manifest::load(fs.as_ref(), create)?;
        info!(
            manifest = manifest.id(),
            segments = manifest.segments().len(),
            "opened index"
        );

        let inner = Arc::new(DbInner {
            txid: AtomicU32::new(manifest.id()),
            current: ArcSwap::from_pointee(manifest),
            fs,
            opts: opts.clone(),
            policy: TieredMergePolicy::default(),
            state: Mutex::new(DbState::default()),
            merge_tx: Mutex::new(None),
            orphan_tx: Mutex::new(None),
        });

        {
            let mut state = inner.state.lock();
            let current = inner.current.load_full();
            DbInner::inc_file_refs(&mut state, &current);
        }
        inner.collect_stale_files()?;

        let (orphan_tx, orphan_rx) = bounded::<String>(16);
        *inner.orphan_tx.lock() = Some(orphan_tx);
        let (merge_tx, merge_rx) = bounded::<MergeReply>(0);
        *inner.merge_tx.lock() = Some(merge_tx);
        let (closing_tx, closing_rx) = bounded::<()>(0);

        let orphan_handle = {
            let inner = Arc::clone(&inner);
            std::thread::spawn(move || orphan_worker(inner, orphan_rx))
        };
        let merge_handle = {
            let inner = Arc::clone(&inner);
            std::thread::spawn(move || merge_worker(inner, merge_rx))
        };
        let compact_handle = if opts.enable_auto_compact {
            let inner = Arc::clone(&inner);
            Some(std::thread::spawn(move || {
                auto_compact_worker(inner, closing_rx)
            }))
        } else {
            None
        };

        Ok(Database {
            inner,
            merge_worker: Mutex::new(Some(merge_handle)),
            compact_worker: Mutex::new(compact_handle),
            orphan_worker: Mutex::new(Some(orphan_handle)),
            closing_tx: Mutex::new(Some(closing_tx)),
        })
    }

    /// Start a write transaction. The directory's advisory write lock is
    /// taken on the first transaction and held until close.
    pub fn transaction(&self) -> Result<Transaction> {
        let snapshot = self.inner.new_snapshot();

        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            return Err(IndexError::AlreadyClosed);
        }
        if state.write_lock.is_none() {
            match self.inner.fs.lock(WRITE_LOCK_FILE) {
                Ok(lock) => {
                    info!("acquired write lock");
                    state.write_lock = Some(lock);
                }
                Err(err) => {
                    drop(state);
                    return Err(err);
                }
            }
        }
        state.num_transactions += 1;
        drop(state);

        debug!(base = snapshot.id(), "created transaction");
        Ok(Transaction::new(Arc::clone(&self.inner), snapshot))
    }

    /// Run `f` inside a transaction and commit when it succeeds.
    pub fn run_in_transaction<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut txn = self.transaction()?;
        f(&mut txn)?;
        txn.commit()
    }

    /// Add a document to the index. An existing document with the same id
    /// is replaced.
    pub fn add(&self, docid: u32, terms: &[u32]) -> Result<()> {
        self.run_in_transaction(|txn| txn.add(docid, terms))
    }

    /// Delete a document from the index.
    pub fn delete(&self, docid: u32) -> Result<()> {
        self.run_in_transaction(|txn| txn.delete(docid))
    }

    /// Add a pre-sorted stream of items to the index.
    pub fn import(&self, items: &mut dyn ItemReader) -> Result<()> {
        self.run_in_transaction(|txn| txn.import(items))
    }

    /// Delete all docs from the index.
    pub fn truncate(&self) -> Result<()> {
        let snapshot = self.inner.new_snapshot();
        let ids: Vec<u32> = snapshot
            .manifest()
            .segments()
            .iter()
            .map(|s| s.id())
            .collect();
        self.inner.commit(|base| {
            let mut manifest = base.clone();
            for &id in &ids {
                manifest.remove_segment(id);
            }
            Ok(manifest)
        })
    }

    /// Create a consistent read-only view of the index.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.new_snapshot()
    }

    /// Count query-hash matches per document across the whole index.
    pub fn search(&self, query: &[u32]) -> Result<HashMap<u32, usize>> {
        if self.inner.state.lock().closed {
            return Err(IndexError::AlreadyClosed);
        }
        self.snapshot().search(query)
    }

    /// Run one round of segment merging, waiting for it to finish.
    pub fn compact(&self) -> Result<()> {
        self.inner.compact()
    }

    /// Sorted stream over all live items in the index.
    pub fn reader(&self) -> MergedItemReader {
        let manifest = self.inner.current.load_full();
        let readers: Vec<Box<dyn ItemReader>> = manifest
            .segments()
            .iter()
            .map(|s| Box::new(s.reader()) as Box<dyn ItemReader>)
            .collect();
        MergedItemReader::new(readers)
    }

    pub fn num_segments(&self) -> usize {
        self.inner.current.load().segments().len()
    }

    pub fn num_docs(&self) -> u64 {
        self.inner.current.load().num_docs()
    }

    pub fn num_deleted_docs(&self) -> u64 {
        self.inner.current.load().num_deleted_docs()
    }

    /// True if the index holds a live copy of the doc.
    pub fn contains(&self, docid: u32) -> bool {
        self.inner
            .current
            .load()
            .segments()
            .iter()
            .any(|s| s.contains(docid))
    }

    /// Shut the database down: stop commits, drain the merge worker, drain
    /// the orphan queue, release the write lock. Idempotent; also runs on
    /// drop.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.closing_tx.lock().take();
        self.inner.merge_tx.lock().take();
        if let Some(handle) = self.merge_worker.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.compact_worker.lock().take() {
            let _ = handle.join();
        }

        self.inner.orphan_tx.lock().take();
        if let Some(handle) = self.orphan_worker.lock().take() {
            let _ = handle.join();
        }

        let mut state = self.inner.state.lock();
        if state.write_lock.take().is_some() {
            info!("released write lock");
        }
        debug!("closed database");
    }
}

impl Searcher for Database {
    fn search(&self, query: &[u32]) -> Result<HashMap<u32, usize>> {
        Database::search(self, query)
    }

    fn reader(&self) -> Box<dyn ItemReader> {
        Box::new(Database::reader(self))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}
