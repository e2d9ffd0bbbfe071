//! File-system abstraction consumed by the index engine.
//!
//! The engine only ever talks to a [`Directory`]: a flat namespace of files
//! with atomic create-and-rename and advisory locking. Two implementations
//! are provided: [`OsDir`] for real directories and [`MemDir`] for tests.

mod mem;
mod os;

pub use mem::MemDir;
pub use os::OsDir;

use std::fmt;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::Result;

/// Read handle for a file inside a [`Directory`].
pub trait InputFile: Read + Seek + Send {
    /// Total size of the file in bytes.
    fn size(&self) -> Result<u64>;
}

/// Write handle for a plain (non-atomic) file.
pub trait OutputFile: Write + Send {
    /// Flush buffered data and make it durable.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Write handle for an atomically created file.
///
/// The named file either fully materialises on `commit` or never appears;
/// dropping the handle without committing aborts and leaves no trace.
pub trait AtomicFile: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// An advisory lock inside a [`Directory`], released on drop.
pub trait DirLock: Send {}

/// A flat directory of files owned by the index.
pub trait Directory: Send + Sync + fmt::Debug {
    /// List the names of all files in the directory.
    fn read_dir(&self) -> Result<Vec<String>>;

    /// Open an existing file for reading.
    fn open_file(&self, name: &str) -> Result<Box<dyn InputFile>>;

    /// Create a file for writing. When `overwrite` is false the call fails
    /// if the file already exists.
    fn create_file(&self, name: &str, overwrite: bool) -> Result<Box<dyn OutputFile>>;

    /// Create a file that only becomes visible under `name` once the
    /// returned handle is committed.
    fn create_atomic_file(&self, name: &str) -> Result<Box<dyn AtomicFile>>;

    /// Rename a file.
    fn rename(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Remove a file.
    fn remove(&self, name: &str) -> Result<()>;

    /// Check whether a file exists.
    fn exists(&self, name: &str) -> bool;

    /// Acquire the advisory lock with the given name, failing with
    /// [`IndexError::Locked`](crate::IndexError::Locked) when another owner
    /// holds it.
    fn lock(&self, name: &str) -> Result<Box<dyn DirLock>>;
}

impl<D: Directory + ?Sized> Directory for Arc<D> {
    fn read_dir(&self) -> Result<Vec<String>> {
        (**self).read_dir()
    }

    fn open_file(&self, name: &str) -> Result<Box<dyn InputFile>> {
        (**self).open_file(name)
    }

    fn create_file(&self, name: &str, overwrite: bool) -> Result<Box<dyn OutputFile>> {
        (**self).create_file(name, overwrite)
    }

    fn create_atomic_file(&self, name: &str) -> Result<Box<dyn AtomicFile>> {
        (**self).create_atomic_file(name)
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        (**self).rename(old_name, new_name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        (**self).remove(name)
    }

    fn exists(&self, name: &str) -> bool {
        (**self).exists(name)
    }

    fn lock(&self, name: &str) -> Result<Box<dyn DirLock>> {
        (**self).lock(name)
    }
}
