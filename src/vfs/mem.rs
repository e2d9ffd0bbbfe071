//! In-memory directory implementation for testing.

use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AtomicFile, DirLock, Directory, InputFile, OutputFile};
use crate::error::{IndexError, Result};

#[derive(Default)]
struct MemState {
    files: HashMap<String, Arc<[u8]>>,
    locks: HashSet<String>,
}

/// An in-memory [`Directory`].
///
/// Cloning the handle shares the underlying namespace, so a "reopen" in
/// tests sees the files written by the previous instance.
#[derive(Clone, Default)]
pub struct MemDir {
    state: Arc<Mutex<MemState>>,
}

impl MemDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }
}

impl std::fmt::Debug for MemDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemDir")
            .field("files", &state.files.len())
            .finish()
    }
}

impl Directory for MemDir {
    fn read_dir(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.state.lock().files.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn open_file(&self, name: &str) -> Result<Box<dyn InputFile>> {
        let state = self.state.lock();
        let data = state
            .files
            .get(name)
            .ok_or_else(|| IndexError::NotFound(name.to_string()))?;
        Ok(Box::new(MemInput {
            cursor: Cursor::new(Arc::clone(data)),
        }))
    }

    fn create_file(&self, name: &str, overwrite: bool) -> Result<Box<dyn OutputFile>> {
        if !overwrite && self.exists(name) {
            return Err(IndexError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {name}"),
            )));
        }
        Ok(Box::new(MemOutput {
            name: name.to_string(),
            buf: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn create_atomic_file(&self, name: &str) -> Result<Box<dyn AtomicFile>> {
        Ok(Box::new(MemOutput {
            name: name.to_string(),
            buf: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let data = state
            .files
            .remove(old_name)
            .ok_or_else(|| IndexError::NotFound(old_name.to_string()))?;
        state.files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .files
            .remove(name)
            .ok_or_else(|| IndexError::NotFound(name.to_string()))?;
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.state.lock().files.contains_key(name)
    }

    fn lock(&self, name: &str) -> Result<Box<dyn DirLock>> {
        let mut state = self.state.lock();
        if !state.locks.insert(name.to_string()) {
            return Err(IndexError::Locked);
        }
        Ok(Box::new(MemLock {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl Read for MemInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl InputFile for MemInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

/// Buffers writes and publishes the file on commit. Doubles as the atomic
/// handle: nothing is visible until `commit`, dropping discards the buffer.
struct MemOutput {
    name: String,
    buf: Vec<u8>,
    state: Arc<Mutex<MemState>>,
}

impl Write for MemOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemOutput {
    fn publish(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        state.files.insert(self.name, self.buf.into());
        Ok(())
    }
}

impl OutputFile for MemOutput {
    fn commit(self: Box<Self>) -> Result<()> {
        self.publish()
    }
}

impl AtomicFile for MemOutput {
    fn commit(self: Box<Self>) -> Result<()> {
        self.publish()
    }
}

struct MemLock {
    name: String,
    state: Arc<Mutex<MemState>>,
}

impl DirLock for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.state.lock().locks.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let dir = MemDir::new();

        let mut out = dir.create_atomic_file("a.bin").unwrap();
        out.write_all(b"hello").unwrap();
        assert!(!dir.exists("a.bin"), "file visible before commit");
        out.commit().unwrap();

        let mut input = dir.open_file("a.bin").unwrap();
        let mut data = Vec::new();
        input.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(input.size().unwrap(), 5);
    }

    #[test]
    fn test_abort_leaves_no_file() {
        let dir = MemDir::new();
        let mut out = dir.create_atomic_file("a.bin").unwrap();
        out.write_all(b"partial").unwrap();
        drop(out);
        assert!(!dir.exists("a.bin"));
    }

    #[test]
    fn test_create_exclusive() {
        let dir = MemDir::new();
        dir.create_file("a.bin", false).unwrap().commit().unwrap();
        assert!(dir.create_file("a.bin", false).is_err());
        assert!(dir.create_file("a.bin", true).is_ok());
    }

    #[test]
    fn test_lock_exclusion() {
        let dir = MemDir::new();
        let guard = dir.lock("write.lock").unwrap();
        assert!(matches!(dir.lock("write.lock"), Err(IndexError::Locked)));
        drop(guard);
        assert!(dir.lock("write.lock").is_ok());
    }

    #[test]
    fn test_shared_namespace_across_clones() {
        let dir = MemDir::new();
        dir.create_file("a.bin", true).unwrap().commit().unwrap();
        let reopened = dir.clone();
        assert!(reopened.exists("a.bin"));
    }
}
