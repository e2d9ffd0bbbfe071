//! On-disk directory implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{AtomicFile, DirLock, Directory, InputFile, OutputFile};
use crate::error::{IndexError, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A [`Directory`] backed by a real file-system directory.
#[derive(Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    /// Open a directory, optionally creating it when missing.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        match fs::metadata(&root) {
            Ok(info) => {
                if !info.is_dir() {
                    return Err(IndexError::NotDirectory(root));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound && create => {
                fs::create_dir_all(&root)?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self { root })
    }

    /// Root path of the directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Flush directory metadata so a rename survives a crash.
    fn sync_dir(&self) -> Result<()> {
        let dir = File::open(&self.root)?;
        dir.sync_all()?;
        Ok(())
    }
}

impl Directory for OsDir {
    fn read_dir(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn open_file(&self, name: &str) -> Result<Box<dyn InputFile>> {
        let file = File::open(self.file_path(name)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                IndexError::NotFound(name.to_string())
            } else {
                IndexError::Io(err)
            }
        })?;
        let size = file.metadata()?.len();
        Ok(Box::new(OsInput {
            reader: BufReader::new(file),
            size,
        }))
    }

    fn create_file(&self, name: &str, overwrite: bool) -> Result<Box<dyn OutputFile>> {
        let mut opts = OpenOptions::new();
        opts.write(true);
        if overwrite {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }
        let file = opts.open(self.file_path(name))?;
        Ok(Box::new(OsOutput {
            writer: BufWriter::new(file),
        }))
    }

    fn create_atomic_file(&self, name: &str) -> Result<Box<dyn AtomicFile>> {
        let temp_name = format!(
            "{name}.tmp.{}",
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let temp_path = self.file_path(&temp_name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        Ok(Box::new(OsAtomicOutput {
            writer: Some(BufWriter::new(file)),
            temp_path,
            final_path: self.file_path(name),
            root: self.root.clone(),
            committed: false,
        }))
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        fs::rename(self.file_path(old_name), self.file_path(new_name))?;
        self.sync_dir()
    }

    fn remove(&self, name: &str) -> Result<()> {
        fs::remove_file(self.file_path(name)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                IndexError::NotFound(name.to_string())
            } else {
                IndexError::Io(err)
            }
        })
    }

    fn exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn lock(&self, name: &str) -> Result<Box<dyn DirLock>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.file_path(name))?;
        lock_exclusive(&file)?;
        Ok(Box::new(OsLock { _file: file }))
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Err(IndexError::Locked)
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<()> {
    // Advisory locking is only wired up on unix; other platforms rely on
    // single-process discipline.
    Ok(())
}

struct OsInput {
    reader: BufReader<File>,
    size: u64,
}

impl Read for OsInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for OsInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl InputFile for OsInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

struct OsOutput {
    writer: BufWriter<File>,
}

impl Write for OsOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl OutputFile for OsOutput {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Writes to a hidden temp sibling; commit is flush + fsync + rename +
/// directory fsync. Dropping without commit unlinks the temp file.
struct OsAtomicOutput {
    writer: Option<BufWriter<File>>,
    temp_path: PathBuf,
    final_path: PathBuf,
    root: PathBuf,
    committed: bool,
}

impl Write for OsAtomicOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer
            .as_mut()
            .expect("write after commit")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.as_mut().expect("flush after commit").flush()
    }
}

impl AtomicFile for OsAtomicOutput {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let mut writer = self.writer.take().expect("double commit");
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&self.temp_path, &self.final_path)?;
        let dir = File::open(&self.root)?;
        dir.sync_all()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for OsAtomicOutput {
    fn drop(&mut self) {
        if !self.committed {
            self.writer.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

struct OsLock {
    _file: File,
}

impl DirLock for OsLock {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_rejects_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plain");
        fs::write(&path, b"x").unwrap();
        assert!(matches!(
            OsDir::open(&path, false),
            Err(IndexError::NotDirectory(_))
        ));
    }

    #[test]
    fn test_atomic_write_visible_after_commit() {
        let tmp = TempDir::new().unwrap();
        let dir = OsDir::open(tmp.path(), false).unwrap();

        let mut out = dir.create_atomic_file("a.bin").unwrap();
        out.write_all(b"payload").unwrap();
        assert!(!dir.exists("a.bin"));
        out.commit().unwrap();

        let mut data = Vec::new();
        dir.open_file("a.bin").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_atomic_abort_removes_temp() {
        let tmp = TempDir::new().unwrap();
        let dir = OsDir::open(tmp.path(), false).unwrap();

        let mut out = dir.create_atomic_file("a.bin").unwrap();
        out.write_all(b"payload").unwrap();
        drop(out);

        assert!(!dir.exists("a.bin"));
        assert!(dir.read_dir().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_exclusion() {
        let tmp = TempDir::new().unwrap();
        let dir = OsDir::open(tmp.path(), false).unwrap();
        let other = OsDir::open(tmp.path(), false).unwrap();

        let guard = dir.lock("write.lock").unwrap();
        assert!(matches!(other.lock("write.lock"), Err(IndexError::Locked)));
        drop(guard);
        assert!(other.lock("write.lock").is_ok());
    }
}
