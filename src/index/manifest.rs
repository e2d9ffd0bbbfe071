//! The committed-state descriptor: a versioned list of segments.

use std::io::Read;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use super::segment::Segment;
use crate::error::{IndexError, Result};
use crate::vfs::Directory;

pub const MANIFEST_MAGIC: u32 = u32::from_le_bytes(*b"fpx1");
pub const MANIFEST_VERSION: u32 = 1;

/// One committed state of the database.
///
/// Manifests are immutable once published; a commit clones the current one,
/// mutates the clone, and swaps it in. Segments are shared by reference
/// between revisions and copied on first write ([`Manifest::segment_mut`]).
#[derive(Clone, Default)]
pub struct Manifest {
    id: u32,
    segments: Vec<Arc<Segment>>,
    num_docs: u64,
    num_deleted_docs: u64,
    num_items: u64,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locate and parse the newest manifest in the directory, opening every
    /// referenced segment. With `create` set, an empty manifest with id 0 is
    /// returned when the directory holds none.
    pub fn load(fs: &dyn Directory, create: bool) -> Result<Manifest> {
        let mut newest: Option<u32> = None;
        for name in fs.read_dir()? {
            if let Some(id) = parse_file_name(&name) {
                newest = Some(newest.map_or(id, |prev| prev.max(id)));
            }
        }
        let id = match newest {
            Some(id) => id,
            None if create => return Ok(Manifest::new()),
            None => return Err(IndexError::NotFound("manifest".to_string())),
        };

        let mut file = fs.open_file(&file_name(id))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        drop(file);

        if raw.len() < 4 {
            return Err(IndexError::corrupted("manifest", "file too short"));
        }
        let stored_crc = (&raw[raw.len() - 4..]).read_u32::<LittleEndian>()?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[..raw.len() - 4]);
        if hasher.finalize() != stored_crc {
            return Err(IndexError::corrupted("manifest", "checksum mismatch"));
        }

        let mut cursor = &raw[..raw.len() - 4];
        let magic = cursor.read_u32::<LittleEndian>()?;
        let version = cursor.read_u32::<LittleEndian>()?;
        if magic != MANIFEST_MAGIC {
            return Err(IndexError::corrupted("manifest", "bad magic"));
        }
        if version != MANIFEST_VERSION {
            return Err(IndexError::corrupted(
                "manifest",
                format!("unsupported version {version}"),
            ));
        }
        let stored_id = cursor.read_u32::<LittleEndian>()?;
        if stored_id != id {
            return Err(IndexError::corrupted("manifest", "id mismatch"));
        }
        let num_docs = cursor.read_u64::<LittleEndian>()?;
        let num_deleted_docs = cursor.read_u64::<LittleEndian>()?;
        let num_items = cursor.read_u64::<LittleEndian>()?;
        let checksum = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;

        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let seg_id = cursor.read_u32::<LittleEndian>()?;
            let update_id = cursor.read_u32::<LittleEndian>()?;
            let seg_docs = cursor.read_u32::<LittleEndian>()?;
            let seg_items = cursor.read_u64::<LittleEndian>()?;
            let seg_deleted = cursor.read_u32::<LittleEndian>()?;

            let segment = Segment::open(fs, seg_id, update_id)?;
            if segment.num_docs() != seg_docs
                || segment.num_deleted_docs() != seg_deleted
                || segment.num_items() != seg_items
            {
                return Err(IndexError::corrupted(
                    "manifest",
                    format!("segment {seg_id} counters disagree with its metadata"),
                ));
            }
            segments.push(Arc::new(segment));
        }

        let manifest = Manifest {
            id,
            segments,
            num_docs,
            num_deleted_docs,
            num_items,
        };
        if manifest.checksum() != checksum {
            return Err(IndexError::corrupted("manifest", "segment checksum mismatch"));
        }
        debug!(
            manifest = id,
            segments = manifest.segments.len(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Write the manifest atomically under its id-encoded name.
    pub fn save(&self, fs: &dyn Directory) -> Result<()> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(MANIFEST_MAGIC)?;
        body.write_u32::<LittleEndian>(MANIFEST_VERSION)?;
        body.write_u32::<LittleEndian>(self.id)?;
        body.write_u64::<LittleEndian>(self.num_docs)?;
        body.write_u64::<LittleEndian>(self.num_deleted_docs)?;
        body.write_u64::<LittleEndian>(self.num_items)?;
        body.write_u32::<LittleEndian>(self.checksum())?;
        body.write_u32::<LittleEndian>(self.segments.len() as u32)?;
        for segment in &self.segments {
            body.write_u32::<LittleEndian>(segment.id())?;
            body.write_u32::<LittleEndian>(segment.update_id())?;
            body.write_u32::<LittleEndian>(segment.num_docs())?;
            body.write_u64::<LittleEndian>(segment.num_items())?;
            body.write_u32::<LittleEndian>(segment.num_deleted_docs())?;
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        body.write_u32::<LittleEndian>(hasher.finalize())?;

        let mut out = fs.create_atomic_file(&file_name(self.id))?;
        use std::io::Write;
        out.write_all(&body)?;
        out.commit()?;
        Ok(())
    }

    /// Deterministic hash over the segment descriptors in list order.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = Vec::with_capacity(self.segments.len() * 20);
        for segment in &self.segments {
            let _ = buf.write_u32::<LittleEndian>(segment.id());
            let _ = buf.write_u32::<LittleEndian>(segment.num_docs());
            let _ = buf.write_u64::<LittleEndian>(segment.num_items());
            let _ = buf.write_u32::<LittleEndian>(segment.update_id());
        }
        hasher.update(&buf);
        hasher.finalize()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u64 {
        self.num_deleted_docs
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn contains_segment(&self, id: u32) -> bool {
        self.segments.iter().any(|s| s.id() == id)
    }

    pub fn segment(&self, id: u32) -> Option<&Arc<Segment>> {
        self.segments.iter().find(|s| s.id() == id)
    }

    /// Copy-on-write access to one segment.
    pub(crate) fn segment_mut(&mut self, id: u32) -> Option<&mut Segment> {
        self.segments
            .iter_mut()
            .find(|s| s.id() == id)
            .map(Arc::make_mut)
    }

    /// Copy-on-write access by position.
    pub(crate) fn segment_mut_at(&mut self, idx: usize) -> &mut Segment {
        Arc::make_mut(&mut self.segments[idx])
    }

    pub(crate) fn add_segment(&mut self, segment: Arc<Segment>) {
        self.segments.push(segment);
        self.refresh_stats();
    }

    pub(crate) fn remove_segment(&mut self, id: u32) -> bool {
        let before = self.segments.len();
        self.segments.retain(|s| s.id() != id);
        let removed = self.segments.len() != before;
        if removed {
            self.refresh_stats();
        }
        removed
    }

    /// Recompute the aggregate counters from the segment list.
    pub(crate) fn refresh_stats(&mut self) {
        self.num_docs = self.segments.iter().map(|s| s.num_docs() as u64).sum();
        self.num_deleted_docs = self
            .segments
            .iter()
            .map(|s| s.num_deleted_docs() as u64)
            .sum();
        self.num_items = self.segments.iter().map(|s| s.num_items()).sum();
    }

    /// Every file this manifest keeps alive: its own file plus each
    /// segment's data and current metadata file.
    pub fn file_names(&self) -> Vec<String> {
        let mut names = vec![file_name(self.id)];
        for segment in &self.segments {
            names.extend(segment.file_names());
        }
        names
    }
}

pub fn file_name(id: u32) -> String {
    format!("manifest.{id}")
}

/// Parse `manifest.<id>` names; anything else returns None.
pub fn parse_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("manifest.")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::buffer::ItemBuffer;
    use crate::vfs::{Directory, MemDir};
    use std::collections::HashMap;

    fn make_segment(fs: &MemDir, id: u32, docs: &[(u32, &[u32])]) -> Arc<Segment> {
        let mut buf = ItemBuffer::new();
        for &(docid, terms) in docs {
            buf.add(docid, terms);
        }
        let mut segment = Segment::create(fs, id, &mut buf.reader()).unwrap();
        segment.save_update(fs, id).unwrap();
        Arc::new(segment)
    }

    #[test]
    fn test_save_and_load() {
        let fs = MemDir::new();
        let mut manifest = Manifest::new();
        manifest.add_segment(make_segment(&fs, 1, &[(1, &[10, 11]), (2, &[12])]));
        manifest.add_segment(make_segment(&fs, 2, &[(3, &[13])]));
        manifest.set_id(3);
        manifest.save(&fs).unwrap();

        let loaded = Manifest::load(&fs, false).unwrap();
        assert_eq!(loaded.id(), 3);
        assert_eq!(loaded.segments().len(), 2);
        assert_eq!(loaded.num_docs(), 3);
        assert_eq!(loaded.num_items(), 4);
        assert_eq!(loaded.checksum(), manifest.checksum());

        let mut hits = HashMap::new();
        loaded.segment(1).unwrap().search(&[10], &mut hits).unwrap();
        assert_eq!(hits, HashMap::from([(1, 1)]));
    }

    #[test]
    fn test_newest_manifest_wins() {
        let fs = MemDir::new();
        let mut old = Manifest::new();
        old.set_id(1);
        old.save(&fs).unwrap();

        let mut new = Manifest::new();
        new.add_segment(make_segment(&fs, 2, &[(1, &[5])]));
        new.set_id(3);
        new.save(&fs).unwrap();

        let loaded = Manifest::load(&fs, false).unwrap();
        assert_eq!(loaded.id(), 3);
        assert_eq!(loaded.segments().len(), 1);
    }

    #[test]
    fn test_missing_manifest() {
        let fs = MemDir::new();
        assert!(matches!(
            Manifest::load(&fs, false),
            Err(IndexError::NotFound(_))
        ));
        let created = Manifest::load(&fs, true).unwrap();
        assert_eq!(created.id(), 0);
        assert!(created.segments().is_empty());
    }

    #[test]
    fn test_corrupted_manifest_detected() {
        let fs = MemDir::new();
        let mut manifest = Manifest::new();
        manifest.set_id(1);
        manifest.save(&fs).unwrap();

        let mut raw = Vec::new();
        use std::io::{Read, Write};
        fs.open_file("manifest.1").unwrap().read_to_end(&mut raw).unwrap();
        raw[8] ^= 0xff;
        let mut out = fs.create_file("manifest.1", true).unwrap();
        out.write_all(&raw).unwrap();
        out.commit().unwrap();

        assert!(matches!(
            Manifest::load(&fs, false),
            Err(IndexError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_cow_segment_mutation() {
        let fs = MemDir::new();
        let mut base = Manifest::new();
        base.add_segment(make_segment(&fs, 1, &[(1, &[5]), (2, &[6])]));

        let mut next = base.clone();
        next.segment_mut(1).unwrap().delete_doc(1);
        next.refresh_stats();

        assert_eq!(next.num_deleted_docs(), 1);
        assert_eq!(base.num_deleted_docs(), 0, "base manifest must be untouched");
        assert!(base.segment(1).unwrap().contains(1));
        assert!(!next.segment(1).unwrap().contains(1));
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("manifest.42"), Some(42));
        assert_eq!(parse_file_name("manifest.x"), None);
        assert_eq!(parse_file_name("segment-1.data"), None);
    }
}
