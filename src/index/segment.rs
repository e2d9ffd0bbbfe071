//! Immutable on-disk segments.
//!
//! A segment is a data file holding a sorted run of items plus a metadata
//! file with counts, term/docID bounds, the docID membership filter and the
//! deletion set. The item payload never changes after creation; deletions
//! only touch the metadata, which is rewritten under a new manifest-id
//! suffix on every commit that grows the deletion set.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use roaring::RoaringBitmap;
use tracing::debug;

use super::codec::{DataWriter, SegmentData, DEFAULT_BLOCK_SIZE};
use super::item::{Item, ItemReader};
use super::oracle::DocFilter;
use crate::error::{IndexError, Result};
use crate::vfs::Directory;

pub const META_MAGIC: u32 = u32::from_le_bytes(*b"fpm1");
pub const META_VERSION: u32 = 1;

/// An immutable sorted run of items with an attached deletion set.
#[derive(Clone)]
pub struct Segment {
    id: u32,
    update_id: u32,
    num_docs: u32,
    num_items: u64,
    min_term: u32,
    max_term: u32,
    filter: DocFilter,
    deleted_docs: RoaringBitmap,
    dirty: bool,
    data: Arc<SegmentData>,
}

impl Segment {
    /// Stream a sorted item reader into a new segment on disk.
    ///
    /// Only the data file is written here; the metadata file is produced by
    /// [`Segment::save_update`] during the commit that publishes the
    /// segment.
    pub fn create(fs: &dyn Directory, id: u32, input: &mut dyn ItemReader) -> Result<Segment> {
        let out = fs.create_atomic_file(&data_file_name(id))?;
        let mut writer = DataWriter::new(out, DEFAULT_BLOCK_SIZE)?;

        let mut filter = DocFilter::new();
        let mut min_term = u32::MAX;
        let mut max_term = 0u32;
        let mut buf = [Item::default(); 1024];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &item in &buf[..n] {
                writer.add(item)?;
                filter.insert(item.docid);
                min_term = min_term.min(item.term);
                max_term = max_term.max(item.term);
            }
        }
        let num_items = writer.finish()?;

        let num_docs = filter.len() as u32;
        debug!(segment = id, docs = num_docs, items = num_items, "created segment");

        let mut data_file = fs.open_file(&data_file_name(id))?;
        let data = SegmentData::load(data_file.as_mut())?;

        Ok(Segment {
            id,
            update_id: id,
            num_docs,
            num_items,
            min_term: if num_items == 0 { 0 } else { min_term },
            max_term,
            filter,
            deleted_docs: RoaringBitmap::new(),
            dirty: true,
            data: Arc::new(data),
        })
    }

    /// Load a segment from its data file and the metadata revision named by
    /// `update_id`.
    pub fn open(fs: &dyn Directory, id: u32, update_id: u32) -> Result<Segment> {
        let mut meta_file = fs.open_file(&meta_file_name(id, update_id))?;
        let mut raw = Vec::new();
        meta_file.read_to_end(&mut raw)?;
        drop(meta_file);

        if raw.len() < 4 {
            return Err(IndexError::corrupted("segment meta", "file too short"));
        }
        let stored_crc = (&raw[raw.len() - 4..]).read_u32::<LittleEndian>()?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[..raw.len() - 4]);
        if hasher.finalize() != stored_crc {
            return Err(IndexError::corrupted("segment meta", "checksum mismatch"));
        }

        let mut cursor = &raw[..raw.len() - 4];
        let magic = cursor.read_u32::<LittleEndian>()?;
        let version = cursor.read_u32::<LittleEndian>()?;
        if magic != META_MAGIC {
            return Err(IndexError::corrupted("segment meta", "bad magic"));
        }
        if version != META_VERSION {
            return Err(IndexError::corrupted(
                "segment meta",
                format!("unsupported version {version}"),
            ));
        }
        let stored_id = cursor.read_u32::<LittleEndian>()?;
        let stored_update_id = cursor.read_u32::<LittleEndian>()?;
        if stored_id != id || stored_update_id != update_id {
            return Err(IndexError::corrupted("segment meta", "id mismatch"));
        }
        let num_docs = cursor.read_u32::<LittleEndian>()?;
        let num_items = cursor.read_u64::<LittleEndian>()?;
        let num_deleted_docs = cursor.read_u32::<LittleEndian>()?;
        let min_term = cursor.read_u32::<LittleEndian>()?;
        let max_term = cursor.read_u32::<LittleEndian>()?;
        let min_docid = cursor.read_u32::<LittleEndian>()?;
        let max_docid = cursor.read_u32::<LittleEndian>()?;

        let docs = read_bitmap(&mut cursor)?;
        let deleted_docs = read_bitmap(&mut cursor)?;
        if docs.len() != num_docs as u64 || deleted_docs.len() != num_deleted_docs as u64 {
            return Err(IndexError::corrupted("segment meta", "count mismatch"));
        }
        if docs.min().unwrap_or(0) != min_docid || docs.max().unwrap_or(0) != max_docid {
            return Err(IndexError::corrupted("segment meta", "docID bounds mismatch"));
        }

        let mut data_file = fs.open_file(&data_file_name(id))?;
        let data = SegmentData::load(data_file.as_mut())?;
        if data.num_items() != num_items {
            return Err(IndexError::corrupted("segment meta", "item count mismatch"));
        }

        Ok(Segment {
            id,
            update_id,
            num_docs,
            num_items,
            min_term,
            max_term,
            filter: DocFilter::from_bitmap(docs),
            deleted_docs,
            dirty: false,
            data: Arc::new(data),
        })
    }

    /// Write the metadata revision for the given manifest id.
    pub fn save_update(&mut self, fs: &dyn Directory, txid: u32) -> Result<()> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(META_MAGIC)?;
        body.write_u32::<LittleEndian>(META_VERSION)?;
        body.write_u32::<LittleEndian>(self.id)?;
        body.write_u32::<LittleEndian>(txid)?;
        body.write_u32::<LittleEndian>(self.num_docs)?;
        body.write_u64::<LittleEndian>(self.num_items)?;
        body.write_u32::<LittleEndian>(self.num_deleted_docs())?;
        body.write_u32::<LittleEndian>(self.min_term)?;
        body.write_u32::<LittleEndian>(self.max_term)?;
        body.write_u32::<LittleEndian>(self.filter.min().unwrap_or(0))?;
        body.write_u32::<LittleEndian>(self.filter.max().unwrap_or(0))?;
        write_bitmap(&mut body, self.filter.bitmap())?;
        write_bitmap(&mut body, &self.deleted_docs)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        body.write_u32::<LittleEndian>(hasher.finalize())?;

        let mut out = fs.create_atomic_file(&meta_file_name(self.id, txid))?;
        use std::io::Write;
        out.write_all(&body)?;
        out.commit()?;

        debug!(
            segment = self.id,
            update = txid,
            deleted = self.num_deleted_docs(),
            "saved segment metadata"
        );
        self.update_id = txid;
        self.dirty = false;
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn update_id(&self) -> u32 {
        self.update_id
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.deleted_docs.len() as u32
    }

    pub fn num_live_docs(&self) -> u32 {
        self.num_docs - self.num_deleted_docs()
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    /// Item count discounted by the deleted share of documents; the merge
    /// policy sizes segments by this.
    pub fn effective_items(&self) -> u64 {
        if self.num_docs == 0 {
            return 0;
        }
        self.num_items * self.num_live_docs() as u64 / self.num_docs as u64
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn deleted_docs(&self) -> &RoaringBitmap {
        &self.deleted_docs
    }

    /// All docIDs present at creation, tombstoned or not.
    pub fn docs(&self) -> &RoaringBitmap {
        self.filter.bitmap()
    }

    /// True when the segment holds a live (non-deleted) copy of the doc.
    pub fn contains(&self, docid: u32) -> bool {
        self.filter.contains(docid) && !self.deleted_docs.contains(docid)
    }

    /// Tombstone one document. Returns true when the doc was present and
    /// not already deleted; the metadata is marked for rewrite.
    pub fn delete_doc(&mut self, docid: u32) -> bool {
        if !self.filter.contains(docid) {
            return false;
        }
        if self.deleted_docs.insert(docid) {
            self.dirty = true;
            return true;
        }
        false
    }

    /// Tombstone every present doc in `docs`.
    pub fn delete_docs(&mut self, docs: &RoaringBitmap) {
        let present = docs & self.filter.bitmap();
        if !present.is_subset(&self.deleted_docs) {
            self.deleted_docs |= present;
            self.dirty = true;
        }
    }

    /// Count hits for a sorted, deduplicated query, skipping deleted docs.
    pub fn search(&self, query: &[u32], hits: &mut HashMap<u32, usize>) -> Result<()> {
        for &term in query {
            if term < self.min_term || term > self.max_term {
                continue;
            }
            let mut cursor = self.data.cursor_from(self.data.start_block(term));
            while let Some(item) = cursor.next_item()? {
                if item.term < term {
                    continue;
                }
                if item.term > term {
                    break;
                }
                if !self.deleted_docs.contains(item.docid) {
                    *hits.entry(item.docid).or_insert(0) += 1;
                }
            }
        }
        Ok(())
    }

    /// Sorted stream over the segment's live items.
    pub fn reader(&self) -> SegmentItemReader {
        SegmentItemReader {
            data: Arc::clone(&self.data),
            deleted_docs: self.deleted_docs.clone(),
            num_docs: self.num_live_docs() as u64,
            block: 0,
            items: Vec::new(),
            pos: 0,
        }
    }

    /// Names of the files currently backing this segment.
    pub fn file_names(&self) -> Vec<String> {
        vec![
            data_file_name(self.id),
            meta_file_name(self.id, self.update_id),
        ]
    }
}

pub fn data_file_name(id: u32) -> String {
    format!("segment-{id}.data")
}

pub fn meta_file_name(id: u32, update_id: u32) -> String {
    format!("segment-{id}.meta.{update_id}")
}

/// Parse `segment-<id>.data` names; anything else returns None.
pub fn parse_data_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("segment-")?
        .strip_suffix(".data")?
        .parse()
        .ok()
}

/// Parse `segment-<id>.meta.<txid>` names; anything else returns None.
pub fn parse_meta_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("segment-")?;
    let (id, update_id) = rest.split_once(".meta.")?;
    Some((id.parse().ok()?, update_id.parse().ok()?))
}

fn write_bitmap(out: &mut Vec<u8>, bitmap: &RoaringBitmap) -> Result<()> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut bytes)?;
    out.write_u32::<LittleEndian>(bytes.len() as u32)?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn read_bitmap(cursor: &mut &[u8]) -> Result<RoaringBitmap> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    if cursor.len() < len {
        return Err(IndexError::corrupted("segment meta", "truncated bitmap"));
    }
    let (bytes, rest) = cursor.split_at(len);
    let bitmap = RoaringBitmap::deserialize_from(bytes)
        .map_err(|err| IndexError::corrupted("segment meta", err.to_string()))?;
    *cursor = rest;
    Ok(bitmap)
}

/// Streams a segment's items, skipping tombstoned docs.
pub struct SegmentItemReader {
    data: Arc<SegmentData>,
    deleted_docs: RoaringBitmap,
    num_docs: u64,
    block: usize,
    items: Vec<Item>,
    pos: usize,
}

impl ItemReader for SegmentItemReader {
    fn read(&mut self, buf: &mut [Item]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            if self.pos == self.items.len() {
                if self.block == self.data.num_blocks() {
                    break;
                }
                self.items = self.data.decode_block(self.block)?;
                self.block += 1;
                self.pos = 0;
                continue;
            }
            let item = self.items[self.pos];
            self.pos += 1;
            if !self.deleted_docs.contains(item.docid) {
                buf[n] = item;
                n += 1;
            }
        }
        Ok(n)
    }

    fn num_docs(&self) -> u64 {
        self.num_docs
    }

    fn num_items(&self) -> u64 {
        self.data.num_items()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::buffer::ItemBuffer;
    use crate::index::item::read_all_items;
    use crate::vfs::MemDir;

    fn build_segment(fs: &MemDir, id: u32, docs: &[(u32, &[u32])]) -> Segment {
        let mut buf = ItemBuffer::new();
        for &(docid, terms) in docs {
            buf.add(docid, terms);
        }
        let mut segment = Segment::create(fs, id, &mut buf.reader()).unwrap();
        segment.save_update(fs, id + 1).unwrap();
        segment
    }

    #[test]
    fn test_create_and_search() {
        let fs = MemDir::new();
        let segment = build_segment(&fs, 1, &[(1, &[100, 200, 300]), (2, &[200, 400])]);

        assert_eq!(segment.num_docs(), 2);
        assert_eq!(segment.num_items(), 5);

        let mut hits = HashMap::new();
        segment.search(&[100, 200, 999], &mut hits).unwrap();
        assert_eq!(hits, HashMap::from([(1, 2), (2, 1)]));
    }

    #[test]
    fn test_contains_and_delete() {
        let fs = MemDir::new();
        let mut segment = build_segment(&fs, 1, &[(7, &[1, 2]), (8, &[3])]);

        assert!(segment.contains(7));
        assert!(!segment.contains(9));

        assert!(segment.delete_doc(7));
        assert!(!segment.delete_doc(7), "double delete must not count twice");
        assert!(!segment.delete_doc(9), "absent doc is not deletable");
        assert!(segment.is_dirty());
        assert!(!segment.contains(7));
        assert_eq!(segment.num_deleted_docs(), 1);
        assert_eq!(segment.num_live_docs(), 1);

        let mut hits = HashMap::new();
        segment.search(&[1, 2, 3], &mut hits).unwrap();
        assert_eq!(hits, HashMap::from([(8, 1)]));
    }

    #[test]
    fn test_meta_roundtrip_with_deletes() {
        let fs = MemDir::new();
        let mut segment = build_segment(&fs, 3, &[(1, &[10]), (2, &[20]), (3, &[30])]);
        segment.delete_doc(2);
        segment.save_update(&fs, 9).unwrap();
        assert_eq!(segment.update_id(), 9);

        let reopened = Segment::open(&fs, 3, 9).unwrap();
        assert_eq!(reopened.num_docs(), 3);
        assert_eq!(reopened.num_deleted_docs(), 1);
        assert!(!reopened.contains(2));
        assert!(reopened.contains(1));
        assert!(!reopened.is_dirty());

        let mut hits = HashMap::new();
        reopened.search(&[10, 20, 30], &mut hits).unwrap();
        assert_eq!(hits, HashMap::from([(1, 1), (3, 1)]));
    }

    #[test]
    fn test_reader_skips_deleted() {
        let fs = MemDir::new();
        let mut segment = build_segment(&fs, 1, &[(1, &[5, 6]), (2, &[5])]);
        segment.delete_doc(1);

        let items = read_all_items(&mut segment.reader()).unwrap();
        assert_eq!(items, vec![Item::new(5, 2)]);
    }

    #[test]
    fn test_file_names_follow_update_id() {
        let fs = MemDir::new();
        let segment = build_segment(&fs, 4, &[(1, &[1])]);
        assert_eq!(
            segment.file_names(),
            vec!["segment-4.data".to_string(), "segment-4.meta.5".to_string()]
        );
    }
}
