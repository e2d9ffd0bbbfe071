//! On-disk codec for segment data files.
//!
//! Layout: a fixed header (magic, version, block size), a run of fixed-size
//! blocks of delta-encoded items, a per-block first-term index, and a footer
//! with the block count, item count and a crc32 over everything before it.
//!
//! Each block starts with its item count (u16) followed by the first item
//! stored raw and the rest as varint deltas: a term delta, then either a
//! docID delta (same term) or a raw docID (new term). Blocks are
//! zero-padded to the configured size so the first-term index alone is
//! enough to position a scan.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

use super::item::Item;
use crate::error::{IndexError, Result};
use crate::vfs::{AtomicFile, InputFile};

pub const DATA_MAGIC: u32 = u32::from_le_bytes(*b"fpd1");
pub const DATA_VERSION: u32 = 1;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

const HEADER_LEN: usize = 12;
// Block count and item count; the crc32 trailer sits after it.
const FOOTER_LEN: usize = 12;

fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u32> {
    let mut result: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| IndexError::corrupted("segment data", "truncated varint"))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 28 {
            return Err(IndexError::corrupted("segment data", "varint overflow"));
        }
    }
}

/// Streams sorted items into an atomic data file.
///
/// Enforces strict `(term, docid)` ordering; an exact duplicate of the
/// previous pair is skipped so each pair is unique within the segment.
pub struct DataWriter {
    out: Box<dyn AtomicFile>,
    crc: crc32fast::Hasher,
    block_size: usize,
    block: Vec<u8>,
    block_items: u16,
    prev_in_block: Option<Item>,
    prev: Option<Item>,
    index: Vec<u32>,
    num_items: u64,
}

impl DataWriter {
    pub fn new(out: Box<dyn AtomicFile>, block_size: u32) -> Result<Self> {
        let mut writer = Self {
            out,
            crc: crc32fast::Hasher::new(),
            block_size: block_size as usize,
            block: Vec::with_capacity(block_size as usize),
            block_items: 0,
            prev_in_block: None,
            prev: None,
            index: Vec::new(),
            num_items: 0,
        };
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.write_u32::<LittleEndian>(DATA_MAGIC)?;
        header.write_u32::<LittleEndian>(DATA_VERSION)?;
        header.write_u32::<LittleEndian>(block_size)?;
        writer.emit(&header)?;
        Ok(writer)
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        self.crc.update(bytes);
        self.out.write_all(bytes)?;
        Ok(())
    }

    pub fn add(&mut self, item: Item) -> Result<()> {
        if let Some(prev) = self.prev {
            if item == prev {
                return Ok(());
            }
            if item < prev {
                return Err(IndexError::corrupted("item stream", "items out of order"));
            }
        }

        let mut scratch = Vec::with_capacity(10);
        match self.prev_in_block {
            None => {
                write_varint(&mut scratch, item.term);
                write_varint(&mut scratch, item.docid);
            }
            Some(prev) => {
                let dterm = item.term - prev.term;
                write_varint(&mut scratch, dterm);
                if dterm == 0 {
                    write_varint(&mut scratch, item.docid - prev.docid);
                } else {
                    write_varint(&mut scratch, item.docid);
                }
            }
        }

        let fits = 2 + self.block.len() + scratch.len() <= self.block_size
            && self.block_items < u16::MAX;
        if !fits {
            self.flush_block()?;
            scratch.clear();
            write_varint(&mut scratch, item.term);
            write_varint(&mut scratch, item.docid);
        }

        if self.prev_in_block.is_none() {
            self.index.push(item.term);
        }
        self.block.extend_from_slice(&scratch);
        self.block_items += 1;
        self.prev_in_block = Some(item);
        self.prev = Some(item);
        self.num_items += 1;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block_items == 0 {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(self.block_size);
        encoded.write_u16::<LittleEndian>(self.block_items)?;
        encoded.extend_from_slice(&self.block);
        encoded.resize(self.block_size, 0);
        self.emit(&encoded)?;
        self.block.clear();
        self.block_items = 0;
        self.prev_in_block = None;
        Ok(())
    }

    /// Flush the final block, append index and footer, and commit the file.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_block()?;

        let mut tail = Vec::with_capacity(self.index.len() * 4 + FOOTER_LEN);
        for &first_term in &self.index {
            tail.write_u32::<LittleEndian>(first_term)?;
        }
        tail.write_u32::<LittleEndian>(self.index.len() as u32)?;
        tail.write_u64::<LittleEndian>(self.num_items)?;
        self.emit(&tail)?;

        let crc = self.crc.clone().finalize();
        use std::io::Write;
        self.out.write_u32::<LittleEndian>(crc)?;
        self.out.flush()?;
        self.out.commit()?;
        Ok(self.num_items)
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }
}

/// An immutable, fully loaded segment data payload.
pub struct SegmentData {
    block_size: usize,
    index: Vec<u32>,
    blocks: Vec<u8>,
    num_items: u64,
}

impl SegmentData {
    /// Read and verify a data file produced by [`DataWriter`].
    pub fn load(input: &mut dyn InputFile) -> Result<Self> {
        let mut raw = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut raw)?;
        if raw.len() < HEADER_LEN + FOOTER_LEN + 4 {
            return Err(IndexError::corrupted("segment data", "file too short"));
        }

        let stored_crc = (&raw[raw.len() - 4..]).read_u32::<LittleEndian>()?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[..raw.len() - 4]);
        if hasher.finalize() != stored_crc {
            return Err(IndexError::corrupted("segment data", "checksum mismatch"));
        }

        let mut head = &raw[..HEADER_LEN];
        let magic = head.read_u32::<LittleEndian>()?;
        let version = head.read_u32::<LittleEndian>()?;
        let block_size = head.read_u32::<LittleEndian>()? as usize;
        if magic != DATA_MAGIC {
            return Err(IndexError::corrupted("segment data", "bad magic"));
        }
        if version != DATA_VERSION {
            return Err(IndexError::corrupted(
                "segment data",
                format!("unsupported version {version}"),
            ));
        }
        if block_size == 0 {
            return Err(IndexError::corrupted("segment data", "zero block size"));
        }

        let mut foot = &raw[raw.len() - 4 - FOOTER_LEN..raw.len() - 4];
        let num_blocks = foot.read_u32::<LittleEndian>()? as usize;
        let num_items = foot.read_u64::<LittleEndian>()?;

        let index_len = num_blocks * 4;
        let blocks_len = num_blocks * block_size;
        if HEADER_LEN + blocks_len + index_len + FOOTER_LEN + 4 != raw.len() {
            return Err(IndexError::corrupted("segment data", "length mismatch"));
        }

        let blocks = raw[HEADER_LEN..HEADER_LEN + blocks_len].to_vec();
        let mut index = Vec::with_capacity(num_blocks);
        let mut index_bytes = &raw[HEADER_LEN + blocks_len..HEADER_LEN + blocks_len + index_len];
        for _ in 0..num_blocks {
            index.push(index_bytes.read_u32::<LittleEndian>()?);
        }

        Ok(Self {
            block_size,
            index,
            blocks,
            num_items,
        })
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    /// Index of the block where a scan for `term` must start.
    pub fn start_block(&self, term: u32) -> usize {
        // First block whose first term is <= term; the index is sorted.
        self.index.partition_point(|&first| first <= term).saturating_sub(1)
    }

    pub(crate) fn decode_block(&self, block: usize) -> Result<Vec<Item>> {
        let start = block * self.block_size;
        let data = &self.blocks[start..start + self.block_size];
        let count = (&data[..2]).read_u16::<LittleEndian>()? as usize;

        let mut items = Vec::with_capacity(count);
        let mut pos = 2;
        let mut prev: Option<Item> = None;
        for _ in 0..count {
            let item = match prev {
                None => {
                    let term = read_varint(data, &mut pos)?;
                    let docid = read_varint(data, &mut pos)?;
                    Item::new(term, docid)
                }
                Some(prev) => {
                    let dterm = read_varint(data, &mut pos)?;
                    let term = prev.term + dterm;
                    let docid = if dterm == 0 {
                        prev.docid + read_varint(data, &mut pos)?
                    } else {
                        read_varint(data, &mut pos)?
                    };
                    Item::new(term, docid)
                }
            };
            items.push(item);
            prev = Some(item);
        }
        Ok(items)
    }

    /// Cursor over all items starting at the given block.
    pub fn cursor_from(&self, block: usize) -> DataCursor<'_> {
        DataCursor {
            data: self,
            block,
            items: Vec::new(),
            pos: 0,
        }
    }

    pub fn cursor(&self) -> DataCursor<'_> {
        self.cursor_from(0)
    }
}

/// Forward-only item cursor over a [`SegmentData`].
pub struct DataCursor<'a> {
    data: &'a SegmentData,
    block: usize,
    items: Vec<Item>,
    pos: usize,
}

impl DataCursor<'_> {
    pub fn next_item(&mut self) -> Result<Option<Item>> {
        while self.pos == self.items.len() {
            if self.block == self.data.num_blocks() {
                return Ok(None);
            }
            self.items = self.data.decode_block(self.block)?;
            self.block += 1;
            self.pos = 0;
        }
        let item = self.items[self.pos];
        self.pos += 1;
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{Directory, MemDir};

    fn write_items(dir: &MemDir, name: &str, block_size: u32, items: &[Item]) -> u64 {
        let out = dir.create_atomic_file(name).unwrap();
        let mut writer = DataWriter::new(out, block_size).unwrap();
        for &item in items {
            writer.add(item).unwrap();
        }
        writer.finish().unwrap()
    }

    fn load(dir: &MemDir, name: &str) -> SegmentData {
        let mut input = dir.open_file(name).unwrap();
        SegmentData::load(input.as_mut()).unwrap()
    }

    fn collect(data: &SegmentData) -> Vec<Item> {
        let mut cursor = data.cursor();
        let mut out = Vec::new();
        while let Some(item) = cursor.next_item().unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_roundtrip_across_blocks() {
        let dir = MemDir::new();
        // Tiny blocks so the run spans many of them.
        let items: Vec<Item> = (0..500u32)
            .map(|i| Item::new(i / 3, 1 + (i % 3) * 7))
            .collect();
        let mut sorted = items.clone();
        sorted.sort();
        sorted.dedup();

        let n = write_items(&dir, "seg.data", 64, &sorted);
        assert_eq!(n, sorted.len() as u64);

        let data = load(&dir, "seg.data");
        assert!(data.num_blocks() > 1);
        assert_eq!(collect(&data), sorted);
    }

    #[test]
    fn test_duplicate_pairs_are_skipped() {
        let dir = MemDir::new();
        let items = [Item::new(5, 1), Item::new(5, 1), Item::new(5, 2)];
        let n = write_items(&dir, "seg.data", 64, &items);
        assert_eq!(n, 2);
        assert_eq!(
            collect(&load(&dir, "seg.data")),
            vec![Item::new(5, 1), Item::new(5, 2)]
        );
    }

    #[test]
    fn test_out_of_order_input_rejected() {
        let dir = MemDir::new();
        let out = dir.create_atomic_file("seg.data").unwrap();
        let mut writer = DataWriter::new(out, 64).unwrap();
        writer.add(Item::new(9, 1)).unwrap();
        assert!(writer.add(Item::new(3, 1)).is_err());
    }

    #[test]
    fn test_start_block_positioning() {
        let dir = MemDir::new();
        let items: Vec<Item> = (0..2000u32).map(|t| Item::new(t, 1)).collect();
        write_items(&dir, "seg.data", 128, &items);
        let data = load(&dir, "seg.data");

        for term in [0u32, 1, 997, 1999] {
            let mut cursor = data.cursor_from(data.start_block(term));
            loop {
                let item = cursor.next_item().unwrap().expect("term must be found");
                if item.term >= term {
                    assert_eq!(item.term, term);
                    break;
                }
            }
        }
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = MemDir::new();
        write_items(&dir, "seg.data", 64, &[Item::new(1, 1)]);

        let mut raw = Vec::new();
        {
            use std::io::Read;
            dir.open_file("seg.data").unwrap().read_to_end(&mut raw).unwrap();
        }
        raw[HEADER_LEN + 3] ^= 0xff;
        let mut out = dir.create_file("seg.data", true).unwrap();
        use std::io::Write;
        out.write_all(&raw).unwrap();
        out.commit().unwrap();

        let mut input = dir.open_file("seg.data").unwrap();
        assert!(matches!(
            SegmentData::load(input.as_mut()),
            Err(IndexError::Corrupted { .. })
        ));
    }
}
