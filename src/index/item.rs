//! The canonical `(term, docID)` pair and the sorted stream abstraction.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::Result;

/// A single posting: one 32-bit term contributed by one document.
///
/// Items order lexicographically by `(term, docid)`; field order matters for
/// the derived `Ord`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub term: u32,
    pub docid: u32,
}

impl Item {
    pub fn new(term: u32, docid: u32) -> Self {
        Self { term, docid }
    }
}

/// A lazy, forward-only stream of items sorted by `(term, docid)`.
pub trait ItemReader: Send {
    /// Fill `buf` with up to its length in items, returning how many were
    /// written. `Ok(0)` signals the end of the stream.
    fn read(&mut self, buf: &mut [Item]) -> Result<usize>;

    /// Total number of distinct documents, when known in advance; zero
    /// otherwise. Used to presize segments.
    fn num_docs(&self) -> u64 {
        0
    }

    /// Total number of items, when known in advance; zero otherwise.
    fn num_items(&self) -> u64 {
        0
    }
}

impl ItemReader for Box<dyn ItemReader> {
    fn read(&mut self, buf: &mut [Item]) -> Result<usize> {
        (**self).read(buf)
    }

    fn num_docs(&self) -> u64 {
        (**self).num_docs()
    }

    fn num_items(&self) -> u64 {
        (**self).num_items()
    }
}

/// Drain a reader into a vector. Test and export helper.
pub fn read_all_items<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut buf = [Item::default(); 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(items);
        }
        items.extend_from_slice(&buf[..n]);
    }
}

const MERGE_CHUNK: usize = 1024;

struct MergeSource {
    reader: Box<dyn ItemReader>,
    buf: Vec<Item>,
    pos: usize,
}

impl MergeSource {
    fn next(&mut self) -> Result<Option<Item>> {
        if self.pos == self.buf.len() {
            self.buf.resize(MERGE_CHUNK, Item::default());
            let n = self.reader.read(&mut self.buf)?;
            self.buf.truncate(n);
            self.pos = 0;
            if n == 0 {
                return Ok(None);
            }
        }
        let item = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(item))
    }
}

/// Merges `k` sorted readers into one sorted reader.
///
/// A min-heap keyed on each child's head item drives the merge; ties break
/// by child index, and equal items from different children are all emitted.
/// The merger is not a set union.
pub struct MergedItemReader {
    sources: Vec<MergeSource>,
    heap: BinaryHeap<Reverse<(Item, usize)>>,
    primed: bool,
    num_docs: u64,
    num_items: u64,
}

impl MergedItemReader {
    pub fn new(readers: Vec<Box<dyn ItemReader>>) -> Self {
        let num_docs = readers.iter().map(|r| r.num_docs()).sum();
        let num_items = readers.iter().map(|r| r.num_items()).sum();
        let sources = readers
            .into_iter()
            .map(|reader| MergeSource {
                reader,
                buf: Vec::new(),
                pos: 0,
            })
            .collect();
        Self {
            sources,
            heap: BinaryHeap::new(),
            primed: false,
            num_docs,
            num_items,
        }
    }

    fn prime(&mut self) -> Result<()> {
        for idx in 0..self.sources.len() {
            if let Some(item) = self.sources[idx].next()? {
                self.heap.push(Reverse((item, idx)));
            }
        }
        self.primed = true;
        Ok(())
    }
}

impl ItemReader for MergedItemReader {
    fn read(&mut self, buf: &mut [Item]) -> Result<usize> {
        if !self.primed {
            self.prime()?;
        }
        let mut n = 0;
        while n < buf.len() {
            let Reverse((item, idx)) = match self.heap.pop() {
                Some(head) => head,
                None => break,
            };
            buf[n] = item;
            n += 1;
            if let Some(next) = self.sources[idx].next()? {
                self.heap.push(Reverse((next, idx)));
            }
        }
        Ok(n)
    }

    fn num_docs(&self) -> u64 {
        self.num_docs
    }

    fn num_items(&self) -> u64 {
        self.num_items
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fixed item list posing as a sorted stream.
    pub(crate) struct SliceReader {
        items: Vec<Item>,
        pos: usize,
    }

    impl SliceReader {
        pub(crate) fn new(items: Vec<Item>) -> Self {
            Self { items, pos: 0 }
        }
    }

    impl ItemReader for SliceReader {
        fn read(&mut self, buf: &mut [Item]) -> Result<usize> {
            let n = buf.len().min(self.items.len() - self.pos);
            buf[..n].copy_from_slice(&self.items[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn num_items(&self) -> u64 {
            self.items.len() as u64
        }
    }

    fn items(pairs: &[(u32, u32)]) -> Vec<Item> {
        pairs.iter().map(|&(t, d)| Item::new(t, d)).collect()
    }

    #[test]
    fn test_item_ordering() {
        assert!(Item::new(1, 9) < Item::new(2, 0));
        assert!(Item::new(2, 1) < Item::new(2, 2));
    }

    #[test]
    fn test_merge_two_readers() {
        let a = Box::new(SliceReader::new(items(&[(1, 1), (3, 1), (5, 1)])));
        let b = Box::new(SliceReader::new(items(&[(2, 2), (3, 2), (9, 2)])));
        let mut merged = MergedItemReader::new(vec![a, b]);

        let out = read_all_items(&mut merged).unwrap();
        assert_eq!(
            out,
            items(&[(1, 1), (2, 2), (3, 1), (3, 2), (5, 1), (9, 2)])
        );
        assert_eq!(merged.num_items(), 6);
    }

    #[test]
    fn test_merge_preserves_duplicates() {
        let a = Box::new(SliceReader::new(items(&[(7, 4)])));
        let b = Box::new(SliceReader::new(items(&[(7, 4)])));
        let mut merged = MergedItemReader::new(vec![a, b]);

        let out = read_all_items(&mut merged).unwrap();
        assert_eq!(out, items(&[(7, 4), (7, 4)]));
    }

    #[test]
    fn test_merge_empty_inputs() {
        let mut merged = MergedItemReader::new(vec![
            Box::new(SliceReader::new(Vec::new())) as Box<dyn ItemReader>,
        ]);
        assert!(read_all_items(&mut merged).unwrap().is_empty());
    }
}
