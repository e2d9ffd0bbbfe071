//! In-memory staging buffer for recent writes.

use roaring::RoaringBitmap;

use super::item::{Item, ItemReader};
use crate::error::Result;

/// Accumulates `(docID, terms)` inserts until a transaction flushes them
/// into a segment.
///
/// Items are kept in arrival order and sorted stably by `(term, docid)` when
/// a reader is taken, so duplicate terms within one add survive the sort.
#[derive(Default)]
pub struct ItemBuffer {
    items: Vec<Item>,
    docs: RoaringBitmap,
}

impl ItemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage all terms of one document.
    pub fn add(&mut self, docid: u32, terms: &[u32]) {
        self.docs.insert(docid);
        self.items
            .extend(terms.iter().map(|&term| Item::new(term, docid)));
    }

    /// Drop every staged item of a document.
    pub fn delete(&mut self, docid: u32) {
        if self.docs.remove(docid) {
            self.items.retain(|item| item.docid != docid);
        }
    }

    pub fn contains(&self, docid: u32) -> bool {
        self.docs.contains(docid)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn num_docs(&self) -> u64 {
        self.docs.len()
    }

    pub fn num_items(&self) -> u64 {
        self.items.len() as u64
    }

    /// Snapshot the staged items as a sorted stream.
    pub fn reader(&self) -> BufferReader {
        let mut items = self.items.clone();
        items.sort();
        BufferReader {
            items,
            pos: 0,
            num_docs: self.docs.len(),
        }
    }
}

/// Sorted view over a buffer's staged items.
pub struct BufferReader {
    items: Vec<Item>,
    pos: usize,
    num_docs: u64,
}

impl ItemReader for BufferReader {
    fn read(&mut self, buf: &mut [Item]) -> Result<usize> {
        let n = buf.len().min(self.items.len() - self.pos);
        buf[..n].copy_from_slice(&self.items[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn num_docs(&self) -> u64 {
        self.num_docs
    }

    fn num_items(&self) -> u64 {
        self.items.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::item::read_all_items;

    #[test]
    fn test_sorted_reader() {
        let mut buf = ItemBuffer::new();
        buf.add(1, &[7, 3, 9]);
        buf.add(2, &[3, 5]);

        let items = read_all_items(&mut buf.reader()).unwrap();
        assert_eq!(
            items,
            vec![
                Item::new(3, 1),
                Item::new(3, 2),
                Item::new(5, 2),
                Item::new(7, 1),
                Item::new(9, 1),
            ]
        );
        assert_eq!(buf.num_docs(), 2);
        assert_eq!(buf.num_items(), 5);
    }

    #[test]
    fn test_delete_removes_staged_items() {
        let mut buf = ItemBuffer::new();
        buf.add(1, &[7, 8, 9]);
        buf.add(2, &[5]);
        buf.delete(1);

        assert!(!buf.contains(1));
        assert!(buf.contains(2));
        let items = read_all_items(&mut buf.reader()).unwrap();
        assert_eq!(items, vec![Item::new(5, 2)]);
    }

    #[test]
    fn test_duplicate_terms_retained() {
        let mut buf = ItemBuffer::new();
        buf.add(1, &[4, 4]);
        assert_eq!(buf.num_items(), 2);
    }
}
