//! Compact docID membership oracle attached to every segment.

use roaring::RoaringBitmap;

/// Answers "does this segment contain docID d" with no false negatives.
///
/// A min/max range check short-circuits most misses; the roaring set behind
/// it is exact, so routing deletes to segments never needs a second lookup
/// against the item payload.
#[derive(Clone, Debug, Default)]
pub struct DocFilter {
    docs: RoaringBitmap,
}

impl DocFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bitmap(docs: RoaringBitmap) -> Self {
        Self { docs }
    }

    pub fn insert(&mut self, docid: u32) {
        self.docs.insert(docid);
    }

    pub fn contains(&self, docid: u32) -> bool {
        if self.docs.is_empty() {
            return false;
        }
        // Range probe first; min/max are O(1) on the roaring index.
        let (min, max) = (self.docs.min().unwrap_or(0), self.docs.max().unwrap_or(0));
        if docid < min || docid > max {
            return false;
        }
        self.docs.contains(docid)
    }

    pub fn len(&self) -> u64 {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn min(&self) -> Option<u32> {
        self.docs.min()
    }

    pub fn max(&self) -> Option<u32> {
        self.docs.max()
    }

    pub fn bitmap(&self) -> &RoaringBitmap {
        &self.docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut filter = DocFilter::new();
        for docid in [5u32, 9, 1000] {
            filter.insert(docid);
        }

        assert!(filter.contains(5));
        assert!(filter.contains(1000));
        assert!(!filter.contains(4));
        assert!(!filter.contains(1001));
        assert_eq!(filter.len(), 3);
        assert_eq!(filter.min(), Some(5));
        assert_eq!(filter.max(), Some(1000));
    }

    #[test]
    fn test_empty_filter() {
        let filter = DocFilter::new();
        assert!(!filter.contains(1));
        assert!(filter.is_empty());
    }
}
