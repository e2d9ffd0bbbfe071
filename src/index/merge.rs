//! Tiered merge policy and merge execution.

use std::sync::Arc;

use tracing::{debug, info};

use super::db::DbInner;
use super::item::{ItemReader, MergedItemReader};
use super::manifest::Manifest;
use super::segment::{self, Segment};
use crate::error::{IndexError, Result};

/// Configuration for the tiered merge policy.
///
/// Segments are sized by their effective item count (raw items discounted
/// by the deleted share of docs), so delete-heavy segments look small and
/// get folded in early.
#[derive(Clone, Debug)]
pub struct TieredMergePolicy {
    /// Smallest number of segments worth merging at once.
    pub min_merge_size: usize,
    /// Largest number of segments in a single merge.
    pub max_merge_size: usize,
    /// Do not produce a segment with more effective items than this.
    pub max_merged_items: u64,
    /// Segments below this size all count as equal when scoring.
    pub floor_item_count: u64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self {
            min_merge_size: 2,
            max_merge_size: 10,
            max_merged_items: 1 << 30,
            floor_item_count: 1024,
        }
    }
}

impl TieredMergePolicy {
    /// Pick the most balanced merge, or `None` when nothing qualifies.
    ///
    /// Candidates are contiguous windows over the segments sorted by
    /// effective size; each window is scored by largest/total (lower is a
    /// better balanced merge) and windows whose merged size would exceed
    /// the cap are skipped. `max_size` overrides the configured cap when
    /// non-zero. On equal scores the earliest window wins, favouring older
    /// segments.
    pub fn find_best_merge(&self, manifest: &Manifest, max_size: u64) -> Option<MergePlan> {
        let mut sized: Vec<(u64, u32)> = manifest
            .segments()
            .iter()
            .map(|s| (s.effective_items(), s.id()))
            .collect();
        if sized.len() < self.min_merge_size {
            return None;
        }
        sized.sort_unstable();

        let cap = if max_size > 0 {
            max_size
        } else {
            self.max_merged_items
        };

        let mut best: Option<(f64, MergePlan)> = None;
        for start in 0..=(sized.len() - self.min_merge_size) {
            let longest = self.max_merge_size.min(sized.len() - start);
            for k in self.min_merge_size..=longest {
                let window = &sized[start..start + k];
                let total_raw: u64 = window.iter().map(|&(size, _)| size).sum();
                if total_raw > cap {
                    // Windows only grow to the right; larger k cannot fit.
                    break;
                }
                let total: u64 = window
                    .iter()
                    .map(|&(size, _)| size.max(self.floor_item_count))
                    .sum();
                let largest = window
                    .iter()
                    .map(|&(size, _)| size.max(self.floor_item_count))
                    .max()
                    .unwrap_or(self.floor_item_count);
                let score = largest as f64 / total as f64;

                if best.as_ref().map_or(true, |(prev, _)| score < *prev) {
                    let plan = MergePlan {
                        segment_ids: window.iter().map(|&(_, id)| id).collect(),
                    };
                    best = Some((score, plan));
                }
            }
        }
        best.map(|(_, plan)| plan)
    }
}

/// A merge to execute: the ids of the segments to replace.
#[derive(Clone, Debug)]
pub struct MergePlan {
    pub segment_ids: Vec<u32>,
}

impl MergePlan {
    /// Execute the merge against the database.
    ///
    /// The replacement segment is built outside the commit mutex from a
    /// snapshot of the inputs. Under the mutex the inputs are re-checked:
    /// if any left the manifest the merge quietly aborts and the staged
    /// file is removed; deletions that reached the inputs in the meantime
    /// are carried onto the replacement before it is published.
    pub(crate) fn run(&self, db: &Arc<DbInner>) -> Result<()> {
        let snapshot = db.new_snapshot();
        let manifest = snapshot.manifest();

        let mut inputs: Vec<Arc<Segment>> = Vec::with_capacity(self.segment_ids.len());
        for &id in &self.segment_ids {
            match manifest.segment(id) {
                Some(segment) => inputs.push(Arc::clone(segment)),
                None => return Ok(()),
            }
        }

        let readers: Vec<Box<dyn ItemReader>> = inputs
            .iter()
            .map(|s| Box::new(s.reader()) as Box<dyn ItemReader>)
            .collect();
        let mut merged_input = MergedItemReader::new(readers);

        let new_id = db.next_txid();
        let merged = Segment::create(db.fs().as_ref(), new_id, &mut merged_input)?;
        debug!(
            segment = new_id,
            inputs = ?self.segment_ids,
            docs = merged.num_docs(),
            items = merged.num_items(),
            "built merged segment"
        );

        let mut published = false;
        let result = db.commit(|base| {
            for &id in &self.segment_ids {
                if !base.contains_segment(id) {
                    return Err(IndexError::CommitConflict);
                }
            }

            let mut next = base.clone();
            let mut merged = merged.clone();
            // Deletes that landed on the inputs after our snapshot have to
            // survive the swap.
            for &id in &self.segment_ids {
                if let Some(current) = next.segment(id) {
                    merged.delete_docs(current.deleted_docs());
                }
            }
            for &id in &self.segment_ids {
                next.remove_segment(id);
            }
            if merged.num_items() > 0 && merged.num_live_docs() > 0 {
                next.add_segment(Arc::new(merged));
                published = true;
            }
            Ok(next)
        });

        match result {
            Ok(()) => {
                if !published {
                    db.enqueue_orphan(segment::data_file_name(new_id));
                }
                info!(segments = ?self.segment_ids, merged = new_id, "merged segments");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                db.enqueue_orphan(segment::data_file_name(new_id));
                debug!(segments = ?self.segment_ids, "merge aborted, inputs changed");
                Ok(())
            }
            Err(err) => {
                db.enqueue_orphan(segment::data_file_name(new_id));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::buffer::ItemBuffer;
    use crate::vfs::MemDir;

    fn manifest_with_sizes(sizes: &[u64]) -> Manifest {
        let fs = MemDir::new();
        let mut manifest = Manifest::new();
        for (idx, &size) in sizes.iter().enumerate() {
            let id = idx as u32 + 1;
            let mut buf = ItemBuffer::new();
            for n in 0..size {
                buf.add(n as u32 + 1, &[n as u32]);
            }
            let mut segment = Segment::create(&fs, id, &mut buf.reader()).unwrap();
            segment.save_update(&fs, id).unwrap();
            manifest.add_segment(Arc::new(segment));
        }
        manifest
    }

    #[test]
    fn test_no_merge_below_minimum() {
        let policy = TieredMergePolicy::default();
        let manifest = manifest_with_sizes(&[100]);
        assert!(policy.find_best_merge(&manifest, 0).is_none());
    }

    #[test]
    fn test_equal_segments_merge_together() {
        let policy = TieredMergePolicy::default();
        let manifest = manifest_with_sizes(&[10, 10, 10, 10, 10]);
        let plan = policy.find_best_merge(&manifest, 0).unwrap();
        assert_eq!(plan.segment_ids.len(), 5, "all equal segments join one merge");
    }

    #[test]
    fn test_merge_respects_size_cap() {
        let policy = TieredMergePolicy {
            floor_item_count: 1,
            ..Default::default()
        };
        let manifest = manifest_with_sizes(&[2000, 2000, 2000]);
        let plan = policy.find_best_merge(&manifest, 4500).unwrap();
        assert_eq!(plan.segment_ids.len(), 2, "third segment would bust the cap");
    }

    #[test]
    fn test_deterministic_choice() {
        let policy = TieredMergePolicy::default();
        let manifest = manifest_with_sizes(&[50, 50, 50]);
        let a = policy.find_best_merge(&manifest, 0).unwrap();
        let b = policy.find_best_merge(&manifest, 0).unwrap();
        assert_eq!(a.segment_ids, b.segment_ids);
    }
}
