//! The binning index: in-memory model and the read-side query algorithm.
//!
//! Per reference the index holds three owned structures: a bin map keyed by
//! bin number (each bin owning its chunk list inline), a linear index of
//! 16 KiB windows, and a metadata summary.  The file level adds a count of
//! unplaced unmapped records.
//!
//! A query `(reference, start, end)` resolves to a minimal sorted chunk
//! list: candidate bins from the binning-scheme walk, a lower-bound filter
//! from the linear index, then sorting and coalescing across adjacent
//! compressed blocks.

pub mod builder;
pub mod io;
pub mod merge;

pub use builder::BaiBuilder;
pub use io::LazyBaiIndex;
pub use merge::{merge_indexes, merge_indexes_unfilled, merge_partitioned, IndexedPart};

use std::collections::BTreeMap;

use crate::bgzf::{coalesce_chunks, Chunk, VirtualPosition};
use crate::binning::{position_to_window, region_to_bins, MAX_POSITION};
use crate::error::{BamError, Result};

/// Per-reference summary stored in the metadata pseudo-bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Smallest start VP of any record on this reference.
    pub first: VirtualPosition,
    /// Largest end VP of any record on this reference.
    pub last: VirtualPosition,
    pub aligned_count: u64,
    pub unaligned_count: u64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            first: VirtualPosition::UNSET,
            last: VirtualPosition::default(),
            aligned_count: 0,
            unaligned_count: 0,
        }
    }
}

/// Index content for one reference sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceIndex {
    /// Data bins keyed by bin number.  The metadata pseudo-bin is held in
    /// `metadata`, never here.
    pub bins: BTreeMap<u32, Vec<Chunk>>,
    /// Entry `w` is the smallest VP at which any record overlapping window
    /// `w` begins; [`VirtualPosition::UNSET`] when no record does.
    pub linear: Vec<VirtualPosition>,
    pub metadata: Option<Metadata>,
}

impl ReferenceIndex {
    /// Lower bound for a query starting at zero-based `start`: the nearest
    /// linear-index entry at or before the window containing `start`.
    pub fn min_offset(&self, start: u32) -> VirtualPosition {
        if self.linear.is_empty() {
            return VirtualPosition::default();
        }
        let window = position_to_window(start).min(self.linear.len() - 1);
        self.linear[..=window]
            .iter()
            .rev()
            .find(|vp| !vp.is_unset())
            .copied()
            .unwrap_or_default()
    }
}

/// A loaded binning index: per-reference content plus the file-level count
/// of unplaced unmapped records.  Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaiIndex {
    pub references: Vec<ReferenceIndex>,
    pub no_coordinate_count: Option<u64>,
}

impl BaiIndex {
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Chunks that may contain records overlapping the zero-based half-open
    /// interval `[start, end)` on `ref_id` — sorted and coalesced.
    pub fn query(&self, ref_id: usize, start: u32, end: u32) -> Result<Vec<Chunk>> {
        let reference = self.references.get(ref_id).ok_or_else(|| {
            BamError::InvalidArgument(format!(
                "reference {ref_id} outside the index ({} references)",
                self.references.len()
            ))
        })?;
        if start >= end || start >= MAX_POSITION {
            return Err(BamError::InvalidArgument(format!("empty query interval {start}..{end}")));
        }
        Ok(query_reference(reference, start, end))
    }

    /// Union of per-interval chunk lists, re-sorted and re-coalesced.  The
    /// intervals must already be optimised (sorted and merged; see
    /// `query::optimize_intervals`).
    pub fn query_many(&self, intervals: &[(usize, u32, u32)]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for &(ref_id, start, end) in intervals {
            chunks.extend(self.query(ref_id, start, end)?);
        }
        chunks.sort();
        Ok(coalesce_chunks(chunks))
    }

    /// Where the file's trailing unmapped block begins: the largest linear
    /// index entry across all references.  `None` for an index with no
    /// placed records at all.
    pub fn start_of_last_linear_bin(&self) -> Option<VirtualPosition> {
        self.references
            .iter()
            .flat_map(|r| r.linear.iter())
            .filter(|vp| !vp.is_unset())
            .max()
            .copied()
    }

    /// Metadata pseudo-bin content for one reference, if recorded.
    pub fn metadata(&self, ref_id: usize) -> Option<&Metadata> {
        self.references.get(ref_id)?.metadata.as_ref()
    }
}

/// The §4.3 query algorithm over one reference's content.  Shared by the
/// fully cached and lazy loaders.
pub(crate) fn query_reference(reference: &ReferenceIndex, start: u32, end: u32) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = region_to_bins(start, end)
        .into_iter()
        .filter_map(|bin| reference.bins.get(&bin))
        .flat_map(|bin_chunks| bin_chunks.iter().copied())
        .collect();

    let min_offset = reference.min_offset(start);
    chunks.retain(|c| c.end() > min_offset);
    chunks.sort();
    coalesce_chunks(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(block: u64, intra: u16) -> VirtualPosition {
        VirtualPosition::new(block, intra)
    }

    fn one_ref_index() -> BaiIndex {
        // Two bins: records near position 100 and near position 40_000.
        let mut bins = BTreeMap::new();
        bins.insert(4681, vec![Chunk::new(vp(1, 0), vp(2, 0))]);
        bins.insert(4683, vec![Chunk::new(vp(8, 0), vp(9, 0))]);

        let mut linear = vec![VirtualPosition::UNSET; 3];
        linear[0] = vp(1, 0);
        linear[2] = vp(8, 0);

        BaiIndex {
            references: vec![ReferenceIndex {
                bins,
                linear,
                metadata: Some(Metadata {
                    first: vp(1, 0),
                    last: vp(9, 0),
                    aligned_count: 2,
                    unaligned_count: 0,
                }),
            }],
            no_coordinate_count: Some(1),
        }
    }

    #[test]
    fn test_query_returns_overlapping_bin_chunks() {
        let index = one_ref_index();
        let chunks = index.query(0, 50, 200).unwrap();
        assert_eq!(chunks, vec![Chunk::new(vp(1, 0), vp(2, 0))]);
    }

    #[test]
    fn test_query_linear_filter_drops_early_chunks() {
        // Query in window 2: min_offset is vp(8, 0), so the chunk ending at
        // vp(2, 0) is discarded even though bin 0 ancestors would carry it.
        let mut index = one_ref_index();
        index.references[0]
            .bins
            .insert(0, vec![Chunk::new(vp(1, 0), vp(2, 0))]);
        let chunks = index.query(0, 40_000, 40_100).unwrap();
        assert_eq!(chunks, vec![Chunk::new(vp(8, 0), vp(9, 0))]);
    }

    #[test]
    fn test_min_offset_falls_back_through_unset_windows() {
        let index = one_ref_index();
        let reference = &index.references[0];
        assert_eq!(reference.min_offset(20_000), vp(1, 0)); // window 1 unset
        assert_eq!(reference.min_offset(40_000), vp(8, 0));
    }

    #[test]
    fn test_query_bad_reference_or_interval() {
        let index = one_ref_index();
        assert!(matches!(index.query(5, 0, 10), Err(BamError::InvalidArgument(_))));
        assert!(matches!(index.query(0, 10, 10), Err(BamError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_of_last_linear_bin() {
        let index = one_ref_index();
        assert_eq!(index.start_of_last_linear_bin(), Some(vp(8, 0)));
        assert_eq!(BaiIndex::default().start_of_last_linear_bin(), None);
    }
}
