//! Write-side binning-index builder.
//!
//! The builder observes every record written in coordinate order together
//! with the record's chunk extent `[pre-write VP, post-write VP)` and
//! produces a complete [`BaiIndex`] at the end.  Out-of-order input is
//! fatal: a decreasing reference index, or a decreasing start within one
//! reference, means the stream is not coordinate sorted.

use std::collections::BTreeMap;

use crate::bgzf::{Chunk, VirtualPosition};
use crate::binning::{position_to_window, MAX_BIN, MAX_WINDOW_COUNT};
use crate::error::{BamError, Result};
use crate::header::SequenceDictionary;
use crate::record::Record;

use super::{BaiIndex, Metadata, ReferenceIndex};

/// Sentinel for "unplaced records seen; no further placed record is legal".
const AFTER_LAST_REF: i32 = i32::MAX;

#[derive(Debug)]
struct ReferenceState {
    bins: BTreeMap<u32, Vec<Chunk>>,
    linear: Vec<VirtualPosition>,
    /// Highest window any record touched; the linear index truncates here.
    largest_window: Option<usize>,
    metadata: Metadata,
}

impl ReferenceState {
    fn new(window_count: usize) -> Self {
        Self {
            bins: BTreeMap::new(),
            linear: vec![VirtualPosition::UNSET; window_count],
            largest_window: None,
            metadata: Metadata::default(),
        }
    }
}

#[derive(Debug)]
pub struct BaiBuilder {
    /// Per-reference window capacity, from the dictionary's lengths.
    window_counts: Vec<usize>,
    /// States are allocated on first touch; untouched references stay
    /// `None` and build into empty content.
    references: Vec<Option<ReferenceState>>,
    current_ref: i32,
    last_pos: i32,
    no_coordinate_count: u64,
    fill_linear_index: bool,
}

impl BaiBuilder {
    /// A builder for a file declaring `dictionary`.  Linear indexes are
    /// sized to each reference's length, or to the scheme maximum for a
    /// zero-length declaration.
    pub fn new(dictionary: &SequenceDictionary) -> Self {
        let window_counts = dictionary
            .iter()
            .map(|seq| {
                if seq.length == 0 {
                    MAX_WINDOW_COUNT
                } else {
                    position_to_window(seq.length - 1) + 1
                }
            })
            .collect::<Vec<_>>();
        let references = window_counts.iter().map(|_| None).collect();
        Self {
            window_counts,
            references,
            current_ref: -1,
            last_pos: i32::MIN,
            no_coordinate_count: 0,
            fill_linear_index: true,
        }
    }

    /// Control the forward-fill of uninitialised linear-index entries at
    /// build time.  Filling matches the C-tool convention for standalone
    /// indexes; it must be off for indexes that will later be merged, where
    /// a filled entry is indistinguishable from a real one.
    pub fn fill_linear_index(mut self, fill: bool) -> Self {
        self.fill_linear_index = fill;
        self
    }

    /// Observe one record and its chunk extent.
    pub fn add_record(&mut self, record: &Record, chunk: Chunk) -> Result<()> {
        if record.is_unplaced() {
            self.no_coordinate_count += 1;
            // Unplaced records sort after every placed one; any placed
            // record from here on is out of order.
            self.current_ref = AFTER_LAST_REF;
            return Ok(());
        }

        let ref_id = record.ref_id;
        if ref_id < self.current_ref {
            return Err(BamError::OutOfOrder(format!(
                "reference index decreased from {} to {ref_id}",
                self.current_ref
            )));
        }
        if ref_id as usize >= self.references.len() {
            return Err(BamError::InvalidArgument(format!(
                "record reference {ref_id} outside the {}-entry dictionary",
                self.references.len()
            )));
        }
        if ref_id > self.current_ref {
            self.current_ref = ref_id;
            self.last_pos = i32::MIN;
        } else if record.pos < self.last_pos {
            return Err(BamError::OutOfOrder(format!(
                "alignment start decreased from {} to {} on reference {ref_id}",
                self.last_pos + 1,
                record.pos + 1
            )));
        }
        self.last_pos = record.pos;

        let window_count = self.window_counts[ref_id as usize];
        let state = self.references[ref_id as usize]
            .get_or_insert_with(|| ReferenceState::new(window_count));

        // Bin assignment: the record's stored bin when it has one,
        // recomputed from the span otherwise.  A stored bin outside the
        // scheme (e.g. a pseudo-bin value) is recomputed too; without a
        // span the record takes the zero bin.
        let mut bin = u32::from(record.compute_bin());
        if bin > MAX_BIN {
            bin = record
                .alignment_span()
                .map(|(start, end)| u32::from(crate::binning::region_to_bin(start, end)))
                .unwrap_or(0);
        }
        let bin_chunks = state.bins.entry(bin).or_default();
        match bin_chunks.last_mut() {
            Some(last) if last.is_adjacent_to(chunk) || last.overlaps(chunk) => {
                if chunk.end() > last.end() {
                    *last = Chunk::new(last.start(), chunk.end());
                }
            }
            _ => bin_chunks.push(chunk),
        }

        // Linear index: every window the alignment span overlaps gets the
        // smallest starting VP seen for it.
        if record.pos >= 0 {
            let (start, end) = record
                .alignment_span()
                .unwrap_or((record.pos as u32, record.pos as u32 + 1));
            let first_window = position_to_window(start);
            let last_window = position_to_window(end - 1);
            if last_window >= state.linear.len() {
                state.linear.resize(last_window + 1, VirtualPosition::UNSET);
            }
            for w in first_window..=last_window {
                let entry = &mut state.linear[w];
                if entry.is_unset() || *entry > chunk.start() {
                    *entry = chunk.start();
                }
            }
            state.largest_window =
                Some(state.largest_window.map_or(last_window, |lw| lw.max(last_window)));
        }

        // Metadata.
        if record.flags.is_unmapped() {
            state.metadata.unaligned_count += 1;
        } else {
            state.metadata.aligned_count += 1;
        }
        if chunk.start() < state.metadata.first {
            state.metadata.first = chunk.start();
        }
        if chunk.end() > state.metadata.last {
            state.metadata.last = chunk.end();
        }

        Ok(())
    }

    /// Finalise into a complete index.
    pub fn build(self) -> BaiIndex {
        let fill = self.fill_linear_index;
        let references = self
            .references
            .into_iter()
            .map(|state| match state {
                None => ReferenceIndex::default(),
                Some(mut state) => {
                    let len = state.largest_window.map_or(0, |w| w + 1);
                    state.linear.truncate(len);
                    if fill {
                        forward_fill(&mut state.linear);
                    }
                    ReferenceIndex {
                        bins: state.bins,
                        linear: state.linear,
                        metadata: Some(state.metadata),
                    }
                }
            })
            .collect();

        BaiIndex { references, no_coordinate_count: Some(self.no_coordinate_count) }
    }
}

/// Replace every uninitialised entry with the previous initialised one,
/// starting from zero.  After this pass the linear index is monotonically
/// non-decreasing.
pub(crate) fn forward_fill(linear: &mut [VirtualPosition]) {
    let mut carry = VirtualPosition::default();
    for entry in linear.iter_mut() {
        if entry.is_unset() {
            *entry = carry;
        } else {
            carry = *entry;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::header::ReferenceSequence;
    use crate::record::{Cigar, CigarOp, CigarOpKind, Flags};

    use super::*;

    fn vp(block: u64, intra: u16) -> VirtualPosition {
        VirtualPosition::new(block, intra)
    }

    fn dictionary() -> SequenceDictionary {
        SequenceDictionary::new(vec![
            ReferenceSequence::new("chr1", 100_000),
            ReferenceSequence::new("chr2", 100_000),
        ])
    }

    fn placed(ref_id: i32, pos: i32, len: u32) -> Record {
        Record {
            ref_id,
            pos,
            flags: Flags(0),
            cigar: Cigar::new(vec![CigarOp::new(CigarOpKind::Match, len)]),
            ..Record::default()
        }
    }

    #[test]
    fn test_adjacent_chunks_coalesce_in_bin() {
        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&placed(0, 1, 4), Chunk::new(vp(0, 55), vp(0, 89))).unwrap();
        b.add_record(&placed(0, 5, 2), Chunk::new(vp(0, 89), vp(0, 144))).unwrap();
        let index = b.build();

        let chunks = &index.references[0].bins[&4681];
        assert_eq!(chunks, &vec![Chunk::new(vp(0, 55), vp(0, 144))]);
    }

    #[test]
    fn test_linear_index_keeps_smallest_start() {
        let mut b = BaiBuilder::new(&dictionary()).fill_linear_index(false);
        // Spans windows 0..=1 starting at vp 100, then a later record in
        // window 1 only; the window-1 entry must keep the earlier VP.
        b.add_record(&placed(0, 16_000, 1000), Chunk::new(vp(100, 0), vp(110, 0))).unwrap();
        b.add_record(&placed(0, 17_000, 10), Chunk::new(vp(110, 0), vp(120, 0))).unwrap();
        let index = b.build();

        let linear = &index.references[0].linear;
        assert_eq!(linear[0], vp(100, 0));
        assert_eq!(linear[1], vp(100, 0));
        assert_eq!(linear.len(), 2);
    }

    #[test]
    fn test_forward_fill_behaviour() {
        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&placed(0, 40_000, 10), Chunk::new(vp(7, 0), vp(8, 0))).unwrap();
        let index = b.build();
        let linear = &index.references[0].linear;
        // Windows 0 and 1 were never touched; filling replaces them with
        // the previous offset, zero at the start.
        assert_eq!(linear.len(), 3);
        assert_eq!(linear[0], VirtualPosition::default());
        assert_eq!(linear[1], VirtualPosition::default());
        assert_eq!(linear[2], vp(7, 0));
    }

    #[test]
    fn test_metadata_accumulates() {
        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&placed(0, 10, 5), Chunk::new(vp(1, 0), vp(2, 0))).unwrap();
        let mut unmapped_with_coord = placed(0, 12, 1);
        unmapped_with_coord.flags = Flags(Flags::UNMAPPED);
        unmapped_with_coord.cigar = Cigar::default();
        b.add_record(&unmapped_with_coord, Chunk::new(vp(2, 0), vp(3, 0))).unwrap();
        let index = b.build();

        let meta = index.metadata(0).unwrap();
        assert_eq!(meta.aligned_count, 1);
        assert_eq!(meta.unaligned_count, 1);
        assert_eq!(meta.first, vp(1, 0));
        assert_eq!(meta.last, vp(3, 0));
    }

    #[test]
    fn test_unplaced_records_counted_at_file_level() {
        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&placed(1, 10, 5), Chunk::new(vp(1, 0), vp(2, 0))).unwrap();
        b.add_record(&Record::default(), Chunk::new(vp(2, 0), vp(3, 0))).unwrap();
        b.add_record(&Record::default(), Chunk::new(vp(3, 0), vp(4, 0))).unwrap();
        let index = b.build();
        assert_eq!(index.no_coordinate_count, Some(2));
    }

    #[test]
    fn test_out_of_order_detection() {
        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&placed(1, 100, 5), Chunk::new(vp(1, 0), vp(2, 0))).unwrap();
        let err = b.add_record(&placed(0, 10, 5), Chunk::new(vp(2, 0), vp(3, 0)));
        assert!(matches!(err, Err(BamError::OutOfOrder(_))));

        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&placed(0, 100, 5), Chunk::new(vp(1, 0), vp(2, 0))).unwrap();
        let err = b.add_record(&placed(0, 50, 5), Chunk::new(vp(2, 0), vp(3, 0)));
        assert!(matches!(err, Err(BamError::OutOfOrder(_))));
    }

    #[test]
    fn test_placed_after_unplaced_is_out_of_order() {
        let mut b = BaiBuilder::new(&dictionary());
        b.add_record(&Record::default(), Chunk::new(vp(1, 0), vp(2, 0))).unwrap();
        let err = b.add_record(&placed(0, 10, 5), Chunk::new(vp(2, 0), vp(3, 0)));
        assert!(matches!(err, Err(BamError::OutOfOrder(_))));
    }
}
