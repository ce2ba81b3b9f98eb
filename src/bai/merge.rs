//! Merging per-part binning indexes into one index for a concatenated file.
//!
//! A partitioned BAM is a directory holding one `header` file (the
//! BGZF-wrapped header bytes), zero or more headerless `part-NNNNN` files,
//! and optionally a `terminator` file containing only the BGZF EOF marker.
//! Each part carries a hidden `.part-NNNNN.bai` built with the linear-index
//! forward-fill disabled, because a filled entry cannot be told apart from
//! a real one during the merge.
//!
//! The merge shifts every virtual position of part `i` by the byte offset
//! at which that part lands in the concatenated file (`offset << 16` on the
//! packed representation), unions bins, and combines linear indexes
//! first-initialised-entry-wins before applying the forward-fill pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::bgzf::{coalesce_chunks, VirtualPosition};
use crate::error::{BamError, Result};
use crate::header::SequenceDictionary;

use super::builder::forward_fill;
use super::{BaiIndex, Metadata, ReferenceIndex};

/// File holding the BGZF-wrapped header in a partitioned directory.
pub const HEADER_FILE_NAME: &str = "header";
/// Optional file holding only the BGZF EOF marker.
pub const TERMINATOR_FILE_NAME: &str = "terminator";

pub fn part_file_name(part: usize) -> String {
    format!("part-{part:05}")
}

pub fn part_index_file_name(part: usize) -> String {
    format!(".part-{part:05}.bai")
}

/// One part's index together with the part's compressed byte length.
#[derive(Debug, Clone)]
pub struct IndexedPart {
    pub index: BaiIndex,
    pub byte_length: u64,
}

/// Check that every dictionary matches the first; parts with differing
/// dictionaries cannot share record reference indexes.
pub fn ensure_shared_dictionary(dictionaries: &[SequenceDictionary]) -> Result<()> {
    if let Some((first, rest)) = dictionaries.split_first() {
        for d in rest {
            first.ensure_same_as(d)?;
        }
    }
    Ok(())
}

/// Merge per-part indexes into the index of the concatenated file, whose
/// layout is `header` then each part in order.
///
/// `header_length` is the compressed byte length of the header file; part
/// `i`'s chunks shift by `header_length + Σ byte_length[..i]`.  The merged
/// linear indexes get the forward-fill pass, making the result a final
/// index.
pub fn merge_indexes(parts: &[IndexedPart], header_length: u64) -> Result<BaiIndex> {
    merge_indexes_inner(parts, header_length, true)
}

/// [`merge_indexes`] without the final forward-fill.  Use this for the
/// intermediate stages of a staged merge: a filled entry cannot be told
/// apart from a real one, so filling early would corrupt later stages.
pub fn merge_indexes_unfilled(parts: &[IndexedPart], header_length: u64) -> Result<BaiIndex> {
    merge_indexes_inner(parts, header_length, false)
}

fn merge_indexes_inner(parts: &[IndexedPart], header_length: u64, fill: bool) -> Result<BaiIndex> {
    let n_ref = match parts.first() {
        Some(part) => part.index.reference_count(),
        None => return Ok(BaiIndex::default()),
    };
    for (i, part) in parts.iter().enumerate() {
        if part.index.reference_count() != n_ref {
            return Err(BamError::DictionaryMismatch(format!(
                "part {i} indexes {} references, part 0 indexes {n_ref}",
                part.index.reference_count()
            )));
        }
    }

    // Cumulative byte offset of each part within the concatenated file.
    let mut offsets = Vec::with_capacity(parts.len());
    let mut offset = header_length;
    for part in parts {
        offsets.push(offset);
        offset += part.byte_length;
    }

    let mut references = Vec::with_capacity(n_ref);
    for ref_id in 0..n_ref {
        references.push(merge_reference(parts, &offsets, ref_id, fill));
    }

    let no_coordinate_count = parts
        .iter()
        .filter_map(|p| p.index.no_coordinate_count)
        .fold(None, |acc: Option<u64>, c| Some(acc.unwrap_or(0) + c));

    Ok(BaiIndex { references, no_coordinate_count })
}

fn merge_reference(parts: &[IndexedPart], offsets: &[u64], ref_id: usize, fill: bool) -> ReferenceIndex {
    // Bins: union with shifted chunks, then sort and coalesce per bin.
    let mut bins: BTreeMap<u32, Vec<_>> = BTreeMap::new();
    for (part, &offset) in parts.iter().zip(offsets) {
        let reference = &part.index.references[ref_id];
        for (&bin, chunks) in &reference.bins {
            bins.entry(bin)
                .or_default()
                .extend(chunks.iter().map(|c| c.shift(offset)));
        }
    }
    for chunks in bins.values_mut() {
        chunks.sort();
        let merged = coalesce_chunks(std::mem::take(chunks));
        *chunks = merged;
    }

    // Metadata: min first, max last over initialised values; counts sum.
    let mut metadata: Option<Metadata> = None;
    for (part, &offset) in parts.iter().zip(offsets) {
        let Some(part_meta) = &part.index.references[ref_id].metadata else {
            continue;
        };
        let shifted_first = part_meta.first.shift(offset);
        let shifted_last = part_meta.last.shift(offset);
        let merged = metadata.get_or_insert_with(Metadata::default);
        if !shifted_first.is_unset() && shifted_first < merged.first {
            merged.first = shifted_first;
        }
        if shifted_last > merged.last {
            merged.last = shifted_last;
        }
        merged.aligned_count += part_meta.aligned_count;
        merged.unaligned_count += part_meta.unaligned_count;
    }

    // Linear index: per window, the shifted entry of the first part whose
    // index has an initialised value there.
    let window_count = parts
        .iter()
        .map(|p| p.index.references[ref_id].linear.len())
        .max()
        .unwrap_or(0);
    let mut linear = vec![VirtualPosition::UNSET; window_count];
    for (w, entry) in linear.iter_mut().enumerate() {
        for (part, &offset) in parts.iter().zip(offsets) {
            let part_linear = &part.index.references[ref_id].linear;
            if let Some(vp) = part_linear.get(w) {
                if !vp.is_unset() {
                    *entry = vp.shift(offset);
                    break;
                }
            }
        }
    }
    if fill {
        forward_fill(&mut linear);
    }

    ReferenceIndex { bins, linear, metadata }
}

// ── Directory-level convenience ──────────────────────────────────────────────

/// Load the hidden per-part indexes of a partitioned directory, merge them,
/// and return the concatenated file's index.
///
/// `dictionary` is the dictionary declared by the `header` file; every part
/// index must cover the same number of references.
pub fn merge_partitioned(dir: &Path, dictionary: &SequenceDictionary) -> Result<BaiIndex> {
    let header_length = fs::metadata(dir.join(HEADER_FILE_NAME))?.len();

    let mut parts = Vec::new();
    for part_number in 0.. {
        let part_path: PathBuf = dir.join(part_file_name(part_number));
        if !part_path.exists() {
            break;
        }
        let byte_length = fs::metadata(&part_path)?.len();
        let index = BaiIndex::read_from_path(dir.join(part_index_file_name(part_number)))?;
        if index.reference_count() != dictionary.len() {
            return Err(BamError::DictionaryMismatch(format!(
                "part {part_number} indexes {} references, header declares {}",
                index.reference_count(),
                dictionary.len()
            )));
        }
        parts.push(IndexedPart { index, byte_length });
    }

    merge_indexes(&parts, header_length)
}

#[cfg(test)]
mod tests {
    use crate::bgzf::Chunk;

    use super::*;

    fn vp(block: u64, intra: u16) -> VirtualPosition {
        VirtualPosition::new(block, intra)
    }

    fn part_index(chunk: Chunk, linear0: VirtualPosition, aligned: u64) -> BaiIndex {
        let mut bins = BTreeMap::new();
        bins.insert(4681u32, vec![chunk]);
        BaiIndex {
            references: vec![ReferenceIndex {
                bins,
                linear: vec![linear0],
                metadata: Some(Metadata {
                    first: chunk.start(),
                    last: chunk.end(),
                    aligned_count: aligned,
                    unaligned_count: 0,
                }),
            }],
            no_coordinate_count: Some(aligned / 2),
        }
    }

    fn two_parts() -> Vec<IndexedPart> {
        vec![
            IndexedPart {
                index: part_index(Chunk::new(vp(0, 10), vp(100, 0)), vp(0, 10), 4),
                byte_length: 10_000,
            },
            IndexedPart {
                index: part_index(Chunk::new(vp(0, 20), vp(200, 0)), vp(0, 20), 6),
                byte_length: 20_000,
            },
        ]
    }

    #[test]
    fn test_merge_shifts_part_chunks_by_cumulative_offset() {
        // Header 500 bytes, part sizes 10,000 and 20,000: part 0 shifts by
        // 500, part 1 by 10,500.
        let merged = merge_indexes(&two_parts(), 500).unwrap();
        let chunks = &merged.references[0].bins[&4681];
        assert_eq!(
            chunks,
            &vec![
                Chunk::new(vp(500, 10), vp(600, 0)),
                Chunk::new(vp(10_500, 20), vp(10_700, 0)),
            ]
        );
    }

    #[test]
    fn test_merge_linear_index_first_part_wins() {
        let merged = merge_indexes(&two_parts(), 500).unwrap();
        assert_eq!(merged.references[0].linear, vec![vp(500, 10)]);
    }

    #[test]
    fn test_merge_metadata_and_counts() {
        let merged = merge_indexes(&two_parts(), 500).unwrap();
        let meta = merged.metadata(0).unwrap();
        assert_eq!(meta.first, vp(500, 10));
        assert_eq!(meta.last, vp(10_700, 0));
        assert_eq!(meta.aligned_count, 10);
        assert_eq!(merged.no_coordinate_count, Some(5));
    }

    #[test]
    fn test_merge_is_associative() {
        let parts = {
            let mut v = two_parts();
            v.push(IndexedPart {
                index: part_index(Chunk::new(vp(0, 30), vp(50, 0)), vp(0, 30), 2),
                byte_length: 5_000,
            });
            v
        };

        // One pass over [0..3].
        let all_at_once = merge_indexes(&parts, 500).unwrap();

        // [0..2] merged first (unfilled, as staged merging requires), then
        // treated as one pre-shifted part of the combined length.
        let left = merge_indexes_unfilled(&parts[..2], 0).unwrap();
        let left_len: u64 = parts[..2].iter().map(|p| p.byte_length).sum();
        let staged = merge_indexes(
            &[
                IndexedPart { index: left, byte_length: left_len },
                parts[2].clone(),
            ],
            500,
        )
        .unwrap();

        let mut one_pass = Vec::new();
        all_at_once.write_to(&mut one_pass).unwrap();
        let mut two_pass = Vec::new();
        staged.write_to(&mut two_pass).unwrap();
        assert_eq!(one_pass, two_pass);
    }

    #[test]
    fn test_reference_count_mismatch_is_dictionary_mismatch() {
        let mut parts = two_parts();
        parts[1].index.references.push(ReferenceIndex::default());
        assert!(matches!(
            merge_indexes(&parts, 500),
            Err(BamError::DictionaryMismatch(_))
        ));
    }

    #[test]
    fn test_merge_of_nothing_is_empty() {
        let merged = merge_indexes(&[], 500).unwrap();
        assert_eq!(merged, BaiIndex::default());
    }
}
