//! Offline index construction: build companion indexes for an existing
//! coordinate-sorted file by scanning it once.
//!
//! The streaming writer builds its index live; these helpers cover files
//! that arrived without one.  Both do a single sequential pass, feeding
//! each record's chunk extent (pre-read VP, post-read VP) to the
//! corresponding builder.

use std::fs;
use std::path::Path;

use crate::bai::{BaiBuilder, BaiIndex};
use crate::defaults::Defaults;
use crate::error::Result;
use crate::reader::BamReader;
use crate::sbi::{SbiBuilder, SbiIndex};

/// Scan `path` and build its binning index.
///
/// `fill_linear_index` follows the builder's convention: on for a
/// standalone index, off when the result will be merged.
pub fn create_bai(path: impl AsRef<Path>, fill_linear_index: bool) -> Result<BaiIndex> {
    let mut reader = BamReader::open(&path, &Defaults::default())?;
    let dictionary = reader.header().dictionary.clone();
    let mut builder = BaiBuilder::new(&dictionary).fill_linear_index(fill_linear_index);

    loop {
        let start = reader.virtual_position();
        let Some(record) = reader.read_record()? else {
            break;
        };
        let end = reader.virtual_position();
        builder.add_record(&record, crate::bgzf::Chunk::new(start, end))?;
    }
    Ok(builder.build())
}

/// Scan `path`, build its binning index, and write it to the standard
/// sibling location (`X.bam` → `X.bai`).
pub fn create_bai_file(path: impl AsRef<Path>) -> Result<()> {
    let index = create_bai(&path, true)?;
    index.write_to_path(path.as_ref().with_extension("bai"))
}

/// Scan `path` and build its splitting index at the given granularity.
/// The header's MD5 and UUID fields stay zero; callers that want them can
/// stamp [`crate::sbi::generate_uuid`] and a digest themselves.
pub fn create_sbi(path: impl AsRef<Path>, granularity: u64) -> Result<SbiIndex> {
    let file_length = fs::metadata(&path)?.len();
    let mut reader = BamReader::open(&path, &Defaults::default())?;
    let mut builder = SbiBuilder::new(granularity)?;

    loop {
        let position = reader.virtual_position();
        if reader.read_record()?.is_none() {
            break;
        }
        builder.record(position)?;
    }
    let end_of_data = reader.virtual_position();
    builder.finish(end_of_data, file_length, None, None)
}

/// Scan `path`, build its splitting index, and write it to `X.bam.sbi`.
pub fn create_sbi_file(path: impl AsRef<Path>, granularity: u64) -> Result<()> {
    let index = create_sbi(&path, granularity)?;
    let mut name = path.as_ref().as_os_str().to_owned();
    name.push(".sbi");
    index.write_to_path(name)
}

#[cfg(test)]
mod tests {
    use crate::header::{Header, ReferenceSequence, SequenceDictionary, SortOrder};
    use crate::record::{Cigar, CigarOp, CigarOpKind, Flags, Record};
    use crate::writer::{BamWriter, WriterOptions};

    use super::*;

    fn write_sample(path: &Path, with_index: bool) {
        let header = Header::with_sort_order(
            SortOrder::Coordinate,
            SequenceDictionary::new(vec![ReferenceSequence::new("chr1", 100_000)]),
        );
        let options = WriterOptions { create_index: with_index, ..WriterOptions::default() };
        let mut writer = BamWriter::create(path, header, options).unwrap();
        for pos in [10, 5_000, 40_000] {
            writer
                .write_record(Record {
                    ref_id: 0,
                    pos,
                    flags: Flags(0),
                    name: format!("r{pos}").into_bytes(),
                    cigar: Cigar::new(vec![CigarOp::new(CigarOpKind::Match, 25)]),
                    seq: vec![b'A'; 25],
                    quals: vec![30; 25],
                    ..Record::default()
                })
                .unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_offline_bai_matches_live_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_sample(&path, true);

        let live = BaiIndex::read_from_path(dir.path().join("sample.bai")).unwrap();
        let offline = create_bai(&path, true).unwrap();
        assert_eq!(offline, live);
    }

    #[test]
    fn test_create_bai_file_enables_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_sample(&path, false);
        assert!(!dir.path().join("sample.bai").exists());

        create_bai_file(&path).unwrap();

        let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
        assert!(reader.has_index());
        let hits: Vec<Record> = reader
            .query(&[crate::query::Interval::new(0, 4_900, 5_100).unwrap()], false)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, b"r5000");
    }

    #[test]
    fn test_create_sbi_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_sample(&path, false);

        create_sbi_file(&path, 2).unwrap();
        let index = SbiIndex::read_from_path(dir.path().join("sample.bam.sbi")).unwrap();
        assert_eq!(index.header.total_record_count, 3);
        assert_eq!(index.header.granularity, 2);
        // Records 0 and 2 kept, plus the end-of-data VP.
        assert_eq!(index.offsets().len(), 3);
        assert_eq!(index.header.file_length, fs::metadata(&path).unwrap().len());
    }
}
