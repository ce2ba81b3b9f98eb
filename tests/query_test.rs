//! End-to-end indexed query behaviour on a real file.

use bamrange::{
    BamError, BamReader, BamWriter, Defaults, Header, Interval, Record, ReferenceSequence,
    SequenceDictionary, SortOrder, WriterOptions,
};
use bamrange::record::{Cigar, CigarOp, CigarOpKind, Flags};

fn two_chromosome_header() -> Header {
    Header::with_sort_order(
        SortOrder::Coordinate,
        SequenceDictionary::new(vec![
            ReferenceSequence::new("chr1", 1000),
            ReferenceSequence::new("chr2", 1000),
        ]),
    )
}

fn placed(name: &str, ref_id: i32, start_one_based: u32, len: u32) -> Record {
    Record {
        ref_id,
        pos: start_one_based as i32 - 1,
        mapq: 60,
        flags: Flags(0),
        name: name.as_bytes().to_vec(),
        cigar: Cigar::new(vec![CigarOp::new(CigarOpKind::Match, len)]),
        seq: (0..len).map(|i| b"ACGT"[(i % 4) as usize]).collect(),
        quals: vec![30; len as usize],
        ..Record::default()
    }
}

/// Two references, five records, per the canonical scenario: `chr1:100`
/// (100 bases), `chr1:200` (10 bases), `chr1:900`, `chr2:50`, and one
/// unplaced unmapped record.
fn write_sample(path: &std::path::Path) {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = WriterOptions { create_index: true, ..WriterOptions::default() };
    let mut writer = BamWriter::create(path, two_chromosome_header(), options).unwrap();
    writer.write_record(placed("a", 0, 100, 100)).unwrap();
    writer.write_record(placed("b", 0, 200, 10)).unwrap();
    writer.write_record(placed("c", 0, 900, 10)).unwrap();
    writer.write_record(placed("d", 1, 50, 10)).unwrap();
    writer.write_record(Record::default()).unwrap();
    writer.close().unwrap();
}

#[test]
fn test_overlap_query_yields_both_edge_and_inner_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
    assert!(reader.has_index());

    let interval = Interval::new(0, 150, 250).unwrap();
    let hits: Vec<Record> = reader
        .query(&[interval], false)
        .unwrap()
        .collect::<bamrange::Result<_>>()
        .unwrap();

    let names: Vec<&[u8]> = hits.iter().map(|r| r.name.as_slice()).collect();
    assert_eq!(names, vec![b"a".as_slice(), b"b".as_slice()]);
}

#[test]
fn test_contained_query_demands_full_containment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
    let interval = Interval::new(0, 150, 250).unwrap();
    let hits: Vec<Record> = reader
        .query(&[interval], true)
        .unwrap()
        .collect::<bamrange::Result<_>>()
        .unwrap();

    // Only the record at 200 (span 200..=209) lies fully inside 150..=250;
    // the one at 100 spans 100..=199 and pokes out.
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, b"b");
}

#[test]
fn test_unmapped_query_yields_exactly_the_unplaced_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
    let hits: Vec<Record> = reader
        .query_unmapped()
        .unwrap()
        .collect::<bamrange::Result<_>>()
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert!(hits[0].is_unplaced());
}

#[test]
fn test_multi_interval_query_merges_and_spans_references() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
    let intervals = [
        Interval::new(1, 40, 60).unwrap(),
        Interval::new(0, 890, 920).unwrap(),
        Interval::new(0, 895, 930).unwrap(), // overlaps the previous one
    ];
    let hits: Vec<Record> = reader
        .query(&intervals, false)
        .unwrap()
        .collect::<bamrange::Result<_>>()
        .unwrap();

    let names: Vec<&[u8]> = hits.iter().map(|r| r.name.as_slice()).collect();
    assert_eq!(names, vec![b"c".as_slice(), b"d".as_slice()]);
}

#[test]
fn test_iterator_close_is_idempotent_and_final() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
    let interval = Interval::new(0, 1, 1000).unwrap();
    let mut query = reader.query(&[interval], false).unwrap();

    assert!(query.next_record().unwrap().is_some());
    query.close();
    query.close(); // second close is a no-op
    assert!(matches!(
        query.next_record(),
        Err(BamError::InvalidState(_))
    ));
}

#[test]
fn test_sequential_read_sees_all_records_in_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    let mut reader = BamReader::open(&path, &Defaults::default()).unwrap();
    let records: Vec<Record> = reader.records().collect::<bamrange::Result<_>>().unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(records[0].name, b"a");
    assert!(records[4].is_unplaced());
}

#[test]
fn test_truncated_file_reports_unexpected_eof() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    write_sample(&path);

    // Strip the terminal EOF marker, as a crashed writer would leave it.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - bamrange::bgzf::EOF_MARKER.len());
    let truncated = dir.path().join("truncated.bam");
    std::fs::write(&truncated, bytes).unwrap();

    let mut reader = BamReader::open(&truncated, &Defaults::default()).unwrap();
    let outcome: bamrange::Result<Vec<Record>> = reader.records().collect();
    assert!(matches!(outcome, Err(BamError::UnexpectedEof(_))));
}

#[test]
fn test_md5_sidecar_matches_output_bytes() {
    use md5::{Digest, Md5};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.bam");
    let options = WriterOptions {
        create_md5: true,
        ..WriterOptions::default()
    };
    let mut writer = BamWriter::create(&path, two_chromosome_header(), options).unwrap();
    writer.write_record(placed("a", 0, 100, 10)).unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let expected = hex::encode(Md5::digest(&bytes));
    let sidecar = std::fs::read_to_string(dir.path().join("sample.bam.md5")).unwrap();
    assert_eq!(sidecar.trim(), expected);
}
