//! BAM reader: sequential record iteration, indexed queries, and companion
//! index discovery.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use crate::bai::BaiIndex;
use crate::bgzf::{BgzfReader, PrefetchReader, VirtualPosition};
use crate::codec::{decode_record, RawRecord, ValidationStringency, MIN_RECORD_BODY};
use crate::defaults::Defaults;
use crate::error::{BamError, Result};
use crate::header::Header;
use crate::query::{
    optimize_intervals, ChunkIterator, FilteringIterator, Interval, IntervalFilter, Query,
    UnmappedQuery, UnplacedFilter,
};
use crate::record::Record;

/// The capability set shared by every alignment source variant (BAM, the
/// text format, the reference-compressed format, remote).  Only the BAM
/// variant lives in this crate; the others are external collaborators
/// implementing the same surface.  Indexed queries stay on the concrete
/// reader because they borrow it for the iterator's lifetime.
pub trait AlignmentSource {
    fn header(&self) -> &Header;
    fn has_index(&self) -> bool;
    /// `Ok(None)` is the clean end of the stream.
    fn next_record(&mut self) -> Result<Option<Record>>;
    /// Release the underlying byte source.  Reads after close are errors.
    fn close(&mut self) -> Result<()>;
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct BamReader<R: Read> {
    bgzf: BgzfReader<R>,
    header: Header,
    index: Option<BaiIndex>,
    stringency: ValidationStringency,
    /// Where the first record starts (right after the header block).
    first_record_position: VirtualPosition,
    scratch: Vec<u8>,
    closed: bool,
}

impl BamReader<BufReader<File>> {
    /// Open a BAM file, probing for its companion index (see
    /// [`find_companion_index`]).
    pub fn open(path: impl AsRef<Path>, defaults: &Defaults) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let buffered = BufReader::with_capacity(defaults.buffer_size, file);
        let mut reader = Self::from_reader(buffered)?;

        if let Some(index_path) = find_companion_index(path) {
            reader.index = Some(BaiIndex::read_from_path(index_path)?);
        }
        Ok(reader)
    }
}

impl BamReader<PrefetchReader> {
    /// Sequential-only variant with a worker thread prefetching compressed
    /// bytes one block ahead.  No seeking, so no indexed queries.
    pub fn open_async(path: impl AsRef<Path>, _defaults: &Defaults) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(PrefetchReader::new(file))
    }
}

impl<R: Read> BamReader<R> {
    /// Wrap an already-open BGZF byte source and read the header.
    pub fn from_reader(inner: R) -> Result<Self> {
        let mut bgzf = BgzfReader::new(inner);
        let header = Header::read_from(&mut ByteReader(&mut bgzf))?;
        let first_record_position = bgzf.virtual_position();
        Ok(Self {
            bgzf,
            header,
            index: None,
            stringency: ValidationStringency::default(),
            first_record_position,
            scratch: Vec::new(),
            closed: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    pub fn index(&self) -> Option<&BaiIndex> {
        self.index.as_ref()
    }

    /// Attach an index loaded elsewhere (e.g. from a nonstandard path).
    pub fn set_index(&mut self, index: BaiIndex) {
        self.index = Some(index);
    }

    pub fn set_validation_stringency(&mut self, stringency: ValidationStringency) {
        self.stringency = stringency;
    }

    /// Virtual position of the next record boundary.
    pub fn virtual_position(&self) -> VirtualPosition {
        self.bgzf.virtual_position()
    }

    /// Decode the next record.  `Ok(None)` is the clean end of the stream;
    /// a stream ending without the BGZF EOF marker is `UnexpectedEof` — the
    /// file was truncated by a writer that never closed.
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        match self.read_record_bytes()? {
            None => Ok(None),
            Some(()) => decode_record(&self.scratch, self.stringency).map(Some),
        }
    }

    /// Like [`BamReader::read_record`], but retaining the raw bytes for
    /// on-demand field access.
    pub fn read_raw_record(&mut self) -> Result<Option<RawRecord>> {
        match self.read_record_bytes()? {
            None => Ok(None),
            Some(()) => RawRecord::new(self.scratch.clone()).map(Some),
        }
    }

    /// Read one framed record body into the scratch buffer.
    fn read_record_bytes(&mut self) -> Result<Option<()>> {
        if self.closed {
            return Err(BamError::InvalidState("reader is closed"));
        }

        let mut len_buf = [0u8; 4];
        let n = self.bgzf.read_available(&mut len_buf)?;
        if n == 0 {
            if !self.bgzf.eof_marker_seen() {
                return Err(BamError::UnexpectedEof("BGZF EOF marker"));
            }
            return Ok(None);
        }
        if n < len_buf.len() {
            return Err(BamError::UnexpectedEof("record length"));
        }

        let block_size = u32::from_le_bytes(len_buf) as usize;
        if block_size < MIN_RECORD_BODY {
            return Err(BamError::InvalidRecord(format!(
                "declared record size {block_size} below the {MIN_RECORD_BODY}-byte minimum"
            )));
        }

        self.scratch.resize(block_size, 0);
        self.bgzf.read_fully(&mut self.scratch)?;
        Ok(Some(()))
    }

    /// Iterator over the remaining records in file order.
    pub fn records(&mut self) -> Records<'_, R> {
        Records { reader: self }
    }
}

impl<R: Read + Seek> BamReader<R> {
    /// Reposition to an arbitrary record boundary, e.g. a chunk start from
    /// an index or a splitting-index offset.
    pub fn seek(&mut self, position: VirtualPosition) -> Result<()> {
        self.bgzf.seek_virtual(position)
    }

    /// Records overlapping (or contained in, with `contained`) any of the
    /// query intervals, reading only the chunks the index names.
    pub fn query(&mut self, intervals: &[Interval], contained: bool) -> Result<Query<'_, R>> {
        let optimized = optimize_intervals(intervals.to_vec());
        let chunks = {
            let index = self.index.as_ref().ok_or(BamError::NotIndexable)?;
            let ranges: Vec<_> = optimized.iter().map(|i| i.as_bin_range()).collect();
            index.query_many(&ranges)?
        };
        let filter = IntervalFilter::new(optimized, contained)?;
        Ok(FilteringIterator::new(ChunkIterator::new(self, chunks), filter))
    }

    /// The trailing unplaced unmapped records: seek to the start of the
    /// last linear bin across all references and scan forward.
    pub fn query_unmapped(&mut self) -> Result<UnmappedQuery<'_, R>> {
        let start = {
            let index = self.index.as_ref().ok_or(BamError::NotIndexable)?;
            index
                .start_of_last_linear_bin()
                .unwrap_or(self.first_record_position)
        };
        Ok(FilteringIterator::new(
            ChunkIterator::from_position(self, start),
            UnplacedFilter,
        ))
    }
}

impl<R: Read> AlignmentSource for BamReader<R> {
    fn header(&self) -> &Header {
        &self.header
    }

    fn has_index(&self) -> bool {
        self.index.is_some()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        self.read_record()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Sequential record iterator borrowed from a reader.
pub struct Records<'a, R: Read> {
    reader: &'a mut BamReader<R>,
}

impl<R: Read> Iterator for Records<'_, R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.read_record().transpose()
    }
}

/// Adapter exposing the BamError-native reader as `io::Read` for the
/// header parse.
struct ByteReader<'a, R: Read>(&'a mut BgzfReader<R>);

impl<R: Read> Read for ByteReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(self.0, buf)
    }
}

// ── Companion discovery ──────────────────────────────────────────────────────

/// Probe for a data file's companion index.
///
/// `X.bam` probes `X.bai` then `X.bam.bai`; `X.cram` probes `X.crai` then
/// `X.cram.crai`.  When neither exists and the data path is a symlink, its
/// immediate target is probed the same way (one level only).  An index
/// older than its data file gets a non-fatal warning.
pub fn find_companion_index(data: &Path) -> Option<PathBuf> {
    if let Some(found) = probe_siblings(data) {
        return Some(found);
    }

    // One level of symlink resolution.
    if let Ok(target) = fs::read_link(data) {
        let resolved = if target.is_absolute() {
            target
        } else {
            data.parent().map(|p| p.join(&target)).unwrap_or(target)
        };
        if let Some(found) = probe_siblings(&resolved) {
            return Some(found);
        }
    }
    None
}

fn probe_siblings(data: &Path) -> Option<PathBuf> {
    let extension = data.extension()?.to_str()?;
    let index_extension = match extension {
        "bam" => "bai",
        "cram" => "crai",
        _ => return None,
    };

    let replaced = data.with_extension(index_extension);
    let appended = {
        let mut name = data.as_os_str().to_owned();
        name.push(".");
        name.push(index_extension);
        PathBuf::from(name)
    };

    for candidate in [replaced, appended] {
        if candidate.is_file() {
            warn_if_stale(data, &candidate);
            return Some(candidate);
        }
    }
    None
}

fn warn_if_stale(data: &Path, index: &Path) {
    let (Ok(data_meta), Ok(index_meta)) = (fs::metadata(data), fs::metadata(index)) else {
        return;
    };
    if let (Ok(data_mtime), Ok(index_mtime)) = (data_meta.modified(), index_meta.modified()) {
        if index_mtime < data_mtime {
            log::warn!(
                "index {} is older than its data file {}; it may be stale",
                index.display(),
                data.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::bgzf::BgzfWriter;
    use crate::codec::write_record;
    use crate::header::{ReferenceSequence, SequenceDictionary, SortOrder};
    use crate::record::{Cigar, CigarOp, CigarOpKind, Flags};

    use super::*;

    fn sample_header() -> Header {
        Header::with_sort_order(
            SortOrder::Coordinate,
            SequenceDictionary::new(vec![ReferenceSequence::new("chr1", 1000)]),
        )
    }

    fn sample_record(pos: i32) -> Record {
        Record {
            ref_id: 0,
            pos,
            flags: Flags(0),
            name: b"read".to_vec(),
            cigar: Cigar::new(vec![CigarOp::new(CigarOpKind::Match, 10)]),
            seq: b"ACGTACGTAC".to_vec(),
            quals: vec![30; 10],
            ..Record::default()
        }
    }

    fn bam_bytes(records: &[Record], with_eof: bool) -> Vec<u8> {
        let mut bgzf = BgzfWriter::new(Vec::new(), 5);
        let mut buf = Vec::new();
        sample_header().write_to(&mut buf).unwrap();
        for record in records {
            write_record(&mut buf, record).unwrap();
        }
        std::io::Write::write_all(&mut bgzf, &buf).unwrap();
        let mut bytes = bgzf.finish().unwrap();
        if !with_eof {
            bytes.truncate(bytes.len() - crate::bgzf::EOF_MARKER.len());
        }
        bytes
    }

    #[test]
    fn test_sequential_read() {
        let bytes = bam_bytes(&[sample_record(10), sample_record(20)], true);
        let mut reader = BamReader::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.header().sort_order(), SortOrder::Coordinate);

        let records: Result<Vec<_>> = reader.records().collect();
        let records = records.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pos, 10);
        assert_eq!(records[1].pos, 20);
    }

    #[test]
    fn test_missing_eof_marker_reported() {
        let bytes = bam_bytes(&[sample_record(10)], false);
        let mut reader = BamReader::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap().pos, 10);
        match reader.read_record() {
            Err(BamError::UnexpectedEof(_)) => {}
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn test_query_without_index_fails() {
        let bytes = bam_bytes(&[sample_record(10)], true);
        let mut reader = BamReader::from_reader(Cursor::new(bytes)).unwrap();
        let interval = Interval::new(0, 1, 100).unwrap();
        assert!(matches!(
            reader.query(&[interval], false),
            Err(BamError::NotIndexable)
        ));
        assert!(matches!(reader.query_unmapped(), Err(BamError::NotIndexable)));
    }

    #[test]
    fn test_read_after_close_is_invalid_state() {
        let bytes = bam_bytes(&[sample_record(10)], true);
        let mut reader = BamReader::from_reader(Cursor::new(bytes)).unwrap();
        AlignmentSource::close(&mut reader).unwrap();
        assert!(matches!(reader.read_record(), Err(BamError::InvalidState(_))));
    }

    #[test]
    fn test_raw_record_access() {
        let bytes = bam_bytes(&[sample_record(42)], true);
        let mut reader = BamReader::from_reader(Cursor::new(bytes)).unwrap();
        let raw = reader.read_raw_record().unwrap().unwrap();
        assert_eq!(raw.pos(), 42);
        assert_eq!(raw.name(), b"read");
    }

    #[test]
    fn test_record_positions_strictly_increase() {
        let bytes =
            bam_bytes(&[sample_record(1), sample_record(2), sample_record(3)], true);
        let mut reader = BamReader::from_reader(Cursor::new(bytes)).unwrap();
        let mut last = reader.virtual_position();
        while let Some(_record) = reader.read_record().unwrap() {
            let position = reader.virtual_position();
            assert!(position > last);
            last = position;
        }
    }
}
