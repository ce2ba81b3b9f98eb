//! Indexed-query pipeline: interval optimisation, record filters, and the
//! iterators that walk index chunks.
//!
//! The pipeline has four stages: optimise the interval set (sort + merge),
//! resolve it to chunks through the index, scan the chunks in virtual
//! position order, and filter each decoded record against the original
//! intervals.  Filtering is a plain object implementing [`RecordFilter`];
//! one generic [`FilteringIterator`] adapter applies any filter to any
//! record source.

use std::io::{Read, Seek};

use crate::bgzf::{Chunk, VirtualPosition};
use crate::binning::MAX_POSITION;
use crate::error::{BamError, Result};
use crate::reader::BamReader;
use crate::record::Record;

// ── Intervals ────────────────────────────────────────────────────────────────

/// A query interval: one-based, closed on both ends, on one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub ref_id: usize,
    pub start: u32,
    pub end: u32,
}

impl Interval {
    pub fn new(ref_id: usize, start: u32, end: u32) -> Result<Self> {
        if start == 0 || end < start || start > MAX_POSITION {
            return Err(BamError::InvalidArgument(format!(
                "bad query interval {start}-{end} (one-based, start ≤ end required)"
            )));
        }
        Ok(Self { ref_id, start, end })
    }

    /// Zero-based half-open form for the index lookup.
    pub(crate) fn as_bin_range(self) -> (usize, u32, u32) {
        (self.ref_id, self.start - 1, self.end)
    }
}

/// Sort intervals by (reference, start) and merge overlapping or abutting
/// neighbours.  Queries must run on an optimised set; the merge keeps the
/// chunk resolution from scanning the same region twice.
pub fn optimize_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by_key(|i| (i.ref_id, i.start, i.end));
    let mut out: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match out.last_mut() {
            Some(last)
                if last.ref_id == interval.ref_id
                    && interval.start <= last.end.saturating_add(1) =>
            {
                last.end = last.end.max(interval.end);
            }
            _ => out.push(interval),
        }
    }
    out
}

// ── Filters ──────────────────────────────────────────────────────────────────

/// Verdict of a filter on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject,
    /// No later record in the stream can match; the iterator drains.
    Stop,
}

pub trait RecordFilter {
    fn evaluate(&self, record: &Record) -> FilterDecision;
}

/// Matches records against an optimised interval set.
///
/// `contained` demands the full alignment span inside one interval;
/// otherwise any overlap accepts.  A record whose (reference, start) is
/// lexicographically beyond the last interval stops the scan — the stream
/// is coordinate sorted, nothing later can match.
#[derive(Debug)]
pub struct IntervalFilter {
    intervals: Vec<Interval>,
    contained: bool,
}

impl IntervalFilter {
    /// `intervals` must already be optimised (see [`optimize_intervals`]).
    pub fn new(intervals: Vec<Interval>, contained: bool) -> Result<Self> {
        if intervals.is_empty() {
            return Err(BamError::InvalidArgument("empty interval set".into()));
        }
        Ok(Self { intervals, contained })
    }
}

impl RecordFilter for IntervalFilter {
    fn evaluate(&self, record: &Record) -> FilterDecision {
        // Unplaced records sort after everything; reaching one means the
        // placed region is exhausted.
        if record.is_unplaced() {
            return FilterDecision::Stop;
        }
        let Some(start) = record.alignment_start() else {
            return FilterDecision::Reject;
        };
        let end = record.alignment_end().unwrap_or(start);
        let ref_id = record.ref_id as usize;

        let last = self.intervals[self.intervals.len() - 1];
        if ref_id > last.ref_id || (ref_id == last.ref_id && start > last.end) {
            return FilterDecision::Stop;
        }

        for interval in &self.intervals {
            if interval.ref_id != ref_id {
                continue;
            }
            let hit = if self.contained {
                start >= interval.start && end <= interval.end
            } else {
                start <= interval.end && end >= interval.start
            };
            if hit {
                return FilterDecision::Accept;
            }
        }
        FilterDecision::Reject
    }
}

/// Accepts exactly the records with no reference — the trailing unmapped
/// block of a coordinate-sorted file.
#[derive(Debug, Default)]
pub struct UnplacedFilter;

impl RecordFilter for UnplacedFilter {
    fn evaluate(&self, record: &Record) -> FilterDecision {
        if record.is_unplaced() {
            FilterDecision::Accept
        } else {
            FilterDecision::Reject
        }
    }
}

// ── Chunk iterator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    BetweenChunks,
    /// Scanning until the reader's virtual position reaches the bound.
    WithinChunk(VirtualPosition),
    Drained,
    Closed,
}

/// Scans a list of coalesced chunks in order: seek to each chunk's start,
/// decode records until the chunk's end, jump to the next chunk.
pub struct ChunkIterator<'a, R: Read + Seek> {
    reader: &'a mut BamReader<R>,
    chunks: Vec<Chunk>,
    next_chunk: usize,
    state: ChunkState,
}

impl<'a, R: Read + Seek> ChunkIterator<'a, R> {
    pub(crate) fn new(reader: &'a mut BamReader<R>, chunks: Vec<Chunk>) -> Self {
        Self { reader, chunks, next_chunk: 0, state: ChunkState::BetweenChunks }
    }

    /// A single unbounded pseudo-chunk starting at `start`: scan from there
    /// to the end of the data.  Used by the unmapped query.
    pub(crate) fn from_position(reader: &'a mut BamReader<R>, start: VirtualPosition) -> Self {
        let chunks = vec![Chunk::new(start, VirtualPosition::UNSET)];
        Self::new(reader, chunks)
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.state {
                ChunkState::Closed => {
                    return Err(BamError::InvalidState("iterator used after close"))
                }
                ChunkState::Drained => return Ok(None),
                ChunkState::BetweenChunks => {
                    let Some(&chunk) = self.chunks.get(self.next_chunk) else {
                        self.state = ChunkState::Drained;
                        return Ok(None);
                    };
                    self.next_chunk += 1;
                    self.reader.seek(chunk.start())?;
                    self.state = ChunkState::WithinChunk(chunk.end());
                }
                ChunkState::WithinChunk(end) => {
                    if self.reader.virtual_position() >= end {
                        self.state = ChunkState::BetweenChunks;
                        continue;
                    }
                    match self.reader.read_record()? {
                        Some(record) => return Ok(Some(record)),
                        None => {
                            self.state = ChunkState::Drained;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Release the seek state.  Idempotent; any other operation after a
    /// close is an error.
    pub fn close(&mut self) {
        self.state = ChunkState::Closed;
        self.chunks.clear();
    }
}

// ── Filtering adapter ────────────────────────────────────────────────────────

/// Applies a [`RecordFilter`] to a [`ChunkIterator`], yielding accepted
/// records and draining on a `Stop` verdict.
pub struct FilteringIterator<'a, R: Read + Seek, F: RecordFilter> {
    inner: ChunkIterator<'a, R>,
    filter: F,
    /// A `Stop` verdict drained the stream; further reads yield `None`.
    stopped: bool,
    /// The caller closed the iterator; further reads are `InvalidState`.
    closed: bool,
}

impl<'a, R: Read + Seek, F: RecordFilter> FilteringIterator<'a, R, F> {
    pub(crate) fn new(inner: ChunkIterator<'a, R>, filter: F) -> Self {
        Self { inner, filter, stopped: false, closed: false }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.closed {
            return Err(BamError::InvalidState("iterator used after close"));
        }
        if self.stopped {
            return Ok(None);
        }
        loop {
            let Some(record) = self.inner.next_record()? else {
                return Ok(None);
            };
            match self.filter.evaluate(&record) {
                FilterDecision::Accept => return Ok(Some(record)),
                FilterDecision::Reject => continue,
                FilterDecision::Stop => {
                    self.stopped = true;
                    self.inner.close();
                    return Ok(None);
                }
            }
        }
    }

    /// Release the held seek state.  Idempotent; every other operation
    /// after a close is an error.
    pub fn close(&mut self) {
        self.closed = true;
        self.inner.close();
    }
}

impl<R: Read + Seek, F: RecordFilter> Iterator for FilteringIterator<'_, R, F> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Iterator over records matching a set of query intervals.
pub type Query<'a, R> = FilteringIterator<'a, R, IntervalFilter>;
/// Iterator over the trailing unmapped records.
pub type UnmappedQuery<'a, R> = FilteringIterator<'a, R, UnplacedFilter>;

#[cfg(test)]
mod tests {
    use crate::record::{Cigar, CigarOp, CigarOpKind, Flags};

    use super::*;

    fn itv(ref_id: usize, start: u32, end: u32) -> Interval {
        Interval::new(ref_id, start, end).unwrap()
    }

    fn placed(ref_id: i32, start_one_based: u32, len: u32) -> Record {
        Record {
            ref_id,
            pos: start_one_based as i32 - 1,
            flags: Flags(0),
            cigar: Cigar::new(vec![CigarOp::new(CigarOpKind::Match, len)]),
            ..Record::default()
        }
    }

    #[test]
    fn test_optimize_sorts_and_merges() {
        let optimized = optimize_intervals(vec![
            itv(1, 500, 600),
            itv(0, 100, 200),
            itv(0, 150, 300),
            itv(0, 301, 400), // abuts the previous merge
        ]);
        assert_eq!(optimized, vec![itv(0, 100, 400), itv(1, 500, 600)]);
    }

    #[test]
    fn test_optimize_keeps_disjoint_intervals() {
        let optimized = optimize_intervals(vec![itv(0, 100, 200), itv(0, 202, 300)]);
        assert_eq!(optimized.len(), 2);
    }

    #[test]
    fn test_interval_validation() {
        assert!(Interval::new(0, 0, 10).is_err());
        assert!(Interval::new(0, 10, 9).is_err());
        assert!(Interval::new(0, 10, 10).is_ok());
    }

    #[test]
    fn test_overlap_vs_containment() {
        let filter =
            IntervalFilter::new(vec![itv(0, 150, 250)], false).unwrap();
        let contained =
            IntervalFilter::new(vec![itv(0, 150, 250)], true).unwrap();

        // Starts at 100 with 100 bases: spans 100..=199, poking out of the
        // interval on the left.
        let edge = placed(0, 100, 100);
        assert_eq!(filter.evaluate(&edge), FilterDecision::Accept);
        assert_eq!(contained.evaluate(&edge), FilterDecision::Reject);

        // Fully inside.
        let inside = placed(0, 200, 10);
        assert_eq!(filter.evaluate(&inside), FilterDecision::Accept);
        assert_eq!(contained.evaluate(&inside), FilterDecision::Accept);

        // Before the interval.
        let before = placed(0, 10, 20);
        assert_eq!(filter.evaluate(&before), FilterDecision::Reject);
    }

    #[test]
    fn test_stop_past_last_interval() {
        let filter = IntervalFilter::new(vec![itv(0, 150, 250)], false).unwrap();
        assert_eq!(filter.evaluate(&placed(0, 251, 10)), FilterDecision::Stop);
        assert_eq!(filter.evaluate(&placed(1, 1, 10)), FilterDecision::Stop);
        assert_eq!(filter.evaluate(&Record::default()), FilterDecision::Stop);
    }

    #[test]
    fn test_unplaced_filter() {
        let filter = UnplacedFilter;
        assert_eq!(filter.evaluate(&Record::default()), FilterDecision::Accept);
        assert_eq!(filter.evaluate(&placed(0, 1, 5)), FilterDecision::Reject);
    }
}
