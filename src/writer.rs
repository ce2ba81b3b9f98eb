//! BAM writer: record serialisation into the BGZF stream, sort-order
//! enforcement with spill-to-disk sorting, live index building, and the
//! MD5 sidecar.
//!
//! Records flow `Record → codec → BGZF`, with the binning-index builder
//! observing every record's pre- and post-write virtual positions.  When
//! the input is not declared presorted, records buffer in memory up to
//! `max_records_in_ram`, spill to temporary sorted runs, and merge at
//! close.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};

use crate::bai::merge::{part_file_name, part_index_file_name, HEADER_FILE_NAME, TERMINATOR_FILE_NAME};
use crate::bai::{BaiBuilder, BaiIndex};
use crate::bgzf::{AsyncBgzfWriter, BgzfWriter, Chunk, VirtualPosition, EOF_MARKER};
use crate::codec::{decode_record, write_record, ValidationStringency};
use crate::defaults::{Defaults, DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_RECORDS_IN_RAM};
use crate::error::{BamError, Result};
use crate::header::{Header, SortOrder};
use crate::record::Record;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Deflate level, 0–9.
    pub compression_level: u32,
    /// Build the companion index while writing.  Takes effect only when
    /// the header declares coordinate order.
    pub create_index: bool,
    /// Emit a sidecar MD5 of the raw compressed output bytes.
    pub create_md5: bool,
    /// Run block writing on a dedicated worker thread.
    pub use_async_io: bool,
    /// In-memory record cap before the sorter spills to disk.
    pub max_records_in_ram: usize,
    /// I/O buffer size for file sinks.
    pub buffer_size: usize,
    /// The caller guarantees records arrive in the declared sort order.
    /// When false, the writer sorts (buffer, spill, merge).
    pub presorted: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            create_index: false,
            create_md5: false,
            use_async_io: false,
            max_records_in_ram: DEFAULT_MAX_RECORDS_IN_RAM,
            buffer_size: crate::defaults::DEFAULT_BUFFER_SIZE,
            presorted: true,
        }
    }
}

impl WriterOptions {
    pub fn from_defaults(defaults: &Defaults) -> Self {
        Self {
            compression_level: defaults.compression_level,
            create_index: defaults.create_index,
            create_md5: defaults.create_md5,
            use_async_io: defaults.use_async_io_write,
            buffer_size: defaults.buffer_size,
            ..Self::default()
        }
    }
}

// ── Output plumbing ──────────────────────────────────────────────────────────

type BoxedSink = Box<dyn Write + Send>;

/// Tees written bytes into an MD5 digest shared with the writer that will
/// emit the sidecar at close.
struct Md5Tee {
    inner: BoxedSink,
    hasher: Arc<Mutex<Md5>>,
}

impl Write for Md5Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.lock().expect("md5 hasher poisoned").update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum Sink {
    Sync(BgzfWriter<BoxedSink>),
    Async(AsyncBgzfWriter<BoxedSink>),
}

impl Sink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Sync(w) => Ok(w.write_all(data)?),
            Sink::Async(w) => w.write_all(data),
        }
    }

    fn virtual_position(&self) -> VirtualPosition {
        match self {
            Sink::Sync(w) => w.virtual_position(),
            Sink::Async(w) => w.virtual_position(),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Sink::Sync(w) => Ok(w.flush()?),
            Sink::Async(w) => w.flush(),
        }
    }

    fn finish(self, with_eof: bool) -> Result<BoxedSink> {
        match (self, with_eof) {
            (Sink::Sync(w), true) => w.finish(),
            (Sink::Sync(w), false) => w.finish_without_eof(),
            (Sink::Async(w), true) => w.finish(),
            (Sink::Async(w), false) => w.finish_without_eof(),
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct BamWriter {
    sink: Option<Sink>,
    header: Header,
    sorter: Option<RecordSorter>,
    index_builder: Option<BaiBuilder>,
    /// Where to put the companion index at close, when known.
    index_path: Option<PathBuf>,
    /// Index built at close, for embedders writing to a raw stream.
    finished_index: Option<BaiIndex>,
    md5: Option<(Arc<Mutex<Md5>>, PathBuf)>,
    sort_order: SortOrder,
    /// (ref as unsigned with unmapped last, pos) of the previous record,
    /// for the presorted coordinate check.
    last_coordinate: Option<(u32, i32)>,
    last_name: Option<Vec<u8>>,
    /// The terminal EOF marker belongs to this writer (false for the part
    /// writer of a partitioned directory).
    owns_terminator: bool,
    encode_buf: Vec<u8>,
}

impl BamWriter {
    /// Create `path`, write the BGZF-wrapped header, and prepare the
    /// sidecars the options ask for (`X.bai` next to `X.bam`, `X.bam.md5`).
    pub fn create(path: impl AsRef<Path>, header: Header, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let sink: BoxedSink = Box::new(BufWriter::with_capacity(options.buffer_size, file));

        let index_path = path.with_extension("bai");
        let md5_path = {
            let mut name = path.as_os_str().to_owned();
            name.push(".md5");
            PathBuf::from(name)
        };
        Self::build(sink, header, options, Some(index_path), md5_path, true, true)
    }

    /// Write to an arbitrary stream.  The companion index, when requested,
    /// is retained for [`BamWriter::take_index`] instead of hitting disk.
    pub fn from_writer<W: Write + Send + 'static>(
        writer: W,
        header: Header,
        options: WriterOptions,
    ) -> Result<Self> {
        Self::build(Box::new(writer), header, options, None, PathBuf::new(), true, true)
    }

    /// Headerless part writer for a partitioned directory: writes
    /// `part-NNNNN`, builds the hidden `.part-NNNNN.bai` with the
    /// linear-index fill disabled, and leaves the EOF marker to the shared
    /// `terminator` file.
    pub fn create_part(
        dir: impl AsRef<Path>,
        part: usize,
        header: Header,
        options: WriterOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let file = File::create(dir.join(part_file_name(part)))?;
        let sink: BoxedSink = Box::new(BufWriter::with_capacity(options.buffer_size, file));
        let index_path = dir.join(part_index_file_name(part));
        Self::build(sink, header, options, Some(index_path), PathBuf::new(), false, false)
    }

    fn build(
        raw_sink: BoxedSink,
        header: Header,
        options: WriterOptions,
        index_path: Option<PathBuf>,
        md5_path: PathBuf,
        write_header: bool,
        owns_terminator: bool,
    ) -> Result<Self> {
        let md5 = if options.create_md5 && !md5_path.as_os_str().is_empty() {
            Some((Arc::new(Mutex::new(Md5::new())), md5_path))
        } else {
            None
        };

        let tee: BoxedSink = match &md5 {
            Some((hasher, _)) => Box::new(Md5Tee { inner: raw_sink, hasher: Arc::clone(hasher) }),
            None => raw_sink,
        };

        let mut sink = if options.use_async_io {
            Sink::Async(AsyncBgzfWriter::new(tee, options.compression_level))
        } else {
            Sink::Sync(BgzfWriter::new(tee, options.compression_level))
        };

        let sort_order = header.sort_order();

        let index_builder = if options.create_index {
            if sort_order == SortOrder::Coordinate {
                // Part indexes must not be forward-filled: a filled entry
                // cannot be distinguished from a real one when merging.
                Some(BaiBuilder::new(&header.dictionary).fill_linear_index(owns_terminator))
            } else {
                log::warn!(
                    "create_index requested but the header declares {:?} order; no index will be built",
                    sort_order
                );
                None
            }
        } else {
            None
        };

        let sorter = if options.presorted {
            None
        } else {
            Some(RecordSorter::new(options.max_records_in_ram, sort_order))
        };

        if write_header {
            let mut buf = Vec::new();
            header.write_to(&mut buf)?;
            sink.write_all(&buf)?;
        }

        Ok(Self {
            sink: Some(sink),
            header,
            sorter,
            index_builder,
            index_path,
            finished_index: None,
            md5,
            sort_order,
            last_coordinate: None,
            last_name: None,
            owns_terminator,
            encode_buf: Vec::new(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Accept one record.  With `presorted`, a record breaking the declared
    /// sort order is `OutOfOrder`; otherwise it goes to the sorter and hits
    /// the stream at close.
    pub fn write_record(&mut self, record: Record) -> Result<()> {
        if self.sink.is_none() {
            return Err(BamError::InvalidState("writer is closed"));
        }

        if let Some(sorter) = &mut self.sorter {
            sorter.push(record)?;
            return Ok(());
        }

        self.check_sort_order(&record)?;
        self.encode_and_write(&record)
    }

    fn check_sort_order(&mut self, record: &Record) -> Result<()> {
        match self.sort_order {
            SortOrder::Coordinate => {
                let key = coordinate_key(record);
                if let Some(last) = self.last_coordinate {
                    if key < last {
                        return Err(BamError::OutOfOrder(format!(
                            "record at ref {} pos {} after ref {} pos {}",
                            record.ref_id,
                            record.pos + 1,
                            if last.0 == u32::MAX { -1 } else { last.0 as i32 },
                            last.1 + 1
                        )));
                    }
                }
                self.last_coordinate = Some(key);
            }
            SortOrder::QueryName => {
                if let Some(last) = &self.last_name {
                    if record.name < *last {
                        return Err(BamError::OutOfOrder(format!(
                            "read name {:?} after {:?}",
                            String::from_utf8_lossy(&record.name),
                            String::from_utf8_lossy(last)
                        )));
                    }
                }
                self.last_name = Some(record.name.clone());
            }
            SortOrder::Unsorted | SortOrder::Unknown => {}
        }
        Ok(())
    }

    fn encode_and_write(&mut self, record: &Record) -> Result<()> {
        let sink = self.sink.as_mut().ok_or(BamError::InvalidState("writer is closed"))?;

        let start = sink.virtual_position();
        self.encode_buf.clear();
        write_record(&mut self.encode_buf, record)?;
        sink.write_all(&self.encode_buf)?;
        let end = sink.virtual_position();

        if let Some(builder) = &mut self.index_builder {
            builder.add_record(record, Chunk::new(start, end))?;
        }
        Ok(())
    }

    /// Drain the sorter, flush, finalise the companion index and MD5
    /// sidecar, and write the EOF marker.  Must be called exactly once;
    /// writing afterwards is `InvalidState`.
    pub fn close(&mut self) -> Result<()> {
        if self.sink.is_none() {
            return Err(BamError::InvalidState("writer already closed"));
        }

        if let Some(mut sorter) = self.sorter.take() {
            let mut drain = sorter.drain()?;
            while let Some(record) = drain.next_record()? {
                self.encode_and_write(&record)?;
            }
        }

        let mut sink = self.sink.take().expect("sink checked above");
        sink.flush()?;
        sink.finish(self.owns_terminator)?;

        if let Some(builder) = self.index_builder.take() {
            let index = builder.build();
            if let Some(path) = &self.index_path {
                index.write_to_path(path)?;
            }
            self.finished_index = Some(index);
        }

        if let Some((hasher, path)) = self.md5.take() {
            let digest = hasher.lock().expect("md5 hasher poisoned").clone().finalize();
            let mut f = File::create(path)?;
            writeln!(f, "{}", hex::encode(digest))?;
        }

        Ok(())
    }

    /// The index built at close, for stream-backed writers.
    pub fn take_index(&mut self) -> Option<BaiIndex> {
        self.finished_index.take()
    }
}

/// Coordinate sort key: unmapped-without-reference records order last.
fn coordinate_key(record: &Record) -> (u32, i32) {
    if record.ref_id < 0 {
        (u32::MAX, record.pos)
    } else {
        (record.ref_id as u32, record.pos)
    }
}

// ── Partitioned scaffolding ──────────────────────────────────────────────────

/// Write the `header` and `terminator` files of a partitioned directory.
/// Parts are written by [`BamWriter::create_part`]; the concatenation
/// `header + part-00000 + … + terminator` is a complete BAM file.
pub fn write_partitioned_scaffold(
    dir: impl AsRef<Path>,
    header: &Header,
    compression_level: u32,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let file = File::create(dir.join(HEADER_FILE_NAME))?;
    let mut bgzf = BgzfWriter::new(file, compression_level);
    let mut buf = Vec::new();
    header.write_to(&mut buf)?;
    bgzf.write_all(&buf)?;
    bgzf.finish_without_eof()?;

    let mut terminator = File::create(dir.join(TERMINATOR_FILE_NAME))?;
    terminator.write_all(&EOF_MARKER)?;
    Ok(())
}

// ── Sorter ───────────────────────────────────────────────────────────────────

/// Buffers records up to a cap, spills sorted runs to anonymous temp
/// files, and merges the runs with the in-memory remainder at drain time.
struct RecordSorter {
    max_in_ram: usize,
    in_ram: Vec<Record>,
    runs: Vec<File>,
    sort_order: SortOrder,
}

impl RecordSorter {
    fn new(max_in_ram: usize, sort_order: SortOrder) -> Self {
        Self { max_in_ram: max_in_ram.max(1), in_ram: Vec::new(), runs: Vec::new(), sort_order }
    }

    fn push(&mut self, record: Record) -> Result<()> {
        self.in_ram.push(record);
        if self.in_ram.len() >= self.max_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    fn sort_batch(&mut self) {
        match self.sort_order {
            SortOrder::QueryName => self.in_ram.sort_by(|a, b| a.name.cmp(&b.name)),
            _ => self.in_ram.sort_by_key(coordinate_key),
        }
    }

    /// Encode the sorted in-memory batch into a fresh temp file.
    fn spill(&mut self) -> Result<()> {
        self.sort_batch();
        let mut file = tempfile::tempfile()?;
        {
            let mut w = BufWriter::new(&mut file);
            let mut buf = Vec::new();
            for record in self.in_ram.drain(..) {
                buf.clear();
                write_record(&mut buf, &record)?;
                w.write_all(&buf)?;
            }
            w.flush()?;
        }
        file.seek(SeekFrom::Start(0))?;
        self.runs.push(file);
        Ok(())
    }

    fn drain(&mut self) -> Result<SortedDrain> {
        self.sort_batch();
        let in_ram = std::mem::take(&mut self.in_ram);

        let mut sources: Vec<RunReader> = Vec::with_capacity(self.runs.len());
        for file in self.runs.drain(..) {
            sources.push(RunReader { reader: BufReader::new(file) });
        }

        let mut heap = BinaryHeap::new();
        for (run, source) in sources.iter_mut().enumerate() {
            if let Some(record) = source.next_record()? {
                heap.push(HeapEntry { record, run, sort_order: self.sort_order });
            }
        }

        Ok(SortedDrain {
            in_ram: in_ram.into_iter().peekable(),
            sources,
            heap,
            sort_order: self.sort_order,
        })
    }
}

/// Reads framed records back from one spilled run.
struct RunReader {
    reader: BufReader<File>,
}

impl RunReader {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .map_err(|_| BamError::UnexpectedEof("spilled record"))?;
        decode_record(&body, ValidationStringency::Strict).map(Some)
    }
}

struct HeapEntry {
    record: Record,
    run: usize,
    sort_order: SortOrder,
}

impl HeapEntry {
    fn key_cmp(&self, other: &Self) -> Ordering {
        match self.sort_order {
            SortOrder::QueryName => self.record.name.cmp(&other.record.name),
            _ => coordinate_key(&self.record).cmp(&coordinate_key(&other.record)),
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for smallest-first.
        self.key_cmp(other).reverse()
    }
}

/// Merges the spilled runs and the final in-memory batch.
struct SortedDrain {
    in_ram: std::iter::Peekable<std::vec::IntoIter<Record>>,
    sources: Vec<RunReader>,
    heap: BinaryHeap<HeapEntry>,
    sort_order: SortOrder,
}

impl SortedDrain {
    fn next_record(&mut self) -> Result<Option<Record>> {
        // Pick the smaller of the heap head and the in-memory head.
        let take_from_ram = match (self.heap.peek(), self.in_ram.peek()) {
            (None, None) => return Ok(None),
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(entry), Some(ram)) => {
                let cmp = match self.sort_order {
                    SortOrder::QueryName => ram.name.cmp(&entry.record.name),
                    _ => coordinate_key(ram).cmp(&coordinate_key(&entry.record)),
                };
                cmp != Ordering::Greater
            }
        };

        if take_from_ram {
            return Ok(self.in_ram.next());
        }

        let entry = self.heap.pop().expect("heap head checked above");
        if let Some(next) = self.sources[entry.run].next_record()? {
            self.heap.push(HeapEntry { record: next, run: entry.run, sort_order: self.sort_order });
        }
        Ok(Some(entry.record))
    }
}
