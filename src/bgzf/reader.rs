//! BGZF input streams: sequential, seekable, and a one-block-ahead
//! prefetcher for the async read path.

use std::io::{self, Read, Seek, SeekFrom};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};

use crate::error::{BamError, Result};

use super::{
    find_bc_subfield, inflate_block, parse_block_header, VirtualPosition, BLOCK_HEADER_SIZE,
    EOF_MARKER,
};

// ── Sequential / seekable reader ─────────────────────────────────────────────

/// Decompressed view of a BGZF stream.
///
/// Blocks are read on demand.  [`BgzfReader::virtual_position`] reports the
/// virtual position of the next byte that will be returned; recording it
/// before and after a structural unit gives that unit's chunk extent.
///
/// When `R: Seek`, [`BgzfReader::seek_virtual`] repositions the stream to an
/// arbitrary virtual position by seeking to the block address, inflating
/// that block, and skipping to the intra-block offset.
pub struct BgzfReader<R> {
    inner: R,
    /// Compressed bytes consumed from `inner` so far.
    position: u64,
    /// Compressed offset of the block currently buffered in `block`.
    block_address: u64,
    block: Vec<u8>,
    block_pos: usize,
    /// Underlying stream exhausted.
    at_eof: bool,
    /// The most recently parsed member was the 28-byte EOF marker.
    eof_marker_seen: bool,
    validate_crc: bool,
}

impl<R: Read> BgzfReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_crc_validation(inner, false)
    }

    /// Like [`BgzfReader::new`], but verifying each block's footer CRC32
    /// during decompression.  Expensive; off by default.
    pub fn with_crc_validation(inner: R, validate_crc: bool) -> Self {
        Self {
            inner,
            position: 0,
            block_address: 0,
            block: Vec::new(),
            block_pos: 0,
            at_eof: false,
            eof_marker_seen: false,
            validate_crc,
        }
    }

    /// Virtual position of the next decompressed byte.
    ///
    /// When the current block is fully consumed this still reports
    /// `(current block, block length)`; that position and `(next block, 0)`
    /// name the same stream byte and compare as adjacent, which is what
    /// chunk arithmetic expects.
    pub fn virtual_position(&self) -> VirtualPosition {
        VirtualPosition::new(self.block_address, self.block_pos as u16)
    }

    /// True once the terminal 28-byte empty block has been read.  A stream
    /// that reaches end-of-data without it was truncated.
    pub fn eof_marker_seen(&self) -> bool {
        self.eof_marker_seen
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Load the next block into the buffer.  Returns `false` on a clean end
    /// of the underlying stream (no bytes where a header would start).
    fn next_block(&mut self) -> Result<bool> {
        if self.at_eof {
            return Ok(false);
        }

        let start = self.position;

        let mut header = [0u8; BLOCK_HEADER_SIZE];
        let n = read_up_to(&mut self.inner, &mut header)?;
        if n == 0 {
            self.at_eof = true;
            return Ok(false);
        }
        if n < BLOCK_HEADER_SIZE {
            return Err(BamError::UnexpectedEof("BGZF block header"));
        }

        let (mut block_size, xlen) = parse_block_header(&header)
            .map_err(|e| BamError::corrupt_block(start, e.to_string()))?;

        // The fixed header covers the first 6 extra bytes; pull in the
        // rest of the extra area when more subfields follow.
        let mut trailing_extra = vec![0u8; xlen.saturating_sub(6)];
        if !trailing_extra.is_empty() {
            self.inner
                .read_exact(&mut trailing_extra)
                .map_err(|_| BamError::UnexpectedEof("BGZF extra subfields"))?;
        }

        // BC was not the leading subfield: search the whole extra area.
        if block_size == 0 {
            let mut extra = header[12..].to_vec();
            extra.extend_from_slice(&trailing_extra);
            block_size = find_bc_subfield(&extra)
                .map_err(|e| BamError::corrupt_block(start, e.to_string()))?;
        }

        let consumed = BLOCK_HEADER_SIZE + trailing_extra.len();
        let body_len = block_size
            .checked_sub(12 + xlen)
            .ok_or_else(|| BamError::corrupt_block(start, "declared size smaller than header"))?;

        let mut body = vec![0u8; body_len];
        self.inner
            .read_exact(&mut body)
            .map_err(|_| BamError::UnexpectedEof("BGZF block body"))?;

        let data = inflate_block(&body, self.validate_crc)
            .map_err(|e| BamError::corrupt_block(start, e.to_string()))?;

        debug_assert_eq!(consumed + body.len(), block_size);
        self.position = start + block_size as u64;
        self.block_address = start;
        self.block_pos = 0;
        self.eof_marker_seen = data.is_empty() && block_size == EOF_MARKER.len();
        self.block = data;
        Ok(true)
    }

    /// Bytes still buffered from the current block.
    fn remaining(&self) -> usize {
        self.block.len() - self.block_pos
    }

    /// Read as many bytes as are available, crossing block boundaries.
    /// Returns 0 only on a clean end of the decompressed stream.
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        while copied < buf.len() {
            if self.remaining() == 0 {
                if !self.next_block()? {
                    break;
                }
                continue; // skip empty members (flush artifacts, EOF marker)
            }
            let n = self.remaining().min(buf.len() - copied);
            buf[copied..copied + n]
                .copy_from_slice(&self.block[self.block_pos..self.block_pos + n]);
            self.block_pos += n;
            copied += n;
        }
        Ok(copied)
    }

    /// Read exactly `buf.len()` decompressed bytes.  End-of-data mid-buffer
    /// is `UnexpectedEof` — the caller was inside a structural unit.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read_available(buf)?;
        if n < buf.len() {
            return Err(BamError::UnexpectedEof("decompressed stream"));
        }
        Ok(())
    }

    /// Advance by exactly `n` decompressed bytes.
    pub fn skip_fully(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            if self.remaining() == 0 {
                if !self.next_block()? {
                    return Err(BamError::UnexpectedEof("decompressed stream"));
                }
                continue;
            }
            let step = self.remaining().min(n);
            self.block_pos += step;
            n -= step;
        }
        Ok(())
    }
}

impl<R: Read + Seek> BgzfReader<R> {
    /// Reposition to `vp`: seek to the block address, inflate that block,
    /// then skip to the within-block offset.
    pub fn seek_virtual(&mut self, vp: VirtualPosition) -> Result<()> {
        if vp.is_unset() {
            return Err(BamError::InvalidArgument("cannot seek to the unset sentinel".into()));
        }

        let address = vp.block_address();
        let intra = vp.intra_offset() as usize;

        if address == self.block_address && !self.block.is_empty() && intra <= self.block.len() {
            self.block_pos = intra;
            return Ok(());
        }

        self.inner.seek(SeekFrom::Start(address))?;
        self.position = address;
        self.at_eof = false;
        self.block.clear();
        self.block_pos = 0;
        self.block_address = address;

        if !self.next_block()? {
            return Err(BamError::UnexpectedEof("seek target block"));
        }
        if intra > self.block.len() {
            return Err(BamError::InvalidArgument(format!(
                "intra-block offset {intra} beyond block length {}",
                self.block.len()
            )));
        }
        self.block_pos = intra;
        Ok(())
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_available(buf).map_err(io_from_bam)
    }
}

fn io_from_bam(e: BamError) -> io::Error {
    match e {
        BamError::Io(e) => e,
        BamError::UnexpectedEof(_) => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Fill `buf` from `r` until full or EOF; short reads are retried.
fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Prefetching byte source ──────────────────────────────────────────────────

/// Read-ahead adapter for the async read path: a worker thread pulls
/// compressed chunks from the underlying source one block-sized unit ahead
/// of the consumer, handing them over a bounded queue.
///
/// Wrapping a [`BgzfReader`] around a `PrefetchReader` yields the async
/// sequential-read variant; its contract is identical to the sync form, and
/// dropping it drains the worker.
pub struct PrefetchReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

/// Compressed bytes fetched per worker read.  One maximum-size BGZF block.
const PREFETCH_CHUNK: usize = super::MAX_BLOCK_SIZE;

impl PrefetchReader {
    pub fn new<R: Read + Send + 'static>(mut inner: R) -> Self {
        // Capacity 1 keeps exactly one chunk in flight beyond the consumer.
        let (tx, rx) = bounded::<io::Result<Vec<u8>>>(1);
        let handle = std::thread::spawn(move || loop {
            let mut buf = vec![0u8; PREFETCH_CHUNK];
            match read_up_to(&mut inner, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send(Ok(buf)).is_err() {
                        break; // consumer dropped
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        });
        Self { rx, handle: Some(handle), current: Vec::new(), pos: 0, done: false }
    }
}

impl Read for PrefetchReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.current.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for PrefetchReader {
    fn drop(&mut self) {
        // Disconnect the queue so the worker's next send fails, then join.
        let (_tx, rx) = bounded(0);
        self.rx = rx;
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
