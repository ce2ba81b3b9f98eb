//! BGZF output streams: synchronous block writer and the worker-backed
//! async variant.

use std::io::{self, Read, Write};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use flate2::read::DeflateEncoder;
use flate2::Compression;

use crate::error::{BamError, Result};

use super::{VirtualPosition, BLOCK_FOOTER_SIZE, BLOCK_HEADER_SIZE, EOF_MARKER, MAX_UNCOMPRESSED_SIZE};

/// Compressed blocks queued between the caller and the async writer's
/// worker thread.
const ASYNC_QUEUE_DEPTH: usize = 16;

/// Build one complete on-disk block from an uncompressed payload.
///
/// The payload must not exceed [`MAX_UNCOMPRESSED_SIZE`] bytes, which
/// guarantees the member fits the 16-bit BSIZE field at every deflate
/// level (an incompressible payload degrades to stored deflate blocks,
/// whose overhead is bounded).
pub(crate) fn compress_block(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    debug_assert!(data.len() <= MAX_UNCOMPRESSED_SIZE);

    let mut cdata = Vec::with_capacity(data.len() / 2 + 64);
    DeflateEncoder::new(data, Compression::new(level)).read_to_end(&mut cdata)?;

    let block_size = BLOCK_HEADER_SIZE + cdata.len() + BLOCK_FOOTER_SIZE;
    if block_size > super::MAX_BLOCK_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("compressed member {block_size} B exceeds the BGZF block limit"),
        ));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    let crc = hasher.finalize();

    let mut block = Vec::with_capacity(block_size);
    block.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04]); // magic, deflate, FEXTRA
    block.extend_from_slice(&[0x00; 4]); // MTIME
    block.extend_from_slice(&[0x00, 0xff]); // XFL, OS
    block.extend_from_slice(&6u16.to_le_bytes()); // XLEN
    block.extend_from_slice(&[b'B', b'C']);
    block.extend_from_slice(&2u16.to_le_bytes()); // SLEN
    block.extend_from_slice(&((block_size - 1) as u16).to_le_bytes()); // BSIZE
    block.extend_from_slice(&cdata);
    block.extend_from_slice(&crc.to_le_bytes());
    block.extend_from_slice(&(data.len() as u32).to_le_bytes());

    Ok(block)
}

// ── Synchronous writer ───────────────────────────────────────────────────────

/// Sequential compressed output stream.
///
/// Uncompressed bytes buffer up to [`MAX_UNCOMPRESSED_SIZE`]; each full
/// buffer becomes one independently inflatable block.  `flush` emits any
/// partial block; [`BgzfWriter::finish`] writes the terminal EOF marker
/// exactly once and returns the inner writer.
pub struct BgzfWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    /// Compressed bytes emitted so far — the block address of the next
    /// flushed block.
    block_address: u64,
    level: u32,
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W, level: u32) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(MAX_UNCOMPRESSED_SIZE),
            block_address: 0,
            level: level.min(9),
        }
    }

    /// Virtual position at which the next written byte will land.
    pub fn virtual_position(&self) -> VirtualPosition {
        VirtualPosition::new(self.block_address, self.buf.len() as u16)
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = compress_block(&self.buf, self.level)?;
        self.inner.write_all(&block)?;
        self.block_address += block.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush any partial block, write the EOF marker, and return the inner
    /// writer.  Calling `finish` twice is prevented by consuming `self`.
    pub fn finish(mut self) -> Result<W> {
        self.flush_block()?;
        self.inner.write_all(&EOF_MARKER)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    /// Flush and return the inner writer without a terminal EOF marker.
    /// For the files of a partitioned directory, where a single shared
    /// `terminator` file supplies the one EOF marker of the concatenation.
    pub fn finish_without_eof(mut self) -> Result<W> {
        self.flush_block()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let room = MAX_UNCOMPRESSED_SIZE - self.buf.len();
            let n = room.min(data.len() - written);
            self.buf.extend_from_slice(&data[written..written + n]);
            written += n;
            if self.buf.len() == MAX_UNCOMPRESSED_SIZE {
                self.flush_block()?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.inner.flush()
    }
}

// ── Async writer ─────────────────────────────────────────────────────────────

/// Worker-backed variant of [`BgzfWriter`].
///
/// Compression runs on the caller's thread so that virtual positions stay
/// exactly as cheap and exact as in the sync writer; finished compressed
/// blocks travel over a bounded queue to a dedicated thread that owns the
/// underlying writer.  `finish` drains the queue, writes the EOF marker,
/// and joins the worker, surfacing any deferred I/O error.
pub struct AsyncBgzfWriter<W: Write + Send + 'static> {
    tx: Option<Sender<Vec<u8>>>,
    handle: Option<JoinHandle<io::Result<W>>>,
    buf: Vec<u8>,
    block_address: u64,
    level: u32,
}

impl<W: Write + Send + 'static> AsyncBgzfWriter<W> {
    pub fn new(mut inner: W, level: u32) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(ASYNC_QUEUE_DEPTH);
        let handle = std::thread::spawn(move || -> io::Result<W> {
            for block in rx {
                inner.write_all(&block)?;
            }
            inner.flush()?;
            Ok(inner)
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
            buf: Vec::with_capacity(MAX_UNCOMPRESSED_SIZE),
            block_address: 0,
            level: level.min(9),
        }
    }

    pub fn virtual_position(&self) -> VirtualPosition {
        VirtualPosition::new(self.block_address, self.buf.len() as u16)
    }

    fn send(&mut self, block: Vec<u8>) -> Result<()> {
        let len = block.len() as u64;
        let tx = self.tx.as_ref().ok_or(BamError::InvalidState("writer already finished"))?;
        if tx.send(block).is_err() {
            // Worker died; join it to surface the underlying error.
            return Err(self.take_worker_error());
        }
        self.block_address += len;
        Ok(())
    }

    fn take_worker_error(&mut self) -> BamError {
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(Err(e))) => BamError::Io(e),
            _ => BamError::InvalidState("async writer worker terminated"),
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = compress_block(&self.buf, self.level)?;
        self.buf.clear();
        self.send(block)
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let room = MAX_UNCOMPRESSED_SIZE - self.buf.len();
            let n = room.min(data.len() - written);
            self.buf.extend_from_slice(&data[written..written + n]);
            written += n;
            if self.buf.len() == MAX_UNCOMPRESSED_SIZE {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_block()
    }

    /// Drain outstanding blocks, append the EOF marker, join the worker,
    /// and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.flush_block()?;
        self.send(EOF_MARKER.to_vec())?;
        self.join_worker()
    }

    /// Drain and join without a terminal EOF marker (partitioned parts).
    pub fn finish_without_eof(mut self) -> Result<W> {
        self.flush_block()?;
        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<W> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(h) => match h.join() {
                Ok(Ok(w)) => Ok(w),
                Ok(Err(e)) => Err(BamError::Io(e)),
                Err(_) => Err(BamError::InvalidState("async writer worker panicked")),
            },
            None => Err(BamError::InvalidState("writer already finished")),
        }
    }
}

impl<W: Write + Send + 'static> Drop for AsyncBgzfWriter<W> {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
