//! BGZF layer — block-gzip framing and the virtual file pointer.
//!
//! A BGZF stream is a self-synchronising concatenation of gzip members, each
//! carrying a `BC` extra subfield that declares the member's total on-disk
//! size.  Because every block is independently inflatable, a 64-bit *virtual
//! position* — compressed block offset in the high 48 bits, uncompressed
//! offset within the block in the low 16 — addresses any byte of the
//! decompressed stream.  All random access in this crate is expressed in
//! that space.
//!
//! # On-disk block layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   gzip ID1      = 0x1f
//!    1      1   gzip ID2      = 0x8b
//!    2      1   CM            = 8 (deflate)
//!    3      1   FLG           = 4 (FEXTRA)
//!    4      4   MTIME         = 0
//!    8      1   XFL           = 0
//!    9      1   OS            = 0xff
//!   10      2   XLEN          (≥ 6)
//!   12      1   SI1           = 'B'
//!   13      1   SI2           = 'C'
//!   14      2   SLEN          = 2
//!   16      2   BSIZE         = total block size − 1
//!   18      *   deflate-compressed payload
//!    *      4   CRC32 of uncompressed payload
//!    *      4   ISIZE (uncompressed payload length)
//! ```
//!
//! A reader must tolerate additional extra subfields before or after `BC`;
//! `XLEN` covers them all.  The uncompressed payload of one block never
//! exceeds [`MAX_UNCOMPRESSED_SIZE`] bytes and the whole member never
//! exceeds [`MAX_BLOCK_SIZE`] bytes.
//!
//! # EOF marker
//!
//! A conforming stream ends with [`EOF_MARKER`] — a 28-byte empty-payload
//! block — exactly once.  Its absence means the stream was truncated.

mod reader;
mod writer;

pub use reader::{BgzfReader, PrefetchReader};
pub use writer::{AsyncBgzfWriter, BgzfWriter};

use std::fmt;
use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;

/// Maximum on-disk size of one block, header and footer included.
pub const MAX_BLOCK_SIZE: usize = 65536;
/// Maximum uncompressed payload of one block.
pub const MAX_UNCOMPRESSED_SIZE: usize = 65280;
/// Fixed gzip header length up to and including the `BC` subfield.
pub const BLOCK_HEADER_SIZE: usize = 18;
/// CRC32 + ISIZE.
pub const BLOCK_FOOTER_SIZE: usize = 8;
/// Smallest legal block: header + empty deflate payload + footer.
pub const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + 2 + BLOCK_FOOTER_SIZE;

/// The terminal empty block.  Written once by every writer; its absence at
/// the end of a stream marks truncation.
pub const EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00,
    0x42, 0x43, 0x02, 0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

// ── Virtual position ─────────────────────────────────────────────────────────

const INTRA_SHIFT: u32 = 16;
const INTRA_MASK: u64 = 0xffff;

/// A two-part pointer into a BGZF stream: 48-bit compressed block offset in
/// the high bits, 16-bit offset into the block's decompressed payload in the
/// low bits.  Ordering is lexicographic on (block address, intra offset),
/// which the packed representation gives for free.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualPosition(u64);

impl VirtualPosition {
    /// In-memory sentinel for "no position recorded".  Never written to
    /// disk; index serialisation maps it to zero (see `bai::io`).
    pub const UNSET: VirtualPosition = VirtualPosition(u64::MAX);

    /// Largest representable compressed block offset.
    pub const MAX_BLOCK_ADDRESS: u64 = (1 << 48) - 1;

    pub fn new(block_address: u64, intra_offset: u16) -> Self {
        debug_assert!(block_address <= Self::MAX_BLOCK_ADDRESS);
        VirtualPosition((block_address << INTRA_SHIFT) | u64::from(intra_offset))
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        VirtualPosition(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Byte offset of the compressed block in the underlying file.
    #[inline]
    pub fn block_address(self) -> u64 {
        self.0 >> INTRA_SHIFT
    }

    /// Byte offset into the decompressed payload of that block.
    #[inline]
    pub fn intra_offset(self) -> u16 {
        (self.0 & INTRA_MASK) as u16
    }

    #[inline]
    pub fn is_unset(self) -> bool {
        self.0 == u64::MAX
    }

    /// Shift the block address by `delta` compressed bytes, leaving the
    /// intra-block offset unchanged.  Used by the partitioned-index merger.
    /// The sentinel passes through untouched.
    pub fn shift(self, delta: u64) -> Self {
        if self.is_unset() {
            self
        } else {
            VirtualPosition(self.0 + (delta << INTRA_SHIFT))
        }
    }
}

impl fmt::Debug for VirtualPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            write!(f, "VirtualPosition(UNSET)")
        } else {
            write!(f, "VirtualPosition({}:{})", self.block_address(), self.intra_offset())
        }
    }
}

impl fmt::Display for VirtualPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_address(), self.intra_offset())
    }
}

// ── Chunk ────────────────────────────────────────────────────────────────────

/// A half-open interval `[start, end)` of virtual-position space — the unit
/// of "there are records here" annotation in every index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    start: VirtualPosition,
    end: VirtualPosition,
}

impl Chunk {
    pub fn new(start: VirtualPosition, end: VirtualPosition) -> Self {
        Chunk { start, end }
    }

    #[inline]
    pub fn start(self) -> VirtualPosition {
        self.start
    }

    #[inline]
    pub fn end(self) -> VirtualPosition {
        self.end
    }

    /// True when `other` begins inside this chunk's VP range.
    #[inline]
    pub fn overlaps(self, other: Chunk) -> bool {
        other.start < self.end && self.start < other.end
    }

    /// True when `other` starts in the compressed block this chunk ends in,
    /// or in the block that starts exactly where this chunk's last block
    /// ends.  Chunks in that relation are coalesced by index queries and
    /// builders: scanning them as one range costs no extra block reads.
    #[inline]
    pub fn is_adjacent_to(self, other: Chunk) -> bool {
        self.end.block_address() == other.start.block_address()
            || self.end == other.start
    }

    /// Shift both ends by `delta` compressed bytes.
    pub fn shift(self, delta: u64) -> Self {
        Chunk::new(self.start.shift(delta), self.end.shift(delta))
    }
}

impl Ord for Chunk {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start.cmp(&other.start).then(self.end.cmp(&other.end))
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({}..{})", self.start, self.end)
    }
}

/// Merge a start-sorted chunk list so that overlapping or block-adjacent
/// neighbours become one chunk.  Idempotent: running it on an already
/// coalesced list is a no-op.
pub fn coalesce_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut out: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match out.last_mut() {
            Some(last) if last.overlaps(chunk) || last.is_adjacent_to(chunk) => {
                if chunk.end > last.end {
                    last.end = chunk.end;
                }
            }
            _ => out.push(chunk),
        }
    }
    out
}

// ── Raw block decode ─────────────────────────────────────────────────────────

/// Parse the gzip header of one block from `header` (the first
/// [`BLOCK_HEADER_SIZE`] bytes of the member) and return
/// `(total_block_size, xlen)`.
///
/// Extra subfields other than `BC` are permitted; `BC` must be present with
/// `SLEN = 2`.  Any structural violation is `InvalidData` — the caller maps
/// it to `CorruptBlock` with the block's compressed offset attached.
pub(crate) fn parse_block_header(header: &[u8; BLOCK_HEADER_SIZE]) -> io::Result<(usize, usize)> {
    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad gzip magic {:#04x} {:#04x}", header[0], header[1]),
        ));
    }
    if header[2] != 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported compression method {}", header[2]),
        ));
    }
    if header[3] & 0x04 == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "FEXTRA flag not set; not a BGZF member",
        ));
    }

    let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
    if xlen < 6 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("XLEN {xlen} too small to carry the BC subfield"),
        ));
    }

    // Fast path: BC is the first (and usually only) subfield.
    if header[12] == b'B' && header[13] == b'C' {
        let slen = u16::from_le_bytes([header[14], header[15]]);
        if slen != 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("BC subfield SLEN {slen}, expected 2"),
            ));
        }
        let bsize = u16::from_le_bytes([header[16], header[17]]) as usize;
        let block_size = bsize + 1;
        if block_size < MIN_BLOCK_SIZE || block_size > MAX_BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("declared block size {block_size} outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]"),
            ));
        }
        return Ok((block_size, xlen));
    }

    // Slow path: BC sits after another subfield.  The caller reads the rest
    // of the extra area and calls `find_bc_subfield`.
    Ok((0, xlen))
}

/// Locate the `BC` subfield in a full extra-field area and return the total
/// block size.  Used only when `BC` is not the first subfield.
pub(crate) fn find_bc_subfield(extra: &[u8]) -> io::Result<usize> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let si1 = extra[pos];
        let si2 = extra[pos + 1];
        let slen = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        if si1 == b'B' && si2 == b'C' {
            if slen != 2 || pos + 6 > extra.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed BC subfield"));
            }
            let bsize = u16::from_le_bytes([extra[pos + 4], extra[pos + 5]]) as usize;
            let block_size = bsize + 1;
            if block_size < MIN_BLOCK_SIZE || block_size > MAX_BLOCK_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("declared block size {block_size} outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]"),
                ));
            }
            return Ok(block_size);
        }
        pos += 4 + slen;
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "no BC subfield in extra area"))
}

/// Inflate the member body of one block.
///
/// `body` is everything after the extra area: the deflate payload followed
/// by the 8-byte footer.  ISIZE is always checked against the inflated
/// length; the CRC32 only when `validate_crc` is set (the footer CRC costs
/// a second pass over the payload).
pub(crate) fn inflate_block(body: &[u8], validate_crc: bool) -> io::Result<Vec<u8>> {
    if body.len() < BLOCK_FOOTER_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "block body shorter than footer"));
    }
    let (cdata, footer) = body.split_at(body.len() - BLOCK_FOOTER_SIZE);

    let mut footer_rdr = footer;
    let expected_crc = footer_rdr.read_u32::<LittleEndian>()?;
    let isize = footer_rdr.read_u32::<LittleEndian>()? as usize;
    if isize > MAX_UNCOMPRESSED_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("ISIZE {isize} exceeds the {MAX_UNCOMPRESSED_SIZE}-byte payload limit"),
        ));
    }

    let mut data = Vec::with_capacity(isize);
    DeflateDecoder::new(cdata)
        .read_to_end(&mut data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("inflate failed: {e}")))?;

    if data.len() != isize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("inflated {} bytes but ISIZE declares {isize}", data.len()),
        ));
    }

    if validate_crc {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);
        let actual = hasher.finalize();
        if actual != expected_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload CRC32 mismatch: expected {expected_crc:#010x}, got {actual:#010x}"),
            ));
        }
    }

    Ok(data)
}
