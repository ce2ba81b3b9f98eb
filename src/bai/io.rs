//! Binning-index file I/O.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! magic   "BAI\x01"
//! n_ref   i32
//! per reference:
//!   n_bin   i32
//!   per bin:
//!     bin      u32
//!     n_chunk  i32
//!     n_chunk × (vp_start u64, vp_end u64)
//!   n_intv  i32
//!   n_intv × u64 linear-index entry
//! n_no_coor  u64 (optional, at EOF)
//! ```
//!
//! Bin 37450 is the metadata pseudo-bin: exactly two chunks, the first
//! holding (first record VP, last record VP) and the second the aligned and
//! unaligned record counts packed as if they were VPs.
//!
//! The in-memory linear-index sentinel [`VirtualPosition::UNSET`] has no
//! on-disk form: unset entries are written as zero and zero entries load as
//! the sentinel.  A real record can never start at VP zero because the
//! header block precedes all records.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bgzf::{Chunk, VirtualPosition};
use crate::binning::PSEUDO_BIN;
use crate::error::{BamError, Result};

use super::{query_reference, BaiIndex, Metadata, ReferenceIndex};

pub const BAI_MAGIC: [u8; 4] = *b"BAI\x01";

// ── Write ────────────────────────────────────────────────────────────────────

impl BaiIndex {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&BAI_MAGIC)?;
        w.write_i32::<LittleEndian>(self.references.len() as i32)?;

        for reference in &self.references {
            let n_bin = reference.bins.len() + usize::from(reference.metadata.is_some());
            w.write_i32::<LittleEndian>(n_bin as i32)?;

            for (&bin, chunks) in &reference.bins {
                w.write_u32::<LittleEndian>(bin)?;
                w.write_i32::<LittleEndian>(chunks.len() as i32)?;
                for chunk in chunks {
                    w.write_u64::<LittleEndian>(chunk.start().raw())?;
                    w.write_u64::<LittleEndian>(chunk.end().raw())?;
                }
            }

            if let Some(meta) = &reference.metadata {
                w.write_u32::<LittleEndian>(PSEUDO_BIN)?;
                w.write_i32::<LittleEndian>(2)?;
                w.write_u64::<LittleEndian>(if meta.first.is_unset() { 0 } else { meta.first.raw() })?;
                w.write_u64::<LittleEndian>(meta.last.raw())?;
                w.write_u64::<LittleEndian>(meta.aligned_count)?;
                w.write_u64::<LittleEndian>(meta.unaligned_count)?;
            }

            w.write_i32::<LittleEndian>(reference.linear.len() as i32)?;
            for vp in &reference.linear {
                w.write_u64::<LittleEndian>(if vp.is_unset() { 0 } else { vp.raw() })?;
            }
        }

        if let Some(count) = self.no_coordinate_count {
            w.write_u64::<LittleEndian>(count)?;
        }
        Ok(())
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }
}

// ── Fully cached loader ──────────────────────────────────────────────────────

impl BaiIndex {
    /// Materialise every per-reference structure up front.
    pub fn read_from<R: Read>(r: &mut R) -> Result<BaiIndex> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| BamError::UnexpectedEof("BAI magic"))?;
        if magic != BAI_MAGIC {
            return Err(BamError::InvalidArgument(format!(
                "bad BAI magic {magic:02x?}, expected {BAI_MAGIC:02x?}"
            )));
        }

        let n_ref = r.read_i32::<LittleEndian>()?;
        if n_ref < 0 {
            return Err(BamError::InvalidArgument(format!("negative reference count {n_ref}")));
        }

        let mut references = Vec::with_capacity(n_ref as usize);
        for _ in 0..n_ref {
            references.push(read_reference(r)?);
        }

        // Optional trailing count of unplaced unmapped records.
        let no_coordinate_count = match r.read_u64::<LittleEndian>() {
            Ok(count) => Some(count),
            Err(_) => None,
        };

        Ok(BaiIndex { references, no_coordinate_count })
    }

    pub fn read_from_path(path: impl AsRef<Path>) -> Result<BaiIndex> {
        Self::read_from(&mut BufReader::new(File::open(path)?))
    }
}

fn read_reference<R: Read>(r: &mut R) -> Result<ReferenceIndex> {
    let n_bin = r.read_i32::<LittleEndian>()?;
    let mut bins = BTreeMap::new();
    let mut metadata = None;

    for _ in 0..n_bin {
        let bin = r.read_u32::<LittleEndian>()?;
        let n_chunk = r.read_i32::<LittleEndian>()?;

        if bin == PSEUDO_BIN {
            if n_chunk != 2 {
                return Err(BamError::InvalidArgument(format!(
                    "metadata pseudo-bin with {n_chunk} chunks, expected 2"
                )));
            }
            let first = r.read_u64::<LittleEndian>()?;
            let last = r.read_u64::<LittleEndian>()?;
            let aligned = r.read_u64::<LittleEndian>()?;
            let unaligned = r.read_u64::<LittleEndian>()?;
            metadata = Some(Metadata {
                first: if first == 0 {
                    VirtualPosition::UNSET
                } else {
                    VirtualPosition::from_raw(first)
                },
                last: VirtualPosition::from_raw(last),
                aligned_count: aligned,
                unaligned_count: unaligned,
            });
            continue;
        }

        let mut chunks = Vec::with_capacity(n_chunk.max(0) as usize);
        for _ in 0..n_chunk {
            let start = r.read_u64::<LittleEndian>()?;
            let end = r.read_u64::<LittleEndian>()?;
            chunks.push(Chunk::new(
                VirtualPosition::from_raw(start),
                VirtualPosition::from_raw(end),
            ));
        }
        bins.insert(bin, chunks);
    }

    let n_intv = r.read_i32::<LittleEndian>()?;
    let mut linear = Vec::with_capacity(n_intv.max(0) as usize);
    for _ in 0..n_intv {
        let raw = r.read_u64::<LittleEndian>()?;
        linear.push(if raw == 0 {
            VirtualPosition::UNSET
        } else {
            VirtualPosition::from_raw(raw)
        });
    }

    Ok(ReferenceIndex { bins, linear, metadata })
}

// ── Lazy loader ──────────────────────────────────────────────────────────────

/// Index loader that keeps the file bytes and parses one reference's
/// content on first use.
///
/// Behaviourally indistinguishable from [`BaiIndex::read_from`]; it trades
/// per-query latency for not materialising untouched references.  The open
/// pass walks the structure once to record each reference's byte span
/// without building chunk lists.
pub struct LazyBaiIndex {
    data: Vec<u8>,
    /// Byte range of each reference's content within `data`.
    ref_spans: Vec<std::ops::Range<usize>>,
    no_coordinate_count: Option<u64>,
    cache: std::cell::RefCell<Vec<Option<ReferenceIndex>>>,
}

impl LazyBaiIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < 8 || data[0..4] != BAI_MAGIC {
            return Err(BamError::InvalidArgument("not a BAI index".into()));
        }
        let n_ref = LittleEndian::read_i32(&data[4..8]);
        if n_ref < 0 {
            return Err(BamError::InvalidArgument(format!("negative reference count {n_ref}")));
        }

        let mut ref_spans = Vec::with_capacity(n_ref as usize);
        let mut pos = 8usize;
        for _ in 0..n_ref {
            let start = pos;
            pos = skip_reference(&data, pos)?;
            ref_spans.push(start..pos);
        }

        let no_coordinate_count = if data.len() - pos >= 8 {
            Some(LittleEndian::read_u64(&data[pos..pos + 8]))
        } else {
            None
        };

        let cache = std::cell::RefCell::new(vec![None; ref_spans.len()]);
        Ok(Self { data, ref_spans, no_coordinate_count, cache })
    }

    pub fn reference_count(&self) -> usize {
        self.ref_spans.len()
    }

    pub fn no_coordinate_count(&self) -> Option<u64> {
        self.no_coordinate_count
    }

    fn ensure_loaded(&self, ref_id: usize) -> Result<()> {
        let mut cache = self.cache.borrow_mut();
        if cache[ref_id].is_none() {
            let span = self.ref_spans[ref_id].clone();
            let mut slice = &self.data[span];
            cache[ref_id] = Some(read_reference(&mut slice)?);
        }
        Ok(())
    }

    /// Same contract as [`BaiIndex::query`].
    pub fn query(&self, ref_id: usize, start: u32, end: u32) -> Result<Vec<Chunk>> {
        if ref_id >= self.ref_spans.len() {
            return Err(BamError::InvalidArgument(format!(
                "reference {ref_id} outside the index ({} references)",
                self.ref_spans.len()
            )));
        }
        if start >= end || start >= crate::binning::MAX_POSITION {
            return Err(BamError::InvalidArgument(format!("empty query interval {start}..{end}")));
        }
        self.ensure_loaded(ref_id)?;
        let cache = self.cache.borrow();
        let reference = cache[ref_id].as_ref().unwrap();
        Ok(query_reference(reference, start, end))
    }

    /// Parse everything, producing the fully cached form.
    pub fn materialize(&self) -> Result<BaiIndex> {
        let mut references = Vec::with_capacity(self.ref_spans.len());
        for span in &self.ref_spans {
            let mut slice = &self.data[span.clone()];
            references.push(read_reference(&mut slice)?);
        }
        Ok(BaiIndex { references, no_coordinate_count: self.no_coordinate_count })
    }
}

/// Advance past one reference's content without materialising it.
fn skip_reference(data: &[u8], mut pos: usize) -> Result<usize> {
    fn need(data: &[u8], pos: usize, n: usize) -> Result<()> {
        if pos + n > data.len() {
            Err(BamError::UnexpectedEof("BAI reference content"))
        } else {
            Ok(())
        }
    }

    need(data, pos, 4)?;
    let n_bin = LittleEndian::read_i32(&data[pos..pos + 4]);
    pos += 4;
    for _ in 0..n_bin {
        need(data, pos, 8)?;
        let n_chunk = LittleEndian::read_i32(&data[pos + 4..pos + 8]) as usize;
        pos += 8;
        need(data, pos, 16 * n_chunk)?;
        pos += 16 * n_chunk;
    }
    need(data, pos, 4)?;
    let n_intv = LittleEndian::read_i32(&data[pos..pos + 4]) as usize;
    pos += 4;
    need(data, pos, 8 * n_intv)?;
    Ok(pos + 8 * n_intv)
}
