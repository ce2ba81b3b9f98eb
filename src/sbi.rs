//! SBI — the flat splitting/offset index.
//!
//! An SBI file records the virtual position of every *n*-th record of a
//! BAM stream (`n` = granularity) plus one trailing VP where the next
//! record would start (end of data).  Consumers use it to cut the file
//! into independently readable chunks of roughly equal compressed size.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic        = "SBI\x01"
//!    4      8   file_length  (compressed byte length of the data file)
//!   12     16   md5          (MD5 of the data file, or zeros)
//!   28     16   uuid         (or zeros)
//!   44      8   total_record_count
//!   52      8   granularity
//!   60      8   n_offsets
//!   68    8×n   virtual positions, strictly non-decreasing
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bgzf::{Chunk, VirtualPosition};
use crate::error::{BamError, Result};

pub const SBI_MAGIC: [u8; 4] = *b"SBI\x01";

/// Fresh random UUID for [`SbiHeader::uuid`], for builders that tag their
/// output instead of writing zeros.
pub fn generate_uuid() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbiHeader {
    /// Compressed byte length of the indexed data file.
    pub file_length: u64,
    /// MD5 of the data file; all zeros when not computed.
    pub md5: [u8; 16],
    /// UUID of the data file; all zeros when not assigned.
    pub uuid: [u8; 16],
    pub total_record_count: u64,
    pub granularity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbiIndex {
    pub header: SbiHeader,
    /// Every granularity-th record VP plus the trailing end-of-data VP.
    offsets: Vec<VirtualPosition>,
}

impl SbiIndex {
    pub fn offsets(&self) -> &[VirtualPosition] {
        &self.offsets
    }

    /// End-of-data VP: where the record after the last one would begin.
    pub fn end_of_data(&self) -> Option<VirtualPosition> {
        self.offsets.last().copied()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&SBI_MAGIC)?;
        w.write_u64::<LittleEndian>(self.header.file_length)?;
        w.write_all(&self.header.md5)?;
        w.write_all(&self.header.uuid)?;
        w.write_u64::<LittleEndian>(self.header.total_record_count)?;
        w.write_u64::<LittleEndian>(self.header.granularity)?;
        w.write_u64::<LittleEndian>(self.offsets.len() as u64)?;
        for vp in &self.offsets {
            w.write_u64::<LittleEndian>(vp.raw())?;
        }
        Ok(())
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<SbiIndex> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| BamError::UnexpectedEof("SBI magic"))?;
        if magic != SBI_MAGIC {
            return Err(BamError::InvalidArgument(format!(
                "bad SBI magic {magic:02x?}, expected {SBI_MAGIC:02x?}"
            )));
        }

        let file_length = r.read_u64::<LittleEndian>()?;
        let mut md5 = [0u8; 16];
        r.read_exact(&mut md5).map_err(|_| BamError::UnexpectedEof("SBI header"))?;
        let mut uuid = [0u8; 16];
        r.read_exact(&mut uuid).map_err(|_| BamError::UnexpectedEof("SBI header"))?;
        let total_record_count = r.read_u64::<LittleEndian>()?;
        let granularity = r.read_u64::<LittleEndian>()?;

        let n_offsets = r.read_u64::<LittleEndian>()? as usize;
        let mut offsets = Vec::with_capacity(n_offsets);
        let mut previous = VirtualPosition::default();
        for i in 0..n_offsets {
            let vp = VirtualPosition::from_raw(r.read_u64::<LittleEndian>()?);
            if vp < previous {
                return Err(BamError::InvalidArgument(format!(
                    "SBI offset {i} ({vp}) decreases below {previous}"
                )));
            }
            previous = vp;
            offsets.push(vp);
        }

        Ok(SbiIndex {
            header: SbiHeader { file_length, md5, uuid, total_record_count, granularity },
            offsets,
        })
    }

    pub fn read_from_path(path: impl AsRef<Path>) -> Result<SbiIndex> {
        Self::read_from(&mut BufReader::new(File::open(path)?))
    }

    /// Cut the data file into chunks of roughly `split_size` compressed
    /// bytes each.
    ///
    /// Walks the target compressed offsets `split_size, 2·split_size, …`
    /// and rounds each up to the next indexed VP; two targets rounding to
    /// the same VP merge into one chunk.  The returned chunks' block
    /// addresses partition `[0, file_length)` as evenly as the granularity
    /// allows, and their concatenation covers every record.
    pub fn split(&self, split_size: i64) -> Result<Vec<Chunk>> {
        if split_size <= 0 {
            return Err(BamError::InvalidArgument(format!(
                "split size must be positive, got {split_size}"
            )));
        }
        let split_size = split_size as u64;

        let (Some(&first), Some(&last)) = (self.offsets.first(), self.offsets.last()) else {
            return Ok(Vec::new());
        };

        let mut chunks = Vec::new();
        let mut start = first;
        let mut target = split_size;
        while target < self.header.file_length {
            let end = self.ceiling_offset(target);
            if end > start {
                chunks.push(Chunk::new(start, end));
                start = end;
            }
            target += split_size;
        }
        if last > start {
            chunks.push(Chunk::new(start, last));
        }
        Ok(chunks)
    }

    /// First indexed VP whose block address is at or past `compressed`;
    /// the end-of-data VP when none is.
    fn ceiling_offset(&self, compressed: u64) -> VirtualPosition {
        let idx = self
            .offsets
            .partition_point(|vp| vp.block_address() < compressed);
        self.offsets.get(idx).copied().unwrap_or_else(|| {
            *self.offsets.last().expect("split is never called on an empty sequence")
        })
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Observes record VPs while a file is scanned or written and keeps every
/// granularity-th one.
#[derive(Debug)]
pub struct SbiBuilder {
    granularity: u64,
    record_count: u64,
    offsets: Vec<VirtualPosition>,
    previous: VirtualPosition,
}

impl SbiBuilder {
    pub fn new(granularity: u64) -> Result<Self> {
        if granularity == 0 {
            return Err(BamError::InvalidArgument("granularity must be positive".into()));
        }
        Ok(Self {
            granularity,
            record_count: 0,
            offsets: Vec::new(),
            previous: VirtualPosition::default(),
        })
    }

    /// Observe the VP at which one record starts.  VPs must not decrease.
    pub fn record(&mut self, vp: VirtualPosition) -> Result<()> {
        if vp < self.previous {
            return Err(BamError::OutOfOrder(format!(
                "record VP {vp} decreases below {}",
                self.previous
            )));
        }
        self.previous = vp;
        if self.record_count % self.granularity == 0 {
            self.offsets.push(vp);
        }
        self.record_count += 1;
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Close the sequence with the end-of-data VP and assemble the index.
    /// `md5` and `uuid` default to zeros when not supplied.
    pub fn finish(
        mut self,
        end_of_data: VirtualPosition,
        file_length: u64,
        md5: Option<[u8; 16]>,
        uuid: Option<[u8; 16]>,
    ) -> Result<SbiIndex> {
        if end_of_data < self.previous {
            return Err(BamError::OutOfOrder(format!(
                "end-of-data VP {end_of_data} decreases below {}",
                self.previous
            )));
        }
        self.offsets.push(end_of_data);
        Ok(SbiIndex {
            header: SbiHeader {
                file_length,
                md5: md5.unwrap_or([0; 16]),
                uuid: uuid.unwrap_or([0; 16]),
                total_record_count: self.record_count,
                granularity: self.granularity,
            },
            offsets: self.offsets,
        })
    }
}
