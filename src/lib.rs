//! # bamrange — random-access BAM reading and streaming writing
//!
//! Format guarantees (frozen by the BAM/BGZF specifications):
//! - All numeric fields are little-endian; never negotiated
//! - Every BGZF member is independently inflatable and self-sizing via the
//!   `BC` extra subfield; random access is addressed by 64-bit virtual
//!   positions (48-bit block offset, 16-bit intra-block offset)
//! - A conforming stream ends with the 28-byte empty-block EOF marker
//!   exactly once; its absence means truncation and readers say so
//! - The binning index (`BAI\x01`) uses the six-level UCSC scheme with a
//!   16 KiB linear index; bin 37450 is the metadata pseudo-bin
//! - The splitting index (`SBI\x01`) is a flat granularity-based sequence
//!   of record virtual positions plus one end-of-data sentinel
//! - Record virtual positions strictly increase within a file; indexes
//!   and queries rely on it
//!
//! Reading is sequential or indexed: a `(reference, start, end)` query
//! resolves through the binning index to a minimal set of coalesced
//! chunks, and the iterator pipeline decodes and filters only those.  The
//! writer mirrors the read path and can keep a binning-index builder and
//! an MD5 sidecar in sync with the stream.  Partitioned output (a
//! directory of header, parts, and terminator) merges its per-part
//! indexes into one by offset-shifting chunks.

pub mod bai;
pub mod bgzf;
pub mod binning;
pub mod codec;
pub mod defaults;
pub mod error;
pub mod header;
pub mod indexing;
pub mod query;
pub mod reader;
pub mod record;
pub mod sbi;
pub mod writer;

// Flat re-exports for the most common types.
pub use bai::{BaiBuilder, BaiIndex, LazyBaiIndex};
pub use bgzf::{BgzfReader, BgzfWriter, Chunk, VirtualPosition};
pub use codec::{RawRecord, ValidationStringency};
pub use defaults::Defaults;
pub use error::{BamError, Result};
pub use header::{Header, ReferenceSequence, SequenceDictionary, SortOrder};
pub use indexing::{create_bai, create_bai_file, create_sbi, create_sbi_file};
pub use query::Interval;
pub use reader::{AlignmentSource, BamReader};
pub use record::{AuxField, AuxValue, Cigar, CigarOp, CigarOpKind, Flags, Record, Tag};
pub use sbi::{SbiBuilder, SbiIndex};
pub use writer::{BamWriter, WriterOptions};
