//! Crate-wide error type.
//!
//! Every failure surfaced by a reader, writer, or index operation is one of
//! the variants below.  Local recovery is limited to stringency-controlled
//! record validation (see `codec`); everything else propagates.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BamError>;

#[derive(Error, Debug)]
pub enum BamError {
    /// Underlying byte source failed.  Never retried internally.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Stream ended inside a structural unit (block header, record body,
    /// tag).  The reader is invalidated.
    #[error("Unexpected end of stream inside {0}")]
    UnexpectedEof(&'static str),

    /// BGZF block header or payload rejected: bad magic, implausible size,
    /// inflate failure, or CRC mismatch when verification is enabled.
    #[error("Corrupt BGZF block at compressed offset {offset}: {reason}")]
    CorruptBlock { offset: u64, reason: String },

    /// Record fields are inconsistent with each other or with the declared
    /// sizes.  Subject to the validation-stringency hook.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A writer or index builder received a record breaking the declared
    /// sort order.  Fatal.
    #[error("Record out of order: {0}")]
    OutOfOrder(String),

    /// The partitioned-index merger saw parts with inconsistent sequence
    /// dictionaries.  Fatal.
    #[error("Sequence dictionary mismatch: {0}")]
    DictionaryMismatch(String),

    /// Bad query interval, non-positive split size, or a bin outside the
    /// binning scheme.  Fatal to the call; the reader remains usable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An indexed query was requested on a reader that has no index.
    #[error("No index is available for this reader")]
    NotIndexable,

    /// Operation on a closed or finished reader/writer.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

impl BamError {
    pub(crate) fn corrupt_block(offset: u64, reason: impl Into<String>) -> Self {
        BamError::CorruptBlock { offset, reason: reason.into() }
    }
}
