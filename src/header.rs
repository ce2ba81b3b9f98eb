//! BAM header: magic, text header, and the binary sequence dictionary.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic      = "BAM\x01"
//!    4      4   l_text     (LE i32)
//!    8  l_text  text header (SAM header text, not null-terminated)
//!    *      4   n_ref      (LE i32)
//! then per reference:
//!    *      4   l_name     (LE i32, includes NUL)
//!    *  l_name  name, null-terminated
//!    *      4   l_ref      (LE i32)
//! ```
//!
//! The binary reference list is authoritative for record `ref_id` fields;
//! the text header's `@SQ` lines are carried verbatim but never parsed for
//! lookup.

use std::collections::HashMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BamError, Result};

pub const BAM_MAGIC: [u8; 4] = *b"BAM\x01";

// ── Sequence dictionary ──────────────────────────────────────────────────────

/// One named reference sequence with a known length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSequence {
    pub name: String,
    pub length: u32,
}

impl ReferenceSequence {
    pub fn new(name: impl Into<String>, length: u32) -> Self {
        Self { name: name.into(), length }
    }
}

/// Ordered list of reference sequences with name → index lookup.
///
/// Record `ref_id` fields index into this list.  Two dictionaries are
/// compatible for index merging only when they have the same sequences in
/// the same order.
#[derive(Debug, Clone, Default)]
pub struct SequenceDictionary {
    seqs: Vec<ReferenceSequence>,
    by_name: HashMap<String, usize>,
}

impl SequenceDictionary {
    pub fn new(seqs: Vec<ReferenceSequence>) -> Self {
        let by_name = seqs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self { seqs, by_name }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ReferenceSequence> {
        self.seqs.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceSequence> {
        self.seqs.iter()
    }

    /// Error with `DictionaryMismatch` when `other` differs in length,
    /// order, or sequence content.
    pub fn ensure_same_as(&self, other: &SequenceDictionary) -> Result<()> {
        if self.seqs.len() != other.seqs.len() {
            return Err(BamError::DictionaryMismatch(format!(
                "{} references vs {}",
                self.seqs.len(),
                other.seqs.len()
            )));
        }
        for (i, (a, b)) in self.seqs.iter().zip(other.seqs.iter()).enumerate() {
            if a != b {
                return Err(BamError::DictionaryMismatch(format!(
                    "reference {i}: {}:{} vs {}:{}",
                    a.name, a.length, b.name, b.length
                )));
            }
        }
        Ok(())
    }
}

impl PartialEq for SequenceDictionary {
    fn eq(&self, other: &Self) -> bool {
        self.seqs == other.seqs
    }
}

impl Eq for SequenceDictionary {}

// ── Sort order ───────────────────────────────────────────────────────────────

/// Declared record ordering, parsed from the text header's `@HD SO:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Unknown,
    Unsorted,
    QueryName,
    Coordinate,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Unknown => "unknown",
            SortOrder::Unsorted => "unsorted",
            SortOrder::QueryName => "queryname",
            SortOrder::Coordinate => "coordinate",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "unsorted" => SortOrder::Unsorted,
            "queryname" => SortOrder::QueryName,
            "coordinate" => SortOrder::Coordinate,
            _ => SortOrder::Unknown,
        }
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// The SAM text header, carried verbatim.
    pub text: String,
    pub dictionary: SequenceDictionary,
}

impl Header {
    pub fn new(text: impl Into<String>, dictionary: SequenceDictionary) -> Self {
        Self { text: text.into(), dictionary }
    }

    /// Build a minimal header declaring a sort order and `@SQ` lines
    /// matching the dictionary.
    pub fn with_sort_order(sort_order: SortOrder, dictionary: SequenceDictionary) -> Self {
        let mut text = format!("@HD\tVN:1.6\tSO:{}\n", sort_order.as_str());
        for seq in dictionary.iter() {
            text.push_str(&format!("@SQ\tSN:{}\tLN:{}\n", seq.name, seq.length));
        }
        Self { text, dictionary }
    }

    /// Sort order declared in the `@HD` line; `Unknown` when absent.
    pub fn sort_order(&self) -> SortOrder {
        for line in self.text.lines() {
            if !line.starts_with("@HD") {
                continue;
            }
            for field in line.split('\t') {
                if let Some(value) = field.strip_prefix("SO:") {
                    return SortOrder::from_str(value);
                }
            }
        }
        SortOrder::Unknown
    }

    /// Read the BGZF-decompressed header block: magic, text, dictionary.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Header> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| BamError::UnexpectedEof("BAM magic"))?;
        if magic != BAM_MAGIC {
            return Err(BamError::InvalidRecord(format!(
                "bad BAM magic {magic:02x?}, expected {BAM_MAGIC:02x?}"
            )));
        }

        let l_text = r.read_i32::<LittleEndian>()? as usize;
        let mut text = vec![0u8; l_text];
        r.read_exact(&mut text)
            .map_err(|_| BamError::UnexpectedEof("text header"))?;
        let text = String::from_utf8_lossy(&text).into_owned();

        let n_ref = r.read_i32::<LittleEndian>()? as usize;
        let mut seqs = Vec::with_capacity(n_ref);
        for _ in 0..n_ref {
            let l_name = r.read_i32::<LittleEndian>()? as usize;
            if l_name == 0 {
                return Err(BamError::InvalidRecord("empty reference name".into()));
            }
            let mut name = vec![0u8; l_name];
            r.read_exact(&mut name)
                .map_err(|_| BamError::UnexpectedEof("reference name"))?;
            if name.pop() != Some(0) {
                return Err(BamError::InvalidRecord("reference name not null-terminated".into()));
            }
            let name = String::from_utf8_lossy(&name).into_owned();
            let length = r.read_i32::<LittleEndian>()? as u32;
            seqs.push(ReferenceSequence::new(name, length));
        }

        Ok(Header::new(text, SequenceDictionary::new(seqs)))
    }

    /// Write the header block in the layout above.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&BAM_MAGIC)?;
        w.write_i32::<LittleEndian>(self.text.len() as i32)?;
        w.write_all(self.text.as_bytes())?;
        w.write_i32::<LittleEndian>(self.dictionary.len() as i32)?;
        for seq in self.dictionary.iter() {
            w.write_i32::<LittleEndian>(seq.name.len() as i32 + 1)?;
            w.write_all(seq.name.as_bytes())?;
            w.write_all(&[0])?;
            w.write_i32::<LittleEndian>(seq.length as i32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_ref_dictionary() -> SequenceDictionary {
        SequenceDictionary::new(vec![
            ReferenceSequence::new("chr1", 1000),
            ReferenceSequence::new("chr2", 1000),
        ])
    }

    #[test]
    fn test_header_round_trip() {
        let header = Header::with_sort_order(SortOrder::Coordinate, two_ref_dictionary());

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let decoded = Header::read_from(&mut &buf[..]).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(decoded.sort_order(), SortOrder::Coordinate);
        assert_eq!(decoded.dictionary.index_of("chr2"), Some(1));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = b"BAI\x01\x00\x00\x00\x00";
        assert!(Header::read_from(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_sort_order_defaults_to_unknown() {
        let header = Header::new("@CO\tno hd line\n", SequenceDictionary::default());
        assert_eq!(header.sort_order(), SortOrder::Unknown);
    }

    #[test]
    fn test_dictionary_mismatch_detection() {
        let a = two_ref_dictionary();
        let mut seqs: Vec<_> = a.iter().cloned().collect();
        seqs.swap(0, 1);
        let b = SequenceDictionary::new(seqs);
        assert!(a.ensure_same_as(&a.clone()).is_ok());
        assert!(matches!(a.ensure_same_as(&b), Err(BamError::DictionaryMismatch(_))));
    }
}
