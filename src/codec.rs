//! Binary alignment-record codec.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   block_size   (size of everything after this field)
//!    4      4   ref_id       (−1 unmapped)
//!    8      4   pos          (zero-based, −1 unset)
//!   12      1   l_read_name  (includes NUL)
//!   13      1   mapq
//!   14      2   bin
//!   16      2   n_cigar_op
//!   18      2   flag
//!   20      4   l_seq
//!   24      4   next_ref_id
//!   28      4   next_pos
//!   32      4   tlen
//!   36      *   read_name, null-terminated
//!    *   4×n    cigar        (op_len << 4 | op_code)
//!    *  (l+1)/2 packed bases (two 4-bit codes per byte, high nibble first)
//!    *      l   qualities    (all 0xFF ⇒ absent)
//!    *      *   tag fields until end of block
//! ```
//!
//! # Long CIGARs
//!
//! `n_cigar_op` is 16-bit.  A CIGAR with more than 65,535 operators is
//! encoded as the two-operator sentinel `<readLen>S<refLen>N` with the real
//! CIGAR appended as a `CG:B,I` tag; both sentinel operand lengths are
//! checked against the 28-bit operator limit before the sentinel form is
//! chosen.  The decoder detects exactly that shape and restores the real
//! CIGAR, dropping the tag.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{BamError, Result};
use crate::record::{
    base_to_nibble, AuxField, AuxValue, Cigar, CigarOp, CigarOpKind, Flags, Record, Tag, CG,
    MAX_CIGAR_OP_LENGTH, MISSING_NAME, NIBBLE_TO_BASE,
};

/// Fixed-size portion of the record body (everything before `read_name`).
pub const MIN_RECORD_BODY: usize = 32;

/// How much to complain about records that violate the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationStringency {
    /// Abort on the first inconsistent record.
    #[default]
    Strict,
    /// Log a warning and keep going with a best-effort record.
    Lenient,
    /// Keep going without notice.
    Silent,
}

impl ValidationStringency {
    fn tolerate(self, what: &str) -> bool {
        match self {
            ValidationStringency::Strict => false,
            ValidationStringency::Lenient => {
                log::warn!("invalid record tolerated (lenient validation): {what}");
                true
            }
            ValidationStringency::Silent => true,
        }
    }
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Append one framed record (`block_size` + body) to `dst`.
pub fn write_record(dst: &mut Vec<u8>, rec: &Record) -> Result<()> {
    let name: &[u8] = if rec.name.is_empty() { MISSING_NAME } else { &rec.name };
    let l_read_name = name.len() + 1;
    if l_read_name > u8::MAX as usize {
        return Err(BamError::InvalidRecord(format!(
            "read name of {} bytes exceeds the 254-byte limit",
            name.len()
        )));
    }

    let l_seq = rec.seq.len();
    if !rec.quals.is_empty() && rec.quals.len() != l_seq {
        return Err(BamError::InvalidRecord(format!(
            "{} quality values for {l_seq} bases",
            rec.quals.len()
        )));
    }

    // Long-CIGAR handling: operand validation happens before the sentinel
    // form is chosen so an unencodable CIGAR fails with the real reason.
    let sentinel = if rec.cigar.len() > u16::MAX as usize {
        let read_len = rec.cigar.read_length();
        let ref_len = rec.cigar.reference_length();
        if read_len > MAX_CIGAR_OP_LENGTH || ref_len > MAX_CIGAR_OP_LENGTH {
            return Err(BamError::InvalidRecord(format!(
                "CIGAR spans (read {read_len}, reference {ref_len}) exceed the 28-bit operator limit"
            )));
        }
        if rec.tag(CG).is_some() {
            return Err(BamError::InvalidRecord(
                "record with an oversized CIGAR already carries a CG tag".into(),
            ));
        }
        Some([
            CigarOp::new(CigarOpKind::SoftClip, read_len),
            CigarOp::new(CigarOpKind::Skip, ref_len),
        ])
    } else {
        None
    };

    let n_cigar_op = match &sentinel {
        Some(ops) => ops.len(),
        None => rec.cigar.len(),
    };

    let tags_size: usize = rec.tags.iter().map(aux_encoded_size).sum();
    let cg_size = if sentinel.is_some() { 8 + 4 * rec.cigar.len() } else { 0 };

    let block_size =
        MIN_RECORD_BODY + l_read_name + 4 * n_cigar_op + (l_seq + 1) / 2 + l_seq + tags_size + cg_size;

    dst.reserve(4 + block_size);
    put_u32(dst, block_size as u32);
    put_i32(dst, rec.ref_id);
    put_i32(dst, rec.pos);
    dst.push(l_read_name as u8);
    dst.push(rec.mapq);
    put_u16(dst, rec.compute_bin());
    put_u16(dst, n_cigar_op as u16);
    put_u16(dst, rec.flags.0);
    put_u32(dst, l_seq as u32);
    put_i32(dst, rec.mate_ref_id);
    put_i32(dst, rec.mate_pos);
    put_i32(dst, rec.template_len);

    dst.extend_from_slice(name);
    dst.push(0);

    match &sentinel {
        Some(ops) => {
            for op in ops {
                put_u32(dst, op.encoded());
            }
        }
        None => {
            for op in rec.cigar.iter() {
                if op.len > MAX_CIGAR_OP_LENGTH {
                    return Err(BamError::InvalidRecord(format!(
                        "CIGAR operator length {} exceeds the 28-bit limit",
                        op.len
                    )));
                }
                put_u32(dst, op.encoded());
            }
        }
    }

    // Packed bases, high nibble first.
    let mut pairs = rec.seq.chunks_exact(2);
    for pair in &mut pairs {
        dst.push(base_to_nibble(pair[0]) << 4 | base_to_nibble(pair[1]));
    }
    if let [last] = pairs.remainder() {
        dst.push(base_to_nibble(*last) << 4);
    }

    if rec.quals.is_empty() {
        dst.resize(dst.len() + l_seq, 0xff);
    } else {
        dst.extend_from_slice(&rec.quals);
    }

    for field in &rec.tags {
        write_aux(dst, field);
    }

    if sentinel.is_some() {
        dst.extend_from_slice(&CG.0);
        dst.push(b'B');
        dst.push(b'I');
        put_u32(dst, rec.cigar.len() as u32);
        for op in rec.cigar.iter() {
            put_u32(dst, op.encoded());
        }
    }

    Ok(())
}

#[inline]
fn put_u16(dst: &mut Vec<u8>, v: u16) {
    dst.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u32(dst: &mut Vec<u8>, v: u32) {
    dst.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_i32(dst: &mut Vec<u8>, v: i32) {
    dst.extend_from_slice(&v.to_le_bytes());
}

fn aux_encoded_size(field: &AuxField) -> usize {
    3 + match &field.value {
        AuxValue::Char(_) | AuxValue::Int8(_) | AuxValue::UInt8(_) => 1,
        AuxValue::Int16(_) | AuxValue::UInt16(_) => 2,
        AuxValue::Int32(_) | AuxValue::UInt32(_) | AuxValue::Float(_) => 4,
        AuxValue::String(s) | AuxValue::Hex(s) => s.len() + 1,
        AuxValue::ArrayInt8(v) => 5 + v.len(),
        AuxValue::ArrayUInt8(v) => 5 + v.len(),
        AuxValue::ArrayInt16(v) => 5 + 2 * v.len(),
        AuxValue::ArrayUInt16(v) => 5 + 2 * v.len(),
        AuxValue::ArrayInt32(v) => 5 + 4 * v.len(),
        AuxValue::ArrayUInt32(v) => 5 + 4 * v.len(),
        AuxValue::ArrayFloat(v) => 5 + 4 * v.len(),
    }
}

fn write_aux(dst: &mut Vec<u8>, field: &AuxField) {
    dst.extend_from_slice(&field.tag.0);
    match &field.value {
        AuxValue::Char(c) => {
            dst.push(b'A');
            dst.push(*c);
        }
        AuxValue::Int8(v) => {
            dst.push(b'c');
            dst.push(*v as u8);
        }
        AuxValue::UInt8(v) => {
            dst.push(b'C');
            dst.push(*v);
        }
        AuxValue::Int16(v) => {
            dst.push(b's');
            dst.extend_from_slice(&v.to_le_bytes());
        }
        AuxValue::UInt16(v) => {
            dst.push(b'S');
            dst.extend_from_slice(&v.to_le_bytes());
        }
        AuxValue::Int32(v) => {
            dst.push(b'i');
            dst.extend_from_slice(&v.to_le_bytes());
        }
        AuxValue::UInt32(v) => {
            dst.push(b'I');
            dst.extend_from_slice(&v.to_le_bytes());
        }
        AuxValue::Float(v) => {
            dst.push(b'f');
            dst.extend_from_slice(&v.to_le_bytes());
        }
        AuxValue::String(s) => {
            dst.push(b'Z');
            dst.extend_from_slice(s);
            dst.push(0);
        }
        AuxValue::Hex(s) => {
            dst.push(b'H');
            dst.extend_from_slice(s);
            dst.push(0);
        }
        AuxValue::ArrayInt8(v) => {
            dst.push(b'B');
            dst.push(b'c');
            put_u32(dst, v.len() as u32);
            dst.extend(v.iter().map(|&x| x as u8));
        }
        AuxValue::ArrayUInt8(v) => {
            dst.push(b'B');
            dst.push(b'C');
            put_u32(dst, v.len() as u32);
            dst.extend_from_slice(v);
        }
        AuxValue::ArrayInt16(v) => {
            dst.push(b'B');
            dst.push(b's');
            put_u32(dst, v.len() as u32);
            for x in v {
                dst.extend_from_slice(&x.to_le_bytes());
            }
        }
        AuxValue::ArrayUInt16(v) => {
            dst.push(b'B');
            dst.push(b'S');
            put_u32(dst, v.len() as u32);
            for x in v {
                dst.extend_from_slice(&x.to_le_bytes());
            }
        }
        AuxValue::ArrayInt32(v) => {
            dst.push(b'B');
            dst.push(b'i');
            put_u32(dst, v.len() as u32);
            for x in v {
                dst.extend_from_slice(&x.to_le_bytes());
            }
        }
        AuxValue::ArrayUInt32(v) => {
            dst.push(b'B');
            dst.push(b'I');
            put_u32(dst, v.len() as u32);
            for x in v {
                dst.extend_from_slice(&x.to_le_bytes());
            }
        }
        AuxValue::ArrayFloat(v) => {
            dst.push(b'B');
            dst.push(b'f');
            put_u32(dst, v.len() as u32);
            for x in v {
                dst.extend_from_slice(&x.to_le_bytes());
            }
        }
    }
}

// ── Lazy view ────────────────────────────────────────────────────────────────

/// A record whose variable-length bytes are retained unparsed.
///
/// Fixed fields are read straight out of the buffer on demand; the
/// variable fields parse when asked for.  The view is immutable — any
/// mutation goes through [`RawRecord::decode`], which materialises a full
/// [`Record`].
#[derive(Debug, Clone)]
pub struct RawRecord {
    data: Vec<u8>,
}

impl RawRecord {
    /// Wrap one record body (without the `block_size` prefix).
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < MIN_RECORD_BODY {
            return Err(BamError::InvalidRecord(format!(
                "record body of {} bytes is below the {MIN_RECORD_BODY}-byte minimum",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn ref_id(&self) -> i32 {
        LittleEndian::read_i32(&self.data[0..4])
    }

    #[inline]
    pub fn pos(&self) -> i32 {
        LittleEndian::read_i32(&self.data[4..8])
    }

    #[inline]
    fn l_read_name(&self) -> usize {
        self.data[8] as usize
    }

    #[inline]
    pub fn mapq(&self) -> u8 {
        self.data[9]
    }

    #[inline]
    pub fn bin(&self) -> u16 {
        LittleEndian::read_u16(&self.data[10..12])
    }

    #[inline]
    pub fn n_cigar_ops(&self) -> usize {
        LittleEndian::read_u16(&self.data[12..14]) as usize
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags(LittleEndian::read_u16(&self.data[14..16]))
    }

    #[inline]
    pub fn read_len(&self) -> usize {
        LittleEndian::read_u32(&self.data[16..20]) as usize
    }

    #[inline]
    pub fn mate_ref_id(&self) -> i32 {
        LittleEndian::read_i32(&self.data[20..24])
    }

    #[inline]
    pub fn mate_pos(&self) -> i32 {
        LittleEndian::read_i32(&self.data[24..28])
    }

    #[inline]
    pub fn template_len(&self) -> i32 {
        LittleEndian::read_i32(&self.data[28..32])
    }

    /// Read name without the terminator, as stored.
    pub fn name(&self) -> &[u8] {
        let end = (MIN_RECORD_BODY + self.l_read_name()).min(self.data.len());
        let bytes = &self.data[MIN_RECORD_BODY..end];
        match bytes.split_last() {
            Some((0, rest)) => rest,
            _ => bytes,
        }
    }

    /// Materialise every field.
    pub fn decode(&self, stringency: ValidationStringency) -> Result<Record> {
        decode_record(&self.data, stringency)
    }
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Parse one record body (without the `block_size` prefix).
pub fn decode_record(body: &[u8], stringency: ValidationStringency) -> Result<Record> {
    if body.len() < MIN_RECORD_BODY {
        return Err(BamError::InvalidRecord(format!(
            "record body of {} bytes is below the {MIN_RECORD_BODY}-byte minimum",
            body.len()
        )));
    }

    let ref_id = LittleEndian::read_i32(&body[0..4]);
    let pos = LittleEndian::read_i32(&body[4..8]);
    let l_read_name = body[8] as usize;
    let mapq = body[9];
    let bin = LittleEndian::read_u16(&body[10..12]);
    let n_cigar_op = LittleEndian::read_u16(&body[12..14]) as usize;
    let flags = Flags(LittleEndian::read_u16(&body[14..16]));
    let l_seq = LittleEndian::read_u32(&body[16..20]) as usize;
    let mate_ref_id = LittleEndian::read_i32(&body[20..24]);
    let mate_pos = LittleEndian::read_i32(&body[24..28]);
    let template_len = LittleEndian::read_i32(&body[28..32]);

    let mut offset = MIN_RECORD_BODY;

    // Read name, declared length includes the terminator.
    if l_read_name == 0 || offset + l_read_name > body.len() {
        return Err(BamError::InvalidRecord("declared read-name length overruns the record".into()));
    }
    let name_bytes = &body[offset..offset + l_read_name];
    let name = if name_bytes[l_read_name - 1] != 0 {
        if !stringency.tolerate("read name is not null-terminated at the declared offset") {
            return Err(BamError::InvalidRecord(
                "read name is not null-terminated at the declared offset".into(),
            ));
        }
        name_bytes.to_vec()
    } else {
        name_bytes[..l_read_name - 1].to_vec()
    };
    offset += l_read_name;

    // CIGAR.
    if offset + 4 * n_cigar_op > body.len() {
        return Err(BamError::InvalidRecord("CIGAR overruns the record".into()));
    }
    let mut ops = Vec::with_capacity(n_cigar_op);
    for i in 0..n_cigar_op {
        let encoded = LittleEndian::read_u32(&body[offset + 4 * i..offset + 4 * i + 4]);
        ops.push(CigarOp::from_encoded(encoded)?);
    }
    offset += 4 * n_cigar_op;

    // Packed bases.
    let packed_len = (l_seq + 1) / 2;
    if offset + packed_len > body.len() {
        return Err(BamError::InvalidRecord("sequence overruns the record".into()));
    }
    let mut seq = Vec::with_capacity(l_seq);
    for i in 0..l_seq {
        let byte = body[offset + i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
        seq.push(NIBBLE_TO_BASE[nibble as usize]);
    }
    offset += packed_len;

    // Qualities: a run of 0xFF means absent.
    if offset + l_seq > body.len() {
        return Err(BamError::InvalidRecord("qualities overrun the record".into()));
    }
    let qual_bytes = &body[offset..offset + l_seq];
    let quals = if l_seq > 0 && qual_bytes.iter().all(|&q| q == 0xff) {
        Vec::new()
    } else {
        qual_bytes.to_vec()
    };
    offset += l_seq;

    // Tag fields until the end of the block.
    let mut tags = Vec::new();
    while offset < body.len() {
        let (field, consumed) = read_aux(&body[offset..])?;
        tags.push(field);
        offset += consumed;
    }

    let mut record = Record {
        ref_id,
        pos,
        mapq,
        flags,
        name,
        cigar: Cigar::new(ops),
        seq,
        quals,
        mate_ref_id,
        mate_pos,
        template_len,
        tags,
        bin: Some(bin),
    };

    restore_long_cigar(&mut record);
    Ok(record)
}

/// Detect the two-operator long-CIGAR sentinel (`<readLen>S<refLen>N` with
/// a `CG:B,I` tag) and restore the real CIGAR.
fn restore_long_cigar(record: &mut Record) {
    let ops = record.cigar.ops();
    if ops.len() != 2
        || ops[0].kind != CigarOpKind::SoftClip
        || ops[0].len as usize != record.seq.len()
        || ops[1].kind != CigarOpKind::Skip
    {
        return;
    }
    let encoded = match record.tag(CG) {
        Some(AuxValue::ArrayUInt32(v)) if !v.is_empty() => v.clone(),
        _ => return,
    };
    let mut ops = Vec::with_capacity(encoded.len());
    for v in encoded {
        match CigarOp::from_encoded(v) {
            Ok(op) => ops.push(op),
            Err(_) => return, // not a valid encoded CIGAR; leave the sentinel
        }
    }
    record.cigar = Cigar::new(ops);
    record.bin = None; // the sentinel bin no longer matches the real span
    record.remove_tag(CG);
}

fn read_aux(data: &[u8]) -> Result<(AuxField, usize)> {
    if data.len() < 3 {
        return Err(BamError::InvalidRecord("truncated tag field".into()));
    }
    let tag = Tag([data[0], data[1]]);
    let type_byte = data[2];
    let rest = &data[3..];

    let (value, value_len) = read_aux_value(type_byte, rest)?;
    Ok((AuxField::new(tag, value), 3 + value_len))
}

fn read_aux_value(type_byte: u8, data: &[u8]) -> Result<(AuxValue, usize)> {
    fn need(data: &[u8], n: usize) -> Result<()> {
        if data.len() < n {
            Err(BamError::InvalidRecord("tag value overruns the record".into()))
        } else {
            Ok(())
        }
    }

    match type_byte {
        b'A' => {
            need(data, 1)?;
            Ok((AuxValue::Char(data[0]), 1))
        }
        b'c' => {
            need(data, 1)?;
            Ok((AuxValue::Int8(data[0] as i8), 1))
        }
        b'C' => {
            need(data, 1)?;
            Ok((AuxValue::UInt8(data[0]), 1))
        }
        b's' => {
            need(data, 2)?;
            Ok((AuxValue::Int16(LittleEndian::read_i16(data)), 2))
        }
        b'S' => {
            need(data, 2)?;
            Ok((AuxValue::UInt16(LittleEndian::read_u16(data)), 2))
        }
        b'i' => {
            need(data, 4)?;
            Ok((AuxValue::Int32(LittleEndian::read_i32(data)), 4))
        }
        b'I' => {
            need(data, 4)?;
            Ok((AuxValue::UInt32(LittleEndian::read_u32(data)), 4))
        }
        b'f' => {
            need(data, 4)?;
            Ok((AuxValue::Float(LittleEndian::read_f32(data)), 4))
        }
        b'Z' | b'H' => {
            let nul = data
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| BamError::InvalidRecord("unterminated string tag".into()))?;
            let bytes = data[..nul].to_vec();
            let value = if type_byte == b'Z' { AuxValue::String(bytes) } else { AuxValue::Hex(bytes) };
            Ok((value, nul + 1))
        }
        b'B' => {
            need(data, 5)?;
            let subtype = data[0];
            let count = LittleEndian::read_u32(&data[1..5]) as usize;
            let elems = &data[5..];
            let elem_size = match subtype {
                b'c' | b'C' => 1,
                b's' | b'S' => 2,
                b'i' | b'I' | b'f' => 4,
                other => {
                    return Err(BamError::InvalidRecord(format!(
                        "unknown array element type {:?}",
                        other as char
                    )))
                }
            };
            need(elems, count * elem_size)?;
            let value = match subtype {
                b'c' => AuxValue::ArrayInt8(elems[..count].iter().map(|&b| b as i8).collect()),
                b'C' => AuxValue::ArrayUInt8(elems[..count].to_vec()),
                b's' => AuxValue::ArrayInt16(
                    (0..count).map(|i| LittleEndian::read_i16(&elems[2 * i..])).collect(),
                ),
                b'S' => AuxValue::ArrayUInt16(
                    (0..count).map(|i| LittleEndian::read_u16(&elems[2 * i..])).collect(),
                ),
                b'i' => AuxValue::ArrayInt32(
                    (0..count).map(|i| LittleEndian::read_i32(&elems[4 * i..])).collect(),
                ),
                b'I' => AuxValue::ArrayUInt32(
                    (0..count).map(|i| LittleEndian::read_u32(&elems[4 * i..])).collect(),
                ),
                b'f' => AuxValue::ArrayFloat(
                    (0..count).map(|i| LittleEndian::read_f32(&elems[4 * i..])).collect(),
                ),
                _ => unreachable!(),
            };
            Ok((value, 5 + count * elem_size))
        }
        other => Err(BamError::InvalidRecord(format!("unknown tag type {:?}", other as char))),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample_record() -> Record {
        Record {
            ref_id: 1,
            pos: 8,
            mapq: 13,
            flags: Flags(Flags::PAIRED | Flags::FIRST_OF_PAIR),
            name: b"r0".to_vec(),
            cigar: Cigar::new(vec![
                CigarOp::new(CigarOpKind::Match, 3),
                CigarOp::new(CigarOpKind::SoftClip, 1),
            ]),
            seq: b"ACGT".to_vec(),
            quals: vec![45, 35, 43, 50],
            mate_ref_id: 1,
            mate_pos: 21,
            template_len: 144,
            tags: vec![AuxField::new(Tag(*b"NH"), AuxValue::UInt8(1))],
            bin: None,
        }
    }

    fn round_trip(rec: &Record) -> Record {
        let mut buf = Vec::new();
        write_record(&mut buf, rec).unwrap();
        let block_size = LittleEndian::read_u32(&buf[0..4]) as usize;
        assert_eq!(block_size, buf.len() - 4);
        decode_record(&buf[4..], ValidationStringency::Strict).unwrap()
    }

    #[test]
    fn test_known_byte_layout() {
        let mut buf = Vec::new();
        write_record(&mut buf, &sample_record()).unwrap();

        let expected = [
            0x35, 0x00, 0x00, 0x00, // block_size = 53
            0x01, 0x00, 0x00, 0x00, // ref_id = 1
            0x08, 0x00, 0x00, 0x00, // pos = 8
            0x03, // l_read_name = 3
            0x0d, // mapq = 13
            0x49, 0x12, // bin = 4681
            0x02, 0x00, // n_cigar_op = 2
            0x41, 0x00, // flag = 0x41
            0x04, 0x00, 0x00, 0x00, // l_seq = 4
            0x01, 0x00, 0x00, 0x00, // next_ref_id = 1
            0x15, 0x00, 0x00, 0x00, // next_pos = 21
            0x90, 0x00, 0x00, 0x00, // tlen = 144
            b'r', b'0', 0x00, // read_name
            0x30, 0x00, 0x00, 0x00, // cigar[0] = 3M
            0x14, 0x00, 0x00, 0x00, // cigar[1] = 1S
            0x12, 0x48, // seq = ACGT
            0x2d, 0x23, 0x2b, 0x32, // qualities
            b'N', b'H', b'C', 0x01, // NH:C:1
        ];
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let rec = sample_record();
        let back = round_trip(&rec);
        assert_eq!(back.ref_id, rec.ref_id);
        assert_eq!(back.pos, rec.pos);
        assert_eq!(back.name, rec.name);
        assert_eq!(back.cigar, rec.cigar);
        assert_eq!(back.seq, rec.seq);
        assert_eq!(back.quals, rec.quals);
        assert_eq!(back.tags, rec.tags);
    }

    #[test]
    fn test_absent_qualities_round_trip() {
        let mut rec = sample_record();
        rec.quals = Vec::new();
        let back = round_trip(&rec);
        assert!(back.quals.is_empty());
        assert_eq!(back.seq, rec.seq);
    }

    #[test]
    fn test_single_large_operator_round_trips_exactly() {
        // One operator of 100,000 is fine: the operator count is 1, and
        // lengths are 28-bit.
        let mut rec = sample_record();
        rec.seq = vec![b'A'; 100_000];
        rec.quals = Vec::new();
        rec.cigar = Cigar::new(vec![CigarOp::new(CigarOpKind::Match, 100_000)]);
        let back = round_trip(&rec);
        assert_eq!(back.cigar, rec.cigar);
        assert!(back.tag(CG).is_none());
    }

    #[test]
    fn test_long_cigar_sentinel_round_trip() {
        const OP_COUNT: usize = 70_000;
        let mut rec = sample_record();
        rec.seq = vec![b'A'; OP_COUNT];
        rec.quals = Vec::new();
        rec.cigar = Cigar::new(vec![CigarOp::new(CigarOpKind::Match, 1); OP_COUNT]);

        let mut buf = Vec::new();
        write_record(&mut buf, &rec).unwrap();

        // The serialised form carries the two-operator sentinel.
        let n_cigar_op = LittleEndian::read_u16(&buf[4 + 12..4 + 14]);
        assert_eq!(n_cigar_op, 2);

        let back = decode_record(&buf[4..], ValidationStringency::Strict).unwrap();
        assert_eq!(back.cigar.len(), OP_COUNT);
        assert_eq!(back.cigar, rec.cigar);
        assert!(back.tag(CG).is_none());
    }

    #[test]
    fn test_unterminated_name_stringency() {
        let mut buf = Vec::new();
        write_record(&mut buf, &sample_record()).unwrap();
        let name_terminator = 4 + MIN_RECORD_BODY + 2;
        buf[name_terminator] = b'!';

        let body = &buf[4..];
        assert!(decode_record(body, ValidationStringency::Strict).is_err());
        let rec = decode_record(body, ValidationStringency::Silent).unwrap();
        assert_eq!(rec.name, b"r0!");
    }

    #[test]
    fn test_undersized_body_rejected() {
        let body = vec![0u8; MIN_RECORD_BODY - 1];
        assert!(decode_record(&body, ValidationStringency::Strict).is_err());
    }

    #[test]
    fn test_raw_record_lazy_accessors() {
        let mut buf = Vec::new();
        write_record(&mut buf, &sample_record()).unwrap();
        let raw = RawRecord::new(buf[4..].to_vec()).unwrap();
        assert_eq!(raw.ref_id(), 1);
        assert_eq!(raw.pos(), 8);
        assert_eq!(raw.mapq(), 13);
        assert_eq!(raw.name(), b"r0");
        assert_eq!(raw.n_cigar_ops(), 2);
        assert_eq!(raw.read_len(), 4);
        let rec = raw.decode(ValidationStringency::Strict).unwrap();
        assert_eq!(rec.template_len, 144);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            ref_id in -1i32..3,
            pos in -1i32..1_000_000,
            mapq in 0u8..255,
            flag_bits in 0u16..0x1000,
            name in "[A-Za-z0-9_.]{1,40}",
            seq_len in 0usize..300,
            with_quals in any::<bool>(),
            tlen in -10_000i32..10_000,
        ) {
            let seq: Vec<u8> = (0..seq_len).map(|i| b"ACGTN"[i % 5]).collect();
            let quals = if with_quals {
                (0..seq_len).map(|i| (i % 60) as u8).collect()
            } else {
                Vec::new()
            };
            let cigar = if seq_len > 0 {
                Cigar::new(vec![CigarOp::new(CigarOpKind::Match, seq_len as u32)])
            } else {
                Cigar::default()
            };
            let rec = Record {
                ref_id,
                pos,
                mapq,
                flags: Flags(flag_bits),
                name: name.into_bytes(),
                cigar,
                seq,
                quals,
                mate_ref_id: -1,
                mate_pos: -1,
                template_len: tlen,
                tags: vec![
                    AuxField::new(Tag(*b"XA"), AuxValue::Int16(-42)),
                    AuxField::new(Tag(*b"XB"), AuxValue::ArrayFloat(vec![1.5, -2.25])),
                    AuxField::new(Tag(*b"XZ"), AuxValue::String(b"prop".to_vec())),
                ],
                bin: None,
            };
            let back = round_trip(&rec);
            prop_assert_eq!(back.ref_id, rec.ref_id);
            prop_assert_eq!(back.pos, rec.pos);
            prop_assert_eq!(back.name, rec.name);
            prop_assert_eq!(back.seq, rec.seq);
            prop_assert_eq!(back.quals, rec.quals);
            prop_assert_eq!(back.tags, rec.tags);
        }
    }
}
