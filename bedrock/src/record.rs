//! The physical record format shared by every index.
//!
//! ```text
//! +------+----------+------------+-----------------+-------------+---------------+------+
//! | info | n_fields | creator_id | version_pointer | null bitmap | field ends    | data |
//! | u8   | u16 LE   | u64 LE     | u64 LE          | ceil(n/8)   | n * u16 LE    |      |
//! +------+----------+------------+-----------------+-------------+---------------+------+
//! ```
//!
//! Field end offsets are relative to the start of the data area. Bit `0x4000`
//! of an end offset marks an externally stored field whose data is a
//! [`BlobRef`]. A version pointer of zero means "no prior version", any other
//! value is the arena id plus one.

use std::cmp::Ordering;

use bytes::{BufMut, Bytes, BytesMut};

use crate::undo::VersionId;
use crate::{BedrockError, Result, TransactionId};

pub const DELETE_MARK: u8 = 0x20;

const HEADER_LEN: usize = 1 + 2 + 8 + 8;
const EXTERN_FLAG: u16 = 0x4000;
const OFFSET_MASK: u16 = 0x3FFF;

pub const MAX_DATA_LEN: usize = OFFSET_MASK as usize;
pub const BLOB_REF_LEN: usize = 12;

/// Reference to a value kept in the overflow store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub id: u64,
    pub len: u32,
}

impl BlobRef {
    pub fn encode(&self) -> [u8; BLOB_REF_LEN] {
        let mut out = [0u8; BLOB_REF_LEN];
        out[..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOB_REF_LEN {
            return Err(BedrockError::MalformedRecord(format!(
                "overflow reference is {} bytes, expected {BLOB_REF_LEN}",
                bytes.len()
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[8..]);
        Ok(Self {
            id: u64::from_le_bytes(id),
            len: u32::from_le_bytes(len),
        })
    }
}

/// An owned field value used when building records and search tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Null,
    Value(Vec<u8>),
    External(BlobRef),
}

impl Field {
    pub fn int(value: i64, len: usize) -> Self {
        Field::Value(encode_int(value, len))
    }

    pub fn uint(value: u64, len: usize) -> Self {
        Field::Value(encode_uint(value, len))
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Field::Value(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    pub fn as_field_ref(&self) -> FieldRef<'_> {
        match self {
            Field::Null => FieldRef::Null,
            Field::Value(v) => FieldRef::Inline(v),
            Field::External(r) => FieldRef::External(*r),
        }
    }
}

/// Stores a signed integer so that bytewise order equals numeric order:
/// big-endian two's complement with the sign bit flipped.
pub fn encode_int(value: i64, len: usize) -> Vec<u8> {
    let len = len.clamp(1, 8);
    let mut out = value.to_be_bytes()[8 - len..].to_vec();
    out[0] ^= 0x80;
    out
}

pub fn decode_int(stored: &[u8]) -> i64 {
    if stored.is_empty() {
        return 0;
    }
    let len = stored.len().clamp(1, 8);
    let first = stored.first().copied().unwrap_or(0x80) ^ 0x80;
    let fill = if first & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; 8];
    buf[8 - len..].copy_from_slice(&stored[stored.len() - len..]);
    buf[8 - len] = first;
    i64::from_be_bytes(buf)
}

pub fn encode_uint(value: u64, len: usize) -> Vec<u8> {
    let len = len.clamp(1, 8);
    value.to_be_bytes()[8 - len..].to_vec()
}

pub fn decode_uint(stored: &[u8]) -> u64 {
    if stored.is_empty() {
        return 0;
    }
    let len = stored.len().clamp(1, 8);
    let mut buf = [0u8; 8];
    buf[8 - len..].copy_from_slice(&stored[stored.len() - len..]);
    u64::from_be_bytes(buf)
}

/// System attributes written into every record header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordMeta {
    pub creator_id: TransactionId,
    pub version_pointer: Option<VersionId>,
    pub delete_marked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub info_bits: u8,
    pub n_fields: u16,
    pub creator_id: TransactionId,
    pub version_pointer: Option<VersionId>,
}

impl RecordHeader {
    pub fn is_delete_marked(&self) -> bool {
        self.info_bits & DELETE_MARK != 0
    }

    fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(BedrockError::MalformedRecord(format!(
                "record of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let n_fields = u16::from_le_bytes([bytes[1], bytes[2]]);
        let mut creator = [0u8; 8];
        creator.copy_from_slice(&bytes[3..11]);
        let mut pointer = [0u8; 8];
        pointer.copy_from_slice(&bytes[11..19]);
        let pointer = u64::from_le_bytes(pointer);
        Ok(Self {
            info_bits: bytes[0],
            n_fields,
            creator_id: u64::from_le_bytes(creator),
            version_pointer: pointer.checked_sub(1),
        })
    }
}

/// Reads only the fixed header of a record.
pub fn peek_header(bytes: &[u8]) -> Result<RecordHeader> {
    RecordHeader::read(bytes)
}

pub fn encode_record(fields: &[Field], meta: RecordMeta) -> Result<Bytes> {
    let n_fields = u16::try_from(fields.len())
        .map_err(|_| BedrockError::MalformedRecord("too many fields".to_string()))?;
    let null_bytes = fields.len().div_ceil(8);

    let mut data_len = 0usize;
    let mut ends = Vec::with_capacity(fields.len());
    let mut nulls = vec![0u8; null_bytes];
    for (i, field) in fields.iter().enumerate() {
        let mut flags = 0u16;
        match field {
            Field::Null => nulls[i / 8] |= 1 << (i % 8),
            Field::Value(v) => data_len += v.len(),
            Field::External(_) => {
                data_len += BLOB_REF_LEN;
                flags = EXTERN_FLAG;
            }
        }
        if data_len > MAX_DATA_LEN {
            return Err(BedrockError::MalformedRecord(format!(
                "record data exceeds {MAX_DATA_LEN} bytes"
            )));
        }
        ends.push(data_len as u16 | flags);
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + null_bytes + 2 * fields.len() + data_len);
    let info = if meta.delete_marked { DELETE_MARK } else { 0 };
    buf.put_u8(info);
    buf.put_u16_le(n_fields);
    buf.put_u64_le(meta.creator_id);
    buf.put_u64_le(meta.version_pointer.map_or(0, |id| id + 1));
    buf.put_slice(&nulls);
    for end in &ends {
        buf.put_u16_le(*end);
    }
    for field in fields {
        match field {
            Field::Null => {}
            Field::Value(v) => buf.put_slice(v),
            Field::External(r) => buf.put_slice(&r.encode()),
        }
    }
    Ok(buf.freeze())
}

/// Returns a copy of `bytes` with the delete mark set or cleared and the
/// system attributes replaced.
pub fn restamp(bytes: &[u8], meta: RecordMeta) -> Result<Bytes> {
    RecordHeader::read(bytes)?;
    let mut buf = BytesMut::from(bytes);
    buf[0] = if meta.delete_marked {
        buf[0] | DELETE_MARK
    } else {
        buf[0] & !DELETE_MARK
    };
    buf[3..11].copy_from_slice(&meta.creator_id.to_le_bytes());
    buf[11..19].copy_from_slice(&meta.version_pointer.map_or(0, |id| id + 1).to_le_bytes());
    Ok(buf.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Null,
    Inline(&'a [u8]),
    External(BlobRef),
}

impl<'a> FieldRef<'a> {
    pub fn to_field(&self) -> Field {
        match self {
            FieldRef::Null => Field::Null,
            FieldRef::Inline(v) => Field::Value(v.to_vec()),
            FieldRef::External(r) => Field::External(*r),
        }
    }
}

/// Key comparison of two fields: NULL sorts first, inline values compare
/// bytewise. Externally stored values are never part of a key; they sort
/// after inline values by length so the order stays total.
pub fn compare_fields(a: FieldRef<'_>, b: FieldRef<'_>) -> Ordering {
    match (a, b) {
        (FieldRef::Null, FieldRef::Null) => Ordering::Equal,
        (FieldRef::Null, _) => Ordering::Less,
        (_, FieldRef::Null) => Ordering::Greater,
        (FieldRef::Inline(x), FieldRef::Inline(y)) => x.cmp(y),
        (FieldRef::Inline(_), FieldRef::External(_)) => Ordering::Less,
        (FieldRef::External(_), FieldRef::Inline(_)) => Ordering::Greater,
        (FieldRef::External(x), FieldRef::External(y)) => x.len.cmp(&y.len),
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSlot {
    start: usize,
    end: usize,
    null: bool,
    external: bool,
}

/// A bounds-checked view of one record. Field offsets are computed once at
/// parse time; every accessor afterwards is a slice lookup.
#[derive(Debug, Clone)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
    header: RecordHeader,
    slots: Vec<FieldSlot>,
}

impl<'a> RecordView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = RecordHeader::read(bytes)?;
        let n = header.n_fields as usize;
        let null_bytes = n.div_ceil(8);
        let data_start = HEADER_LEN + null_bytes + 2 * n;
        if bytes.len() < data_start {
            return Err(BedrockError::MalformedRecord(format!(
                "record of {} bytes cannot hold {n} field offsets",
                bytes.len()
            )));
        }
        let data_len = bytes.len() - data_start;
        let nulls = &bytes[HEADER_LEN..HEADER_LEN + null_bytes];
        let ends = &bytes[HEADER_LEN + null_bytes..data_start];

        let mut slots = Vec::with_capacity(n);
        let mut prev = 0usize;
        for i in 0..n {
            let raw = u16::from_le_bytes([ends[2 * i], ends[2 * i + 1]]);
            let end = (raw & OFFSET_MASK) as usize;
            let null = nulls[i / 8] & (1 << (i % 8)) != 0;
            let external = raw & EXTERN_FLAG != 0;
            if end < prev || end > data_len {
                return Err(BedrockError::MalformedRecord(format!(
                    "field {i} ends at {end}, outside {prev}..={data_len}"
                )));
            }
            if null && end != prev {
                return Err(BedrockError::MalformedRecord(format!(
                    "null field {i} has {} bytes of data",
                    end - prev
                )));
            }
            if external && end - prev != BLOB_REF_LEN {
                return Err(BedrockError::MalformedRecord(format!(
                    "external field {i} is {} bytes",
                    end - prev
                )));
            }
            slots.push(FieldSlot {
                start: data_start + prev,
                end: data_start + end,
                null,
                external,
            });
            prev = end;
        }
        if prev != data_len {
            return Err(BedrockError::MalformedRecord(format!(
                "{} trailing bytes after the last field",
                data_len - prev
            )));
        }

        Ok(Self {
            bytes,
            header,
            slots,
        })
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn n_fields(&self) -> usize {
        self.slots.len()
    }

    pub fn creator_id(&self) -> TransactionId {
        self.header.creator_id
    }

    pub fn version_pointer(&self) -> Option<VersionId> {
        self.header.version_pointer
    }

    pub fn is_delete_marked(&self) -> bool {
        self.header.is_delete_marked()
    }

    pub fn has_external(&self) -> bool {
        self.slots.iter().any(|s| s.external)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            creator_id: self.header.creator_id,
            version_pointer: self.header.version_pointer,
            delete_marked: self.is_delete_marked(),
        }
    }

    pub fn field(&self, i: usize) -> Result<FieldRef<'a>> {
        let slot = self.slots.get(i).ok_or_else(|| {
            BedrockError::MalformedRecord(format!(
                "field {i} requested from a record with {} fields",
                self.slots.len()
            ))
        })?;
        if slot.null {
            return Ok(FieldRef::Null);
        }
        let data = &self.bytes[slot.start..slot.end];
        if slot.external {
            return Ok(FieldRef::External(BlobRef::decode(data)?));
        }
        Ok(FieldRef::Inline(data))
    }

    pub fn to_fields(&self) -> Result<Vec<Field>> {
        (0..self.n_fields())
            .map(|i| self.field(i).map(|f| f.to_field()))
            .collect()
    }
}
