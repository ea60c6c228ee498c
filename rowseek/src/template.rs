//! Output row layout.
//!
//! A row is a null bitmap (one bit per template column), then every
//! fixed-width column at a fixed offset, then one region per variable-width
//! column. Large values are represented in the fixed part by an 8-byte
//! descriptor: u32 LE length followed by u32 LE offset into the scan's
//! blob arena.

use bedrock::index::{ColumnDef, ColumnType};
use bedrock::Value;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SearchError};
use crate::materialize::BlobArena;

pub const LARGE_DESCRIPTOR_LEN: usize = 8;

/// Character set of a fixed-width character column; decides the pad
/// sequence written after short values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Charset {
    Binary,
    Latin1,
    Utf8mb4,
    Ucs2,
    Utf32,
}

impl Charset {
    pub fn pad_unit(self) -> &'static [u8] {
        match self {
            Charset::Binary => &[0x00],
            Charset::Latin1 | Charset::Utf8mb4 => &[0x20],
            Charset::Ucs2 => &[0x00, 0x20],
            Charset::Utf32 => &[0x00, 0x00, 0x00, 0x20],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Fixed { len: usize },
    /// Length prefix (1 byte below 256, else 2 bytes LE) plus `max_len` bytes.
    Variable { max_len: usize },
    Large,
    /// Stored big-endian with the sign bit flipped, written little-endian.
    Numeric { len: usize, unsigned: bool },
}

impl ColumnKind {
    fn for_type(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Int { len } => ColumnKind::Numeric {
                len: len as usize,
                unsigned: false,
            },
            ColumnType::UInt { len } => ColumnKind::Numeric {
                len: len as usize,
                unsigned: true,
            },
            ColumnType::Double => ColumnKind::Fixed { len: 8 },
            ColumnType::Char { len } => ColumnKind::Fixed { len: len as usize },
            ColumnType::VarChar { max_len } => ColumnKind::Variable {
                max_len: max_len as usize,
            },
            ColumnType::Blob => ColumnKind::Large,
        }
    }

    /// Bytes the column occupies in the row.
    pub fn width(self) -> usize {
        match self {
            ColumnKind::Fixed { len } | ColumnKind::Numeric { len, .. } => len,
            ColumnKind::Variable { max_len } => prefix_len(max_len) + max_len,
            ColumnKind::Large => LARGE_DESCRIPTOR_LEN,
        }
    }

    fn is_variable(self) -> bool {
        matches!(self, ColumnKind::Variable { .. })
    }
}

pub(crate) fn prefix_len(max_len: usize) -> usize {
    if max_len < 256 {
        1
    } else {
        2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateColumn {
    pub col_no: usize,
    pub ty: ColumnType,
    pub kind: ColumnKind,
    pub charset: Charset,
    /// Bit in the null bitmap.
    pub null_bit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowTemplate {
    columns: Vec<TemplateColumn>,
    null_bytes: usize,
    row_len: usize,
}

impl RowTemplate {
    /// Layout for the table columns `wanted`, in that order.
    pub fn new(table: &[ColumnDef], wanted: &[usize]) -> Result<Self> {
        let mut columns = Vec::with_capacity(wanted.len());
        for (null_bit, &col_no) in wanted.iter().enumerate() {
            let def = table.get(col_no).ok_or(SearchError::UnknownColumn(col_no))?;
            def.ty.check()?;
            if columns.iter().any(|c: &TemplateColumn| c.col_no == col_no) {
                return Err(SearchError::Template(format!("column {col_no} requested twice")));
            }
            let charset = match def.ty {
                ColumnType::Char { .. } | ColumnType::VarChar { .. } => Charset::Latin1,
                _ => Charset::Binary,
            };
            columns.push(TemplateColumn {
                col_no,
                ty: def.ty,
                kind: ColumnKind::for_type(def.ty),
                charset,
                null_bit,
                offset: 0,
            });
        }

        let null_bytes = columns.len().div_ceil(8);
        let mut offset = null_bytes;
        for column in columns.iter_mut().filter(|c| !c.kind.is_variable()) {
            column.offset = offset;
            offset += column.kind.width();
        }
        for column in columns.iter_mut().filter(|c| c.kind.is_variable()) {
            column.offset = offset;
            offset += column.kind.width();
        }
        Ok(Self {
            columns,
            null_bytes,
            row_len: offset,
        })
    }

    /// Every column of the table.
    pub fn all(table: &[ColumnDef]) -> Result<Self> {
        let wanted: Vec<usize> = (0..table.len()).collect();
        Self::new(table, &wanted)
    }

    pub fn with_charset(mut self, col_no: usize, charset: Charset) -> Result<Self> {
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.col_no == col_no)
            .ok_or(SearchError::UnknownColumn(col_no))?;
        column.charset = charset;
        Ok(self)
    }

    pub fn columns(&self) -> &[TemplateColumn] {
        &self.columns
    }

    pub fn col_nos(&self) -> impl Iterator<Item = usize> + '_ {
        self.columns.iter().map(|c| c.col_no)
    }

    pub fn null_bytes(&self) -> usize {
        self.null_bytes
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn has_large(&self) -> bool {
        self.columns.iter().any(|c| c.kind == ColumnKind::Large)
    }

    pub fn is_null(&self, row: &[u8], i: usize) -> bool {
        row.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0)
    }

    /// Reads a materialized row back into values, one per template column.
    pub fn decode(&self, row: &[u8], arena: &BlobArena) -> Result<Vec<Value>> {
        if row.len() < self.row_len {
            return Err(SearchError::BufferTooSmall {
                given: row.len(),
                needed: self.row_len,
            });
        }
        self.columns
            .iter()
            .map(|column| {
                if self.is_null(row, column.null_bit) {
                    return Ok(Value::Null);
                }
                let at = column.offset;
                let data = &row[at..at + column.kind.width()];
                let value = match column.kind {
                    ColumnKind::Numeric { len, unsigned } => {
                        let mut raw = [0u8; 8];
                        raw[..len].copy_from_slice(data);
                        if unsigned {
                            Value::UInt(u64::from_le_bytes(raw))
                        } else {
                            // Sign-extend from `len` bytes.
                            let shift = 64 - 8 * len as u32;
                            Value::Int(i64::from_le_bytes(raw).wrapping_shl(shift).wrapping_shr(shift))
                        }
                    }
                    ColumnKind::Fixed { .. } if column.ty == ColumnType::Double => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(data);
                        Value::Double(f64::from_le_bytes(raw))
                    }
                    ColumnKind::Fixed { .. } => {
                        let pad = column.charset.pad_unit();
                        let mut end = data.len();
                        while end >= pad.len() && &data[end - pad.len()..end] == pad {
                            end -= pad.len();
                        }
                        Value::Str(String::from_utf8_lossy(&data[..end]).into_owned())
                    }
                    ColumnKind::Variable { max_len } => {
                        let prefix = prefix_len(max_len);
                        let len = if prefix == 1 {
                            data[0] as usize
                        } else {
                            u16::from_le_bytes([data[0], data[1]]) as usize
                        };
                        let bytes = data.get(prefix..prefix + len).ok_or_else(|| {
                            SearchError::Template(format!("column {} length {len} exceeds its region", column.col_no))
                        })?;
                        Value::Str(String::from_utf8_lossy(bytes).into_owned())
                    }
                    ColumnKind::Large => {
                        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
                        let offset = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
                        let bytes = arena.get(offset, len).ok_or_else(|| {
                            SearchError::Template(format!("column {} points outside the blob arena", column.col_no))
                        })?;
                        Value::Bytes(bytes.to_vec())
                    }
                };
                Ok(value)
            })
            .collect()
    }
}
