//! Table and index definitions, key comparison and lock keys.

use std::cmp::Ordering;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::lock_manager::LockTarget;
use crate::record::{compare_fields, Field, FieldRef, RecordView};
use crate::{BedrockError, IndexId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int { len: u8 },
    UInt { len: u8 },
    Double,
    Char { len: u16 },
    VarChar { max_len: u16 },
    Blob,
}

impl ColumnType {
    /// Whether values of this type may be moved to the overflow store.
    pub fn may_overflow(&self) -> bool {
        matches!(self, ColumnType::Blob)
    }

    /// Integers are stored in 1 to 8 bytes.
    pub fn check(&self) -> Result<()> {
        match *self {
            ColumnType::Int { len } | ColumnType::UInt { len } if len == 0 || len > 8 => Err(
                BedrockError::Unsupported(format!("integer column of {len} bytes")),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// One field of an index entry: which table column it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub col_no: usize,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    pub clustered: bool,
    pub unique: bool,
    pub columns: Vec<IndexColumn>,
    /// Number of leading fields that identify an entry.
    pub n_unique: usize,
}

impl IndexDef {
    /// Clustered index: primary-key columns first, then every other column.
    pub fn clustered(id: IndexId, name: &str, table: &[ColumnDef], pk: &[usize]) -> Self {
        let mut columns: Vec<IndexColumn> = pk
            .iter()
            .map(|&col_no| IndexColumn {
                col_no,
                ty: table[col_no].ty,
            })
            .collect();
        for (col_no, col) in table.iter().enumerate() {
            if !pk.contains(&col_no) {
                columns.push(IndexColumn { col_no, ty: col.ty });
            }
        }
        Self {
            id,
            name: name.to_string(),
            clustered: true,
            unique: true,
            columns,
            n_unique: pk.len(),
        }
    }

    /// Secondary index: the key columns followed by the primary-key columns
    /// not already part of the key.
    pub fn secondary(
        id: IndexId,
        name: &str,
        table: &[ColumnDef],
        key: &[usize],
        pk: &[usize],
        unique: bool,
    ) -> Self {
        let mut columns: Vec<IndexColumn> = key
            .iter()
            .map(|&col_no| IndexColumn {
                col_no,
                ty: table[col_no].ty,
            })
            .collect();
        for &col_no in pk {
            if !key.contains(&col_no) {
                columns.push(IndexColumn {
                    col_no,
                    ty: table[col_no].ty,
                });
            }
        }
        let n_unique = if unique { key.len() } else { columns.len() };
        Self {
            id,
            name: name.to_string(),
            clustered: false,
            unique,
            columns,
            n_unique,
        }
    }

    pub fn n_fields(&self) -> usize {
        self.columns.len()
    }

    /// Fields that order entries inside the tree. A secondary entry is only
    /// unique together with its primary-key suffix.
    pub fn n_ordering_fields(&self) -> usize {
        if self.clustered {
            self.n_unique
        } else {
            self.columns.len()
        }
    }

    pub fn field_position(&self, col_no: usize) -> Option<usize> {
        self.columns.iter().position(|c| c.col_no == col_no)
    }

    /// Compares a (possibly partial) search tuple against a record. Only the
    /// tuple's fields take part, so a record extending the tuple compares
    /// equal.
    pub fn compare_tuple(&self, tuple: &[Field], record: &RecordView<'_>) -> Result<Ordering> {
        for (i, field) in tuple.iter().enumerate() {
            let ord = compare_fields(field.as_field_ref(), record.field(i)?);
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }

    pub fn compare_records(&self, a: &RecordView<'_>, b: &RecordView<'_>) -> Result<Ordering> {
        for i in 0..self.n_ordering_fields() {
            let ord = compare_fields(a.field(i)?, b.field(i)?);
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }

    /// The ordering prefix of a record as owned fields.
    pub fn ordering_key(&self, record: &RecordView<'_>) -> Result<Vec<Field>> {
        (0..self.n_ordering_fields())
            .map(|i| record.field(i).map(|f| f.to_field()))
            .collect()
    }

    /// Projects a full table row (indexed by column number) onto this
    /// index's field order.
    pub fn build_entry(&self, row: &[Field]) -> Result<Vec<Field>> {
        self.columns
            .iter()
            .map(|c| {
                row.get(c.col_no).cloned().ok_or_else(|| {
                    BedrockError::MalformedRecord(format!(
                        "row has no column {} for index {}",
                        c.col_no, self.name
                    ))
                })
            })
            .collect()
    }

    /// Stable byte identity of the entry's ordering prefix, used as a lock
    /// target.
    pub fn lock_key(&self, record: &RecordView<'_>) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        for i in 0..self.n_ordering_fields() {
            match record.field(i)? {
                FieldRef::Null => buf.put_u8(0x00),
                FieldRef::Inline(data) => {
                    buf.put_u8(0x01);
                    buf.put_u16_le(data.len() as u16);
                    buf.put_slice(data);
                }
                FieldRef::External(blob) => {
                    buf.put_u8(0x02);
                    buf.put_slice(&blob.encode());
                }
            }
        }
        Ok(buf.freeze())
    }

    pub fn lock_target(&self, record: &RecordView<'_>) -> Result<LockTarget> {
        Ok(LockTarget::Record {
            index: self.id,
            key: self.lock_key(record)?,
        })
    }

    pub fn supremum_target(&self) -> LockTarget {
        LockTarget::Supremum { index: self.id }
    }
}
