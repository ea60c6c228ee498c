//! Copying records into the caller's row layout.

use bedrock::record::FieldRef;
use bedrock::{BedrockError, RecordView};
use thiserror::Error;

use crate::access::OverflowFetcher;
use crate::template::{prefix_len, ColumnKind, RowTemplate, TemplateColumn};

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("large values need {needed} bytes, the arena allows {limit}")]
    TooLarge { needed: usize, limit: usize },
    #[error("row buffer holds {given} bytes, the template needs {needed}")]
    BufferTooSmall { given: usize, needed: usize },
    #[error("record has no field for column {0}")]
    MissingColumn(usize),
    #[error("column {col_no} holds {len} bytes, more than its {width}-byte slot")]
    Overlong { col_no: usize, len: usize, width: usize },
    #[error(transparent)]
    Storage(#[from] BedrockError),
}

/// Scan-owned storage for large column values of the row being delivered.
/// Cleared at the start of every fetch, so a delivered row's large values
/// stay readable until the next fetch.
#[derive(Debug)]
pub struct BlobArena {
    buf: Vec<u8>,
    limit: usize,
}

impl BlobArena {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    /// Appends `bytes` and returns their offset.
    pub fn push(&mut self, bytes: &[u8]) -> Result<usize, MaterializeError> {
        let needed = self.buf.len() + bytes.len();
        if needed > self.limit {
            return Err(MaterializeError::TooLarge {
                needed,
                limit: self.limit,
            });
        }
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Ok(offset)
    }

    pub fn get(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.buf.get(offset..offset.checked_add(len)?)
    }
}

/// Writes records into rows laid out by a [`RowTemplate`]. `field_map`
/// gives, per template column, the record field that carries it.
pub struct RowMaterializer<'a> {
    template: &'a RowTemplate,
    field_map: &'a [usize],
    overflow: &'a dyn OverflowFetcher,
}

impl<'a> RowMaterializer<'a> {
    pub fn new(template: &'a RowTemplate, field_map: &'a [usize], overflow: &'a dyn OverflowFetcher) -> Self {
        Self {
            template,
            field_map,
            overflow,
        }
    }

    pub fn materialize(
        &self,
        record: &RecordView<'_>,
        out: &mut [u8],
        arena: &mut BlobArena,
    ) -> Result<(), MaterializeError> {
        let needed = self.template.row_len();
        if out.len() < needed {
            return Err(MaterializeError::BufferTooSmall {
                given: out.len(),
                needed,
            });
        }
        for (i, column) in self.template.columns().iter().enumerate() {
            let pos = *self
                .field_map
                .get(i)
                .ok_or(MaterializeError::MissingColumn(column.col_no))?;
            match record.field(pos)? {
                FieldRef::Null => write_null(column, out),
                FieldRef::Inline(data) => {
                    clear_null(column, out);
                    self.write_value(column, data, out, arena)?;
                }
                FieldRef::External(blob) => {
                    clear_null(column, out);
                    let data = self.overflow.fetch_overflow(blob)?;
                    self.write_value(column, &data, out, arena)?;
                }
            }
        }
        Ok(())
    }

    fn write_value(
        &self,
        column: &TemplateColumn,
        data: &[u8],
        out: &mut [u8],
        arena: &mut BlobArena,
    ) -> Result<(), MaterializeError> {
        let at = column.offset;
        let overlong = |width: usize| MaterializeError::Overlong {
            col_no: column.col_no,
            len: data.len(),
            width,
        };
        match column.kind {
            ColumnKind::Numeric { len, unsigned } => {
                if data.len() != len {
                    return Err(overlong(len));
                }
                let le = if unsigned {
                    bedrock::record::decode_uint(data).to_le_bytes()
                } else {
                    bedrock::record::decode_int(data).to_le_bytes()
                };
                out[at..at + len].copy_from_slice(&le[..len]);
            }
            ColumnKind::Fixed { len } => {
                if data.len() > len {
                    return Err(overlong(len));
                }
                out[at..at + data.len()].copy_from_slice(data);
                let pad = column.charset.pad_unit();
                for (i, byte) in out[at + data.len()..at + len].iter_mut().enumerate() {
                    *byte = pad[i % pad.len()];
                }
            }
            ColumnKind::Variable { max_len } => {
                if data.len() > max_len {
                    return Err(overlong(max_len));
                }
                let prefix = prefix_len(max_len);
                if prefix == 1 {
                    out[at] = data.len() as u8;
                } else {
                    out[at..at + 2].copy_from_slice(&(data.len() as u16).to_le_bytes());
                }
                out[at + prefix..at + prefix + data.len()].copy_from_slice(data);
            }
            ColumnKind::Large => {
                let offset = arena.push(data)?;
                out[at..at + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
                out[at + 4..at + 8].copy_from_slice(&(offset as u32).to_le_bytes());
            }
        }
        Ok(())
    }
}

fn write_null(column: &TemplateColumn, out: &mut [u8]) {
    out[column.null_bit / 8] |= 1 << (column.null_bit % 8);
    match column.kind {
        ColumnKind::Fixed { len } | ColumnKind::Numeric { len, .. } => {
            out[column.offset..column.offset + len].fill(0);
        }
        ColumnKind::Variable { .. } | ColumnKind::Large => {}
    }
}

fn clear_null(column: &TemplateColumn, out: &mut [u8]) {
    out[column.null_bit / 8] &= !(1 << (column.null_bit % 8));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Charset;
    use bedrock::blob::OverflowStore;
    use bedrock::index::{ColumnDef, ColumnType};
    use bedrock::record::{encode_record, RecordMeta};
    use bedrock::{Field, Value};
    use bytes::Bytes;

    fn table() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", ColumnType::Int { len: 2 }),
            ColumnDef::new("code", ColumnType::Char { len: 4 }),
            ColumnDef::new("name", ColumnType::VarChar { max_len: 20 }),
            ColumnDef::new("doc", ColumnType::Blob),
            ColumnDef::new("n", ColumnType::UInt { len: 4 }),
        ]
    }

    #[test]
    fn writes_every_column_kind() {
        let store = OverflowStore::new(4);
        let blob = store.store(Bytes::from_static(b"a long document")).unwrap();
        let rec = encode_record(
            &[
                Field::int(-3, 2),
                Field::bytes("ab"),
                Field::bytes("hello"),
                Field::External(blob),
                Field::Null,
            ],
            RecordMeta::default(),
        )
        .unwrap();
        let view = RecordView::parse(&rec).unwrap();

        let template = RowTemplate::all(&table()).unwrap();
        let map = [0, 1, 2, 3, 4];
        let mut out = vec![0xAA; template.row_len()];
        let mut arena = BlobArena::new(1024);
        RowMaterializer::new(&template, &map, &store)
            .materialize(&view, &mut out, &mut arena)
            .unwrap();

        let cols = template.columns();
        assert_eq!(&out[cols[0].offset..cols[0].offset + 2], &(-3i16).to_le_bytes());
        assert_eq!(&out[cols[1].offset..cols[1].offset + 4], b"ab  ");
        assert_eq!(&out[cols[4].offset..cols[4].offset + 4], &[0, 0, 0, 0]);
        assert!(template.is_null(&out, 4));
        assert!(!template.is_null(&out, 0));

        let values = template.decode(&out, &arena).unwrap();
        assert_eq!(values[0], Value::Int(-3));
        assert_eq!(values[1], Value::Str("ab".into()));
        assert_eq!(values[2], Value::Str("hello".into()));
        assert_eq!(values[3], Value::Bytes(b"a long document".to_vec()));
        assert_eq!(values[4], Value::Null);
    }

    #[test]
    fn char_padding_follows_charset() {
        let template = RowTemplate::new(&table(), &[1])
            .unwrap()
            .with_charset(1, Charset::Ucs2)
            .unwrap();
        let rec = encode_record(&[Field::bytes([0x00, 0x41])], RecordMeta::default()).unwrap();
        let view = RecordView::parse(&rec).unwrap();
        let mut out = vec![0; template.row_len()];
        let store = OverflowStore::default();
        RowMaterializer::new(&template, &[0], &store)
            .materialize(&view, &mut out, &mut BlobArena::new(0))
            .unwrap();
        assert_eq!(&out[1..5], &[0x00, 0x41, 0x00, 0x20]);
    }

    #[test]
    fn arena_limit_reports_too_large() {
        let template = RowTemplate::new(&table(), &[3]).unwrap();
        let rec = encode_record(&[Field::bytes(vec![7u8; 64])], RecordMeta::default()).unwrap();
        let view = RecordView::parse(&rec).unwrap();
        let mut out = vec![0; template.row_len()];
        let store = OverflowStore::default();
        let mut arena = BlobArena::new(32);
        let err = RowMaterializer::new(&template, &[0], &store)
            .materialize(&view, &mut out, &mut arena)
            .unwrap_err();
        assert!(matches!(err, MaterializeError::TooLarge { needed: 64, limit: 32 }));

        arena.set_limit(64);
        RowMaterializer::new(&template, &[0], &store)
            .materialize(&view, &mut out, &mut arena)
            .unwrap();
        assert_eq!(arena.used(), 64);
    }
}
