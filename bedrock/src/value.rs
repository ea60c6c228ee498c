//! Typed column values and their conversion to and from record fields.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::index::ColumnType;
use crate::record::{decode_int, decode_uint, encode_int, encode_uint, Field, FieldRef};
use crate::{BedrockError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Encodes the value for a column of type `ty`. Values that must go to
    /// the overflow store are left inline here; the table layer moves them.
    pub fn to_field(&self, col_no: usize, ty: ColumnType) -> Result<Field> {
        let invalid = |reason: &str| BedrockError::InvalidValue {
            col_no,
            reason: reason.to_string(),
        };
        if self.is_null() {
            return Ok(Field::Null);
        }
        match ty {
            ColumnType::Int { len } => {
                let v = self.as_i64().ok_or_else(|| invalid("expected an integer"))?;
                Ok(Field::Value(encode_int(v, len as usize)))
            }
            ColumnType::UInt { len } => match self {
                Value::UInt(v) => Ok(Field::Value(encode_uint(*v, len as usize))),
                Value::Int(v) if *v >= 0 => Ok(Field::Value(encode_uint(*v as u64, len as usize))),
                _ => Err(invalid("expected an unsigned integer")),
            },
            ColumnType::Double => match self {
                Value::Double(v) => Ok(Field::Value(v.to_le_bytes().to_vec())),
                _ => Err(invalid("expected a double")),
            },
            ColumnType::Char { len } => {
                let bytes = self.as_bytes().ok_or_else(|| invalid("expected a string"))?;
                if bytes.len() > len as usize {
                    return Err(invalid("value is wider than the column"));
                }
                Ok(Field::Value(bytes.to_vec()))
            }
            ColumnType::VarChar { max_len } => {
                let bytes = self.as_bytes().ok_or_else(|| invalid("expected a string"))?;
                if bytes.len() > max_len as usize {
                    return Err(invalid("value is longer than the column"));
                }
                Ok(Field::Value(bytes.to_vec()))
            }
            ColumnType::Blob => {
                let bytes = self.as_bytes().ok_or_else(|| invalid("expected bytes"))?;
                Ok(Field::Value(bytes.to_vec()))
            }
        }
    }

    pub fn from_field(field: FieldRef<'_>, ty: ColumnType) -> Result<Value> {
        let data = match field {
            FieldRef::Null => return Ok(Value::Null),
            FieldRef::Inline(data) => data,
            FieldRef::External(blob) => {
                return Err(BedrockError::Unsupported(format!(
                    "overflow value {} must be fetched before decoding",
                    blob.id
                )))
            }
        };
        Ok(match ty {
            ColumnType::Int { .. } => Value::Int(decode_int(data)),
            ColumnType::UInt { .. } => Value::UInt(decode_uint(data)),
            ColumnType::Double => {
                let raw: [u8; 8] = data.try_into().map_err(|_| {
                    BedrockError::MalformedRecord(format!("double stored in {} bytes", data.len()))
                })?;
                Value::Double(f64::from_le_bytes(raw))
            }
            ColumnType::Char { .. } | ColumnType::VarChar { .. } => {
                Value::Str(String::from_utf8_lossy(data).into_owned())
            }
            ColumnType::Blob => Value::Bytes(data.to_vec()),
        })
    }

    /// Total order used by aggregates: NULL first, numbers numerically,
    /// strings and bytes lexicographically. Mixed kinds compare by kind.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
            (Value::Int(a), Value::UInt(b)) => i128::from(*a).cmp(&i128::from(*b)),
            (Value::UInt(a), Value::Int(b)) => i128::from(*a).cmp(&i128::from(*b)),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::UInt(_) => 1,
            Value::Double(_) => 2,
            Value::Str(_) => 3,
            Value::Bytes(_) => 4,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
