//! Search tuples, scan direction and per-scan options.

use std::fmt;
use std::sync::Arc;

use bedrock::btree::SearchMode;
use bedrock::index::IndexDef;
use bedrock::record::FieldRef;
use bedrock::{Field, RecordView, Value};
use serde::{Deserialize, Serialize};

use crate::access::OverflowFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    /// Every bound field must equal the record's. On a unique index with all
    /// unique fields bound this is a point lookup.
    Exact,
    /// The bound fields must be a prefix of the record.
    ExactPrefix,
    /// The tuple only positions the scan; no match is required afterwards.
    RangeStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanDirection {
    Ascending,
    Descending,
}

impl ScanDirection {
    pub fn is_forward(self) -> bool {
        self == ScanDirection::Ascending
    }

    pub fn reverse(self) -> Self {
        match self {
            ScanDirection::Ascending => ScanDirection::Descending,
            ScanDirection::Descending => ScanDirection::Ascending,
        }
    }

    /// Search mode used to restore a stored position in this direction.
    pub(crate) fn restore_mode(self) -> SearchMode {
        match self {
            ScanDirection::Ascending => SearchMode::GreaterOrEqual,
            ScanDirection::Descending => SearchMode::LessOrEqual,
        }
    }
}

/// The locking clause of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectLock {
    None,
    Shared,
    Exclusive,
}

/// A possibly partial key plus how records must relate to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTuple {
    fields: Vec<Field>,
    match_mode: MatchMode,
    inclusive: bool,
}

impl SearchTuple {
    pub fn exact(fields: Vec<Field>) -> Self {
        Self {
            fields,
            match_mode: MatchMode::Exact,
            inclusive: true,
        }
    }

    pub fn prefix(fields: Vec<Field>) -> Self {
        Self {
            fields,
            match_mode: MatchMode::ExactPrefix,
            inclusive: true,
        }
    }

    /// Starts at the first record at (ascending) or the last record at
    /// (descending) the tuple.
    pub fn range_from(fields: Vec<Field>) -> Self {
        Self {
            fields,
            match_mode: MatchMode::RangeStart,
            inclusive: true,
        }
    }

    /// Like [`SearchTuple::range_from`] but skips records equal to the tuple.
    pub fn range_after(fields: Vec<Field>) -> Self {
        Self {
            fields,
            match_mode: MatchMode::RangeStart,
            inclusive: false,
        }
    }

    /// Every record of the index.
    pub fn full_scan() -> Self {
        Self::range_from(Vec::new())
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn match_mode(&self) -> MatchMode {
        self.match_mode
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn has_null(&self) -> bool {
        self.fields.iter().any(Field::is_null)
    }

    /// Whether records past the first mismatch can end the scan.
    pub fn requires_match(&self) -> bool {
        self.match_mode != MatchMode::RangeStart && !self.fields.is_empty()
    }

    /// Search mode for the initial positioning.
    pub fn open_mode(&self, direction: ScanDirection) -> SearchMode {
        match (direction, self.inclusive) {
            (ScanDirection::Ascending, true) => SearchMode::GreaterOrEqual,
            (ScanDirection::Ascending, false) => SearchMode::Greater,
            (ScanDirection::Descending, true) => SearchMode::LessOrEqual,
            (ScanDirection::Descending, false) => SearchMode::Less,
        }
    }

    /// A point lookup: exact match on every unique field of a unique index,
    /// with no NULL among them. Returns at most one row.
    pub fn is_unique_search(&self, def: &IndexDef) -> bool {
        self.match_mode == MatchMode::Exact
            && def.unique
            && self.fields.len() >= def.n_unique
            && !self.fields[..def.n_unique].iter().any(Field::is_null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateVerdict {
    Match,
    NoMatch,
    /// This and every further record in scan order fails; stop the scan.
    OutOfRange,
}

/// Column access for residual predicates.
pub struct RowAccess<'r> {
    def: &'r IndexDef,
    record: &'r RecordView<'r>,
    types: &'r [bedrock::index::ColumnType],
    overflow: &'r dyn OverflowFetcher,
}

impl<'r> RowAccess<'r> {
    pub(crate) fn new(
        def: &'r IndexDef,
        record: &'r RecordView<'r>,
        types: &'r [bedrock::index::ColumnType],
        overflow: &'r dyn OverflowFetcher,
    ) -> Self {
        Self {
            def,
            record,
            types,
            overflow,
        }
    }

    /// The value of table column `col_no`, or `None` if the record does not
    /// carry it.
    pub fn value(&self, col_no: usize) -> Option<Value> {
        let pos = self.def.field_position(col_no)?;
        let ty = *self.types.get(col_no)?;
        match self.record.field(pos).ok()? {
            FieldRef::External(blob) => {
                let bytes = self.overflow.fetch_overflow(blob).ok()?;
                Some(Value::Bytes(bytes.to_vec()))
            }
            field => Value::from_field(field, ty).ok(),
        }
    }

    pub fn is_delete_marked(&self) -> bool {
        self.record.is_delete_marked()
    }
}

pub type RowPredicate = Arc<dyn Fn(&RowAccess<'_>) -> PredicateVerdict + Send + Sync>;

#[derive(Clone, Default)]
pub struct ScanOptions {
    /// Deliver delete-marked rows as well, flagged in `RowDelivered`.
    pub include_delete_marked: bool,
    pub predicate: Option<RowPredicate>,
    /// Never buffer rows in the fetch cache.
    pub disable_cache: bool,
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("include_delete_marked", &self.include_delete_marked)
            .field("predicate", &self.predicate.is_some())
            .field("disable_cache", &self.disable_cache)
            .finish()
    }
}

impl ScanOptions {
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RowAccess<'_>) -> PredicateVerdict + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn include_delete_marked(mut self) -> Self {
        self.include_delete_marked = true;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.disable_cache = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrock::index::{ColumnDef, ColumnType};

    #[test]
    fn unique_search_needs_all_unique_fields_without_nulls() {
        let cols = vec![
            ColumnDef::new("a", ColumnType::Int { len: 4 }),
            ColumnDef::new("b", ColumnType::Int { len: 4 }),
        ];
        let def = IndexDef::clustered(1, "p", &cols, &[0, 1]);
        let full = SearchTuple::exact(vec![Field::int(1, 4), Field::int(2, 4)]);
        assert!(full.is_unique_search(&def));
        assert!(!SearchTuple::exact(vec![Field::int(1, 4)]).is_unique_search(&def));
        assert!(!SearchTuple::exact(vec![Field::int(1, 4), Field::Null]).is_unique_search(&def));
        assert!(!SearchTuple::prefix(vec![Field::int(1, 4), Field::int(2, 4)]).is_unique_search(&def));
    }

    #[test]
    fn open_modes_follow_bound_and_direction() {
        let t = SearchTuple::range_after(vec![Field::int(3, 4)]);
        assert_eq!(t.open_mode(ScanDirection::Ascending), SearchMode::Greater);
        assert_eq!(t.open_mode(ScanDirection::Descending), SearchMode::Less);
        assert!(!SearchTuple::full_scan().requires_match());
        assert!(SearchTuple::prefix(vec![Field::int(3, 4)]).requires_match());
    }
}
