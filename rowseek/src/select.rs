//! Pull-based executors over the search engine, for internal statements that
//! read one or more tables: single-index scans, nested-loop joins driven by
//! index lookups, simple aggregates and scan-driven updates.

use std::cmp::Ordering;
use std::sync::Arc;

use bedrock::index::ColumnType;
use bedrock::lock_manager::LockManager;
use bedrock::table::Table;
use bedrock::transaction::Transaction;
use bedrock::Value;

use crate::context::{ScanRequest, ScanStats, SearchContext};
use crate::engine::SearchEngine;
use crate::errors::{ScanOutcome, SelectError};
use crate::tuple::{SearchTuple, SelectLock};

pub type Row = Vec<Value>;

pub type SelectResult<T> = std::result::Result<T, SelectError>;

pub trait Executor {
    fn next(&mut self) -> SelectResult<Option<Row>>;
}

/// Scans one index and decodes each delivered row into values, in template
/// column order. Yields and lock waits are absorbed here.
pub struct IndexScan<'e> {
    engine: &'e SearchEngine,
    ctx: SearchContext,
    buf: Vec<u8>,
    done: bool,
}

impl<'e> IndexScan<'e> {
    pub fn new(engine: &'e SearchEngine, request: ScanRequest) -> SelectResult<Self> {
        let buf = vec![0; request.row_template().row_len()];
        let ctx = engine.open(request)?;
        Ok(Self {
            engine,
            ctx,
            buf,
            done: false,
        })
    }

    pub fn context(&self) -> &SearchContext {
        &self.ctx
    }

    /// Starts over with a new search tuple.
    pub fn rebind(&mut self, tuple: SearchTuple) -> SelectResult<()> {
        self.engine.reopen(&mut self.ctx, tuple)?;
        self.done = false;
        Ok(())
    }

    pub fn finish(self) -> ScanStats {
        self.engine.close(self.ctx)
    }

    fn stopped(&self, outcome: ScanOutcome) -> SelectError {
        SelectError::Scan {
            index: self.ctx.index().name.clone(),
            outcome,
        }
    }
}

impl Executor for IndexScan<'_> {
    fn next(&mut self) -> SelectResult<Option<Row>> {
        while !self.done {
            let direction = self.ctx.direction();
            match self.engine.fetch(&mut self.ctx, direction, &mut self.buf) {
                Ok(_) => return Ok(Some(self.ctx.decode_row(&self.buf)?)),
                Err(ScanOutcome::Yielded) => continue,
                Err(ScanOutcome::LockWait(_)) => {
                    if let Err(outcome) = self.engine.wait(&mut self.ctx) {
                        return Err(self.stopped(outcome));
                    }
                }
                Err(ScanOutcome::EndOfIndex | ScanOutcome::NotFound) => self.done = true,
                Err(outcome) => return Err(self.stopped(outcome)),
            }
        }
        Ok(None)
    }
}

/// Builds the inner search tuple from an outer row; `None` skips the row.
pub type Binder<'e> = Box<dyn Fn(&[Value]) -> SelectResult<Option<SearchTuple>> + 'e>;

/// Binder for an equality join: each `(outer_pos, inner_col_no, ty)` takes
/// the outer row's value at `outer_pos` as the next field of the inner
/// index key. Outer rows with a NULL join value never match.
pub fn equi_join(key: Vec<(usize, usize, ColumnType)>) -> Binder<'static> {
    Box::new(move |row: &[Value]| {
        let mut fields = Vec::with_capacity(key.len());
        for &(outer_pos, col_no, ty) in &key {
            let value = row.get(outer_pos).ok_or(SelectError::NoSuchColumn(outer_pos))?;
            if value.is_null() {
                return Ok(None);
            }
            fields.push(value.to_field(col_no, ty)?);
        }
        Ok(Some(SearchTuple::exact(fields)))
    })
}

/// For every outer row, re-opens the inner scan on a tuple bound from it and
/// emits the outer row extended by each inner row.
pub struct NestedLoopJoin<'e> {
    outer: Box<dyn Executor + 'e>,
    inner: IndexScan<'e>,
    bind: Binder<'e>,
    outer_row: Option<Row>,
}

impl<'e> NestedLoopJoin<'e> {
    pub fn new(outer: Box<dyn Executor + 'e>, inner: IndexScan<'e>, bind: Binder<'e>) -> Self {
        Self {
            outer,
            inner,
            bind,
            outer_row: None,
        }
    }

    pub fn finish(self) -> ScanStats {
        self.inner.finish()
    }
}

impl Executor for NestedLoopJoin<'_> {
    fn next(&mut self) -> SelectResult<Option<Row>> {
        loop {
            let Some(outer_row) = self.outer_row.as_ref() else {
                let Some(row) = self.outer.next()? else {
                    return Ok(None);
                };
                if let Some(tuple) = (self.bind)(&row)? {
                    self.inner.rebind(tuple)?;
                    self.outer_row = Some(row);
                }
                continue;
            };
            match self.inner.next()? {
                Some(inner_row) => {
                    let mut joined = outer_row.clone();
                    joined.extend(inner_row);
                    return Ok(Some(joined));
                }
                None => self.outer_row = None,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    /// Sum of the input column at this position. NULLs are ignored.
    Sum(usize),
    Min(usize),
    Max(usize),
}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Accumulator {
    fn new(function: AggregateFn) -> Self {
        match function {
            AggregateFn::Count => Accumulator::Count(0),
            AggregateFn::Sum(_) => Accumulator::Sum(None),
            AggregateFn::Min(_) => Accumulator::Min(None),
            AggregateFn::Max(_) => Accumulator::Max(None),
        }
    }

    fn update(&mut self, value: Option<&Value>) -> SelectResult<()> {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(acc) => {
                let Some(value) = value.filter(|v| !v.is_null()) else {
                    return Ok(());
                };
                *acc = Some(match acc.take() {
                    None => add(&Value::Int(0), value)?,
                    Some(sum) => add(&sum, value)?,
                });
            }
            Accumulator::Min(acc) => keep_extreme(acc, value, Ordering::Less),
            Accumulator::Max(acc) => keep_extreme(acc, value, Ordering::Greater),
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int(n),
            Accumulator::Sum(v) | Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

fn keep_extreme(acc: &mut Option<Value>, value: Option<&Value>, wanted: Ordering) {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return;
    };
    if acc.as_ref().map_or(true, |cur| value.compare(cur) == wanted) {
        *acc = Some(value.clone());
    }
}

fn add(a: &Value, b: &Value) -> SelectResult<Value> {
    Ok(match (a, b) {
        (Value::Double(x), other) | (other, Value::Double(x)) => {
            let y = match other {
                Value::Double(y) => *y,
                Value::Int(y) => *y as f64,
                Value::UInt(y) => *y as f64,
                v => return Err(SelectError::NotNumeric(v.to_string())),
            };
            Value::Double(x + y)
        }
        (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(*y)),
        (x, y) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Value::Int(x.wrapping_add(y)),
            _ if x.as_i64().is_none() => return Err(SelectError::NotNumeric(x.to_string())),
            _ => return Err(SelectError::NotNumeric(y.to_string())),
        },
    })
}

/// Folds its whole input into a single row, one value per function.
pub struct Aggregate<'e> {
    input: Box<dyn Executor + 'e>,
    functions: Vec<AggregateFn>,
    done: bool,
}

impl<'e> Aggregate<'e> {
    pub fn new(input: Box<dyn Executor + 'e>, functions: Vec<AggregateFn>) -> Self {
        Self {
            input,
            functions,
            done: false,
        }
    }
}

impl Executor for Aggregate<'_> {
    fn next(&mut self) -> SelectResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut accs: Vec<Accumulator> = self.functions.iter().map(|&f| Accumulator::new(f)).collect();
        while let Some(row) = self.input.next()? {
            for (acc, function) in accs.iter_mut().zip(&self.functions) {
                let value = match *function {
                    AggregateFn::Count => None,
                    AggregateFn::Sum(pos) | AggregateFn::Min(pos) | AggregateFn::Max(pos) => {
                        Some(row.get(pos).ok_or(SelectError::NoSuchColumn(pos))?)
                    }
                };
                acc.update(value)?;
            }
        }
        Ok(Some(accs.into_iter().map(Accumulator::finish).collect()))
    }
}

/// Returns the column changes for a row, or `None` to leave it alone.
pub type UpdateFn<'e> = Box<dyn FnMut(&[Value]) -> Option<Vec<(usize, Value)>> + 'e>;

/// Walks the clustered index with exclusive locks and rewrites each row the
/// update function asks for. Each call to `next` returns one updated row as
/// it is after the change.
pub struct UpdateInPlace<'e> {
    scan: IndexScan<'e>,
    table: Arc<Table>,
    trx: Arc<Transaction>,
    locks: Arc<LockManager>,
    update: UpdateFn<'e>,
    updated: u64,
}

impl<'e> UpdateInPlace<'e> {
    /// `engine` must share `locks` with the table's writers.
    pub fn new(
        engine: &'e SearchEngine,
        table: Arc<Table>,
        trx: Arc<Transaction>,
        locks: Arc<LockManager>,
        tuple: SearchTuple,
        update: UpdateFn<'e>,
    ) -> SelectResult<Self> {
        let request = ScanRequest::on_table(&table, "primary", Arc::clone(&trx))?
            .tuple(tuple)
            .lock(SelectLock::Exclusive);
        let scan = IndexScan::new(engine, request)?;
        Ok(Self {
            scan,
            table,
            trx,
            locks,
            update,
            updated: 0,
        })
    }

    pub fn updated(&self) -> u64 {
        self.updated
    }

    /// Runs to completion and returns the number of rows changed.
    pub fn execute(mut self) -> SelectResult<u64> {
        while self.next()?.is_some() {}
        let updated = self.updated;
        let stats = self.scan.finish();
        log::debug!("updated {updated} rows of {} ({} examined)", self.table.name(), stats.records_examined);
        Ok(updated)
    }
}

impl Executor for UpdateInPlace<'_> {
    fn next(&mut self) -> SelectResult<Option<Row>> {
        while let Some(mut row) = self.scan.next()? {
            let Some(changes) = (self.update)(&row) else {
                continue;
            };
            let pk = self
                .table
                .primary_key()
                .iter()
                .map(|&col_no| row.get(col_no).cloned().ok_or(SelectError::NoSuchColumn(col_no)))
                .collect::<SelectResult<Vec<Value>>>()?;
            self.table.update(&self.trx, &self.locks, &pk, &changes)?;
            for (col_no, value) in changes {
                if let Some(slot) = row.get_mut(col_no) {
                    *slot = value;
                }
            }
            self.updated += 1;
            return Ok(Some(row));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rows(std::vec::IntoIter<Row>);

    impl Executor for Rows {
        fn next(&mut self) -> SelectResult<Option<Row>> {
            Ok(self.0.next())
        }
    }

    #[test]
    fn aggregates_ignore_nulls() {
        let rows = vec![
            vec![Value::Int(3), Value::Str("b".into())],
            vec![Value::Null, Value::Str("a".into())],
            vec![Value::Int(-5), Value::Null],
        ];
        let mut agg = Aggregate::new(
            Box::new(Rows(rows.into_iter())),
            vec![
                AggregateFn::Count,
                AggregateFn::Sum(0),
                AggregateFn::Min(0),
                AggregateFn::Max(1),
            ],
        );
        let row = agg.next().unwrap().unwrap();
        assert_eq!(
            row,
            vec![Value::Int(3), Value::Int(-2), Value::Int(-5), Value::Str("b".into())]
        );
        assert!(agg.next().unwrap().is_none());
    }

    #[test]
    fn aggregates_over_empty_input() {
        let mut agg = Aggregate::new(
            Box::new(Rows(Vec::new().into_iter())),
            vec![AggregateFn::Count, AggregateFn::Max(0)],
        );
        assert_eq!(agg.next().unwrap().unwrap(), vec![Value::Int(0), Value::Null]);
    }

    #[test]
    fn sum_widens_to_double_and_rejects_text() {
        assert_eq!(add(&Value::Int(2), &Value::Double(0.5)).unwrap(), Value::Double(2.5));
        assert_eq!(add(&Value::UInt(2), &Value::Int(3)).unwrap(), Value::Int(5));
        assert!(matches!(
            add(&Value::Int(1), &Value::Str("x".into())),
            Err(SelectError::NotNumeric(_))
        ));
    }

    #[test]
    fn equi_join_skips_null_keys() {
        let bind = equi_join(vec![(1, 0, ColumnType::Int { len: 4 })]);
        assert!(bind(&[Value::Int(1), Value::Null]).unwrap().is_none());
        let tuple = bind(&[Value::Int(1), Value::Int(7)]).unwrap().unwrap();
        assert_eq!(tuple.fields().len(), 1);
    }
}
