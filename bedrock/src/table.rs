//! A table: one clustered tree, its secondary trees, the version arena and
//! the overflow store. Writes take row locks the way the search engine
//! expects writers to: an exclusive record lock on every entry they touch and
//! an insert-intention lock on the successor of every entry they insert.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::blob::OverflowStore;
use crate::btree::{CursorRecord, IndexTree, SearchMode, TreeConfig};
use crate::failpoint;
use crate::index::{ColumnDef, IndexDef};
use crate::lock_manager::{LockKind, LockManager, LockMode, LockOutcome, LockTarget};
use crate::record::{encode_record, restamp, Field, RecordMeta, RecordView};
use crate::transaction::{Transaction, TransactionManager};
use crate::undo::VersionArena;
use crate::value::Value;
use crate::{BedrockError, IndexId, Result};

static NEXT_INDEX_ID: AtomicU32 = AtomicU32::new(1);

fn next_index_id() -> IndexId {
    NEXT_INDEX_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
pub struct TableBuilder {
    name: String,
    columns: Vec<ColumnDef>,
    pk: Vec<usize>,
    secondaries: Vec<(String, Vec<usize>, bool)>,
    tree_config: TreeConfig,
    inline_limit: usize,
    lock_wait: Duration,
}

impl TableBuilder {
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[usize]) -> Self {
        self.pk = columns.to_vec();
        self
    }

    pub fn index(mut self, name: &str, columns: &[usize], unique: bool) -> Self {
        self.secondaries
            .push((name.to_string(), columns.to_vec(), unique));
        self
    }

    pub fn tree_config(mut self, config: TreeConfig) -> Self {
        self.tree_config = config;
        self
    }

    pub fn inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    pub fn lock_wait(mut self, timeout: Duration) -> Self {
        self.lock_wait = timeout;
        self
    }

    pub fn build(self) -> Result<Arc<Table>> {
        if self.pk.is_empty() {
            return Err(BedrockError::Unsupported(format!(
                "table {} has no primary key",
                self.name
            )));
        }
        for column in &self.columns {
            column.ty.check().map_err(|_| {
                BedrockError::Unsupported(format!(
                    "column {}.{} has an unsupported type {:?}",
                    self.name, column.name, column.ty
                ))
            })?;
        }
        let known = |cols: &[usize]| cols.iter().all(|&c| c < self.columns.len());
        if !known(&self.pk) || !self.secondaries.iter().all(|(_, cols, _)| known(cols)) {
            return Err(BedrockError::Unsupported(format!(
                "table {} indexes a column it does not have",
                self.name
            )));
        }
        let clustered_def = IndexDef::clustered(
            next_index_id(),
            &format!("{}.primary", self.name),
            &self.columns,
            &self.pk,
        );
        let clustered = IndexTree::new(clustered_def, self.tree_config.clone());
        let secondaries = self
            .secondaries
            .iter()
            .map(|(name, cols, unique)| {
                let def = IndexDef::secondary(
                    next_index_id(),
                    &format!("{}.{name}", self.name),
                    &self.columns,
                    cols,
                    &self.pk,
                    *unique,
                );
                IndexTree::new(def, self.tree_config.clone())
            })
            .collect();
        Ok(Arc::new(Table {
            name: self.name,
            columns: self.columns,
            pk: self.pk,
            clustered,
            secondaries,
            versions: Arc::new(VersionArena::new()),
            overflow: Arc::new(OverflowStore::new(self.inline_limit)),
            lock_wait: self.lock_wait,
        }))
    }
}

#[derive(Debug)]
pub struct Table {
    name: String,
    columns: Vec<ColumnDef>,
    pk: Vec<usize>,
    clustered: Arc<IndexTree>,
    secondaries: Vec<Arc<IndexTree>>,
    versions: Arc<VersionArena>,
    overflow: Arc<OverflowStore>,
    lock_wait: Duration,
}

impl Table {
    pub fn builder(name: &str) -> TableBuilder {
        TableBuilder {
            name: name.to_string(),
            columns: Vec::new(),
            pk: Vec::new(),
            secondaries: Vec::new(),
            tree_config: TreeConfig::default(),
            inline_limit: crate::blob::DEFAULT_INLINE_LIMIT,
            lock_wait: Duration::from_secs(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[usize] {
        &self.pk
    }

    pub fn clustered(&self) -> &Arc<IndexTree> {
        &self.clustered
    }

    pub fn secondaries(&self) -> &[Arc<IndexTree>] {
        &self.secondaries
    }

    /// Looks an index up by its short name (`primary` or the secondary name).
    pub fn index(&self, name: &str) -> Option<&Arc<IndexTree>> {
        let full = format!("{}.{name}", self.name);
        std::iter::once(&self.clustered)
            .chain(self.secondaries.iter())
            .find(|tree| tree.def().name == full)
    }

    pub fn versions(&self) -> &Arc<VersionArena> {
        &self.versions
    }

    pub fn overflow(&self) -> &Arc<OverflowStore> {
        &self.overflow
    }

    fn encode_row(&self, row: &[Value]) -> Result<Vec<Field>> {
        if row.len() != self.columns.len() {
            return Err(BedrockError::Unsupported(format!(
                "row has {} values, table {} has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            )));
        }
        row.iter()
            .zip(&self.columns)
            .enumerate()
            .map(|(col_no, (value, col))| {
                if value.is_null() && !col.nullable {
                    return Err(BedrockError::InvalidValue {
                        col_no,
                        reason: "column is NOT NULL".to_string(),
                    });
                }
                match value.to_field(col_no, col.ty)? {
                    Field::Value(bytes)
                        if col.ty.may_overflow() && self.overflow.should_externalize(bytes.len()) =>
                    {
                        Ok(Field::External(self.overflow.store(Bytes::from(bytes))?))
                    }
                    field => Ok(field),
                }
            })
            .collect()
    }

    fn pk_fields(&self, pk: &[Value]) -> Result<Vec<Field>> {
        if pk.len() != self.pk.len() {
            return Err(BedrockError::Unsupported(format!(
                "primary key of {} has {} columns",
                self.name,
                self.pk.len()
            )));
        }
        pk.iter()
            .zip(&self.pk)
            .map(|(value, &col_no)| value.to_field(col_no, self.columns[col_no].ty))
            .collect()
    }

    /// Table row (by column number) carried by a clustered record.
    fn row_fields(&self, view: &RecordView<'_>) -> Result<Vec<Field>> {
        let mut row = vec![Field::Null; self.columns.len()];
        for (pos, col) in self.clustered.def().columns.iter().enumerate() {
            row[col.col_no] = view.field(pos)?.to_field();
        }
        Ok(row)
    }

    fn lock(&self, locks: &LockManager, trx: &Transaction, target: &LockTarget, kind: LockKind) -> Result<()> {
        locks.lock(trx.id(), target, LockMode::Exclusive, kind, self.lock_wait)?;
        Ok(())
    }

    /// Target of the first entry after `key`, or the supremum.
    fn successor_target(&self, tree: &Arc<IndexTree>, key: &[Field]) -> Result<LockTarget> {
        let mut cursor = tree.cursor();
        cursor.open(key, SearchMode::Greater)?;
        let target = match cursor.current()? {
            CursorRecord::User(bytes) => tree.def().lock_target(&RecordView::parse(bytes)?)?,
            _ => tree.def().supremum_target(),
        };
        cursor.release();
        Ok(target)
    }

    /// Inserts one entry after taking an exclusive lock on it and an
    /// insert-intention lock on its successor. If a gap lock was granted on
    /// the successor while the entry went in, the entry is taken back out
    /// and the insert waits for that lock.
    fn insert_entry(
        &self,
        tree: &Arc<IndexTree>,
        record: Bytes,
        trx: &Transaction,
        locks: &LockManager,
    ) -> Result<()> {
        let view = RecordView::parse(&record)?;
        let key = tree.def().ordering_key(&view)?;
        let own = tree.def().lock_target(&view)?;
        self.lock(locks, trx, &own, LockKind::Record)?;
        loop {
            let successor = self.successor_target(tree, &key)?;
            self.lock(locks, trx, &successor, LockKind::InsertIntention)?;
            tree.insert(record.clone(), trx.id())?;

            let successor = self.successor_target(tree, &key)?;
            match locks.request(trx.id(), &successor, LockMode::Exclusive, LockKind::InsertIntention)? {
                LockOutcome::Granted => return Ok(()),
                LockOutcome::Wait(ticket) => {
                    tree.remove(&key)?;
                    log::debug!("trx {} backs out of a locked gap in {}", trx.id(), tree.def().name);
                    locks.wait(ticket, self.lock_wait)?;
                }
            }
        }
    }

    fn check_unique(&self, tree: &Arc<IndexTree>, entry: &[Field]) -> Result<()> {
        let def = tree.def();
        let prefix = &entry[..def.n_unique];
        if !def.unique || prefix.iter().any(Field::is_null) {
            return Ok(());
        }
        let mut cursor = tree.cursor();
        cursor.open(prefix, SearchMode::GreaterOrEqual)?;
        loop {
            let CursorRecord::User(bytes) = cursor.current()? else {
                return Ok(());
            };
            let view = RecordView::parse(bytes)?;
            if def.compare_tuple(prefix, &view)? != std::cmp::Ordering::Equal {
                return Ok(());
            }
            if !view.is_delete_marked() {
                return Err(BedrockError::DuplicateKey {
                    index: def.name.clone(),
                });
            }
            cursor.move_next()?;
        }
    }

    /// Inserts a secondary entry, or clears the delete mark of an identical
    /// one left behind by an earlier delete.
    fn insert_secondary(&self, tree: &Arc<IndexTree>, entry: &[Field], trx: &Transaction, locks: &LockManager) -> Result<()> {
        self.check_unique(tree, entry)?;
        let record = encode_record(entry, RecordMeta::default())?;
        let key = &entry[..tree.def().n_ordering_fields()];
        match tree.find(key)? {
            Some(existing) => {
                let target = tree.def().lock_target(&RecordView::parse(&existing)?)?;
                self.lock(locks, trx, &target, LockKind::Record)?;
                tree.update_in_place(record, trx.id())
            }
            None => self.insert_entry(tree, record, trx, locks),
        }
    }

    fn mark_secondary(&self, tree: &Arc<IndexTree>, entry: &[Field], trx: &Transaction, locks: &LockManager) -> Result<()> {
        let key = &entry[..tree.def().n_ordering_fields()];
        let Some(existing) = tree.find(key)? else {
            return Ok(());
        };
        let target = tree.def().lock_target(&RecordView::parse(&existing)?)?;
        self.lock(locks, trx, &target, LockKind::Record)?;
        let meta = RecordMeta {
            delete_marked: true,
            ..RecordMeta::default()
        };
        tree.update_in_place(restamp(&existing, meta)?, trx.id())
    }

    pub fn insert(&self, trx: &Transaction, locks: &LockManager, row: &[Value]) -> Result<()> {
        failpoint::maybe_fail(failpoint::TABLE_WRITE_ERROR)?;
        let fields = self.encode_row(row)?;
        let entry = self.clustered.def().build_entry(&fields)?;
        let key = &entry[..self.clustered.def().n_ordering_fields()];

        match self.clustered.find(key)? {
            Some(existing) => {
                let view = RecordView::parse(&existing)?;
                self.lock(locks, trx, &self.clustered.def().lock_target(&view)?, LockKind::Record)?;
                // The owner may have changed the row while we waited.
                let current = self.clustered.find(key)?.ok_or(BedrockError::RowNotFound)?;
                let view = RecordView::parse(&current)?;
                if !view.is_delete_marked() {
                    return Err(BedrockError::DuplicateKey {
                        index: self.clustered.def().name.clone(),
                    });
                }
                let old_row = self.row_fields(&view)?;
                let version = self.versions.push(current.clone());
                let meta = RecordMeta {
                    creator_id: trx.id(),
                    version_pointer: Some(version),
                    delete_marked: false,
                };
                self.clustered.update_in_place(encode_record(&entry, meta)?, trx.id())?;
                for tree in &self.secondaries {
                    let old = tree.def().build_entry(&old_row)?;
                    let new = tree.def().build_entry(&fields)?;
                    if old != new {
                        self.mark_secondary(tree, &old, trx, locks)?;
                    }
                    self.insert_secondary(tree, &new, trx, locks)?;
                }
            }
            None => {
                let meta = RecordMeta {
                    creator_id: trx.id(),
                    ..RecordMeta::default()
                };
                self.insert_entry(&self.clustered, encode_record(&entry, meta)?, trx, locks)?;
                for tree in &self.secondaries {
                    let sec = tree.def().build_entry(&fields)?;
                    self.insert_secondary(tree, &sec, trx, locks)?;
                }
            }
        }
        log::trace!("trx {} inserted into {}", trx.id(), self.name);
        Ok(())
    }

    /// Delete-marks the row and its secondary entries. The previous image
    /// goes to the version arena.
    pub fn delete(&self, trx: &Transaction, locks: &LockManager, pk: &[Value]) -> Result<()> {
        failpoint::maybe_fail(failpoint::TABLE_WRITE_ERROR)?;
        let key = self.pk_fields(pk)?;
        let (current, row) = self.lock_current(trx, locks, &key)?;
        let version = self.versions.push(current.clone());
        let meta = RecordMeta {
            creator_id: trx.id(),
            version_pointer: Some(version),
            delete_marked: true,
        };
        self.clustered.update_in_place(restamp(&current, meta)?, trx.id())?;
        for tree in &self.secondaries {
            let entry = tree.def().build_entry(&row)?;
            self.mark_secondary(tree, &entry, trx, locks)?;
        }
        log::trace!("trx {} deleted from {}", trx.id(), self.name);
        Ok(())
    }

    /// Replaces non-key columns of one row.
    pub fn update(
        &self,
        trx: &Transaction,
        locks: &LockManager,
        pk: &[Value],
        changes: &[(usize, Value)],
    ) -> Result<()> {
        failpoint::maybe_fail(failpoint::TABLE_WRITE_ERROR)?;
        if let Some((col_no, _)) = changes.iter().find(|(c, _)| self.pk.contains(c)) {
            return Err(BedrockError::InvalidValue {
                col_no: *col_no,
                reason: "primary-key columns cannot be updated".to_string(),
            });
        }
        let key = self.pk_fields(pk)?;
        let (current, old_row) = self.lock_current(trx, locks, &key)?;

        let mut values = Vec::with_capacity(self.columns.len());
        for (col_no, field) in old_row.iter().enumerate() {
            let value = match changes.iter().find(|(c, _)| *c == col_no) {
                Some((_, v)) => v.clone(),
                None => match field {
                    Field::External(blob) => Value::Bytes(self.overflow.fetch(*blob)?.to_vec()),
                    other => Value::from_field(other.as_field_ref(), self.columns[col_no].ty)?,
                },
            };
            values.push(value);
        }
        let new_row = self.encode_row(&values)?;
        let entry = self.clustered.def().build_entry(&new_row)?;
        let version = self.versions.push(current);
        let meta = RecordMeta {
            creator_id: trx.id(),
            version_pointer: Some(version),
            delete_marked: false,
        };
        self.clustered.update_in_place(encode_record(&entry, meta)?, trx.id())?;

        for tree in &self.secondaries {
            let old = tree.def().build_entry(&old_row)?;
            let new = tree.def().build_entry(&new_row)?;
            if old != new {
                self.mark_secondary(tree, &old, trx, locks)?;
                self.insert_secondary(tree, &new, trx, locks)?;
            }
        }
        log::trace!("trx {} updated a row of {}", trx.id(), self.name);
        Ok(())
    }

    /// Locks the clustered record for `key` and returns its current image,
    /// failing if the row does not exist or is delete-marked.
    fn lock_current(&self, trx: &Transaction, locks: &LockManager, key: &[Field]) -> Result<(Bytes, Vec<Field>)> {
        let existing = self.clustered.find(key)?.ok_or(BedrockError::RowNotFound)?;
        let target = self.clustered.def().lock_target(&RecordView::parse(&existing)?)?;
        self.lock(locks, trx, &target, LockKind::Record)?;
        let current = self.clustered.find(key)?.ok_or(BedrockError::RowNotFound)?;
        let view = RecordView::parse(&current)?;
        if view.is_delete_marked() {
            return Err(BedrockError::RowNotFound);
        }
        let row = self.row_fields(&view)?;
        Ok((current, row))
    }

    /// Physically removes delete-marked entries no read view can still need.
    pub fn purge(&self, manager: &TransactionManager) -> Result<usize> {
        let mut removed = 0;
        let clust_def = self.clustered.def();
        for record in self.clustered.records() {
            let view = RecordView::parse(&record)?;
            if view.is_delete_marked() && manager.is_purgeable(view.creator_id()) {
                if self.clustered.remove(&clust_def.ordering_key(&view)?)? {
                    removed += 1;
                }
            }
        }
        for tree in &self.secondaries {
            let def = tree.def();
            for record in tree.records() {
                let view = RecordView::parse(&record)?;
                if !view.is_delete_marked() {
                    continue;
                }
                let fields = view.to_fields()?;
                let pk: Vec<Field> = self
                    .pk
                    .iter()
                    .map(|col_no| def.field_position(*col_no).map(|pos| fields[pos].clone()))
                    .collect::<Option<_>>()
                    .ok_or_else(|| BedrockError::MalformedRecord(format!("{} lacks the primary key", def.name)))?;
                let still_needed = match self.clustered.find(&pk)? {
                    None => false,
                    Some(clust) => {
                        let clust_view = RecordView::parse(&clust)?;
                        if !manager.is_purgeable(clust_view.creator_id()) {
                            true
                        } else {
                            let row = self.row_fields(&clust_view)?;
                            !clust_view.is_delete_marked() && def.build_entry(&row)? == fields
                        }
                    }
                };
                if !still_needed && tree.remove(&def.ordering_key(&view)?)? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::debug!("purged {removed} entries from {}", self.name);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ColumnType;
    use crate::lock_manager::LockError;
    use crate::transaction::IsolationLevel;

    fn people() -> Arc<Table> {
        Table::builder("people")
            .column(ColumnDef::new("id", ColumnType::Int { len: 4 }).not_null())
            .column(ColumnDef::new("name", ColumnType::VarChar { max_len: 32 }))
            .column(ColumnDef::new("age", ColumnType::Int { len: 2 }))
            .primary_key(&[0])
            .index("by_age", &[2], false)
            .lock_wait(Duration::from_millis(20))
            .build()
            .unwrap()
    }

    #[test]
    fn oversized_integer_columns_are_refused() {
        let built = Table::builder("wide")
            .column(ColumnDef::new("id", ColumnType::Int { len: 9 }).not_null())
            .primary_key(&[0])
            .build();
        assert!(matches!(built, Err(BedrockError::Unsupported(_))));
    }

    fn row(id: i64, name: &str, age: i64) -> Vec<Value> {
        vec![Value::Int(id), Value::from(name), Value::Int(age)]
    }

    #[test]
    fn insert_delete_and_reinsert_keep_versions() {
        let tm = TransactionManager::default();
        let locks = LockManager::new();
        let table = people();

        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        table.insert(&t1, &locks, &row(1, "ann", 30)).unwrap();
        assert!(matches!(
            table.insert(&t1, &locks, &row(1, "dup", 1)),
            Err(BedrockError::DuplicateKey { .. })
        ));
        table.delete(&t1, &locks, &[Value::Int(1)]).unwrap();
        table.insert(&t1, &locks, &row(1, "bob", 40)).unwrap();
        t1.commit();
        locks.release_all(t1.id());

        let records = table.clustered().records();
        assert_eq!(records.len(), 1);
        let view = RecordView::parse(&records[0]).unwrap();
        assert!(!view.is_delete_marked());
        assert_eq!(table.versions().len(), 2);

        let sec = table.index("by_age").unwrap().records();
        assert_eq!(sec.len(), 2);
        let marked = sec
            .iter()
            .filter(|r| RecordView::parse(r).unwrap().is_delete_marked())
            .count();
        assert_eq!(marked, 1);
    }

    #[test]
    fn update_moves_secondary_entry() {
        let tm = TransactionManager::default();
        let locks = LockManager::new();
        let table = people();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        table.insert(&t1, &locks, &row(1, "ann", 30)).unwrap();
        table.update(&t1, &locks, &[Value::Int(1)], &[(2, Value::Int(31))]).unwrap();
        assert!(matches!(
            table.update(&t1, &locks, &[Value::Int(1)], &[(0, Value::Int(5))]),
            Err(BedrockError::InvalidValue { col_no: 0, .. })
        ));
        t1.commit();
        locks.release_all(t1.id());

        let sec = table.index("by_age").unwrap().records();
        assert_eq!(sec.len(), 2);
        assert_eq!(table.purge(&tm).unwrap(), 1);
        assert_eq!(table.index("by_age").unwrap().records().len(), 1);
    }

    #[test]
    fn insert_waits_on_a_gap_lock() {
        let tm = TransactionManager::default();
        let locks = LockManager::new();
        let table = people();
        let setup = tm.begin(IsolationLevel::RepeatableRead);
        table.insert(&setup, &locks, &row(10, "a", 1)).unwrap();
        table.insert(&setup, &locks, &row(20, "b", 2)).unwrap();
        setup.commit();
        locks.release_all(setup.id());

        let reader = tm.begin(IsolationLevel::RepeatableRead);
        let twenty = table.clustered().find(&[Field::int(20, 4)]).unwrap().unwrap();
        let target = table
            .clustered()
            .def()
            .lock_target(&RecordView::parse(&twenty).unwrap())
            .unwrap();
        locks
            .request(reader.id(), &target, LockMode::Shared, LockKind::NextKey)
            .unwrap();

        let writer = tm.begin(IsolationLevel::RepeatableRead);
        let err = table.insert(&writer, &locks, &row(15, "c", 3));
        assert!(matches!(err, Err(BedrockError::Lock(LockError::Timeout))));
        assert!(table.clustered().find(&[Field::int(15, 4)]).unwrap().is_none());

        locks.release_all(reader.id());
        table.insert(&writer, &locks, &row(15, "c", 3)).unwrap();
    }

    #[test]
    fn purge_respects_open_views() {
        let tm = TransactionManager::default();
        let locks = LockManager::new();
        let table = people();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        table.insert(&t1, &locks, &row(1, "ann", 30)).unwrap();
        t1.commit();
        locks.release_all(t1.id());

        let reader = tm.begin(IsolationLevel::RepeatableRead);
        reader.read_view();
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        table.delete(&t2, &locks, &[Value::Int(1)]).unwrap();
        t2.commit();
        locks.release_all(t2.id());

        assert_eq!(table.purge(&tm).unwrap(), 0);
        reader.commit();
        assert_eq!(table.purge(&tm).unwrap(), 2);
        assert!(table.clustered().records().is_empty());
    }

    #[test]
    fn write_failpoint_stops_before_any_change() {
        let tm = TransactionManager::default();
        let locks = LockManager::new();
        let table = people();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let err = {
            let _failing = failpoint::scoped(failpoint::TABLE_WRITE_ERROR);
            table.insert(&t1, &locks, &row(1, "ann", 30))
        };
        assert!(matches!(err, Err(BedrockError::Failpoint(_))));
        assert!(table.clustered().records().is_empty());
    }
}
