#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bedrock::btree::TreeConfig;
use bedrock::index::{ColumnDef, ColumnType};
use bedrock::lock_manager::LockManager;
use bedrock::table::Table;
use bedrock::transaction::{IsolationLevel, Transaction, TransactionManager};
use bedrock::{Field, Value};
use rowseek::access::LockService;
use rowseek::{RowTemplate, ScanDirection, ScanOutcome, ScanRequest, SearchConfig, SearchContext, SearchEngine};

pub const ID: usize = 0;
pub const NAME: usize = 1;
pub const AGE: usize = 2;
pub const NOTE: usize = 3;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `people(id INT PRIMARY KEY, name VARCHAR(32) UNIQUE, age SMALLINT, note BLOB)`
/// with a non-unique index on `age`. Small leaves so scans cross pages.
pub fn people_table(leaf_capacity: usize) -> Arc<Table> {
    Table::builder("people")
        .column(ColumnDef::new("id", ColumnType::Int { len: 4 }).not_null())
        .column(ColumnDef::new("name", ColumnType::VarChar { max_len: 32 }))
        .column(ColumnDef::new("age", ColumnType::Int { len: 2 }))
        .column(ColumnDef::new("note", ColumnType::Blob))
        .primary_key(&[ID])
        .index("by_name", &[NAME], true)
        .index("by_age", &[AGE], false)
        .tree_config(TreeConfig {
            leaf_capacity,
            verify_checksums: true,
        })
        .lock_wait(Duration::from_millis(200))
        .build()
        .unwrap()
}

pub fn person(id: i64, age: i64) -> Vec<Value> {
    vec![
        Value::Int(id),
        Value::Str(format!("name{id}")),
        Value::Int(age),
        Value::Null,
    ]
}

pub fn key(id: i64) -> Field {
    Field::int(id, 4)
}

pub fn age_key(age: i64) -> Field {
    Field::int(age, 2)
}

pub struct Fixture {
    pub tm: TransactionManager,
    pub locks: Arc<LockManager>,
    pub table: Arc<Table>,
    pub engine: SearchEngine,
}

impl Fixture {
    pub fn new(config: SearchConfig) -> Self {
        Self::with_table(people_table(4), config)
    }

    pub fn with_table(table: Arc<Table>, config: SearchConfig) -> Self {
        init_logging();
        let locks = Arc::new(LockManager::new());
        let engine = SearchEngine::new(config, Arc::clone(&locks) as Arc<dyn LockService>);
        Self {
            tm: TransactionManager::default(),
            locks,
            table,
            engine,
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Transaction> {
        self.tm.begin(isolation)
    }

    pub fn commit(&self, trx: &Transaction) {
        trx.commit();
        self.locks.release_all(trx.id());
    }

    /// Inserts `(id, age)` rows in one committed transaction.
    pub fn seed(&self, rows: impl IntoIterator<Item = (i64, i64)>) {
        let trx = self.begin(IsolationLevel::RepeatableRead);
        for (id, age) in rows {
            self.table.insert(&trx, &self.locks, &person(id, age)).unwrap();
        }
        self.commit(&trx);
    }

    pub fn insert(&self, trx: &Transaction, id: i64, age: i64) -> bedrock::Result<()> {
        self.table.insert(trx, &self.locks, &person(id, age))
    }

    pub fn request(&self, index: &str, trx: &Arc<Transaction>) -> ScanRequest {
        ScanRequest::on_table(&self.table, index, Arc::clone(trx)).unwrap()
    }

    /// Every column except `note`. Rows without large values may be
    /// prefetched.
    pub fn inline_template(&self) -> RowTemplate {
        RowTemplate::new(self.table.columns(), &[ID, NAME, AGE]).unwrap()
    }

    /// Fetches until the scan stops with something other than a row or a
    /// yield. Returns the first column of every row and the final outcome.
    pub fn drain(&self, ctx: &mut SearchContext, direction: ScanDirection) -> (Vec<i64>, ScanOutcome) {
        let mut out = vec![0u8; ctx.template().row_len()];
        let mut ids = Vec::new();
        loop {
            match self.engine.fetch(ctx, direction, &mut out) {
                Ok(_) => {
                    let row = ctx.decode_row(&out).unwrap();
                    ids.push(row[0].as_i64().unwrap());
                }
                Err(ScanOutcome::Yielded) => continue,
                Err(outcome) => return (ids, outcome),
            }
        }
    }

    /// Ids of a whole scan, which must end at the end of the index or the
    /// match range.
    pub fn scan_ids(&self, request: ScanRequest) -> Vec<i64> {
        let direction = request.scan_direction();
        let mut ctx = self.engine.open(request).unwrap();
        let (ids, outcome) = self.drain(&mut ctx, direction);
        assert!(outcome.is_terminal(), "scan stopped with {outcome:?}");
        self.engine.close(ctx);
        ids
    }

    pub fn fetch_one(&self, ctx: &mut SearchContext, direction: ScanDirection) -> Result<Vec<Value>, ScanOutcome> {
        let mut out = vec![0u8; ctx.template().row_len()];
        self.engine.fetch(ctx, direction, &mut out)?;
        Ok(ctx.decode_row(&out).unwrap())
    }
}

pub fn first_id(row: &[Value]) -> i64 {
    row[0].as_i64().unwrap()
}
