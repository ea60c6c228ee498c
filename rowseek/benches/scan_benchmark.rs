use criterion::{black_box, criterion_group, criterion_main, Criterion};
use bedrock::btree::TreeConfig;
use bedrock::index::{ColumnDef, ColumnType};
use bedrock::lock_manager::LockManager;
use bedrock::table::Table;
use bedrock::transaction::{IsolationLevel, TransactionManager};
use bedrock::Value;
use rowseek::access::LockService;
use rowseek::{RowTemplate, ScanOptions, ScanRequest, SearchConfig, SearchEngine};
use std::sync::Arc;

const ROWS: i64 = 10_000;

fn setup_table() -> (Arc<Table>, TransactionManager, Arc<LockManager>) {
    let table = Table::builder("bench")
        .column(ColumnDef::new("id", ColumnType::Int { len: 8 }).not_null())
        .column(ColumnDef::new("name", ColumnType::VarChar { max_len: 32 }))
        .column(ColumnDef::new("value", ColumnType::Int { len: 8 }))
        .primary_key(&[0])
        .index("by_value", &[2], false)
        .tree_config(TreeConfig {
            leaf_capacity: 64,
            verify_checksums: true,
        })
        .build()
        .unwrap();
    let tm = TransactionManager::default();
    let locks = Arc::new(LockManager::new());

    let trx = tm.begin(IsolationLevel::RepeatableRead);
    for i in 0..ROWS {
        table
            .insert(&trx, &locks, &[Value::Int(i), Value::Str(format!("name{i}")), Value::Int(i % 100)])
            .unwrap();
    }
    trx.commit();
    locks.release_all(trx.id());

    (table, tm, locks)
}

fn drain(engine: &SearchEngine, request: ScanRequest) -> u64 {
    let mut ctx = engine.open(request).unwrap();
    let mut out = vec![0u8; ctx.template().row_len()];
    let mut rows = 0;
    while engine.fetch_next(&mut ctx, &mut out).is_ok() {
        rows += 1;
    }
    engine.close(ctx);
    rows
}

fn benchmark_full_scan(c: &mut Criterion) {
    let (table, tm, locks) = setup_table();
    let engine = SearchEngine::new(SearchConfig::default(), locks as Arc<dyn LockService>);

    c.bench_function("primary_full_scan", |b| {
        b.iter(|| {
            let trx = tm.begin(IsolationLevel::RepeatableRead);
            let request = ScanRequest::on_table(&table, "primary", Arc::clone(&trx)).unwrap();
            let rows = drain(&engine, black_box(request));
            trx.commit();
            rows
        })
    });
}

fn benchmark_covering_scan(c: &mut Criterion) {
    let (table, tm, locks) = setup_table();
    let engine = SearchEngine::new(SearchConfig::default(), locks as Arc<dyn LockService>);
    let template = RowTemplate::new(table.columns(), &[2, 0]).unwrap();

    c.bench_function("covering_secondary_scan", |b| {
        b.iter(|| {
            let trx = tm.begin(IsolationLevel::RepeatableRead);
            let request = ScanRequest::on_table(&table, "by_value", Arc::clone(&trx))
                .unwrap()
                .template(template.clone());
            let rows = drain(&engine, black_box(request));
            trx.commit();
            rows
        })
    });
}

fn benchmark_fetch_cache(c: &mut Criterion) {
    let (table, tm, locks) = setup_table();
    let engine = SearchEngine::new(SearchConfig::default(), locks as Arc<dyn LockService>);

    let mut group = c.benchmark_group("fetch_cache");
    for (name, options) in [
        ("with_cache", ScanOptions::default()),
        ("without_cache", ScanOptions::default().without_cache()),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let trx = tm.begin(IsolationLevel::RepeatableRead);
                let request = ScanRequest::on_table(&table, "primary", Arc::clone(&trx))
                    .unwrap()
                    .options(options.clone());
                let rows = drain(&engine, black_box(request));
                trx.commit();
                rows
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_full_scan, benchmark_covering_scan, benchmark_fetch_cache);
criterion_main!(benches);
