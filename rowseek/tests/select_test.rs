use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bedrock::index::{ColumnDef, ColumnType};
use bedrock::table::Table;
use bedrock::transaction::IsolationLevel;
use bedrock::Value;
use rowseek::select::{equi_join, Aggregate, AggregateFn, Executor, IndexScan, NestedLoopJoin, UpdateInPlace};
use rowseek::{LockWaitPolicy, RowTemplate, ScanOutcome, SearchConfig, SearchTuple, SelectError, SelectLock};

mod common;

use common::{age_key, key, people_table, Fixture, AGE, ID, NAME};

const ORDER_ID: usize = 0;
const PERSON_ID: usize = 1;
const AMOUNT: usize = 2;

/// `orders(order_id INT PRIMARY KEY, person_id INT, amount INT)` with a
/// non-unique index on `person_id`.
fn orders_table() -> Arc<Table> {
    Table::builder("orders")
        .column(ColumnDef::new("order_id", ColumnType::Int { len: 4 }).not_null())
        .column(ColumnDef::new("person_id", ColumnType::Int { len: 4 }))
        .column(ColumnDef::new("amount", ColumnType::Int { len: 4 }))
        .primary_key(&[ORDER_ID])
        .index("by_person", &[PERSON_ID], false)
        .lock_wait(Duration::from_millis(200))
        .build()
        .unwrap()
}

fn collect(exec: &mut dyn Executor) -> Vec<Vec<Value>> {
    let mut rows = Vec::new();
    while let Some(row) = exec.next().unwrap() {
        rows.push(row);
    }
    rows
}

fn ints(rows: &[Vec<Value>]) -> Vec<Vec<i64>> {
    rows.iter()
        .map(|row| row.iter().filter_map(Value::as_i64).collect())
        .collect()
}

#[test]
fn index_scan_returns_template_columns_in_index_order() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 40), (2, 20), (3, 30), (4, 20)]);
    let trx = fx.begin(IsolationLevel::RepeatableRead);

    let template = RowTemplate::new(fx.table.columns(), &[AGE, ID]).unwrap();
    let request = fx.request("by_age", &trx).template(template);
    let mut scan = IndexScan::new(&fx.engine, request).unwrap();
    let rows = collect(&mut scan);
    assert_eq!(ints(&rows), vec![vec![20, 2], vec![20, 4], vec![30, 3], vec![40, 1]]);
    assert!(scan.next().unwrap().is_none());

    scan.rebind(SearchTuple::prefix(vec![age_key(20)])).unwrap();
    assert_eq!(ints(&collect(&mut scan)), vec![vec![20, 2], vec![20, 4]]);
    assert_eq!(scan.finish().clustered_lookups, 0);
}

#[test]
fn nested_loop_join_looks_up_the_inner_index_per_outer_row() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 30), (2, 40), (3, 50)]);
    let orders = orders_table();
    let trx = fx.begin(IsolationLevel::RepeatableRead);
    for (order_id, person_id, amount) in [(100, 1, 5), (101, 1, 7), (102, 3, 9), (103, 4, 1)] {
        orders
            .insert(&trx, &fx.locks, &[Value::Int(order_id), Value::Int(person_id), Value::Int(amount)])
            .unwrap();
    }
    fx.commit(&trx);

    let trx = fx.begin(IsolationLevel::RepeatableRead);
    let outer_template = RowTemplate::new(fx.table.columns(), &[ID, NAME]).unwrap();
    let outer = IndexScan::new(&fx.engine, fx.request("primary", &trx).template(outer_template)).unwrap();
    let inner_template = RowTemplate::new(orders.columns(), &[ORDER_ID, AMOUNT]).unwrap();
    let inner_request = rowseek::ScanRequest::on_table(&orders, "by_person", Arc::clone(&trx))
        .unwrap()
        .template(inner_template);
    let inner = IndexScan::new(&fx.engine, inner_request).unwrap();
    let bind = equi_join(vec![(0, PERSON_ID, ColumnType::Int { len: 4 })]);

    let mut join = NestedLoopJoin::new(Box::new(outer), inner, bind);
    let rows = collect(&mut join);
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(1), Value::from("name1"), Value::Int(100), Value::Int(5)],
            vec![Value::Int(1), Value::from("name1"), Value::Int(101), Value::Int(7)],
            vec![Value::Int(3), Value::from("name3"), Value::Int(102), Value::Int(9)],
        ]
    );
    let stats = join.finish();
    assert_eq!(stats.rows_fetched, 3);
}

#[test]
fn aggregate_over_a_joined_scan() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 30), (2, 40)]);
    let orders = orders_table();
    let trx = fx.begin(IsolationLevel::RepeatableRead);
    for (order_id, person_id, amount) in [(1, 1, 10), (2, 2, 20), (3, 2, 12)] {
        orders
            .insert(&trx, &fx.locks, &[Value::Int(order_id), Value::Int(person_id), Value::Int(amount)])
            .unwrap();
    }
    fx.commit(&trx);

    let trx = fx.begin(IsolationLevel::RepeatableRead);
    let outer_template = RowTemplate::new(fx.table.columns(), &[ID]).unwrap();
    let outer = IndexScan::new(&fx.engine, fx.request("primary", &trx).template(outer_template)).unwrap();
    let inner_template = RowTemplate::new(orders.columns(), &[AMOUNT]).unwrap();
    let inner_request = rowseek::ScanRequest::on_table(&orders, "by_person", Arc::clone(&trx))
        .unwrap()
        .template(inner_template);
    let inner = IndexScan::new(&fx.engine, inner_request).unwrap();
    let join = NestedLoopJoin::new(
        Box::new(outer),
        inner,
        equi_join(vec![(0, PERSON_ID, ColumnType::Int { len: 4 })]),
    );

    let mut agg = Aggregate::new(
        Box::new(join),
        vec![
            AggregateFn::Count,
            AggregateFn::Sum(1),
            AggregateFn::Min(1),
            AggregateFn::Max(1),
        ],
    );
    let row = agg.next().unwrap().unwrap();
    assert_eq!(row, vec![Value::Int(3), Value::Int(42), Value::Int(10), Value::Int(20)]);
    assert!(agg.next().unwrap().is_none());
}

#[test]
fn update_in_place_rewrites_matching_rows_under_exclusive_locks() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed((1..=6).map(|id| (id, id * 10)));
    let before = fx.begin(IsolationLevel::RepeatableRead);
    before.read_view();

    let writer = fx.begin(IsolationLevel::RepeatableRead);
    let update = UpdateInPlace::new(
        &fx.engine,
        Arc::clone(&fx.table),
        Arc::clone(&writer),
        Arc::clone(&fx.locks),
        SearchTuple::range_from(vec![key(3)]),
        Box::new(|row: &[Value]| match row[AGE].as_i64() {
            Some(age) if age < 60 => Some(vec![(AGE, Value::Int(age + 1))]),
            _ => None,
        }),
    )
    .unwrap();
    assert_eq!(update.execute().unwrap(), 3);

    // The writer sees its own changes; an older snapshot does not.
    let request = fx.request("by_age", &writer).tuple(SearchTuple::prefix(vec![age_key(41)]));
    assert_eq!(fx.scan_ids(request), vec![4]);
    let request = fx.request("by_age", &before).tuple(SearchTuple::prefix(vec![age_key(40)]));
    assert_eq!(fx.scan_ids(request), vec![4]);

    // Scanned rows and the gap after the last one stay locked.
    let other = fx.begin(IsolationLevel::RepeatableRead);
    assert!(fx
        .table
        .update(&other, &fx.locks, &[Value::Int(6)], &[(AGE, Value::Int(0))])
        .is_err());
    assert!(fx.insert(&other, 7, 70).is_err());
    fx.table
        .update(&other, &fx.locks, &[Value::Int(1)], &[(AGE, Value::Int(0))])
        .unwrap();
    fx.commit(&other);

    fx.commit(&writer);
    let after = fx.begin(IsolationLevel::RepeatableRead);
    let mut scan = IndexScan::new(&fx.engine, fx.request("primary", &after)).unwrap();
    let ages: Vec<i64> = collect(&mut scan).iter().filter_map(|row| row[AGE].as_i64()).collect();
    assert_eq!(ages, vec![0, 20, 31, 41, 51, 60]);
}

#[test]
fn update_in_place_streams_the_changed_rows() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 1), (2, 2), (3, 3)]);
    let writer = fx.begin(IsolationLevel::ReadCommitted);
    let mut update = UpdateInPlace::new(
        &fx.engine,
        Arc::clone(&fx.table),
        Arc::clone(&writer),
        Arc::clone(&fx.locks),
        SearchTuple::full_scan(),
        Box::new(|row: &[Value]| match row[ID].as_i64() {
            Some(2) | None => None,
            Some(id) => Some(vec![(NAME, Value::Str(format!("renamed{id}")))]),
        }),
    )
    .unwrap();

    let first = update.next().unwrap().unwrap();
    assert_eq!((first[ID].clone(), first[NAME].clone()), (Value::Int(1), Value::from("renamed1")));
    assert_eq!(update.updated(), 1);
    let second = update.next().unwrap().unwrap();
    assert_eq!(second[ID], Value::Int(3));
    assert!(update.next().unwrap().is_none());
    assert_eq!(update.updated(), 2);
    fx.commit(&writer);
}

#[test]
fn index_scan_absorbs_lock_waits() {
    let fx = Fixture::new(
        SearchConfig::default().with_lock_wait(Duration::from_secs(5), LockWaitPolicy::Return),
    );
    fx.seed([(1, 1), (2, 2), (3, 3)]);
    let writer = fx.begin(IsolationLevel::RepeatableRead);
    fx.table
        .update(&writer, &fx.locks, &[Value::Int(2)], &[(AGE, Value::Int(22))])
        .unwrap();

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    let request = fx.request("primary", &reader).lock(SelectLock::Shared);
    let mut scan = IndexScan::new(&fx.engine, request).unwrap();
    let rows = thread::scope(|s| {
        let locks = Arc::clone(&fx.locks);
        let writer = Arc::clone(&writer);
        s.spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.commit();
            locks.release_all(writer.id());
        });
        collect(&mut scan)
    });
    let ages: Vec<i64> = rows.iter().filter_map(|row| row[AGE].as_i64()).collect();
    assert_eq!(ages, vec![1, 22, 3]);
    assert_eq!(scan.finish().lock_waits, 1);
    fx.commit(&reader);
}

#[test]
fn index_scan_reports_what_it_cannot_absorb() {
    let fx = Fixture::with_table(
        people_table(4),
        SearchConfig::default().with_lock_wait(Duration::from_millis(50), LockWaitPolicy::Block),
    );
    fx.seed([(1, 1), (2, 2)]);
    let writer = fx.begin(IsolationLevel::RepeatableRead);
    fx.table.delete(&writer, &fx.locks, &[Value::Int(1)]).unwrap();

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    let request = fx.request("primary", &reader).lock(SelectLock::Exclusive);
    let mut scan = IndexScan::new(&fx.engine, request).unwrap();
    match scan.next() {
        Err(SelectError::Scan { index, outcome }) => {
            assert_eq!(index, "people.primary");
            assert!(matches!(outcome, ScanOutcome::LockTimeout));
        }
        other => panic!("expected a lock timeout, got {other:?}"),
    }
    scan.finish();
    fx.commit(&writer);
    fx.commit(&reader);
}
