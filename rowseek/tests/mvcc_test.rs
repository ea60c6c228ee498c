use bedrock::transaction::IsolationLevel;
use bedrock::Value;
use rowseek::{ScanDirection, ScanOptions, ScanOutcome, SearchConfig, SearchTuple};

mod common;

use common::{age_key, first_id, key, Fixture, AGE};

#[test]
fn snapshot_still_sees_a_row_deleted_after_it_was_taken() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 10), (2, 20), (3, 30)]);

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    reader.read_view();

    let writer = fx.begin(IsolationLevel::RepeatableRead);
    fx.table.delete(&writer, &fx.locks, &[Value::Int(2)]).unwrap();
    fx.commit(&writer);

    let request = fx.request("primary", &reader).tuple(SearchTuple::exact(vec![key(2)]));
    let mut ctx = fx.engine.open(request).unwrap();
    let row = fx.fetch_one(&mut ctx, ScanDirection::Ascending).unwrap();
    assert_eq!(row[0], Value::Int(2));
    assert_eq!(row[AGE], Value::Int(20));
    fx.engine.close(ctx);
    assert_eq!(fx.scan_ids(fx.request("primary", &reader)), vec![1, 2, 3]);

    let late = fx.begin(IsolationLevel::RepeatableRead);
    let request = fx.request("primary", &late).tuple(SearchTuple::exact(vec![key(2)]));
    assert!(fx.scan_ids(request).is_empty());
    assert_eq!(fx.scan_ids(fx.request("primary", &late)), vec![1, 3]);
}

#[test]
fn snapshot_ignores_rows_inserted_after_it() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed((1..=10).map(|id| (id * 10, 1)));
    let reader = fx.begin(IsolationLevel::RepeatableRead);
    reader.read_view();

    let writer = fx.begin(IsolationLevel::RepeatableRead);
    for id in [5, 15, 105] {
        fx.insert(&writer, id, 1).unwrap();
    }
    fx.commit(&writer);

    let ids = fx.scan_ids(fx.request("primary", &reader));
    assert_eq!(ids, (1..=10).map(|id| id * 10).collect::<Vec<_>>());
    let ids = fx.scan_ids(fx.request("by_age", &reader).direction(ScanDirection::Descending));
    assert_eq!(ids, (1..=10).rev().map(|id| id * 10).collect::<Vec<_>>());
}

#[test]
fn secondary_entries_follow_the_visible_clustered_version() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 30), (2, 31)]);
    let reader = fx.begin(IsolationLevel::RepeatableRead);
    reader.read_view();

    let writer = fx.begin(IsolationLevel::RepeatableRead);
    fx.table
        .update(&writer, &fx.locks, &[Value::Int(1)], &[(AGE, Value::Int(40))])
        .unwrap();
    fx.commit(&writer);

    // Both the old (30, 1) and the new (40, 1) entry exist; the snapshot
    // must surface row 1 exactly once, with its old age.
    let mut ctx = fx.engine.open(fx.request("by_age", &reader)).unwrap();
    let mut rows = Vec::new();
    while let Ok(row) = fx.fetch_one(&mut ctx, ScanDirection::Ascending) {
        rows.push((first_id(&row), row[AGE].as_i64().unwrap()));
    }
    fx.engine.close(ctx);
    assert_eq!(rows, vec![(1, 30), (2, 31)]);

    let late = fx.begin(IsolationLevel::RepeatableRead);
    assert_eq!(fx.scan_ids(fx.request("by_age", &late)), vec![2, 1]);
    let request = fx.request("by_age", &late).tuple(SearchTuple::prefix(vec![age_key(30)]));
    assert!(fx.scan_ids(request).is_empty());
}

#[test]
fn delete_marked_secondary_and_clustered_rows_are_skipped() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 30), (2, 30), (3, 31)]);

    // An older transaction that stays open keeps the page max trx id of the
    // secondary leaf above every later view's up limit, forcing the
    // clustered check.
    let blocker = fx.begin(IsolationLevel::RepeatableRead);
    let deleter = fx.begin(IsolationLevel::RepeatableRead);
    fx.table.delete(&deleter, &fx.locks, &[Value::Int(2)]).unwrap();
    fx.commit(&deleter);

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    let request = fx.request("by_age", &reader).tuple(SearchTuple::prefix(vec![age_key(30)]));
    let mut ctx = fx.engine.open(request).unwrap();
    let (ids, outcome) = fx.drain(&mut ctx, ScanDirection::Ascending);
    assert_eq!(ids, vec![1]);
    assert!(matches!(outcome, ScanOutcome::NotFound));
    assert!(fx.engine.close(ctx).clustered_lookups >= 2);

    fx.commit(&blocker);
    let reader = fx.begin(IsolationLevel::RepeatableRead);
    assert_eq!(fx.scan_ids(fx.request("by_age", &reader)), vec![1, 3]);
}

#[test]
fn delete_marked_rows_can_be_requested() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 30), (2, 30), (3, 31)]);
    let deleter = fx.begin(IsolationLevel::RepeatableRead);
    fx.table.delete(&deleter, &fx.locks, &[Value::Int(2)]).unwrap();
    fx.commit(&deleter);

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    let request = fx
        .request("primary", &reader)
        .options(ScanOptions::default().include_delete_marked());
    let mut ctx = fx.engine.open(request).unwrap();
    let mut out = vec![0u8; ctx.template().row_len()];
    let mut seen = Vec::new();
    while let Ok(delivered) = fx.engine.fetch_next(&mut ctx, &mut out) {
        seen.push((first_id(&ctx.decode_row(&out).unwrap()), delivered.delete_marked));
    }
    fx.engine.close(ctx);
    assert_eq!(seen, vec![(1, false), (2, true), (3, false)]);
}

#[test]
fn read_committed_sees_commits_at_statement_boundaries() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 10)]);
    let reader = fx.begin(IsolationLevel::ReadCommitted);
    assert_eq!(fx.scan_ids(fx.request("primary", &reader)), vec![1]);

    let writer = fx.begin(IsolationLevel::RepeatableRead);
    fx.insert(&writer, 2, 10).unwrap();
    assert_eq!(fx.scan_ids(fx.request("primary", &reader)), vec![1]);
    fx.commit(&writer);
    assert_eq!(fx.scan_ids(fx.request("primary", &reader)), vec![1]);

    reader.end_statement();
    assert_eq!(fx.scan_ids(fx.request("primary", &reader)), vec![1, 2]);
}

#[test]
fn read_uncommitted_sees_pending_changes() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 10), (2, 20)]);
    let writer = fx.begin(IsolationLevel::RepeatableRead);
    fx.insert(&writer, 3, 30).unwrap();
    fx.table
        .update(&writer, &fx.locks, &[Value::Int(1)], &[(AGE, Value::Int(11))])
        .unwrap();

    let dirty = fx.begin(IsolationLevel::ReadUncommitted);
    assert_eq!(fx.scan_ids(fx.request("primary", &dirty)), vec![1, 2, 3]);
    let request = fx.request("by_age", &dirty).tuple(SearchTuple::prefix(vec![age_key(11)]));
    assert_eq!(fx.scan_ids(request), vec![1]);

    let clean = fx.begin(IsolationLevel::RepeatableRead);
    assert_eq!(fx.scan_ids(fx.request("primary", &clean)), vec![1, 2]);
    let request = fx.request("by_age", &clean).tuple(SearchTuple::prefix(vec![age_key(10)]));
    assert_eq!(fx.scan_ids(request), vec![1]);
    fx.commit(&writer);
}

#[test]
fn own_changes_are_visible() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed([(1, 10)]);
    let trx = fx.begin(IsolationLevel::RepeatableRead);
    trx.read_view();
    fx.insert(&trx, 2, 20).unwrap();
    fx.table.delete(&trx, &fx.locks, &[Value::Int(1)]).unwrap();
    assert_eq!(fx.scan_ids(fx.request("primary", &trx)), vec![2]);
    assert_eq!(fx.scan_ids(fx.request("by_age", &trx)), vec![2]);
    fx.commit(&trx);
}

#[test]
fn purge_does_not_change_what_scans_return() {
    let fx = Fixture::new(SearchConfig::default());
    fx.seed((1..=20).map(|id| (id, id % 3)));
    let deleter = fx.begin(IsolationLevel::RepeatableRead);
    for id in (1..=20).filter(|id| id % 4 == 0) {
        fx.table.delete(&deleter, &fx.locks, &[Value::Int(id)]).unwrap();
    }
    fx.commit(&deleter);

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    let before = fx.scan_ids(fx.request("by_age", &reader));
    fx.commit(&reader);
    assert!(fx.table.purge(&fx.tm).unwrap() > 0);

    let reader = fx.begin(IsolationLevel::RepeatableRead);
    assert_eq!(fx.scan_ids(fx.request("by_age", &reader)), before);
    assert_eq!(
        fx.scan_ids(fx.request("primary", &reader)),
        (1..=20).filter(|id| id % 4 != 0).collect::<Vec<_>>()
    );
}
