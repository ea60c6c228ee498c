use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use bedrock::transaction::IsolationLevel;
use bedrock::Value;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rowseek::{ScanDirection, SearchConfig};

mod common;

use common::{Fixture, AGE};

const KEYS: i64 = 200;
const WRITERS: u64 = 4;

/// Random single-row inserts, updates and deletes, one transaction per
/// batch. Lock timeouts and missing rows are part of the game.
fn writer(fx: &Fixture, seed: u64, stop: &AtomicBool, committed: &AtomicU64) {
    let mut rng = StdRng::seed_from_u64(seed);
    while !stop.load(Ordering::Relaxed) {
        let trx = fx.begin(IsolationLevel::RepeatableRead);
        for _ in 0..rng.gen_range(1..5) {
            let id = rng.gen_range(1..=KEYS);
            let result = match rng.gen_range(0..3) {
                0 => fx.insert(&trx, id, rng.gen_range(0..50)),
                1 => fx
                    .table
                    .update(&trx, &fx.locks, &[Value::Int(id)], &[(AGE, Value::Int(rng.gen_range(0..50)))]),
                _ => fx.table.delete(&trx, &fx.locks, &[Value::Int(id)]),
            };
            if let Err(e) = result {
                log::debug!("writer {seed}: {e}");
            }
        }
        fx.commit(&trx);
        committed.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn snapshots_stay_stable_under_concurrent_writers() {
    let config = SearchConfig::default()
        .with_fetch_cache_size(8)
        .with_cache_threshold(2)
        .with_yield_cost(7);
    let fx = Fixture::new(config);
    fx.seed((1..=KEYS).filter(|id| id % 2 == 0).map(|id| (id, id % 50)));

    let stop = AtomicBool::new(false);
    let committed = AtomicU64::new(0);
    thread::scope(|s| {
        for seed in 0..WRITERS {
            let (fx, stop, committed) = (&fx, &stop, &committed);
            s.spawn(move || writer(fx, seed, stop, committed));
        }

        for round in 0..20 {
            let reader = fx.begin(IsolationLevel::RepeatableRead);
            let scan = || fx.request("primary", &reader).template(fx.inline_template());
            let first = fx.scan_ids(scan());
            assert!(first.windows(2).all(|w| w[0] < w[1]), "round {round}: {first:?}");

            thread::sleep(Duration::from_millis(5));
            let again = fx.scan_ids(scan());
            assert_eq!(first, again, "round {round}: snapshot moved");

            let request = scan().direction(ScanDirection::Descending);
            let mut backwards = fx.scan_ids(request);
            backwards.reverse();
            assert_eq!(first, backwards, "round {round}: descending scan differs");
            fx.commit(&reader);
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert!(committed.load(Ordering::Relaxed) > 0);
}

#[test]
fn secondary_scans_agree_with_the_clustered_index() {
    let fx = Fixture::new(SearchConfig::default().with_yield_cost(5));
    fx.seed((1..=KEYS).map(|id| (id, id % 7)));

    // Writers only move rows between ages, so every secondary change lands
    // together with its clustered change.
    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        for seed in 0..WRITERS {
            let (fx, stop) = (&fx, &stop);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + seed);
                while !stop.load(Ordering::Relaxed) {
                    let trx = fx.begin(IsolationLevel::RepeatableRead);
                    let id = rng.gen_range(1..=KEYS);
                    let age = rng.gen_range(0..7);
                    if let Err(e) = fx.table.update(&trx, &fx.locks, &[Value::Int(id)], &[(AGE, Value::Int(age))]) {
                        log::debug!("writer {seed}: {e}");
                    }
                    fx.commit(&trx);
                }
            });
        }

        for round in 0..20 {
            let reader = fx.begin(IsolationLevel::RepeatableRead);
            let mut by_age = fx.scan_ids(fx.request("by_age", &reader));
            by_age.sort_unstable();
            let primary = fx.scan_ids(fx.request("primary", &reader));
            assert_eq!(by_age, primary, "round {round}");
            assert_eq!(primary.len() as i64, KEYS);
            fx.commit(&reader);
        }
        stop.store(true, Ordering::Relaxed);
    });
}
