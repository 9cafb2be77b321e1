//! Recording from many threads while pings are collected.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tally_core::{CommonMetricData, Lifetime, MetricRegistry, MetricType, MetricValue, TallyConfig};
use tally_engine::{Snapshot, Tally};

fn launches() -> CommonMetricData {
    CommonMetricData::new("app", "launches", MetricType::Counter)
}

fn counted(snapshot: Option<Snapshot>) -> i64 {
    match snapshot.as_ref().and_then(|s| s.get(MetricType::Counter, "app", "launches")) {
        Some(MetricValue::Counter(n)) => *n,
        Some(other) => panic!("unexpected value {other:?}"),
        None => 0,
    }
}

#[test]
fn increments_from_two_threads_are_all_counted() {
    let tally = Arc::new(Tally::in_memory(
        MetricRegistry::new().with_metric(launches()).unwrap(),
    ));

    let a = {
        let tally = Arc::clone(&tally);
        thread::spawn(move || {
            tally.record(&launches(), MetricValue::Counter(1));
            tally.record(&launches(), MetricValue::Counter(1));
        })
    };
    let b = {
        let tally = Arc::clone(&tally);
        thread::spawn(move || tally.record(&launches(), MetricValue::Counter(1)))
    };
    a.join().unwrap();
    b.join().unwrap();

    assert_eq!(counted(tally.collect("metrics")), 3);
    assert!(tally.collect("metrics").is_none());
}

#[test]
fn no_increment_is_lost_or_double_counted_across_collections() {
    const THREADS: i64 = 8;
    const PER_THREAD: i64 = 500;

    let tally = Arc::new(Tally::in_memory(
        MetricRegistry::new().with_metric(launches()).unwrap(),
    ));
    let done = Arc::new(AtomicBool::new(false));

    let collector = {
        let tally = Arc::clone(&tally);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut total = 0;
            while !done.load(Ordering::SeqCst) {
                total += counted(tally.collect("metrics"));
                thread::yield_now();
            }
            total
        })
    };

    let recorders: Vec<_> = (0..THREADS)
        .map(|_| {
            let tally = Arc::clone(&tally);
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    tally.record(&launches(), MetricValue::Counter(1));
                }
            })
        })
        .collect();
    for recorder in recorders {
        recorder.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let collected = collector.join().unwrap();
    let remainder = counted(tally.collect("metrics"));
    assert_eq!(collected + remainder, THREADS * PER_THREAD);
}

#[test]
fn multi_ping_writes_stay_consistent_under_collection() {
    let both = launches().with_pings(["metrics", "baseline"]);
    let tally = Arc::new(Tally::in_memory(
        MetricRegistry::new().with_metric(both.clone()).unwrap(),
    ));

    let recorders: Vec<_> = (0..4)
        .map(|_| {
            let tally = Arc::clone(&tally);
            let both = both.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    tally.record(&both, MetricValue::Counter(1));
                }
            })
        })
        .collect();

    let mut metrics = 0;
    let mut baseline = 0;
    for _ in 0..50 {
        metrics += counted(tally.collect("metrics"));
        baseline += counted(tally.collect("baseline"));
    }
    for recorder in recorders {
        recorder.join().unwrap();
    }
    metrics += counted(tally.collect("metrics"));
    baseline += counted(tally.collect("baseline"));

    assert_eq!(metrics, 1000);
    assert_eq!(baseline, 1000);
}

#[test]
fn concurrent_set_additions_union() {
    let tags = CommonMetricData::new("app", "tags", MetricType::StringSet)
        .with_lifetime(Lifetime::Application);
    let tally = Arc::new(Tally::in_memory(
        MetricRegistry::new().with_metric(tags.clone()).unwrap(),
    ));

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let tally = Arc::clone(&tally);
            let tags = tags.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    tally.record(&tags, MetricValue::string_set_item(&format!("{t}-{i}")));
                    tally.collect("metrics");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    match tally.value(&tags, "metrics") {
        Some(MetricValue::StringSet(items)) => {
            let expected: BTreeSet<String> = (0..4)
                .flat_map(|t| (0..25).map(move |i| format!("{t}-{i}")))
                .collect();
            assert_eq!(items, expected);
        }
        other => panic!("unexpected value {other:?}"),
    }
}

#[test]
fn durable_engine_accepts_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let config = TallyConfig {
        writer: tally_core::WriterConfig {
            batch_size: 16,
            ..Default::default()
        },
        ..TallyConfig::with_data_dir(dir.path())
    };
    let user = launches().with_lifetime(Lifetime::User);
    let tally = Arc::new(Tally::init(
        config.clone(),
        MetricRegistry::new().with_metric(user.clone()).unwrap(),
    ));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let tally = Arc::clone(&tally);
            let user = user.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    tally.record(&user, MetricValue::Counter(1));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    tally.shutdown();
    drop(tally);

    let tally = Tally::init(config, MetricRegistry::new().with_metric(user.clone()).unwrap());
    assert_eq!(tally.value(&user, "metrics"), Some(MetricValue::Counter(400)));
}

#[test]
fn wipes_racing_records_keep_disk_and_memory_in_step() {
    let dir = tempfile::tempdir().unwrap();
    let config = TallyConfig {
        writer: tally_core::WriterConfig {
            queue_capacity: 100_000,
            ..Default::default()
        },
        ..TallyConfig::with_data_dir(dir.path())
    };
    let user = launches().with_lifetime(Lifetime::User);
    let registry = || MetricRegistry::new().with_metric(user.clone()).unwrap();
    let tally = Arc::new(Tally::init(config.clone(), registry()));

    let recorders: Vec<_> = (0..4)
        .map(|_| {
            let tally = Arc::clone(&tally);
            let user = user.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    tally.record(&user, MetricValue::Counter(1));
                }
            })
        })
        .collect();
    for _ in 0..200 {
        tally.wipe_all();
        thread::yield_now();
    }
    for recorder in recorders {
        recorder.join().unwrap();
    }
    assert!(!tally.is_persistence_degraded(Lifetime::User));

    let in_memory = tally.value(&user, "metrics");
    tally.shutdown();
    drop(tally);

    let tally = Tally::init(config, registry());
    assert_eq!(tally.value(&user, "metrics"), in_memory);
}
