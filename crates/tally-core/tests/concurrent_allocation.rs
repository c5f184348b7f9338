//! Concurrent writers on one store file.
//!
//! Each thread opens its own connection, the way separate server instances
//! would, and races the others for the same counter.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::json;
use tally_core::config::{LedgerConfig, SequenceConfig};
use tally_core::model::{Actor, CollectionPath, Fields, JobChild, RootCollection};
use tally_core::sequence::{self, SequenceKey};
use tally_core::store::Store;
use tempfile::TempDir;

const THREADS: usize = 10;
const PER_THREAD: usize = 10;

fn config() -> LedgerConfig {
    LedgerConfig {
        sequence: SequenceConfig {
            max_attempts: 10,
            retry_delay_ms: 5,
        },
        ..LedgerConfig::default()
    }
}

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("ledger.sqlite3");
    // Create and migrate once before the writers start.
    Store::open(&path, config()).expect("open store");
    (dir, path)
}

fn race<T: Send + 'static>(
    path: &Path,
    work: impl Fn(usize, &mut Store) -> T + Send + Sync + 'static,
) -> Vec<T> {
    let barrier = Arc::new(Barrier::new(THREADS));
    let work = Arc::new(work);
    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            let path = path.to_path_buf();
            thread::spawn(move || {
                let mut store = Store::open(&path, config()).expect("open store");
                barrier.wait();
                work(worker, &mut store)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect()
}

#[test]
fn hundred_concurrent_allocations_are_exactly_one_to_hundred() {
    let (_dir, path) = setup();

    let per_worker = race(&path, |_, store| {
        let key = SequenceKey::tenant_level("acme", "jobNumber");
        (0..PER_THREAD)
            .map(|_| store.allocate(&key).expect("allocate"))
            .collect::<Vec<i64>>()
    });

    for values in &per_worker {
        assert!(
            values.windows(2).all(|w| w[0] < w[1]),
            "one writer saw non-increasing values: {values:?}"
        );
    }
    let all: Vec<i64> = per_worker.into_iter().flatten().collect();
    let unique: BTreeSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), THREADS * PER_THREAD);
    assert_eq!(unique.len(), all.len(), "duplicate sequence number issued");

    let expected: BTreeSet<i64> = (1..=i64::try_from(THREADS * PER_THREAD).unwrap()).collect();
    assert_eq!(unique, expected);
}

#[test]
fn concurrent_online_creates_get_distinct_numbers() {
    let (_dir, path) = setup();

    let created = race(&path, |worker, store| {
        let actor = Actor::new(format!("u-{worker}"), "Worker");
        (0..3)
            .map(|_| {
                let event = store
                    .create_online(
                        "acme",
                        &CollectionPath::Root(RootCollection::Jobs),
                        Fields::new(),
                        &actor,
                    )
                    .expect("create");
                event.after.expect("after")["jobNumber"]
                    .as_i64()
                    .expect("number")
            })
            .collect::<Vec<i64>>()
    });

    let numbers: BTreeSet<i64> = created.into_iter().flatten().collect();
    assert_eq!(numbers.len(), THREADS * 3);
    assert_eq!(numbers.first(), Some(&1));
    assert_eq!(numbers.last(), Some(&i64::try_from(THREADS * 3).unwrap()));
}

#[test]
fn per_job_counters_are_independent_under_contention() {
    let (_dir, path) = setup();

    let mut store = Store::open(&path, config()).expect("open store");
    let actor = Actor::system();
    let jobs: Vec<String> = (0..2)
        .map(|_| {
            store
                .create_online(
                    "acme",
                    &CollectionPath::Root(RootCollection::Jobs),
                    Fields::new(),
                    &actor,
                )
                .expect("create job")
                .doc_id
        })
        .collect();
    let shared_jobs = Arc::new(jobs.clone());

    race(&path, move |worker, store| {
        let job = &shared_jobs[worker % 2];
        let costs = CollectionPath::job_child(job.as_str(), JobChild::Costs);
        for _ in 0..4 {
            store
                .create_online("acme", &costs, json_body(), &Actor::system())
                .expect("create cost");
        }
    });

    for job in &jobs {
        let key = SequenceKey::new("acme", job.as_str(), "costs.ordinalNumber");
        assert_eq!(sequence::peek(store.conn(), &key).unwrap(), 20);

        let costs = CollectionPath::job_child(job.as_str(), JobChild::Costs);
        let numbers: BTreeSet<i64> = store
            .list("acme", &costs)
            .unwrap()
            .iter()
            .filter_map(tally_core::model::Document::sequence_number)
            .collect();
        assert_eq!(numbers, (1..=20).collect());
    }
}

fn json_body() -> Fields {
    match json!({"amount": 10}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}
