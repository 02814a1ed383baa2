// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! End-to-end batch scenarios against a real scheduler.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anysched::Sched;
use chunker::execute_chunked;
use eventual::{Eventual, Expiry, Fault, fault};
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("rejected {0}")]
struct Rejected(String);

fn wait_outcomes<T: Clone + Send + 'static>(
    batch: &Eventual<Vec<Result<T, Fault>>>,
) -> Vec<Result<T, Fault>> {
    let (tx, rx) = mpsc::channel();
    batch.on_complete(move |outcome| tx.send(outcome).unwrap());
    let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    // The batch as a whole always reports success.
    outcome.unwrap()
}

#[test]
fn one_bad_item_among_ten_fails_alone() {
    let sched = Sched::new_threaded();
    let items: Vec<String> = (1..=10).map(|n| format!("Test{n}")).collect();

    let batch = execute_chunked(&sched, items, 2, Duration::ZERO, |item: String| {
        if item == "Test5" {
            Eventual::failed(fault(Rejected(item)))
        } else {
            Eventual::succeeded(item)
        }
    });

    let outcomes = wait_outcomes(&batch);
    assert_eq!(outcomes.len(), 10);
    for (index, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok(item) => assert_eq!(*item, format!("Test{}", index + 1)),
            Err(cause) => {
                assert_eq!(index, 4);
                assert!(cause.downcast_ref::<Rejected>().is_some());
            }
        }
    }
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_err()).count(), 1);
}

#[test]
fn any_failed_item_leaves_the_batch_expired() {
    let sched = Sched::new_threaded();
    let far = Instant::now() + Duration::from_secs(600);

    let batch = execute_chunked(&sched, vec![1_u32, 2, 3], 2, Duration::ZERO, move |n| {
        if n == 2 {
            Eventual::failed(fault(Rejected(n.to_string())))
        } else {
            Eventual::succeeded_at(Expiry::At(far), n)
        }
    });

    let outcomes = wait_outcomes(&batch);
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_err()).count(), 1);
    assert!(batch.expiry().is_expired());
}

#[test]
fn second_item_starts_no_earlier_than_the_delay() {
    let sched = Sched::new_threaded();
    let submitted = Instant::now();
    let starts = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&starts);
    let batch = execute_chunked(&sched, vec![1_u32, 2], 1, Duration::from_millis(500), move |n| {
        log.lock().push((n, Instant::now()));
        Eventual::succeeded(n)
    });

    assert_eq!(wait_outcomes(&batch).len(), 2);

    let starts = starts.lock();
    assert_eq!(starts[0].0, 1);
    let (second, started_at) = starts[1];
    assert_eq!(second, 2);
    assert!(started_at - submitted >= Duration::from_millis(500));
}
