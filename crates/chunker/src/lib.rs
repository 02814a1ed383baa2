// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! Bounded-concurrency batch execution over deferred values.
//!
//! [`execute_chunked`] runs one operation per input item, at most
//! `chunk_size` at a time: the next chunk starts only after every operation
//! in the current chunk has settled, optionally after an inter-chunk delay.
//! This is the tool for fanning out against a rate-limited or
//! capacity-limited dependency without writing a worker pool.
//!
//! Failures never abort the batch. The returned value always completes with
//! one `Result` per input item, in input order, and its expiry is the
//! minimum across every item's settled expiry, so the batch as a whole is
//! only as reusable as its shortest-lived member and any failed item (which
//! always settles expired) leaves the whole batch expired. An operation that
//! panics is recorded as that item's failure.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use anysched::Sched;
//! use chunker::execute_chunked;
//! use eventual::Eventual;
//!
//! let sched = Sched::new_inline();
//! let batch = execute_chunked(
//!     &sched,
//!     vec![1, 2, 3, 4, 5],
//!     2,
//!     Duration::ZERO,
//!     |n| Eventual::succeeded(n * n),
//! );
//! batch.on_complete(|outcome| {
//!     let squares: Vec<_> = outcome.unwrap().into_iter().map(Result::unwrap).collect();
//!     assert_eq!(squares, vec![1, 4, 9, 16, 25]);
//! });
//! ```

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anysched::Sched;
use eventual::{Eventual, Expiry, Fault, contained, join};
use parking_lot::Mutex;

struct Driver<I, T, F> {
    sched: Sched,
    op: Mutex<F>,
    items: Mutex<VecDeque<I>>,
    chunk_size: usize,
    delay: Duration,
    outcomes: Mutex<Vec<Result<T, Fault>>>,
    result: Eventual<Vec<Result<T, Fault>>>,
}

impl<I, T, F> Driver<I, T, F>
where
    I: Send + 'static,
    T: Send + 'static,
    F: FnMut(I) -> Eventual<T> + Send + 'static,
{
    fn run_chunk(self: &Arc<Self>) {
        let chunk: Vec<I> = {
            let mut items = self.items.lock();
            let take = self.chunk_size.min(items.len());
            items.drain(..take).collect()
        };

        let operations: Vec<Eventual<T>> = chunk
            .into_iter()
            .map(|item| {
                let started = {
                    let mut op = self.op.lock();
                    contained(|| (op)(item))
                };
                started.unwrap_or_else(Eventual::failed)
            })
            .collect();

        let chunk_done = join(operations);
        let handle = chunk_done.clone();
        let driver = Arc::clone(self);
        chunk_done.on_complete(move |outcome| {
            // join never fails; its expiry is already the minimum over the
            // chunk's successful operations.
            if let Ok(results) = outcome {
                driver.result.reduce_expire(handle.expiry());
                driver.outcomes.lock().extend(results);
            }

            if driver.items.lock().is_empty() {
                let outcomes = mem::take(&mut *driver.outcomes.lock());
                let _ = driver.result.try_complete_at(Expiry::Infinite, outcomes);
            } else {
                // Dispatch through the scheduler even for a zero delay, so
                // a long batch cannot recurse chunk by chunk.
                let next = Arc::clone(&driver);
                driver.sched.schedule(driver.delay, Box::new(move || next.run_chunk()));
            }
        });
    }
}

/// Runs `op` once per item, at most `chunk_size` operations in flight.
///
/// Completes with per-item outcomes in input order once every item has
/// settled. The batch's expiry is the minimum over its items' expiries. An
/// empty `items` completes immediately with an empty list.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
#[must_use]
pub fn execute_chunked<I, T, F>(
    sched: &Sched,
    items: Vec<I>,
    chunk_size: usize,
    inter_chunk_delay: Duration,
    op: F,
) -> Eventual<Vec<Result<T, Fault>>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: FnMut(I) -> Eventual<T> + Send + 'static,
{
    assert!(chunk_size > 0, "chunk size must be positive");

    if items.is_empty() {
        return Eventual::succeeded_at(Expiry::Infinite, Vec::new());
    }

    let result = Eventual::pending();
    let driver = Arc::new(Driver {
        sched: sched.clone(),
        op: Mutex::new(op),
        items: Mutex::new(items.into()),
        chunk_size,
        delay: inter_chunk_delay,
        outcomes: Mutex::new(Vec::new()),
        result: result.clone(),
    });
    driver.run_chunk();
    result
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use eventual::fault;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Eventual<Vec<Result<u32, Fault>>>: Send, Clone);

    #[derive(Debug, thiserror::Error)]
    #[error("item {0} rejected")]
    struct Rejected(u32);

    fn wait_outcomes<T: Clone + Send + 'static>(
        batch: &Eventual<Vec<Result<T, Fault>>>,
    ) -> Vec<Result<T, Fault>> {
        let (tx, rx) = mpsc::channel();
        batch.on_complete(move |outcome| tx.send(outcome).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap()
    }

    #[test]
    fn outcomes_keep_input_order_across_chunks() {
        let sched = Sched::new_inline();
        let batch = execute_chunked(&sched, (0..7_u32).collect(), 3, Duration::ZERO, |n| {
            Eventual::succeeded(n * 2)
        });

        let values: Vec<u32> =
            wait_outcomes(&batch).into_iter().map(|result| result.unwrap()).collect();
        assert_eq!(values, vec![0, 2, 4, 6, 8, 10, 12]);
    }

    #[test]
    fn failures_stay_in_place_and_do_not_abort() {
        let sched = Sched::new_inline();
        let batch = execute_chunked(&sched, vec![1_u32, 2, 3], 2, Duration::ZERO, |n| {
            if n == 2 { Eventual::failed(fault(Rejected(n))) } else { Eventual::succeeded(n) }
        });

        let outcomes = wait_outcomes(&batch);
        assert_eq!(*outcomes[0].as_ref().unwrap(), 1);
        assert!(outcomes[1].as_ref().unwrap_err().downcast_ref::<Rejected>().is_some());
        assert_eq!(*outcomes[2].as_ref().unwrap(), 3);
    }

    #[test]
    fn panicking_op_is_recorded_as_that_items_failure() {
        let sched = Sched::new_inline();
        let batch = execute_chunked(&sched, vec![1_u32, 2], 1, Duration::ZERO, |n| {
            if n == 1 {
                panic!("op exploded");
            }
            Eventual::succeeded(n)
        });

        let outcomes = wait_outcomes(&batch);
        assert!(outcomes[0].is_err());
        assert_eq!(*outcomes[1].as_ref().unwrap(), 2);
    }

    #[test]
    fn empty_batch_completes_immediately() {
        let sched = Sched::new_inline();
        let batch: Eventual<Vec<Result<u32, Fault>>> =
            execute_chunked(&sched, Vec::new(), 4, Duration::ZERO, Eventual::succeeded);

        assert!(batch.is_settled());
        assert_eq!(batch.expiry(), Expiry::Infinite);
        assert!(wait_outcomes(&batch).is_empty());
    }

    #[test]
    #[should_panic(expected = "chunk size must be positive")]
    fn zero_chunk_size_panics() {
        let sched = Sched::new_inline();
        let _ = execute_chunked(&sched, vec![1_u32], 0, Duration::ZERO, Eventual::succeeded);
    }

    #[test]
    fn at_most_chunk_size_operations_in_flight() {
        let sched = Sched::new_inline();
        let started = Arc::new(Mutex::new(Vec::new()));

        let launched = Arc::clone(&started);
        let batch = execute_chunked(&sched, (0..4_u32).collect(), 2, Duration::ZERO, move |n| {
            let pending = Eventual::pending();
            launched.lock().push((n, pending.clone()));
            pending
        });

        assert_eq!(started.lock().len(), 2);

        let first_chunk: Vec<_> = started.lock().drain(..).collect();
        for (n, pending) in first_chunk {
            pending.complete(n);
        }

        // The second chunk goes through the scheduler's timer.
        let deadline = Instant::now() + Duration::from_secs(5);
        while started.lock().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(started.lock().len(), 2);
        assert!(!batch.is_settled());

        let second_chunk: Vec<_> = started.lock().drain(..).collect();
        for (n, pending) in second_chunk {
            pending.complete(n);
        }
        let values: Vec<u32> =
            wait_outcomes(&batch).into_iter().map(|result| result.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn inter_chunk_delay_is_respected() {
        let sched = Sched::new_inline();
        let start = Instant::now();

        let batch = execute_chunked(
            &sched,
            vec![1_u32, 2],
            1,
            Duration::from_millis(80),
            Eventual::succeeded,
        );

        assert_eq!(wait_outcomes(&batch).len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn batch_expiry_is_the_minimum_item_expiry() {
        let sched = Sched::new_inline();
        let near = Instant::now() + Duration::from_secs(10);
        let far = Instant::now() + Duration::from_secs(600);

        let batch = execute_chunked(&sched, vec![far, near], 1, Duration::ZERO, |deadline| {
            Eventual::succeeded_at(Expiry::At(deadline), deadline)
        });

        let _ = wait_outcomes(&batch);
        assert_eq!(batch.expiry(), Expiry::At(near));
    }
}
