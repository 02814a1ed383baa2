// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::expiry::Expiry;
use crate::fault::Fault;
use crate::value::Eventual;

struct Gather<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Gather<T> {
    fn new(len: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }))
    }

    /// Stores the `index`-th outcome; returns the full list once every slot
    /// is filled.
    fn put(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        debug_assert!(self.slots[index].is_none(), "input settled twice");
        self.slots[index] = Some(value);
        self.remaining -= 1;
        if self.remaining == 0 {
            Some(self.slots.iter_mut().map(|slot| slot.take().expect("gather slot missing")).collect())
        } else {
            None
        }
    }
}

/// Waits for every input to succeed, failing fast on the first failure.
///
/// The result's expiry is reduced by every input's expiry regardless of
/// success or failure. An empty input yields an already-succeeded value with
/// [`Expiry::Infinite`] and an empty list. Values are reported in input
/// order.
///
/// Each input's handler slot is consumed; inputs must not have handlers
/// attached already.
#[must_use]
pub fn all<T: Send + 'static>(inputs: Vec<Eventual<T>>) -> Eventual<Vec<T>> {
    if inputs.is_empty() {
        return Eventual::succeeded_at(Expiry::Infinite, Vec::new());
    }

    let result = Eventual::pending();
    let gather = Gather::new(inputs.len());

    for (index, input) in inputs.into_iter().enumerate() {
        let gather = Arc::clone(&gather);
        let result = result.clone();
        input.on_settled(move |expiry, outcome| {
            result.reduce_expire(expiry);
            match outcome {
                Ok(value) => {
                    let finished = gather.lock().put(index, value);
                    if let Some(values) = finished {
                        let _ = result.try_complete_at(Expiry::Infinite, values);
                    }
                }
                Err(cause) => {
                    // Fail fast; later failures among the remaining inputs
                    // are no-ops against the settled result.
                    let _ = result.try_fail(cause);
                }
            }
        });
    }

    result
}

/// Waits for every input to settle and reports each outcome individually.
///
/// Unlike [`all`], `join` never fails early and never fails at all: per-input
/// failures are data in the result list. The result's expiry is reduced by
/// every input's expiry, and outcomes appear in input order. An empty input
/// yields an already-succeeded value with [`Expiry::Infinite`] and an empty
/// list.
#[must_use]
pub fn join<T: Send + 'static>(inputs: Vec<Eventual<T>>) -> Eventual<Vec<Result<T, Fault>>> {
    if inputs.is_empty() {
        return Eventual::succeeded_at(Expiry::Infinite, Vec::new());
    }

    let result = Eventual::pending();
    let gather = Gather::new(inputs.len());

    for (index, input) in inputs.into_iter().enumerate() {
        let gather = Arc::clone(&gather);
        let result = result.clone();
        input.on_settled(move |expiry, outcome| {
            result.reduce_expire(expiry);
            let finished = gather.lock().put(index, outcome);
            if let Some(outcomes) = finished {
                let _ = result.try_complete_at(Expiry::Infinite, outcomes);
            }
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::fault::fault;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("input {0} failed")]
    struct InputError(usize);

    #[test]
    fn all_of_empty_is_infinite_and_empty() {
        let result = all::<u32>(Vec::new());
        assert!(result.expiry().is_infinite());
        assert!(result.peek().unwrap().unwrap().is_empty());
    }

    #[test]
    fn join_of_empty_is_infinite_and_empty() {
        let result = join::<u32>(Vec::new());
        assert!(result.expiry().is_infinite());
        assert!(result.peek().unwrap().unwrap().is_empty());
    }

    #[test]
    fn all_reports_values_in_input_order() {
        let first = Eventual::pending();
        let second = Eventual::pending();
        let result = all(vec![first.clone(), second.clone()]);

        // Complete out of order.
        second.complete(2);
        assert!(!result.is_settled());
        first.complete(1);

        assert_eq!(result.peek().unwrap().unwrap(), vec![1, 2]);
    }

    #[test]
    fn all_expiry_is_min_across_inputs() {
        let now = Instant::now();
        let soon = now + Duration::from_secs(1);
        let later = now + Duration::from_secs(60);

        let first = Eventual::succeeded_at(Expiry::At(later), 1);
        let second = Eventual::succeeded_at(Expiry::At(soon), 2);
        let result = all(vec![first, second]);

        assert_eq!(result.expiry(), Expiry::At(soon));
    }

    #[test]
    fn all_fails_fast_on_first_failure() {
        let first = Eventual::pending();
        let second = Eventual::pending();
        let result = all(vec![first.clone(), second.clone()]);

        first.fail(fault(InputError(0)));
        assert!(result.is_settled());
        assert!(result.expiry().is_expired());

        // The straggler settling later is harmless.
        second.complete(2);
        let cause = result.peek().unwrap().unwrap_err();
        assert_eq!(cause.downcast_ref::<InputError>().unwrap().0, 0);
    }

    #[test]
    fn join_waits_for_every_input_and_never_fails() {
        let first = Eventual::pending();
        let second = Eventual::pending();
        let result = join(vec![first.clone(), second.clone()]);

        first.fail(fault(InputError(0)));
        // A failure does not settle a join early.
        assert!(!result.is_settled());

        second.complete(2);
        let outcomes = result.peek().unwrap().unwrap();
        assert!(outcomes[0].is_err());
        assert_eq!(*outcomes[1].as_ref().unwrap(), 2);
    }

    #[test]
    fn join_expiry_reduced_by_failures() {
        let ok = Eventual::succeeded_at(Expiry::Infinite, 1);
        let bad: Eventual<u32> = Eventual::failed(fault(InputError(1)));
        let result = join(vec![ok, bad]);

        assert!(result.is_settled());
        assert!(result.expiry().is_expired());
    }
}
