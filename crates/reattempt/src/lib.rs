// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! Attempt-indexed retry for deferred-value operations.
//!
//! [`retry`] wraps an operation factory: on each attempt it invokes the
//! factory with the attempt index (first attempt is 0) and, on failure,
//! consults a [`RetryPolicy`]. If the policy allows another attempt, the
//! next one is scheduled after the policy's delay; otherwise the wrapper
//! fails permanently with the last cause.
//!
//! A factory that panics is treated identically to an asynchronous failure.
//! There is no wall-clock bound beyond what the policy encodes; callers
//! bound attempts through [`RetryPolicy::should_retry`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use anysched::Sched;
//! use eventual::Eventual;
//! use reattempt::{Backoff, retry};
//!
//! let sched = Sched::new_inline();
//! let outcome = retry(
//!     &sched,
//!     |attempt| Eventual::succeeded(attempt * 10),
//!     Backoff::new(3).fixed_delay(Duration::from_millis(10)),
//! );
//! outcome.on_complete(|result| assert_eq!(result.unwrap(), 0));
//! ```

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anysched::Sched;
use eventual::{Eventual, Fault, contained};
use parking_lot::Mutex;

/// Decides whether and when a failed attempt is followed by another.
///
/// `attempt` is the index of the attempt that just failed; the first
/// attempt has index 0.
pub trait RetryPolicy: Send + Sync + 'static {
    /// Returns `true` if attempt `attempt + 1` should be made.
    fn should_retry(&self, attempt: u32) -> bool;

    /// The delay to wait before attempt `attempt + 1`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// A bounded-attempts policy with a pluggable per-attempt delay.
///
/// `Backoff::new(n)` allows `n` total attempts with no delay between them;
/// use [`fixed_delay`](Self::fixed_delay) or [`with_delay`](Self::with_delay)
/// to add one.
pub struct Backoff {
    max_attempts: u32,
    delay: Box<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl Debug for Backoff {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").field("max_attempts", &self.max_attempts).finish_non_exhaustive()
    }
}

impl Backoff {
    /// A policy allowing `max_attempts` total attempts, with no delay.
    ///
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero. The first attempt always runs
    /// before any policy is consulted, so a zero bound is unsatisfiable.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "at least one attempt is required");
        Self {
            max_attempts,
            delay: Box::new(|_| Duration::ZERO),
        }
    }

    /// Uses the same delay before every follow-up attempt.
    #[must_use]
    pub fn fixed_delay(self, delay: Duration) -> Self {
        self.with_delay(move |_| delay)
    }

    /// Computes the delay from the index of the attempt that just failed.
    #[must_use]
    pub fn with_delay(mut self, delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }
}

impl RetryPolicy for Backoff {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        (self.delay)(attempt)
    }
}

struct Driver<T, F> {
    sched: Sched,
    factory: Mutex<F>,
    policy: Box<dyn RetryPolicy>,
    result: Eventual<T>,
}

impl<T, F> Driver<T, F>
where
    T: Send + 'static,
    F: FnMut(u32) -> Eventual<T> + Send + 'static,
{
    fn attempt(self: &Arc<Self>, attempt: u32) {
        let operation = {
            let mut factory = self.factory.lock();
            contained(|| (factory)(attempt))
        };

        match operation {
            Ok(operation) => {
                let driver = Arc::clone(self);
                let handle = operation.clone();
                operation.on_complete(move |outcome| match outcome {
                    Ok(value) => {
                        // Propagate the successful attempt's expiry.
                        let _ = driver.result.try_complete_at(handle.expiry(), value);
                    }
                    Err(cause) => driver.attempt_failed(attempt, cause),
                });
            }
            Err(fault) => self.attempt_failed(attempt, fault),
        }
    }

    fn attempt_failed(self: &Arc<Self>, attempt: u32, cause: Fault) {
        if self.policy.should_retry(attempt) {
            let driver = Arc::clone(self);
            let delay = self.policy.delay(attempt);
            self.sched.schedule(delay, Box::new(move || driver.attempt(attempt + 1)));
        } else {
            let _ = self.result.try_fail(cause);
        }
    }
}

/// Runs `factory` until an attempt succeeds or `policy` gives up.
///
/// Returns a deferred value that settles with the first successful
/// attempt's value (and expiry), or with the last failure's cause once the
/// policy declines a further attempt.
#[must_use]
pub fn retry<T, F>(sched: &Sched, factory: F, policy: impl RetryPolicy) -> Eventual<T>
where
    T: Send + 'static,
    F: FnMut(u32) -> Eventual<T> + Send + 'static,
{
    let result = Eventual::pending();
    let driver = Arc::new(Driver {
        sched: sched.clone(),
        factory: Mutex::new(factory),
        policy: Box::new(policy),
        result: result.clone(),
    });
    driver.attempt(0);
    result
}
