// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anysched::{ExecContext, Sched, current_context};
use parking_lot::Mutex;

use crate::expiry::Expiry;
use crate::fault::Fault;

struct Subscriber<T> {
    context: Option<ExecContext>,
    callback: Box<dyn FnOnce(Result<T, Fault>) + Send>,
}

struct SharedState<T> {
    expiry: Expiry,
    outcome: Option<Result<T, Fault>>,
    subscribers: Vec<Subscriber<T>>,
}

struct SharedInner<T> {
    settled: AtomicBool,
    state: Mutex<SharedState<T>>,
    sched: Sched,
}

/// A deferred value safe for concurrent completion and subscription across
/// worker threads.
///
/// Unlike [`Eventual`](crate::Eventual), any number of independent
/// subscribers may register, from any thread. Each subscription captures the
/// execution context active at registration time; at completion every
/// subscriber either runs inline (when the completing thread is already on
/// that subscriber's context) or is dispatched onto it, so a callback never
/// runs on a context other than the one that registered it.
///
/// Completion is protected by an internal lock: exactly one of several
/// concurrent `try_complete`/`try_fail` calls wins, and the outcome is
/// published before the settled flag, so a `true` from
/// [`is_settled`](Self::is_settled) always comes with a consistent outcome.
///
/// Subscribers receive a clone of the value, hence the `T: Clone` bound.
///
/// # Strict context diagnostics
///
/// With the `strict-context` cargo feature enabled, a second registration
/// from a *different* context than the first panics. This exists to catch
/// context-affinity mistakes in test suites; production builds append the
/// subscriber instead.
pub struct SharedEventual<T> {
    inner: Arc<SharedInner<T>>,
}

impl<T> Clone for SharedEventual<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for SharedEventual<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEventual")
            .field("settled", &self.inner.settled.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> SharedEventual<T> {
    /// Creates a pending value dispatching through `sched`.
    #[must_use]
    pub fn pending(sched: &Sched) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                settled: AtomicBool::new(false),
                state: Mutex::new(SharedState {
                    expiry: Expiry::Infinite,
                    outcome: None,
                    subscribers: Vec::new(),
                }),
                sched: sched.clone(),
            }),
        }
    }

    /// Creates an already-succeeded value with the given expiry.
    #[must_use]
    pub fn succeeded_at(sched: &Sched, expiry: Expiry, value: T) -> Self {
        let this = Self::pending(sched);
        let settled = this.try_complete_at(expiry, value);
        debug_assert!(settled);
        this
    }

    /// Creates an already-failed value.
    #[must_use]
    pub fn failed(sched: &Sched, cause: Fault) -> Self {
        let this = Self::pending(sched);
        let settled = this.try_fail(cause);
        debug_assert!(settled);
        this
    }

    /// Returns `true` if both handles refer to the same underlying cell.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns `true` once the value is settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    /// The value's current expiry.
    #[must_use]
    pub fn expiry(&self) -> Expiry {
        self.inner.state.lock().expiry
    }

    /// Reduces the expiry to `min(current, expiry)`.
    pub fn reduce_expire(&self, expiry: Expiry) {
        let mut state = self.inner.state.lock();
        state.expiry = state.expiry.min(expiry);
    }

    /// Clones the settled outcome, if any.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, Fault>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Settles the value successfully with [`Expiry::Expired`].
    ///
    /// # Panics
    ///
    /// Panics if the value is already settled.
    pub fn complete(&self, value: T) {
        assert!(self.try_complete(value), "deferred value is already settled");
    }

    /// Settles the value successfully with the given expiry.
    ///
    /// # Panics
    ///
    /// Panics if the value is already settled.
    pub fn complete_at(&self, expiry: Expiry, value: T) {
        assert!(self.try_complete_at(expiry, value), "deferred value is already settled");
    }

    /// Settles the value with a failure.
    ///
    /// # Panics
    ///
    /// Panics if the value is already settled.
    pub fn fail(&self, cause: Fault) {
        assert!(self.try_fail(cause), "deferred value is already settled");
    }

    /// Non-panicking [`complete`](Self::complete); returns `false` if the
    /// value was already settled.
    pub fn try_complete(&self, value: T) -> bool {
        self.try_settle(Expiry::Expired, Ok(value))
    }

    /// Non-panicking [`complete_at`](Self::complete_at); returns `false` if
    /// the value was already settled.
    pub fn try_complete_at(&self, expiry: Expiry, value: T) -> bool {
        self.try_settle(expiry, Ok(value))
    }

    /// Non-panicking [`fail`](Self::fail); returns `false` if the value was
    /// already settled.
    pub fn try_fail(&self, cause: Fault) -> bool {
        self.try_settle(Expiry::Expired, Err(cause))
    }

    /// Registers a subscriber, capturing the execution context active on the
    /// calling thread.
    ///
    /// If the value is already settled the callback runs synchronously and
    /// immediately; the captured context is by construction the current one,
    /// so affinity holds trivially.
    pub fn on_complete(&self, callback: impl FnOnce(Result<T, Fault>) + Send + 'static) {
        let context = current_context();
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            let outcome = outcome.clone();
            drop(state);
            callback(outcome);
            return;
        }

        #[cfg(feature = "strict-context")]
        if let Some(existing) = state.subscribers.first() {
            let matches = match (&existing.context, &context) {
                (Some(a), Some(b)) => a.same_as(b),
                (None, None) => true,
                _ => false,
            };
            assert!(matches, "subscriber registered from a different execution context than the first");
        }

        state.subscribers.push(Subscriber {
            context,
            callback: Box::new(callback),
        });
    }

    fn try_settle(&self, expiry: Expiry, outcome: Result<T, Fault>) -> bool {
        let mut state = self.inner.state.lock();
        if state.outcome.is_some() {
            return false;
        }

        state.expiry = if outcome.is_err() { Expiry::Expired } else { state.expiry.min(expiry) };
        // Outcome first, flag second: readers that observe the flag are
        // guaranteed a populated outcome.
        state.outcome = Some(outcome.clone());
        self.inner.settled.store(true, Ordering::Release);
        let subscribers = mem::take(&mut state.subscribers);
        drop(state);

        let completing_on = current_context();
        for subscriber in subscribers {
            let value = outcome.clone();
            match subscriber.context {
                Some(context) => {
                    let inline = completing_on.as_ref().is_some_and(|current| current.same_as(&context));
                    if inline {
                        (subscriber.callback)(value);
                    } else {
                        let callback = subscriber.callback;
                        self.inner.sched.run_on(&context, Box::new(move || callback(value)));
                    }
                }
                None => (subscriber.callback)(value),
            }
        }
        true
    }
}

impl<T: Clone + Send + 'static> crate::Settleable for SharedEventual<T> {
    fn try_fail(&self, cause: Fault) -> bool {
        Self::try_fail(self, cause)
    }

    fn is_settled(&self) -> bool {
        Self::is_settled(self)
    }
}
