// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::expiry::Expiry;
use crate::fault::{Fault, contained};

type Handler<T> = Box<dyn FnOnce(Expiry, Result<T, Fault>) + Send>;

enum State<T> {
    Pending { handler: Option<Handler<T>> },
    // The outcome is `None` once it has been handed to the handler.
    Done { outcome: Option<Result<T, Fault>> },
}

struct Inner<T> {
    expiry: Expiry,
    state: State<T>,
}

/// A single-assignment deferred value.
///
/// An `Eventual<T>` starts out pending and is settled exactly once, either
/// successfully (with a value and an [`Expiry`]) or with a [`Fault`]. Once
/// settled it never changes again: a second settlement through the panicking
/// API ([`complete`](Self::complete) / [`fail`](Self::fail)) is a
/// programming error, while the `try_*` forms return `false` and leave the
/// value untouched — that tolerance is what lets normal completion race
/// benignly against timeouts and cancellation.
///
/// # Handlers
///
/// This is the single-handler family: exactly one completion handler may be
/// attached over the value's lifetime, via [`on_complete`](Self::on_complete)
/// or one of the combinators (each combinator consumes the handler slot of
/// its source). A handler attached after settlement runs synchronously,
/// before the registration call returns. Use
/// [`SharedEventual`](crate::SharedEventual) when multiple independent
/// subscribers are needed.
///
/// # Expiry
///
/// The one-argument completion forms imply [`Expiry::Expired`]; use
/// [`complete_at`](Self::complete_at) / [`succeeded_at`](Self::succeeded_at)
/// to attach a longer lifetime. Every derived value produced by a combinator
/// is reduce-expired by its source, so a chain can only get shorter-lived.
/// Failures always carry [`Expiry::Expired`].
///
/// # Example
///
/// ```
/// use eventual::Eventual;
///
/// let value = Eventual::pending();
/// let doubled = value.map(|n: u32| n * 2);
///
/// value.complete(21);
/// doubled.on_complete(|outcome| assert_eq!(outcome.unwrap(), 42));
/// ```
pub struct Eventual<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Eventual<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Eventual<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let state = match &inner.state {
            State::Pending { .. } => "pending",
            State::Done { outcome: Some(Ok(_)) } => "succeeded",
            State::Done { outcome: Some(Err(_)) } => "failed",
            State::Done { outcome: None } => "settled",
        };
        f.debug_struct("Eventual").field("state", &state).field("expiry", &inner.expiry).finish()
    }
}

impl<T: Send + 'static> Default for Eventual<T> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<T: Send + 'static> Eventual<T> {
    /// Creates a pending value.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                expiry: Expiry::Infinite,
                state: State::Pending { handler: None },
            })),
        }
    }

    /// Creates an already-succeeded value with [`Expiry::Expired`].
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        Self::succeeded_at(Expiry::Expired, value)
    }

    /// Creates an already-succeeded value with the given expiry.
    #[must_use]
    pub fn succeeded_at(expiry: Expiry, value: T) -> Self {
        let this = Self::pending();
        let settled = this.try_complete_at(expiry, value);
        debug_assert!(settled);
        this
    }

    /// Creates an already-failed value.
    #[must_use]
    pub fn failed(cause: Fault) -> Self {
        let this = Self::pending();
        let settled = this.try_fail(cause);
        debug_assert!(settled);
        this
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
    /// The effective expiry is the minimum of `expiry` and any reductions
    /// applied while the value was pending.
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
        self.settle(Expiry::Expired, Ok(value))
    }

    /// Non-panicking [`complete_at`](Self::complete_at); returns `false` if
    /// the value was already settled.
    pub fn try_complete_at(&self, expiry: Expiry, value: T) -> bool {
        self.settle(expiry, Ok(value))
    }

    /// Non-panicking [`fail`](Self::fail); returns `false` if the value was
    /// already settled.
    pub fn try_fail(&self, cause: Fault) -> bool {
        self.settle(Expiry::Expired, Err(cause))
    }

    /// Returns `true` once the value is settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self.inner.lock().state, State::Done { .. })
    }

    /// The value's current expiry.
    ///
    /// While pending this reflects the reductions applied so far; after
    /// settlement it is final (except for late [`reduce_expire`]
    /// reductions, which only ever shorten it further).
    ///
    /// [`reduce_expire`]: Self::reduce_expire
    #[must_use]
    pub fn expiry(&self) -> Expiry {
        self.inner.lock().expiry
    }

    /// Reduces the expiry to `min(current, expiry)`.
    pub fn reduce_expire(&self, expiry: Expiry) {
        let mut inner = self.inner.lock();
        inner.expiry = inner.expiry.min(expiry);
    }

    /// Clones the settled outcome, if the value is settled and the outcome
    /// has not yet been consumed by a handler.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, Fault>>
    where
        T: Clone,
    {
        match &self.inner.lock().state {
            State::Done { outcome } => outcome.clone(),
            State::Pending { .. } => None,
        }
    }

    /// Attaches the value's single completion handler.
    ///
    /// If the value is already settled the handler runs synchronously,
    /// in-line, before this call returns.
    ///
    /// # Panics
    ///
    /// Panics if a handler was already attached (directly or by a
    /// combinator).
    pub fn on_complete(&self, handler: impl FnOnce(Result<T, Fault>) + Send + 'static) {
        self.on_settled(move |_, outcome| handler(outcome));
    }

    /// Like [`on_complete`](Self::on_complete) but the handler also receives
    /// the settled expiry. This is the primitive the combinators build on.
    pub(crate) fn on_settled(&self, handler: impl FnOnce(Expiry, Result<T, Fault>) + Send + 'static) {
        let mut inner = self.inner.lock();
        match &mut inner.state {
            State::Pending { handler: slot } => {
                assert!(slot.is_none(), "deferred value already has a completion handler");
                *slot = Some(Box::new(handler));
            }
            State::Done { outcome } => {
                let outcome = outcome.take().expect("deferred value outcome was already consumed by a handler");
                let expiry = inner.expiry;
                drop(inner);
                handler(expiry, outcome);
            }
        }
    }

    fn settle(&self, expiry: Expiry, outcome: Result<T, Fault>) -> bool {
        let mut inner = self.inner.lock();
        match &mut inner.state {
            State::Done { .. } => false,
            State::Pending { handler } => {
                let handler = handler.take();
                let expiry = if outcome.is_err() { Expiry::Expired } else { inner.expiry.min(expiry) };
                inner.expiry = expiry;
                match handler {
                    Some(handler) => {
                        inner.state = State::Done { outcome: None };
                        drop(inner);
                        handler(expiry, outcome);
                    }
                    None => inner.state = State::Done { outcome: Some(outcome) },
                }
                true
            }
        }
    }
}

impl<T: Send + 'static> Eventual<T> {
    /// Derives a new value by transforming a successful result.
    ///
    /// Failure propagates untouched. The derived value is reduce-expired by
    /// this value's expiry; a panicking `f` fails the derived value with
    /// [`CallbackPanicked`](crate::CallbackPanicked).
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> Eventual<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Derives a new value by transforming a successful result fallibly.
    ///
    /// An `Err` returned by `f` fails the derived value; this is the
    /// Result-native alternative to panicking inside [`map`](Self::map).
    #[must_use]
    pub fn try_map<U, F>(&self, f: F) -> Eventual<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
    {
        let derived = Eventual::pending();
        let target = derived.clone();
        self.on_settled(move |expiry, outcome| match outcome {
            Ok(value) => match contained(move || f(value)).and_then(|r| r) {
                Ok(mapped) => {
                    let _ = target.try_complete_at(expiry, mapped);
                }
                Err(fault) => {
                    let _ = target.try_fail(fault);
                }
            },
            Err(cause) => {
                let _ = target.try_fail(cause);
            }
        });
        derived
    }

    /// Derives a new value by chaining a follow-up operation (flat-map).
    ///
    /// The derived value settles when the follow-up settles; its expiry is
    /// the minimum of this value's and the follow-up's.
    #[must_use]
    pub fn compose<U, F>(&self, f: F) -> Eventual<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Eventual<U> + Send + 'static,
    {
        let derived = Eventual::pending();
        let target = derived.clone();
        self.on_settled(move |expiry, outcome| match outcome {
            Ok(value) => match contained(move || f(value)) {
                Ok(next) => {
                    target.reduce_expire(expiry);
                    next.on_settled(move |next_expiry, next_outcome| match next_outcome {
                        Ok(next_value) => {
                            let _ = target.try_complete_at(next_expiry, next_value);
                        }
                        Err(cause) => {
                            let _ = target.try_fail(cause);
                        }
                    });
                }
                Err(fault) => {
                    let _ = target.try_fail(fault);
                }
            },
            Err(cause) => {
                let _ = target.try_fail(cause);
            }
        });
        derived
    }

    /// Derives a new value that turns a failure into a success.
    ///
    /// A successful source passes through unchanged. Note that the derived
    /// value is still reduce-expired by the source, and a failed source
    /// carries [`Expiry::Expired`], so a recovered value is never reusable
    /// from a cache's point of view.
    #[must_use]
    pub fn recover<F>(&self, f: F) -> Eventual<T>
    where
        F: FnOnce(Fault) -> T + Send + 'static,
    {
        let derived = Eventual::pending();
        let target = derived.clone();
        self.on_settled(move |expiry, outcome| match outcome {
            Ok(value) => {
                let _ = target.try_complete_at(expiry, value);
            }
            Err(cause) => match contained(move || f(cause)) {
                Ok(recovered) => {
                    let _ = target.try_complete_at(expiry, recovered);
                }
                Err(fault) => {
                    let _ = target.try_fail(fault);
                }
            },
        });
        derived
    }

    /// Derives a new value that replaces a failure with a follow-up
    /// operation (flat-map on the failure path).
    #[must_use]
    pub fn otherwise<F>(&self, f: F) -> Eventual<T>
    where
        F: FnOnce(Fault) -> Eventual<T> + Send + 'static,
    {
        let derived = Eventual::pending();
        let target = derived.clone();
        self.on_settled(move |expiry, outcome| match outcome {
            Ok(value) => {
                let _ = target.try_complete_at(expiry, value);
            }
            Err(cause) => match contained(move || f(cause)) {
                Ok(next) => {
                    target.reduce_expire(expiry);
                    next.on_settled(move |next_expiry, next_outcome| match next_outcome {
                        Ok(next_value) => {
                            let _ = target.try_complete_at(next_expiry, next_value);
                        }
                        Err(next_cause) => {
                            let _ = target.try_fail(next_cause);
                        }
                    });
                }
                Err(fault) => {
                    let _ = target.try_fail(fault);
                }
            },
        });
        derived
    }
}
