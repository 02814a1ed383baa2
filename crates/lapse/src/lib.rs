// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! A generational timeout sweeper for deferred values.
//!
//! A [`Sweeper`] watches deferred values that are expected to settle within
//! a fixed timeout, and fails the ones that do not with a
//! [`TimeoutError`]. It never races a normal completion into a panic: the
//! sweep uses the non-panicking [`Settleable::try_fail`] path, so a value
//! that settles concurrently simply wins.
//!
//! Tracking is cheap by construction. Values are grouped into generations
//! that rotate once per sweep interval, so [`Sweeper::track`] is a single
//! push under a mutex and the sweep walks whole generations instead of a
//! per-value timer wheel. The price is slack: a value is failed somewhere
//! between `timeout` and `timeout + 2 * tolerance` after it was tracked,
//! never earlier.
//!
//! Tracking names the execution context the value's callbacks are affine
//! to; the timeout failure is dispatched onto it, or runs on the sweeper
//! thread when the value has no affinity.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use anysched::Sched;
//! use eventual::Eventual;
//! use lapse::Sweeper;
//!
//! let sched = Sched::new_inline();
//! let sweeper = Sweeper::builder("lookups", Duration::from_secs(5), &sched).build();
//!
//! let pending: Eventual<u32> = Eventual::pending();
//! sweeper.track(None, Box::new(pending.clone()));
//!
//! // Settling normally makes the sweeper skip the value.
//! pending.complete(42);
//! sweeper.shutdown();
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anysched::{ExecContext, Sched};
use eventual::{Fault, Settleable, fault};
use parking_lot::{Condvar, Mutex};

/// The failure a [`Sweeper`] settles abandoned values with.
#[derive(Debug, Clone, thiserror::Error)]
#[error("\"{name}\" value did not settle within {timeout:?}")]
pub struct TimeoutError {
    name: Box<str>,
    timeout: Duration,
    tracked_at: Instant,
}

impl TimeoutError {
    /// The name of the sweeper that timed the value out.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The timeout the value exceeded.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the value's generation was opened.
    #[must_use]
    pub fn tracked_at(&self) -> Instant {
        self.tracked_at
    }
}

type CauseFactory = Box<dyn Fn(Instant) -> Fault + Send + Sync>;

struct Entry {
    context: Option<ExecContext>,
    value: Box<dyn Settleable>,
}

struct Generation {
    opened_at: Instant,
    entries: Vec<Entry>,
}

impl Generation {
    fn open(now: Instant) -> Self {
        Self { opened_at: now, entries: Vec::new() }
    }
}

struct Shared {
    name: Box<str>,
    timeout: Duration,
    tolerance: Duration,
    cause_factory: CauseFactory,
    sched: Sched,
    current: Mutex<Generation>,
    stop: Mutex<bool>,
    stop_cond: Condvar,
}

impl Shared {
    fn run(&self) {
        // Aged from the instant the generation *closed*, so an entry is
        // never failed less than `timeout` after it was tracked.
        let mut backlog: VecDeque<(Instant, Generation)> = VecDeque::new();

        loop {
            let now = Instant::now();
            let rotated = {
                let mut current = self.current.lock();
                std::mem::replace(&mut *current, Generation::open(now))
            };
            if !rotated.entries.is_empty() {
                backlog.push_back((now, rotated));
            }

            while let Some((closed_at, _)) = backlog.front() {
                if now < *closed_at + self.timeout {
                    break;
                }
                let generation = backlog.pop_front();
                if let Some((_, generation)) = generation {
                    self.sweep(generation);
                }
            }

            let mut stop = self.stop.lock();
            if *stop {
                break;
            }
            self.stop_cond.wait_for(&mut stop, self.tolerance);
            if *stop {
                break;
            }
        }

        // Fail whatever is still being tracked so no value dangles forever.
        let last = {
            let mut current = self.current.lock();
            std::mem::replace(&mut *current, Generation::open(Instant::now()))
        };
        backlog.push_back((Instant::now(), last));
        for (_, generation) in backlog {
            self.sweep(generation);
        }
    }

    fn sweep(&self, generation: Generation) {
        let mut expired = 0_usize;
        for entry in generation.entries {
            if entry.value.is_settled() {
                continue;
            }
            expired += 1;
            let cause = (self.cause_factory)(generation.opened_at);
            let value = entry.value;
            match entry.context {
                Some(context) => {
                    self.sched.run_on(
                        &context,
                        Box::new(move || {
                            let _ = value.try_fail(cause);
                        }),
                    );
                }
                None => {
                    let _ = value.try_fail(cause);
                }
            }
        }
        if expired > 0 {
            tracing::debug!(
                sweeper = &*self.name,
                expired,
                "failed deferred values that exceeded the timeout"
            );
        }
    }
}

/// Configures and creates a [`Sweeper`].
pub struct Builder {
    name: Box<str>,
    timeout: Duration,
    tolerance: Duration,
    cause_factory: Option<CauseFactory>,
    sched: Sched,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// How much later than `timeout` a value may be failed.
    ///
    /// This is the sweep interval: smaller values time out more precisely
    /// at the cost of more frequent sweeps. Defaults to a tenth of the
    /// timeout, clamped to at least 50 milliseconds.
    #[must_use]
    pub fn tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Replaces the [`TimeoutError`] cause with a custom one.
    ///
    /// The factory receives the instant the value's generation was opened.
    #[must_use]
    pub fn cause(mut self, factory: impl Fn(Instant) -> Fault + Send + Sync + 'static) -> Self {
        self.cause_factory = Some(Box::new(factory));
        self
    }

    /// Creates the sweeper and starts its background thread.
    ///
    /// # Panics
    ///
    /// Panics if the tolerance is below 50 milliseconds or above the
    /// timeout.
    #[must_use]
    pub fn build(self) -> Sweeper {
        assert!(
            self.tolerance >= Duration::from_millis(50),
            "sweep tolerance must be at least 50ms"
        );
        assert!(self.tolerance <= self.timeout, "sweep tolerance cannot exceed the timeout");

        let cause_factory = self.cause_factory.unwrap_or_else(|| {
            let name = self.name.clone();
            let timeout = self.timeout;
            Box::new(move |tracked_at| {
                fault(TimeoutError { name: name.clone(), timeout, tracked_at })
            })
        });

        let shared = Arc::new(Shared {
            name: self.name,
            timeout: self.timeout,
            tolerance: self.tolerance,
            cause_factory,
            sched: self.sched,
            current: Mutex::new(Generation::open(Instant::now())),
            stop: Mutex::new(false),
            stop_cond: Condvar::new(),
        });

        let runner = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("lapse-{}", shared.name))
            .spawn(move || runner.run())
            .ok();

        Sweeper { shared, thread: Mutex::new(thread) }
    }
}

/// Fails tracked deferred values that do not settle within a timeout.
///
/// See the [crate docs](crate) for the generational sweep model and its
/// timing guarantees.
pub struct Sweeper {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Starts configuring a sweeper named `name` with the given timeout.
    ///
    /// Timeout failures are dispatched through `sched` when the tracking
    /// thread had an execution context.
    #[must_use]
    pub fn builder(name: &str, timeout: Duration, sched: &Sched) -> Builder {
        let tolerance = (timeout / 10).max(Duration::from_millis(50)).min(timeout);
        Builder {
            name: name.into(),
            timeout,
            tolerance,
            cause_factory: None,
            sched: sched.clone(),
        }
    }

    /// Tracks `value`, failing it if it does not settle within the timeout.
    ///
    /// Values that settle on their own are skipped by the sweep. When
    /// `context` is given, the timeout failure is dispatched onto it so it
    /// runs where the value's handlers expect to; pass
    /// [`current_context()`](anysched::current_context) to keep the
    /// caller's affinity.
    pub fn track(&self, context: Option<ExecContext>, value: Box<dyn Settleable>) {
        self.shared.current.lock().entries.push(Entry { context, value });
    }

    /// Stops the sweep thread.
    ///
    /// Values still being tracked are failed during shutdown rather than
    /// left to dangle. Dropping the sweeper does the same.
    pub fn shutdown(&self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.stop_cond.notify_all();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("name", &self.shared.name)
            .field("timeout", &self.shared.timeout)
            .field("tolerance", &self.shared.tolerance)
            .finish_non_exhaustive()
    }
}
