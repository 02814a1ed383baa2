// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::context::ExecContext;
use crate::inline::InlineSched;
use crate::threaded::ThreadedSched;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The operations a scheduler implementation must provide.
///
/// Implement this trait to plug a custom environment (an existing event
/// loop, a test harness) underneath [`Sched`]. Implementations must deliver
/// every accepted task exactly once and must run tasks bound to a context
/// on that context's worker, bracketed so that
/// [`current_context`](crate::current_context) reports the context while the
/// task is on the stack (see [`ExecContext`]).
pub trait SchedImpl: Send + Sync {
    /// Creates a new logical worker with the given diagnostic name.
    fn create_context(&self, name: &str) -> ExecContext;

    /// Runs `task` on the worker identified by `context`.
    fn run_on(&self, context: &ExecContext, task: Task);

    /// Runs `task` soon, on no particular context.
    fn run_soon(&self, task: Task);

    /// Runs `task` after at least `delay` has elapsed, on no particular
    /// context.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Cloneable handle to a scheduler implementation.
///
/// All clones share the same underlying workers and timer. See the
/// [crate docs](crate) for the built-in implementations.
#[derive(Clone)]
pub struct Sched(Arc<dyn SchedImpl>);

impl Sched {
    /// Creates a scheduler that backs every context with a dedicated worker
    /// thread.
    #[must_use]
    pub fn new_threaded() -> Self {
        Self(Arc::new(ThreadedSched::new()))
    }

    /// Creates a scheduler that runs context-bound callbacks inline on the
    /// calling thread.
    ///
    /// Delayed callbacks are still serviced by a background timer thread.
    #[must_use]
    pub fn new_inline() -> Self {
        Self(Arc::new(InlineSched::new()))
    }

    /// Wraps a custom [`SchedImpl`].
    pub fn new_custom(imp: impl SchedImpl + 'static) -> Self {
        Self(Arc::new(imp))
    }

    /// Creates a new logical worker with the given diagnostic name.
    #[must_use]
    pub fn create_context(&self, name: &str) -> ExecContext {
        self.0.create_context(name)
    }

    /// Returns the context the calling thread is currently running on, if
    /// any.
    #[must_use]
    pub fn current(&self) -> Option<ExecContext> {
        crate::context::current_context()
    }

    /// Runs `task` on the worker identified by `context`.
    pub fn run_on(&self, context: &ExecContext, task: Task) {
        self.0.run_on(context, task);
    }

    /// Runs `task` soon, on no particular context.
    pub fn run_soon(&self, task: Task) {
        self.0.run_soon(task);
    }

    /// Runs `task` after at least `delay` has elapsed, on no particular
    /// context.
    pub fn schedule(&self, delay: Duration, task: Task) {
        self.0.schedule(delay, task);
    }
}

impl Debug for Sched {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sched").finish_non_exhaustive()
    }
}
