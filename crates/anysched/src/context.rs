// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};

use crate::sched::Task;

thread_local! {
    static CURRENT: RefCell<Option<ExecContext>> = const { RefCell::new(None) };
}

/// Returns the execution context the calling thread is currently running on,
/// if any.
///
/// This is `Some` only while a callback dispatched through a context is on
/// the stack; threads not owned by a scheduler report `None`.
#[must_use]
pub fn current_context() -> Option<ExecContext> {
    CURRENT.with(|cur| cur.borrow().clone())
}

/// Runs `task` with `context` installed as the calling thread's current
/// context, restoring the previous one afterwards.
pub(crate) fn enter(context: &ExecContext, task: Task) {
    struct Restore(Option<ExecContext>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT.with(|cur| *cur.borrow_mut() = previous);
        }
    }

    // The guard restores the previous context even if the task unwinds.
    let _restore = Restore(CURRENT.with(|cur| cur.borrow_mut().replace(context.clone())));
    task();
}

/// An affinity token identifying a logical worker.
///
/// Contexts are cheap to clone and compare by identity: two handles refer to
/// the same logical worker exactly when [`ExecContext::same_as`] returns
/// `true`. A context carries no scheduling behavior of its own; callbacks
/// are bound to it through [`Sched::run_on`](crate::Sched::run_on).
#[derive(Clone)]
pub struct ExecContext {
    core: Arc<ContextCore>,
}

pub(crate) struct ContextCore {
    name: Box<str>,
    dispatch: Box<dyn Fn(Task) + Send + Sync>,
}

impl ExecContext {
    pub(crate) fn new(name: &str, dispatch: impl Fn(Task) + Send + Sync + 'static) -> Self {
        Self {
            core: Arc::new(ContextCore {
                name: name.into(),
                dispatch: Box::new(dispatch),
            }),
        }
    }

    /// The diagnostic name the context was created with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Returns `true` if both handles refer to the same logical worker.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Hands `task` to the worker behind this context.
    pub(crate) fn dispatch(&self, task: Task) {
        (self.core.dispatch)(task);
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.core))
    }
}

/// A context handle that does not keep the worker alive.
///
/// Workers hold their own context through this so that dropping the last
/// strong [`ExecContext`] tears the worker down.
pub(crate) struct WeakContext(Weak<ContextCore>);

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<ExecContext> {
        self.0.upgrade().map(|core| ExecContext { core })
    }
}

impl Debug for ExecContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext").field("name", &self.core.name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_per_handle_chain() {
        let a = ExecContext::new("a", |task| task());
        let b = ExecContext::new("a", |task| task());
        let a2 = a.clone();

        assert!(a.same_as(&a2));
        assert!(!a.same_as(&b));
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn enter_installs_and_restores() {
        let cx = ExecContext::new("outer", |task| task());
        assert!(current_context().is_none());

        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen2 = std::sync::Arc::clone(&seen);
        enter(&cx, Box::new(move || {
            *seen2.lock().unwrap() = current_context();
        }));

        let seen = seen.lock().unwrap().take();
        assert!(seen.is_some_and(|c| c.same_as(&cx)));
        assert!(current_context().is_none());
    }
}
