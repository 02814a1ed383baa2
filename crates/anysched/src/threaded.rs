// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::context::{ExecContext, WeakContext, enter};
use crate::sched::{SchedImpl, Task};
use crate::timer::Timer;

/// Scheduler backing every context with a dedicated worker thread.
///
/// Each call to [`SchedImpl::create_context`] spawns a named thread draining
/// an unbounded channel; tasks bound to the context run there, one at a
/// time, in submission order. The worker exits once every handle to its
/// context is gone. Delays are serviced by a shared [`Timer`] thread.
pub(crate) struct ThreadedSched {
    timer: Timer,
}

impl ThreadedSched {
    pub fn new() -> Self {
        Self { timer: Timer::new() }
    }
}

impl SchedImpl for ThreadedSched {
    fn create_context(&self, name: &str) -> ExecContext {
        let (tx, rx) = mpsc::channel::<Task>();

        // The worker needs its own context handle to install as current,
        // wired in after the context exists. It holds only a weak handle:
        // the sender lives inside the context core, so a strong handle here
        // would keep the channel connected forever and leak the thread.
        let (cx_tx, cx_rx) = mpsc::channel::<WeakContext>();
        let _ = thread::Builder::new().name(format!("anysched-{name}")).spawn(move || {
            let Ok(own) = cx_rx.recv() else { return };
            while let Ok(task) = rx.recv() {
                match own.upgrade() {
                    Some(context) => enter(&context, task),
                    // All handles are gone; drain what was already queued.
                    None => task(),
                }
            }
        });

        let context = ExecContext::new(name, move |task| {
            // A send failure means the worker is gone; the task is dropped,
            // which only happens during teardown.
            let _ = tx.send(task);
        });
        let _ = cx_tx.send(context.downgrade());
        context
    }

    fn run_on(&self, context: &ExecContext, task: Task) {
        context.dispatch(task);
    }

    fn run_soon(&self, task: Task) {
        self.timer.submit(Duration::ZERO, task);
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.timer.submit(delay, task);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use crate::Sched;
    use crate::context::current_context;

    use super::*;

    #[test]
    fn run_on_executes_on_the_context_thread() {
        let sched = Sched::new_threaded();
        let cx = sched.create_context("worker");

        let (tx, rx) = mpsc::channel();
        let expected = cx.clone();
        sched.run_on(&cx, Box::new(move || {
            let current = current_context();
            let thread_name = thread::current().name().map(str::to_string);
            tx.send((current, thread_name)).unwrap();
        }));

        let (current, thread_name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(current.is_some_and(|c| c.same_as(&expected)));
        assert_eq!(thread_name.as_deref(), Some("anysched-worker"));
    }

    #[test]
    fn tasks_on_one_context_run_in_submission_order() {
        let sched = Sched::new_threaded();
        let cx = sched.create_context("ordered");

        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            sched.run_on(&cx, Box::new(move || tx.send(i).unwrap()));
        }

        for i in 0..16 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), i);
        }
    }

    #[test]
    fn worker_exits_when_all_handles_drop() {
        thread_local! {
            static HOLD: std::cell::RefCell<Option<mpsc::Sender<()>>> =
                const { std::cell::RefCell::new(None) };
        }

        let sched = Sched::new_threaded();
        let cx = sched.create_context("ephemeral");

        // Park a sentinel sender in the worker's thread-local storage; it
        // drops only when the worker thread exits.
        let (tx, rx) = mpsc::channel::<()>();
        sched.run_on(&cx, Box::new(move || {
            HOLD.with(|hold| *hold.borrow_mut() = Some(tx));
        }));

        drop(cx);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn schedule_waits_out_the_delay() {
        let sched = Sched::new_threaded();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        sched.schedule(Duration::from_millis(50), Box::new(move || tx.send(()).unwrap()));

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn run_soon_runs_off_the_calling_thread() {
        let sched = Sched::new_threaded();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        sched.run_soon(Box::new(move || tx.send(thread::current().id()).unwrap()));

        let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(ran_on, caller);
    }
}
