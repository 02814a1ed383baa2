// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::time::Duration;

use crate::context::{ExecContext, enter};
use crate::sched::{SchedImpl, Task};
use crate::timer::Timer;

/// Scheduler that runs context-bound callbacks inline on the calling thread.
///
/// Contexts created here still have identity, and
/// [`current_context`](crate::current_context) reports the context while a
/// dispatched task runs, but no thread hand-off happens. Delays go through
/// the shared timer thread like in the threaded scheduler.
pub(crate) struct InlineSched {
    timer: Timer,
}

impl InlineSched {
    pub fn new() -> Self {
        Self { timer: Timer::new() }
    }
}

impl SchedImpl for InlineSched {
    fn create_context(&self, name: &str) -> ExecContext {
        // The dispatch closure needs the context itself to install it as
        // current; tie the knot through a one-shot slot.
        let slot = std::sync::Arc::new(parking_lot::Mutex::new(None::<ExecContext>));
        let dispatch_slot = std::sync::Arc::clone(&slot);
        let context = ExecContext::new(name, move |task| {
            let own = dispatch_slot.lock().clone();
            match own {
                Some(own) => enter(&own, task),
                None => task(),
            }
        });
        *slot.lock() = Some(context.clone());
        context
    }

    fn run_on(&self, context: &ExecContext, task: Task) {
        context.dispatch(task);
    }

    fn run_soon(&self, task: Task) {
        task();
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.timer.submit(delay, task);
    }
}
