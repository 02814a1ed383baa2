// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::sched::Task;

/// Unique identifier for a pending timer entry.
///
/// The discriminator ensures two entries with the same deadline can coexist
/// in the ordered map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    discriminator: u64,
}

struct TimerState {
    entries: BTreeMap<TimerKey, Task>,
    last_discriminator: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// One-shot timer collection serviced by a dedicated thread.
///
/// Entries are stored in deadline order; the thread sleeps until the
/// earliest deadline (or until a new entry arrives with an earlier one) and
/// runs due tasks on its own thread, with no context installed.
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: BTreeMap::new(),
                last_discriminator: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("anysched-timer".to_string())
            .spawn(move || Self::run(&worker))
            .ok();

        Self { shared, thread }
    }

    pub fn submit(&self, delay: Duration, task: Task) {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        state.last_discriminator = state.last_discriminator.wrapping_add(1);
        let key = TimerKey {
            deadline,
            discriminator: state.last_discriminator,
        };
        state.entries.insert(key, task);
        drop(state);
        self.shared.wakeup.notify_one();
    }

    fn run(shared: &Arc<TimerShared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = state.entries.first_entry() {
                if entry.key().deadline > now {
                    break;
                }
                due.push(entry.remove());
            }

            if !due.is_empty() {
                drop(state);
                for task in due {
                    task();
                }
                state = shared.state.lock();
                continue;
            }

            match state.entries.keys().next().map(|key| key.deadline) {
                Some(next) => {
                    let _ = shared.wakeup.wait_until(&mut state, next);
                }
                None => shared.wakeup.wait(&mut state),
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
