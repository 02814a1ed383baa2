// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! A fair reader/writer lock that queues *work* instead of threads.
//!
//! [`FairLock`] never blocks the calling thread. [`FairLock::read`] and
//! [`FairLock::write`] take a closure: if the lock is available in the
//! requested mode the closure runs immediately on the calling thread,
//! otherwise it is queued and runs later on whichever thread releases the
//! conflicting hold.
//!
//! Admission is strictly FIFO from the queue head, which is what makes the
//! lock fair: a queued writer blocks all readers that arrive after it, so
//! writers cannot starve under a stream of readers. Consecutive readers at
//! the head are admitted together.
//!
//! The closure receives a [`Release`] guard and the hold lasts until
//! [`Release::release`] is called, which may happen inside the closure or
//! later from any thread. Releasing is idempotent; forgetting it leaves the
//! lock held forever.
//!
//! # Example
//!
//! ```
//! use fairlock::FairLock;
//!
//! let lock = FairLock::new();
//! lock.write(|hold| {
//!     // exclusive section
//!     hold.release();
//! });
//! lock.read(|hold| {
//!     // shared section
//!     hold.release();
//! });
//! ```

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use parking_lot::Mutex;

/// The two access modes of a [`FairLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access. Any number of readers may hold the lock together.
    Read,
    /// Exclusive access.
    Write,
}

// Lock state: -1 held by a writer, 0 free, n > 0 held by n readers.
struct RawLock {
    state: AtomicI64,
}

impl RawLock {
    fn new() -> Self {
        Self { state: AtomicI64::new(0) }
    }

    fn try_acquire(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Write => {
                self.state.compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire).is_ok()
            }
            LockMode::Read => self
                .state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                    (held >= 0).then_some(held + 1)
                })
                .is_ok(),
        }
    }

    fn release(&self, mode: LockMode) {
        match mode {
            LockMode::Write => self.state.store(0, Ordering::Release),
            LockMode::Read => {
                let _ = self.state.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

// Lifecycle of a request, kept in an atomic so `Release` can be called from
// any thread and stay idempotent.
const STAMP_QUEUED: u8 = 0;
const STAMP_READ: u8 = 1;
const STAMP_WRITE: u8 = 2;
const STAMP_RELEASED: u8 = 3;

type Work = Box<dyn FnOnce(Release) + Send>;

struct Request {
    mode: LockMode,
    work: Mutex<Option<Work>>,
    stamp: AtomicU8,
}

impl Request {
    fn new(mode: LockMode) -> Self {
        Self { mode, work: Mutex::new(None), stamp: AtomicU8::new(STAMP_QUEUED) }
    }

    fn held_stamp(mode: LockMode) -> u8 {
        match mode {
            LockMode::Read => STAMP_READ,
            LockMode::Write => STAMP_WRITE,
        }
    }
}

struct LockInner {
    raw: RawLock,
    queue: Mutex<VecDeque<Arc<Request>>>,
}

impl LockInner {
    /// Admits as much queued work as the current lock state allows.
    ///
    /// Only ever admits the queue head (FIFO fairness); loops so that a run
    /// of readers at the head is admitted together.
    fn service(inner: &Arc<Self>) {
        loop {
            let head = {
                let queue = inner.queue.lock();
                match queue.front() {
                    Some(request) => Arc::clone(request),
                    None => return,
                }
            };

            if !inner.raw.try_acquire(head.mode) {
                return;
            }

            // Another thread may have admitted this head between our peek
            // and our acquire. Only proceed if it is still the front;
            // otherwise the claiming thread keeps servicing and we stop.
            let admitted = {
                let mut queue = inner.queue.lock();
                match queue.front() {
                    Some(front) if Arc::ptr_eq(front, &head) => {
                        let _ = queue.pop_front();
                        true
                    }
                    _ => false,
                }
            };
            if !admitted {
                inner.raw.release(head.mode);
                return;
            }

            head.stamp.store(Request::held_stamp(head.mode), Ordering::Release);
            let work = head.work.lock().take();
            if let Some(work) = work {
                work(Release { inner: Arc::clone(inner), request: Arc::clone(&head) });
            }

            if head.mode == LockMode::Write {
                // The writer's release will service the queue again.
                return;
            }
        }
    }
}

/// Ends a lock hold granted by [`FairLock`].
///
/// Cheap to clone and safe to call from any thread; only the first
/// [`release`](Self::release) has an effect.
#[derive(Clone)]
pub struct Release {
    inner: Arc<LockInner>,
    request: Arc<Request>,
}

impl Release {
    /// Releases the hold and admits queued work that is now unblocked.
    pub fn release(&self) {
        let previous = self.request.stamp.swap(STAMP_RELEASED, Ordering::AcqRel);
        let mode = match previous {
            STAMP_READ => LockMode::Read,
            STAMP_WRITE => LockMode::Write,
            _ => return,
        };
        self.inner.raw.release(mode);
        LockInner::service(&self.inner);
    }
}

impl Debug for Release {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release").field("mode", &self.request.mode).finish_non_exhaustive()
    }
}

/// A fair, non-blocking reader/writer lock over queued closures.
///
/// See the [crate docs](crate) for the execution and fairness model.
#[derive(Clone)]
pub struct FairLock {
    inner: Arc<LockInner>,
}

impl FairLock {
    /// Creates an unlocked lock with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockInner { raw: RawLock::new(), queue: Mutex::new(VecDeque::new()) }),
        }
    }

    /// Runs `work` under shared access, now or once the lock permits.
    pub fn read(&self, work: impl FnOnce(Release) + Send + 'static) {
        self.execute(LockMode::Read, work);
    }

    /// Runs `work` under exclusive access, now or once the lock permits.
    pub fn write(&self, work: impl FnOnce(Release) + Send + 'static) {
        self.execute(LockMode::Write, work);
    }

    /// Runs `work` in `mode`, now or once the lock permits.
    ///
    /// When nothing is queued and the lock is free in `mode`, `work` runs
    /// on the calling thread before this returns. Otherwise it is queued
    /// behind earlier requests and runs on the thread that releases the
    /// hold it was waiting on.
    pub fn execute(&self, mode: LockMode, work: impl FnOnce(Release) + Send + 'static) {
        let request = Arc::new(Request::new(mode));
        let mut work: Option<Work> = Some(Box::new(work));

        let ran_inline = {
            let mut queue = self.inner.queue.lock();
            if queue.is_empty() && self.inner.raw.try_acquire(mode) {
                true
            } else {
                *request.work.lock() = work.take();
                queue.push_back(Arc::clone(&request));
                false
            }
        };

        if ran_inline {
            request.stamp.store(Request::held_stamp(mode), Ordering::Release);
            if let Some(work) = work {
                work(Release { inner: Arc::clone(&self.inner), request });
            }
        } else {
            LockInner::service(&self.inner);
        }
    }
}

impl Default for FairLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FairLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairLock")
            .field("state", &self.inner.raw.state.load(Ordering::Acquire))
            .field("queued", &self.inner.queue.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FairLock: Send, Sync, Clone);
    assert_impl_all!(Release: Send, Sync, Clone);

    fn held_release() -> (Arc<Mutex<Option<Release>>>, impl FnOnce(Release) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        (slot, move |hold: Release| {
            *sink.lock() = Some(hold);
        })
    }

    #[test]
    fn free_lock_runs_work_inline() {
        let lock = FairLock::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        for mode in [LockMode::Write, LockMode::Read, LockMode::Write] {
            let log = Arc::clone(&ran);
            lock.execute(mode, move |hold| {
                log.lock().push(mode);
                hold.release();
            });
        }

        assert_eq!(*ran.lock(), vec![LockMode::Write, LockMode::Read, LockMode::Write]);
    }

    #[test]
    fn readers_share_the_lock() {
        let lock = FairLock::new();
        let (first, keep_first) = held_release();
        lock.read(keep_first);
        assert!(first.lock().is_some());

        // A second reader is admitted while the first still holds the lock.
        let second_ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&second_ran);
        lock.read(move |hold| {
            *flag.lock() = true;
            hold.release();
        });
        assert!(*second_ran.lock());

        first.lock().take().unwrap().release();
    }

    #[test]
    fn writer_excludes_readers_until_released() {
        let lock = FairLock::new();
        let (writer, keep_writer) = held_release();
        lock.write(keep_writer);

        let reader_ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reader_ran);
        lock.read(move |hold| {
            *flag.lock() = true;
            hold.release();
        });
        assert!(!*reader_ran.lock());

        writer.lock().take().unwrap().release();
        assert!(*reader_ran.lock());
    }

    #[test]
    fn queued_writer_blocks_later_readers() {
        let lock = FairLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (first_reader, keep_first) = held_release();
        lock.read(keep_first);

        let log = Arc::clone(&order);
        lock.write(move |hold| {
            log.lock().push("writer");
            hold.release();
        });

        // Arrived after the writer, so it must wait behind it.
        let log = Arc::clone(&order);
        lock.read(move |hold| {
            log.lock().push("reader");
            hold.release();
        });
        assert!(order.lock().is_empty());

        first_reader.lock().take().unwrap().release();
        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }

    #[test]
    fn consecutive_queued_readers_are_admitted_together() {
        let lock = FairLock::new();
        let (writer, keep_writer) = held_release();
        lock.write(keep_writer);

        let holds = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let sink = Arc::clone(&holds);
            lock.read(move |hold| sink.lock().push(hold));
        }
        assert!(holds.lock().is_empty());

        writer.lock().take().unwrap().release();
        assert_eq!(holds.lock().len(), 3);

        for hold in holds.lock().drain(..) {
            hold.release();
        }
    }

    #[test]
    fn release_is_idempotent() {
        let lock = FairLock::new();
        let (writer, keep_writer) = held_release();
        lock.write(keep_writer);

        let hold = writer.lock().take().unwrap();
        hold.release();
        hold.clone().release();
        hold.release();

        // A double release must not unbalance the lock for the next holder.
        let next_ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&next_ran);
        lock.write(move |hold| {
            *flag.lock() = true;
            hold.release();
        });
        assert!(*next_ran.lock());
    }

    #[test]
    fn release_from_another_thread_admits_queued_work() {
        let lock = FairLock::new();
        let (writer, keep_writer) = held_release();
        lock.write(keep_writer);

        let (tx, rx) = std::sync::mpsc::channel();
        lock.read(move |hold| {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
            hold.release();
        });

        let hold = writer.lock().take().unwrap();
        let releaser = thread::Builder::new()
            .name("releaser".to_string())
            .spawn(move || hold.release())
            .unwrap();
        let ran_on = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        releaser.join().unwrap();

        assert_eq!(ran_on.as_deref(), Some("releaser"));
    }

    #[test]
    fn queued_requests_run_in_submission_order() {
        let lock = FairLock::new();
        let (blocker, keep_blocker) = held_release();
        lock.write(keep_blocker);

        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..10_u32 {
            let log = Arc::clone(&order);
            let mode = if index % 3 == 0 { LockMode::Write } else { LockMode::Read };
            lock.execute(mode, move |hold| {
                log.lock().push(index);
                hold.release();
            });
        }
        assert!(order.lock().is_empty());

        blocker.lock().take().unwrap().release();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn contended_mixed_modes_preserve_exclusion() {
        let lock = FairLock::new();
        // Active holds: -1 during a write, otherwise the reader count.
        let active = Arc::new(AtomicI64::new(0));

        let mut threads = Vec::new();
        for offset in 0..4_u32 {
            let lock = lock.clone();
            let active = Arc::clone(&active);
            threads.push(thread::spawn(move || {
                for round in 0..200 {
                    let active = Arc::clone(&active);
                    if (offset + round) % 4 == 0 {
                        lock.write(move |hold| {
                            let seen = active.swap(-1, Ordering::SeqCst);
                            assert_eq!(seen, 0, "writer admitted while the lock was busy");
                            active.store(0, Ordering::SeqCst);
                            hold.release();
                        });
                    } else {
                        lock.read(move |hold| {
                            let seen = active.fetch_add(1, Ordering::SeqCst);
                            assert!(seen >= 0, "reader admitted during a write hold");
                            let _ = active.fetch_sub(1, Ordering::SeqCst);
                            hold.release();
                        });
                    }
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_writers_serialize() {
        let lock = FairLock::new();
        let counter = Arc::new(Mutex::new(0_u64));

        let mut threads = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = Arc::clone(&counter);
            threads.push(thread::spawn(move || {
                for _ in 0..100 {
                    let counter = Arc::clone(&counter);
                    lock.write(move |hold| {
                        *counter.lock() += 1;
                        hold.release();
                    });
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(*counter.lock(), 800);
    }
}
