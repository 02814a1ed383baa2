// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! Self-refreshing cache wrapper with soft/hard TTL and single-flight
//! refresh.
//!
//! [`RefreshingCache`] wraps a supplier of deferred values and keeps one
//! current value around, refreshing it in the background once it goes soft
//! and replacing it synchronously once it goes hard:
//!
//! - **Fresh** (`now < soft_expires_at`): [`RefreshingCache::get`] returns
//!   the current value unchanged and never calls the supplier.
//! - **Stale-soft** (`soft_expires_at <= now < hard_expires_at`): callers
//!   still get the current value (stale-while-revalidate) while at most one
//!   of them kicks off a background refresh. A refresh failure is logged and
//!   absorbed; the stale value stays in place.
//! - **Stale-hard** (`now >= hard_expires_at`): the current value is
//!   synchronously replaced with a fresh (possibly still-pending) supplier
//!   result, so no caller ever waits longer than the hard limit for a new
//!   attempt to begin.
//!
//! An optional `should_refresh` predicate can veto refreshing a particular
//! successful value during the stale-soft window, making it sticky until the
//! hard limit.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use anysched::Sched;
//! use eventual::{Expiry, SharedEventual};
//! use freshet::RefreshingCache;
//!
//! let sched = Sched::new_inline();
//! let supplier_sched = sched.clone();
//! let cache = RefreshingCache::builder(
//!     Duration::from_secs(30),
//!     Duration::from_secs(300),
//!     move || SharedEventual::succeeded_at(&supplier_sched, Expiry::Infinite, 42),
//! )
//! .build();
//!
//! cache.get().on_complete(|outcome| assert_eq!(outcome.unwrap(), 42));
//! ```

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use eventual::{Expiry, SharedEventual};
use parking_lot::Mutex;

type Supplier<T> = Box<dyn Fn() -> SharedEventual<T> + Send + Sync>;
type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Slot<T> {
    current: SharedEventual<T>,
    soft_expires_at: Instant,
    hard_expires_at: Instant,
}

struct CacheInner<T> {
    supplier: Supplier<T>,
    soft_ttl: Duration,
    hard_limit: Duration,
    should_refresh: Option<Predicate<T>>,
    refreshing: AtomicBool,
    slot: Mutex<Slot<T>>,
}

/// Builder for [`RefreshingCache`].
pub struct Builder<T> {
    soft_ttl: Duration,
    hard_limit: Duration,
    supplier: Supplier<T>,
    should_refresh: Option<Predicate<T>>,
}

impl<T> Debug for Builder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("soft_ttl", &self.soft_ttl)
            .field("hard_limit", &self.hard_limit)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Builder<T> {
    /// Vetoes background refresh of a successful value during the
    /// stale-soft window: while the predicate returns `false` for the
    /// current value, `get` keeps returning it unchanged.
    #[must_use]
    pub fn should_refresh(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.should_refresh = Some(Box::new(predicate));
        self
    }

    /// Builds the cache, eagerly invoking the supplier once for the initial
    /// value.
    #[must_use]
    pub fn build(self) -> RefreshingCache<T> {
        let now = Instant::now();
        let initial = (self.supplier)();
        let mut slot = Slot {
            current: initial,
            soft_expires_at: now + self.soft_ttl,
            hard_expires_at: now + self.hard_limit,
        };
        clip_soft_bound(&mut slot);

        let cache = RefreshingCache {
            inner: Arc::new(CacheInner {
                supplier: self.supplier,
                soft_ttl: self.soft_ttl,
                hard_limit: self.hard_limit,
                should_refresh: self.should_refresh,
                refreshing: AtomicBool::new(false),
                slot: Mutex::new(slot),
            }),
        };
        cache.watch_pending_expiry();
        cache
    }
}

/// A cache holding a single self-refreshing deferred value.
///
/// See the [crate docs](crate) for the state machine. All state is mutated
/// by [`get`](Self::get) calls only; the single-flight refresh flag is one
/// atomic compare-and-swap, so concurrent callers in the stale-soft window
/// trigger at most one refresh.
///
/// The supplier must not call back into the cache.
pub struct RefreshingCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for RefreshingCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for RefreshingCache<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("RefreshingCache")
            .field("soft_expires_at", &slot.soft_expires_at)
            .field("hard_expires_at", &slot.hard_expires_at)
            .field("refreshing", &self.inner.refreshing.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> RefreshingCache<T> {
    /// Starts building a cache around `supplier` with the given soft TTL and
    /// hard limit.
    #[must_use]
    pub fn builder(
        soft_ttl: Duration,
        hard_limit: Duration,
        supplier: impl Fn() -> SharedEventual<T> + Send + Sync + 'static,
    ) -> Builder<T> {
        Builder {
            soft_ttl,
            hard_limit,
            supplier: Box::new(supplier),
            should_refresh: None,
        }
    }

    /// Returns the cached value, refreshing or replacing it per the
    /// soft/hard TTL state machine.
    #[must_use]
    pub fn get(&self) -> SharedEventual<T> {
        let now = Instant::now();
        let mut slot = self.inner.slot.lock();

        if now < slot.soft_expires_at {
            return slot.current.clone();
        }

        if now >= slot.hard_expires_at {
            // Hard-stale: replace synchronously, even if the replacement is
            // still pending.
            let fresh = (self.inner.supplier)();
            slot.current = fresh.clone();
            slot.soft_expires_at = now + self.inner.soft_ttl;
            slot.hard_expires_at = now + self.inner.hard_limit;
            clip_soft_bound(&mut slot);
            drop(slot);
            self.watch_pending_expiry();
            return fresh;
        }

        // Soft-stale: the caller keeps the old value either way.
        if let Some(predicate) = &self.inner.should_refresh {
            if let Some(Ok(value)) = slot.current.peek() {
                if !predicate(&value) {
                    return slot.current.clone();
                }
            }
        }

        let current = slot.current.clone();
        drop(slot);

        if self
            .inner
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.start_refresh(current.clone());
        }

        current
    }

    fn start_refresh(&self, replaced: SharedEventual<T>) {
        let attempt = (self.inner.supplier)();
        let observed = attempt.clone();
        let inner = Arc::clone(&self.inner);
        attempt.on_complete(move |outcome| {
            match outcome {
                Ok(_) => {
                    let now = Instant::now();
                    let mut slot = inner.slot.lock();
                    // A hard replacement may have installed a newer value
                    // while this refresh was in flight; never displace it.
                    if slot.current.same_as(&replaced) {
                        slot.current = observed.clone();
                        slot.soft_expires_at = now + inner.soft_ttl;
                        slot.hard_expires_at = now + inner.hard_limit;
                        clip_soft_bound(&mut slot);
                    }
                }
                Err(cause) => {
                    tracing::warn!(error = %cause, "background refresh failed; keeping the stale value");
                }
            }
            inner.refreshing.store(false, Ordering::Release);
        });
    }

    /// If the current value is still pending, arranges for its expiry to
    /// clip the soft bound once it settles.
    fn watch_pending_expiry(&self) {
        let slot = self.inner.slot.lock();
        if slot.current.is_settled() {
            return;
        }
        let watched = slot.current.clone();
        drop(slot);

        let inner = Arc::clone(&self.inner);
        let installed = watched.clone();
        watched.on_complete(move |outcome| {
            if outcome.is_err() {
                return;
            }
            let mut slot = inner.slot.lock();
            // Only clip if this value is still the installed one.
            if slot.current.same_as(&installed) {
                clip_soft_bound(&mut slot);
            }
        });
    }
}

/// Clips the soft bound by the value's own expiry: a value that expires
/// before `now + soft_ttl` goes soft at its expiry instead.
fn clip_soft_bound<T: Clone + Send + 'static>(slot: &mut Slot<T>) {
    match slot.current.expiry() {
        Expiry::At(deadline) => slot.soft_expires_at = slot.soft_expires_at.min(deadline),
        Expiry::Expired => {
            if slot.current.is_settled() {
                slot.soft_expires_at = Instant::now();
            }
        }
        Expiry::Infinite => {}
    }
}
