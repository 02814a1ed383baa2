// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! Single-assignment deferred values with cache-expiry propagation.
//!
//! # Why
//!
//! Callback-driven coordination needs a cell that is written exactly once
//! and observed any number of times, with two pieces of policy attached:
//! how long a successful result may be reused (its [`Expiry`]), and which
//! worker a callback must run on (its execution context, see
//! [`anysched`]). This crate provides both deferred-value families the rest
//! of the workspace builds on:
//!
//! - [`Eventual`] - the core single-handler family. No affinity, one
//!   completion handler, combinators ([`Eventual::map`],
//!   [`Eventual::compose`], [`Eventual::recover`], [`Eventual::otherwise`])
//!   and the composition helpers [`all`] (fail-fast) and [`join`] (always
//!   waits, reports per-input outcomes).
//! - [`SharedEventual`] - the thread-affine multi-subscriber family, safe
//!   for concurrent completion and subscription across worker threads, with
//!   context-affine dispatch of every subscriber.
//!
//! # Expiry propagation
//!
//! Every derived value is reduce-expired by its sources: a chain of
//! combinators can only get shorter-lived, and a failure anywhere yields
//! [`Expiry::Expired`]. See [`Expiry`] for the ordering rules.
//!
//! # Settlement discipline
//!
//! `complete`/`fail` panic on a second settlement; `try_complete`/`try_fail`
//! return `false` instead and are the primitive higher layers use to
//! tolerate races between normal completion and late timeout or
//! cancellation. The [`Settleable`] trait exposes exactly that surface for
//! components (like a timeout sweeper) that operate on either family.
//!
//! # Example
//!
//! ```
//! use eventual::{Eventual, Expiry};
//!
//! let lookup = Eventual::pending();
//! let shouted = lookup.map(|name: String| name.to_uppercase());
//!
//! lookup.complete_at(Expiry::Infinite, "hello".to_string());
//! shouted.on_complete(|outcome| assert_eq!(outcome.unwrap(), "HELLO"));
//! ```

mod combine;
mod expiry;
mod fault;
mod shared;
mod value;

pub use combine::{all, join};
pub use expiry::Expiry;
pub use fault::{CallbackPanicked, Fault, contained, fault};
pub use shared::SharedEventual;
pub use value::Eventual;

/// The settlement surface shared by both deferred-value families.
///
/// This is what components that merely *terminate* deferred values (such as
/// a timeout sweeper) operate on: the non-panicking failure path plus a
/// settled check for skipping work that already finished.
pub trait Settleable: Send + Sync {
    /// Fails the value unless it is already settled; returns `false` if it
    /// was.
    fn try_fail(&self, cause: Fault) -> bool;

    /// Returns `true` once the value is settled.
    fn is_settled(&self) -> bool;
}

impl<T: Send + 'static> Settleable for Eventual<T> {
    fn try_fail(&self, cause: Fault) -> bool {
        Self::try_fail(self, cause)
    }

    fn is_settled(&self) -> bool {
        Self::is_settled(self)
    }
}
