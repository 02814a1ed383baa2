// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

//! Execution contexts and scheduling for callback-driven components.
//!
//! This crate models the two things the rest of the workspace needs from its
//! environment:
//!
//! - [`ExecContext`] - an affinity token identifying the logical worker a
//!   callback must run on. Contexts have identity ([`ExecContext::same_as`])
//!   and a diagnostic name; they say nothing about how the worker is
//!   implemented.
//! - [`Sched`] - a cloneable handle able to run a callback immediately, on a
//!   specific context, or after a delay.
//!
//! Two implementations are built in:
//!
//! - [`Sched::new_threaded`] backs every created context with a dedicated
//!   worker thread and services delays from a shared timer thread. This is
//!   the implementation production code and affinity-sensitive tests use.
//! - [`Sched::new_inline`] runs context-bound callbacks on the calling
//!   thread. Delays still go through the timer thread. Useful for tests
//!   that don't care about affinity.
//!
//! Custom environments plug in by implementing [`SchedImpl`] and wrapping it
//! with [`Sched::new_custom`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use anysched::Sched;
//!
//! let sched = Sched::new_threaded();
//! let workers = sched.create_context("workers");
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! sched.run_on(&workers, Box::new(move || {
//!     // Runs on the "workers" thread; `current_context` reports it.
//!     tx.send(anysched::current_context().is_some()).unwrap();
//! }));
//! assert!(rx.recv().unwrap());
//! # drop(sched);
//! ```

mod context;
mod inline;
mod sched;
mod threaded;
mod timer;

pub use context::{ExecContext, current_context};
pub use sched::{Sched, SchedImpl, Task};
