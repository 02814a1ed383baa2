// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// The cause carried by a failed deferred value.
///
/// Faults are reference-counted so a single cause can flow through an
/// arbitrary number of derived values and subscribers.
pub type Fault = Arc<dyn Error + Send + Sync + 'static>;

/// Wraps any error into a [`Fault`].
pub fn fault<E>(error: E) -> Fault
where
    E: Error + Send + Sync + 'static,
{
    Arc::new(error)
}

/// Fault produced when a combinator callback panics.
///
/// Combinator callbacks never unwind out of the deferred-value machinery;
/// the panic is captured and turned into a failure of the derived value.
#[derive(Debug, thiserror::Error)]
#[error("callback panicked: {message}")]
pub struct CallbackPanicked {
    message: String,
}

impl CallbackPanicked {
    /// The panic message, if one could be extracted from the payload.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Runs `f`, converting a panic into a [`CallbackPanicked`] fault.
pub fn contained<R>(f: impl FnOnce() -> R) -> Result<R, Fault> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
                (*text).to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "non-string panic payload".to_string()
            };
            Err(fault(CallbackPanicked { message }))
        }
    }
}
