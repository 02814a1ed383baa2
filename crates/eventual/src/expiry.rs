// Copyright (c) The Eventual Project Authors.
// Licensed under the MIT License.

use std::time::Instant;

/// How long the result carried by a deferred value may be reused.
///
/// Expiries are totally ordered: `Expired < At(_) < Infinite`, with `At`
/// values ordered by their instant. Combining two values never yields a
/// longer-lived result than the weakest input, which makes [`Expiry::min`]
/// (the "reduce-expire" rule) the only combination operator needed.
///
/// Failed values always carry [`Expiry::Expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expiry {
    /// The result is never reusable.
    Expired,
    /// The result may be reused until the given instant.
    At(Instant),
    /// The result is always reusable.
    Infinite,
}

impl Expiry {
    /// Returns the weaker of the two expiries.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Ord::min(self, other)
    }

    /// Returns `true` for [`Expiry::Expired`].
    #[must_use]
    pub fn is_expired(self) -> bool {
        matches!(self, Self::Expired)
    }

    /// Returns `true` for [`Expiry::Infinite`].
    #[must_use]
    pub fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// The deadline instant, if the expiry is a concrete point in time.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::At(instant) => Some(instant),
            Self::Expired | Self::Infinite => None,
        }
    }

    /// Returns `true` if the result may still be reused at `now`.
    #[must_use]
    pub fn usable_at(self, now: Instant) -> bool {
        match self {
            Self::Expired => false,
            Self::At(instant) => now < instant,
            Self::Infinite => true,
        }
    }
}
