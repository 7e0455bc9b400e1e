// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::{Clock, NANOS_PER_SEC, Ticks};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

/// A measurement of a monotonically nondecreasing clock.
///
/// Unlike [`std::time::Instant`], a `zokio` `Instant` is only meaningful
/// relative to the [`Clock`] that produced it — two `Instant`s created from
/// different clocks must never be compared.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(pub(super) Duration);

impl Instant {
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Returns an instant corresponding to "now" on `clock`.
    #[must_use]
    pub fn now(clock: &Clock) -> Self {
        Self::from_ticks(clock, clock.now_ticks())
    }

    /// Converts a [`Ticks`] value of `clock` into an `Instant`.
    #[must_use]
    pub fn from_ticks(clock: &Clock, ticks: Ticks) -> Self {
        Self(clock.ticks_to_duration(ticks))
    }

    /// Returns an instant roughly 30 years after `clock`'s current time.
    ///
    /// This is used instead of `Duration::MAX` because conversion to ticks
    /// might cause an overflow, and checked/saturating conversions in the
    /// timer's hot path would be too expensive.
    #[must_use]
    pub fn far_future(clock: &Clock) -> Instant {
        Self::now(clock) + Duration::from_secs(86400 * 365 * 30)
    }

    /// Returns the amount of time elapsed from another instant to this one,
    /// or zero duration if that instant is later than this one.
    #[must_use]
    pub fn duration_since(&self, earlier: Self) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }

    /// Returns the amount of time elapsed from another instant to this one,
    /// or zero duration if that instant is later than this one.
    #[must_use]
    pub fn saturating_duration_since(&self, earlier: Self) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }

    /// Returns the amount of time elapsed from another instant to this one,
    /// or `None` if that instant is later than this one.
    #[must_use]
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        if *self >= earlier {
            let (secs, nanos) = if self.0.subsec_nanos() >= earlier.0.subsec_nanos() {
                (
                    self.0.as_secs() - earlier.0.as_secs(),
                    self.0.subsec_nanos() - earlier.0.subsec_nanos(),
                )
            } else {
                (
                    self.0.as_secs() - earlier.0.as_secs() - 1,
                    self.0.subsec_nanos()
                    // Safety: always fits
                        + unsafe { u32::try_from(NANOS_PER_SEC).unwrap_unchecked() }
                        - earlier.0.subsec_nanos(),
                )
            };

            Some(Duration::new(secs, nanos))
        } else {
            None
        }
    }

    /// Returns the amount of time elapsed since this instant, on `clock`.
    #[must_use]
    pub fn elapsed(&self, clock: &Clock) -> Duration {
        Self::now(clock) - *self
    }

    /// Returns `Some(t)` where `t` is the time `self + duration`, or `None`
    /// if the result can't be represented as an `Instant`.
    #[must_use]
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration).map(Self)
    }

    /// Returns `Some(t)` where `t` is the time `self - duration`, or `None`
    /// if the result can't be represented as an `Instant`.
    #[must_use]
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        self.0.checked_sub(duration).map(Self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// This function may panic if the resulting point in time cannot be represented by the
    /// underlying data structure. See [`Instant::checked_add`] for a version without panic.
    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, other: Duration) -> Instant {
        self.checked_sub(other)
            .expect("overflow when subtracting duration from instant")
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, other: Duration) {
        *self = *self - other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Returns the amount of time elapsed from another instant to this one,
    /// or zero duration if that instant is later than this one.
    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
