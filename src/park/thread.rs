// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::Park;
use crate::time::{Clock, Deadline, Instant};
use std::thread::{self, Thread};

/// Bounded spin iterations performed by [`StdPark::for_current`] before the
/// OS condition variable wait (spec §6.1's `spin_before_park` default).
const DEFAULT_SPIN_BEFORE_PARK: usize = 200;

/// A [`Park`] implementation backed by `std::thread::park`/`unpark`.
///
/// This is the default production parking strategy (spec §4.3's "bounded
/// spin then OS condition variable"): once a worker has exhausted its spin
/// budget it calls [`Park::park`], blocking the OS thread until another
/// worker (or the reactor) calls [`Park::unpark`].
#[derive(Debug)]
pub struct StdPark {
    thread: Thread,
    spin_before_park: usize,
}

impl StdPark {
    /// Constructs a `StdPark` bound to the currently running thread, spinning
    /// [`DEFAULT_SPIN_BEFORE_PARK`] iterations before each OS park.
    ///
    /// Only the thread that called `for_current` may call [`Park::park`] or
    /// [`Park::park_until`] on the returned value; any other thread may call
    /// [`Park::unpark`] to wake it.
    #[must_use]
    pub fn for_current() -> Self {
        Self::with_spin_before_park(DEFAULT_SPIN_BEFORE_PARK)
    }

    /// Constructs a `StdPark` bound to the currently running thread, spinning
    /// `spin_before_park` iterations before each OS park (spec §6.1's
    /// `RuntimeConfig::spin_before_park`).
    #[must_use]
    pub fn with_spin_before_park(spin_before_park: usize) -> Self {
        Self {
            thread: thread::current(),
            spin_before_park,
        }
    }

    fn spin(&self) {
        for _ in 0..self.spin_before_park {
            std::hint::spin_loop();
        }
    }
}

impl Park for StdPark {
    fn park(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread.id(),
            "StdPark::park called from a different thread than for_current()"
        );
        self.spin();
        thread::park();
    }

    fn park_until(&self, deadline: Deadline, clock: &Clock) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread.id(),
            "StdPark::park_until called from a different thread than for_current()"
        );
        self.spin();
        let now = Instant::now(clock);
        let target = deadline.as_instant(clock);
        thread::park_timeout(target.saturating_duration_since(now));
    }

    fn unpark(&self) {
        self.thread.unpark();
    }
}
