// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::timer::Entry;
use crate::time::{Instant, Ticks, TimeError, Timer};
use std::fmt;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use pin_project::{pin_project, pinned_drop};

/// Wait until duration has elapsed.
///
/// # Errors
///
/// Fails with [`TimeError::DurationTooLong`] if `duration` exceeds the
/// timer's clock's maximum representable duration.
pub fn sleep(timer: &Timer, duration: Duration) -> Result<Sleep<'_>, TimeError> {
    let ticks = timer.clock.duration_to_ticks(duration)?;

    Ok(Sleep::new(timer, ticks))
}

/// Wait until the deadline has been reached.
///
/// # Errors
///
/// Fails with [`TimeError::DurationTooLong`] if `deadline` lies too far into
/// the future to be represented by the timer's clock.
pub fn sleep_until(timer: &Timer, deadline: Instant) -> Result<Sleep<'_>, TimeError> {
    let now = Instant::now(&timer.clock);
    let duration = deadline.saturating_duration_since(now);
    let ticks = timer.clock.duration_to_ticks(duration)?;

    Ok(Sleep::new(timer, ticks))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unregistered,
    Registered,
    Completed,
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep<'timer> {
    state: State,
    timer: &'timer Timer,
    ticks: Ticks,
    #[pin]
    entry: Entry,
}

impl<'timer> Sleep<'timer> {
    fn new(timer: &'timer Timer, ticks: Ticks) -> Self {
        let now = timer.clock.now_ticks();
        let deadline = Ticks(now.0 + ticks.0);

        Self {
            state: State::Unregistered,
            timer,
            ticks,
            entry: Entry::new(deadline),
        }
    }
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        tracing::trace!(self=?self, "Sleep::poll");
        let mut me = self.as_mut().project();

        match me.state {
            State::Unregistered => {
                let mut lock = me.timer.core.lock();

                // While we are holding the wheel lock, go ahead and advance the
                // timer, too. This way, the timer wheel gets advanced more
                // frequently than just when a scheduler tick completes or a
                // timer IRQ fires, helping to increase timer accuracy.
                me.timer.turn_locked(&mut lock);

                // Safety: the timer impl promises to treat the pointer as pinned
                let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(me.entry.as_mut())) };

                // Safety: we just created the pointer from a mutable reference
                match unsafe { lock.register(ptr) } {
                    Poll::Ready(()) => {
                        *me.state = State::Completed;
                        return Poll::Ready(());
                    }
                    Poll::Pending => {
                        *me.state = State::Registered;
                        drop(lock);
                    }
                }
            }
            State::Registered if me.entry.is_registered.load(Ordering::Acquire) => {}
            _ => return Poll::Ready(()),
        }

        let _poll = ready!(me.entry.waker.poll_wait(cx));
        debug_assert!(
            _poll.is_err(),
            "a Sleep's WaitCell should only be woken by closing"
        );
        Poll::Ready(())
    }
}

#[pinned_drop]
impl PinnedDrop for Sleep<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        tracing::trace!("Sleep::drop");
        let this = self.project();
        // we only need to remove the sleep from the timer wheel if it's
        // currently part of a linked list --- if the future hasn't been polled
        // yet, or it has already completed, we don't need to lock the timer to
        // remove it.
        if this.entry.is_registered.load(Ordering::Acquire) {
            let mut lock = this.timer.core.lock();
            lock.cancel(this.entry);
        }
    }
}

impl fmt::Debug for Sleep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            state,
            entry,
            timer,
            ..
        } = self;
        f.debug_struct("Sleep")
            .field("duration", &self.timer.clock.ticks_to_duration(self.ticks))
            .field("state", &state)
            .field("entry", &(entry as *const Entry))
            .field("timer", &(*timer as *const Timer))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, Worker};
    use crate::test_util::StdPark;
    use crate::time::Clock;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn sleep_block_on() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let exec: Executor<StdPark> = Executor::new(1, Clock::system());
        let exec: &'static Executor<StdPark> = Box::leak(Box::new(exec));
        let mut worker = Worker::new(exec, 0, StdPark::for_current());

        worker.block_on(async {
            let begin = std::time::Instant::now();

            sleep(exec.timer(), Duration::from_millis(200))
                .unwrap()
                .await;

            let elapsed = begin.elapsed();
            assert!(
                elapsed.as_millis() >= 200,
                "expected to sleep at least 200ms, but got {}",
                elapsed.as_millis()
            );
        });
    }
}
