// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task state word.
//!
//! A task's state is a single atomic `usize` packing the bits from
//! `spec.md` §3 (`RUNNING`, `COMPLETE`, `NOTIFIED`, `CANCELLED`,
//! `JOIN_INTEREST`) plus the `JOIN_WAKER` bit documented in `task.rs`'s
//! `join_waker` field and a trailing reference count. All transitions
//! are compare-and-swap loops; see `task.rs` for the seven-rule
//! `JOIN_WAKER` access protocol this module enforces.

use crossbeam_utils::CachePadded;
use mycelium_bitfield::bitfield;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::task::PollResult;

bitfield! {
    #[derive(Eq, PartialEq)]
    /// A snapshot of a task's state word.
    pub(crate) struct Snapshot<usize> {
        /// Set while a worker is inside the future's `poll` call.
        pub(crate) const RUNNING: bool;
        /// Set once the future has produced `Ready` (or panicked/been
        /// cancelled to completion). Implies the output slot holds a value.
        pub(crate) const COMPLETE: bool;
        /// Set whenever the task is woken while already `RUNNING`, so the
        /// poller knows to re-enqueue rather than drop the wake edge.
        pub(crate) const NOTIFIED: bool;
        /// Set by the join handle (or an explicit `abort`) to request
        /// cooperative cancellation. Diagnostic only unless the future
        /// observes it.
        pub(crate) const CANCELLED: bool;
        /// Cleared when the `JoinHandle` is dropped without awaiting.
        pub(crate) const JOIN_INTEREST: bool;
        /// Guards access to the task's `join_waker` slot; see `task.rs`.
        pub(crate) const JOIN_WAKER: bool;
        /// The remaining bits: the task's reference count.
        pub(crate) const REF_COUNT = ..;
    }
}

#[derive(Debug)]
pub(crate) struct State {
    bits: CachePadded<AtomicUsize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPollAction {
    Poll,
    DontPoll,
    Cancelled { wake_join_waker: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinAction {
    TakeOutput,
    Canceled { completed: bool },
    Register,
    Reregister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeByValAction {
    Enqueue,
    Drop,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeByRefAction {
    Enqueue,
    None,
}

impl State {
    pub(crate) const fn new() -> Self {
        let snapshot = Snapshot::new()
            .with(Snapshot::JOIN_INTEREST, true)
            .with(Snapshot::REF_COUNT, 1);
        Self {
            bits: CachePadded::new(AtomicUsize::new(snapshot.into_bits())),
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> Snapshot {
        Snapshot::from_bits(self.bits.load(order))
    }

    fn fetch_update(
        &self,
        mut f: impl FnMut(Snapshot) -> Option<Snapshot>,
    ) -> Result<Snapshot, Snapshot> {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let Some(next) = f(current) else {
                return Err(current);
            };
            match self.bits.compare_exchange_weak(
                current.into_bits(),
                next.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = Snapshot::from_bits(actual),
            }
        }
    }

    /// Returns the current reference count. Only meaningful immediately
    /// after construction or while the caller otherwise has exclusive
    /// knowledge that no concurrent mutation is in flight.
    pub(crate) fn refcount(&self) -> usize {
        self.load(Ordering::Acquire).get(Snapshot::REF_COUNT)
    }

    /// Increments the reference count. Mirrors `Arc::clone`.
    pub(crate) fn clone_ref(&self) {
        let prev = self.bits.fetch_add(Snapshot::ONE_REF_COUNT, Ordering::Relaxed);
        debug_assert_ne!(
            Snapshot::from_bits(prev).get(Snapshot::REF_COUNT),
            0,
            "cloned a task ref with a zero refcount"
        );
    }

    /// Decrements the reference count, returning `true` if this was the
    /// last reference (the caller must deallocate the cell).
    pub(crate) fn drop_ref(&self) -> bool {
        let prev = self.bits.fetch_sub(Snapshot::ONE_REF_COUNT, Ordering::AcqRel);
        let prev = Snapshot::from_bits(prev);
        debug_assert_ne!(prev.get(Snapshot::REF_COUNT), 0, "refcount underflow");
        prev.get(Snapshot::REF_COUNT) == 1
    }

    /// Sets the `CANCELLED` bit. Returns `true` if this call performed the
    /// transition (i.e. the task was not already cancelled).
    pub(crate) fn cancel(&self) -> bool {
        self.fetch_update(|snapshot| {
            if snapshot.get(Snapshot::CANCELLED) || snapshot.get(Snapshot::COMPLETE) {
                None
            } else {
                Some(snapshot.with(Snapshot::CANCELLED, true))
            }
        })
        .is_ok()
    }

    /// Attempts to transition into `RUNNING` ahead of a poll.
    pub(crate) fn start_poll(&self) -> StartPollAction {
        let result = self.fetch_update(|snapshot| {
            if snapshot.get(Snapshot::COMPLETE) {
                return None;
            }
            if snapshot.get(Snapshot::CANCELLED) {
                return Some(
                    snapshot
                        .with(Snapshot::COMPLETE, true)
                        .with(Snapshot::RUNNING, false)
                        .with(Snapshot::NOTIFIED, false),
                );
            }
            if snapshot.get(Snapshot::RUNNING) {
                return None;
            }
            Some(
                snapshot
                    .with(Snapshot::RUNNING, true)
                    .with(Snapshot::NOTIFIED, false),
            )
        });

        match result {
            Ok(next) if next.get(Snapshot::COMPLETE) => {
                // we raced a cancellation: the task completes without ever
                // running the future.
                let wake_join_waker = next.get(Snapshot::JOIN_INTEREST);
                StartPollAction::Cancelled { wake_join_waker }
            }
            Ok(_) => StartPollAction::Poll,
            Err(_) => StartPollAction::DontPoll,
        }
    }

    /// Transitions out of `RUNNING` once a poll has returned, given whether
    /// the future reported `Ready`.
    pub(crate) fn end_poll(&self, is_ready: bool) -> PollResult {
        let result = self
            .fetch_update(|snapshot| {
                debug_assert!(snapshot.get(Snapshot::RUNNING));
                let cancelled = snapshot.get(Snapshot::CANCELLED);
                let complete = is_ready || cancelled;
                Some(
                    snapshot
                        .with(Snapshot::RUNNING, false)
                        .with(Snapshot::COMPLETE, complete)
                        .with(Snapshot::NOTIFIED, false),
                )
            })
            .expect("end_poll state transition should never fail");

        if result.get(Snapshot::COMPLETE) {
            if result.get(Snapshot::JOIN_INTEREST) {
                PollResult::ReadyJoined
            } else {
                PollResult::Ready
            }
        } else if result.get(Snapshot::NOTIFIED) {
            PollResult::PendingSchedule
        } else {
            PollResult::Pending
        }
    }

    /// Polls the join handle: decides whether to take the output, register
    /// interest, or report cancellation.
    pub(crate) fn try_join(&self) -> JoinAction {
        let snapshot = self.load(Ordering::Acquire);
        if snapshot.get(Snapshot::CANCELLED) && !snapshot.get(Snapshot::COMPLETE) {
            return JoinAction::Canceled { completed: false };
        }
        if snapshot.get(Snapshot::COMPLETE) {
            if snapshot.get(Snapshot::CANCELLED) {
                return JoinAction::Canceled { completed: true };
            }
            return JoinAction::TakeOutput;
        }
        if snapshot.get(Snapshot::JOIN_WAKER) {
            JoinAction::Reregister
        } else {
            JoinAction::Register
        }
    }

    /// Marks that the join waker slot has been written (or rewritten),
    /// granting the executor shared read access once the task completes.
    pub(crate) fn join_waker_registered(&self) {
        self.bits
            .fetch_or(Snapshot::ONE_JOIN_WAKER, Ordering::AcqRel);
    }

    /// Clears `JOIN_INTEREST`, e.g. because the `JoinHandle` was dropped
    /// without awaiting. Does not cancel the task.
    pub(crate) fn drop_join_interest(&self) {
        self.fetch_update(|snapshot| Some(snapshot.with(Snapshot::JOIN_INTEREST, false)))
            .expect("drop_join_interest should never fail");
    }

    pub(crate) fn wake_by_val(&self) -> WakeByValAction {
        let result = self.fetch_update(|snapshot| {
            if snapshot.get(Snapshot::COMPLETE) {
                return None;
            }
            if snapshot.get(Snapshot::RUNNING) {
                Some(snapshot.with(Snapshot::NOTIFIED, true))
            } else {
                None
            }
        });

        match result {
            // running: just latch NOTIFIED, the active poller will
            // re-enqueue on its way out. the waker's own reference is
            // dropped by the caller.
            Ok(_) => WakeByValAction::Drop,
            Err(snapshot) if snapshot.get(Snapshot::COMPLETE) => WakeByValAction::Drop,
            Err(_) => WakeByValAction::Enqueue,
        }
    }

    pub(crate) fn wake_by_ref(&self) -> WakeByRefAction {
        match self.wake_by_val() {
            WakeByValAction::Enqueue => WakeByRefAction::Enqueue,
            _ => WakeByRefAction::None,
        }
    }
}

