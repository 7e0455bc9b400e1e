// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker run queues and work stealing.
//!
//! Each worker owns a [`crossbeam_deque::Worker`] (a Chase-Lev deque): the
//! owning thread pushes and pops from one end, while other workers steal
//! from the other end through a cloneable [`crossbeam_deque::Stealer`].
//! Tasks that arrive with no worker affinity (external `spawn` calls, or a
//! wake from a thread that isn't a worker) go through the shared
//! [`GlobalQueue`] instead.

use std::num::NonZeroUsize;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

use crate::task::TaskRef;

/// The local, single-consumer/multi-stealer run queue owned by one worker.
#[derive(Debug)]
pub(crate) struct LocalQueue {
    worker: Worker<TaskRef>,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self {
            worker: Worker::new_fifo(),
        }
    }

    pub(crate) fn stealer(&self) -> Stealer<TaskRef> {
        self.worker.stealer()
    }

    pub(crate) fn push(&self, task: TaskRef) {
        self.worker.push(task);
    }

    pub(crate) fn pop(&self) -> Option<TaskRef> {
        self.worker.pop()
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    pub(crate) fn inner(&self) -> &Worker<TaskRef> {
        &self.worker
    }
}

/// The global injector queue: the landing spot for tasks spawned or woken
/// from a thread with no local run queue of its own.
#[derive(Debug)]
pub(crate) struct GlobalQueue {
    injector: Injector<TaskRef>,
}

/// Indicates a steal attempt found nothing (as opposed to succeeding, which
/// yields a `TaskRef` directly). Internally-retriable contention
/// (`Steal::Retry`) never escapes to this type; callers spin on it until
/// they see either a task or a genuinely empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TryStealError;

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            injector: Injector::new(),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        self.injector.push(task);
    }

    /// Steals up to `batch_size` tasks from the global queue into `dest`,
    /// returning one of them (spec §4.3's batch steal, sized by
    /// `RuntimeConfig::steal_batch_size`).
    pub(crate) fn try_steal_into(&self, dest: &Worker<TaskRef>, batch_size: usize) -> Result<TaskRef, TryStealError> {
        loop {
            match self.injector.steal_batch_with_limit_and_pop(dest, batch_size) {
                Steal::Success(task) => return Ok(task),
                Steal::Empty => return Err(TryStealError),
                Steal::Retry => continue,
            }
        }
    }
}

/// Steals up to `batch_size` tasks from `stealer` into `dest` (spec §4.3's
/// batch steal, sized by `RuntimeConfig::steal_batch_size`).
pub(crate) fn steal_into(
    stealer: &Stealer<TaskRef>,
    dest: &Worker<TaskRef>,
    batch_size: usize,
) -> Result<TaskRef, TryStealError> {
    loop {
        match stealer.steal_batch_with_limit_and_pop(dest, batch_size) {
            Steal::Success(task) => return Ok(task),
            Steal::Empty => return Err(TryStealError),
            Steal::Retry => continue,
        }
    }
}

#[allow(dead_code)]
pub(crate) fn non_zero(n: usize) -> Option<NonZeroUsize> {
    NonZeroUsize::new(n)
}
