// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::task::{Id, TaskRef};

/// The error returned by a [`JoinHandle`] when the task did not complete
/// normally: either it panicked, or it was cancelled via [`JoinHandle::abort`]
/// (or the completion notifier was torn down during runtime shutdown).
#[derive(Debug)]
pub enum JoinError<T> {
    /// The task's future panicked while being polled.
    Panic {
        id: Id,
        payload: Box<dyn Any + Send + 'static>,
    },
    /// The task was cancelled before (or, racily, right as) it completed.
    ///
    /// If the task had already produced a value before the cancellation was
    /// observed, that value is attached here rather than discarded.
    Cancelled { id: Id, output: Option<T> },
}

impl<T> JoinError<T> {
    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        Self::Panic { id, payload }
    }

    pub(crate) fn cancelled(completed: bool, id: Id) -> JoinError<()> {
        JoinError::Cancelled {
            id,
            output: completed.then_some(()),
        }
    }

    /// The id of the task that this error originated from.
    #[must_use]
    pub fn id(&self) -> Id {
        match self {
            JoinError::Panic { id, .. } => *id,
            JoinError::Cancelled { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panic { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled { .. })
    }

    /// Whether the task had already produced an output by the time
    /// cancellation was observed.
    pub(crate) fn is_completed(&self) -> bool {
        matches!(self, JoinError::Cancelled { output: Some(_), .. })
    }

    /// Re-attaches the task's produced output (if any) after a type-erased
    /// `poll_join` call has read it out of the cell.
    pub(crate) fn with_output<U>(self, output: Option<U>) -> JoinError<U> {
        match self {
            JoinError::Panic { id, payload } => JoinError::Panic { id, payload },
            JoinError::Cancelled { id, .. } => JoinError::Cancelled { id, output },
        }
    }

    /// Consumes the error, re-raising the original panic payload if this was
    /// a panic, and panicking with a diagnostic message otherwise.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            JoinError::Panic { payload, .. } => payload,
            JoinError::Cancelled { .. } => panic!("`JoinError` was not a panic"),
        }
    }
}

impl<T> fmt::Display for JoinError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panic { id, .. } => write!(f, "task {id} panicked"),
            JoinError::Cancelled { id, .. } => write!(f, "task {id} was cancelled"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for JoinError<T> {}

/// A detachable, awaitable handle to a spawned task's eventual output.
///
/// Dropping a `JoinHandle` without awaiting it detaches the task: the task
/// keeps running (or keeps the output it already produced) to completion,
/// but nothing observes the result. Detaching never cancels a task; call
/// [`abort`](JoinHandle::abort) explicitly for that.
#[must_use = "a `JoinHandle` does nothing unless polled or awaited"]
pub struct JoinHandle<T> {
    raw: TaskRef,
    _output: PhantomData<fn() -> T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(raw: TaskRef) -> Self {
        Self {
            raw,
            _output: PhantomData,
        }
    }

    /// This task's id.
    #[must_use]
    pub fn id(&self) -> Id {
        self.raw.id()
    }

    /// Returns `true` if the task has finished running.
    ///
    /// Note that a `true` result here doesn't guarantee a subsequent call to
    /// `poll`/`await` will complete immediately, as the output may need to be
    /// synchronised across cores; it will, however, never block.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.raw.is_complete()
    }

    /// Requests cancellation of the task. The task observes `CANCELLED` on
    /// its next poll; this is a request, not a pre-emption (spec §4.2).
    /// Returns `true` if this call is what transitioned the task to
    /// cancelled.
    pub fn abort(&self) -> bool {
        self.raw.cancel()
    }

    /// Detaches the handle: the task continues running, but its result will
    /// never be observed. Equivalent to `drop(handle)`.
    pub fn detach(self) {
        drop(self);
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `T` is the same type this handle was constructed with.
        unsafe { self.raw.poll_join::<T>(cx) }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.raw.state().drop_join_interest();
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id()).finish()
    }
}
