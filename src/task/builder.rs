// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::any::type_name;
use std::panic::Location;

use crate::executor::Schedule;
use crate::task::id::Id;
use crate::task::join_handle::JoinHandle;
use crate::task::{Task, TaskRef};

/// Builds a task prior to allocation, letting callers override its debug
/// name, kind, and source location for diagnostics (spans, panic messages).
///
/// Spawning itself is the caller's responsibility (see
/// [`crate::executor::Worker::spawn`]): this builder only constructs the
/// allocated cell and its join handle.
pub(crate) struct TaskBuilder<'a> {
    location: Option<Location<'a>>,
    name: Option<&'a str>,
    kind: &'a str,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new() -> Self {
        Self {
            location: None,
            name: None,
            kind: "task",
        }
    }

    /// Override the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed.
    #[allow(dead_code)]
    pub(crate) fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the kind string of tasks spawned by this builder. Only shows
    /// up in debug messages and spans. By default, tasks are of kind `"task"`.
    #[allow(dead_code)]
    pub(crate) fn kind(mut self, kind: &'a str) -> Self {
        self.kind = kind;
        self
    }

    /// Override the source code location associated with tasks spawned by
    /// this builder. By default, tasks inherit the caller's location.
    #[allow(dead_code)]
    pub(crate) fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }

    /// Allocates the task cell and returns the scheduler-facing [`TaskRef`]
    /// alongside the user-facing [`JoinHandle`]. The returned `TaskRef` is
    /// not yet bound to a scheduler or enqueued anywhere.
    #[track_caller]
    pub(crate) fn build<F, S>(&self, future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: Schedule + 'static,
    {
        let id = Id::next();
        let loc = self.location.as_ref().copied().unwrap_or_else(|| *Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?self.name,
            task.kind = self.kind,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let task: Task<F, S> = Task::new(future, id, span);
        TaskRef::new_allocated::<S, F>(Box::new(task))
    }
}
