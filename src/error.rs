// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

/// An error returned by [`Executor::spawn`](crate::executor::Executor::spawn)
/// or [`Runtime::spawn`](crate::runtime::Runtime::spawn).
#[derive(Debug)]
pub enum SpawnError {
    /// The executor (or runtime) has been shut down and is no longer
    /// accepting new tasks.
    Closed,
}

impl From<Closed> for SpawnError {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Closed => f.write_str("executor was closed"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// An error indicating that a channel, queue or notification primitive has
/// been closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl std::error::Error for Closed {}

/// An error returned by [`Timeout`](crate::time::Timeout) when the wrapped
/// future did not complete before the deadline elapsed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Elapsed(pub(crate) ());

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline has elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// An error returned when submitting an operation to the [reactor](crate::reactor::Reactor) fails.
#[derive(Debug)]
#[non_exhaustive]
pub enum SubmitError {
    /// The reactor has been shut down and is no longer accepting submissions.
    Closed,
    /// The underlying OS poller rejected the submission (e.g. the file
    /// descriptor is invalid, or the interest set could not be registered).
    Os(std::io::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Closed => f.write_str("reactor was closed"),
            SubmitError::Os(err) => write!(f, "failed to submit operation to reactor: {err}"),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Closed => None,
            SubmitError::Os(err) => Some(err),
        }
    }
}

/// The outcome of a reactor operation cell that did not resolve with its
/// normal typed result (spec §4.4's "distinguished sentinel" for timeout and
/// §7's cancellation/shutdown sentinels).
#[derive(Debug)]
#[non_exhaustive]
pub enum OpError {
    /// The underlying OS operation completed with an error.
    Io(std::io::Error),
    /// The operation's deadline elapsed before it completed.
    Timeout,
    /// The operation was cancelled (its future was dropped before completion,
    /// or an explicit `abort` reached it).
    Cancelled,
    /// The reactor was shut down while the operation was still pending.
    Shutdown,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Io(err) => write!(f, "reactor operation failed: {err}"),
            OpError::Timeout => f.write_str("reactor operation timed out"),
            OpError::Cancelled => f.write_str("reactor operation was cancelled"),
            OpError::Shutdown => f.write_str("reactor operation aborted by shutdown"),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpError::Io(err) => Some(err),
            OpError::Timeout | OpError::Cancelled | OpError::Shutdown => None,
        }
    }
}

/// An error returned by [`Runtime::shutdown`](crate::runtime::Runtime::shutdown).
#[derive(Debug)]
#[non_exhaustive]
pub enum ShutdownError {
    /// Shutdown did not complete within the configured grace period; some
    /// worker threads may still be running.
    Timeout,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownError::Timeout => f.write_str("runtime shutdown timed out"),
        }
    }
}

impl std::error::Error for ShutdownError {}
