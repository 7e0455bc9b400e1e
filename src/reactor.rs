// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reactor / completion bridge (spec §4.4): adapts a readiness-based OS
//! event loop ([`polling`]) to the poll protocol, tracking per-operation
//! deadlines and typed results.

use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use polling::{Event, Events, Poller};
use slab::Slab;
use spin::Mutex;

use crate::error::{OpError, SubmitError};
use crate::time::{Clock, Instant};

/// The kind of OS operation an [`OpCell`] tracks (spec §3's "reactor
/// operation cell").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpKind {
    Read,
    Write,
    Accept,
    Connect,
    Timer,
    Close,
}

/// The typed success value of a completed operation, keyed by [`OpKind`].
#[derive(Copy, Clone, Debug)]
enum OpValue {
    /// `read`/`write`: bytes transferred.
    Bytes(usize),
    /// `accept`: the accepted connection's raw descriptor.
    Fd(RawFd),
    /// `connect`/`timer`/`close`: no payload beyond success.
    Unit,
}

/// Converts a completed operation's untyped [`OpValue`] into the caller's
/// expected output type. A mismatch between `Self` and the cell's recorded
/// [`OpKind`] is a programming error (spec §4.4), so this panics rather than
/// returning a `Result`.
trait FromOpValue: Sized {
    fn from_op_value(kind: OpKind, value: OpValue) -> Self;
}

impl FromOpValue for usize {
    fn from_op_value(kind: OpKind, value: OpValue) -> Self {
        match value {
            OpValue::Bytes(n) => n,
            _ => panic!("operation kind mismatch: expected byte count for {kind:?}"),
        }
    }
}

impl FromOpValue for RawFd {
    fn from_op_value(kind: OpKind, value: OpValue) -> Self {
        match value {
            OpValue::Fd(fd) => fd,
            _ => panic!("operation kind mismatch: expected a descriptor for {kind:?}"),
        }
    }
}

impl FromOpValue for () {
    fn from_op_value(kind: OpKind, value: OpValue) -> Self {
        match value {
            OpValue::Unit => (),
            _ => panic!("operation kind mismatch: expected unit for {kind:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CellState {
    Pending,
    Ready,
    Error,
    Timeout,
    Cancelled,
    Shutdown,
}

/// Per-operation state tracking one reactor op (spec §3's "reactor operation
/// cell"). Owned jointly by the future holding the [`OpHandle`] and, while
/// the operation is in flight, by the reactor's completion path — hence the
/// `Arc`.
struct OpCell {
    id: u64,
    kind: OpKind,
    state: Mutex<CellState>,
    result: Mutex<Option<Result<OpValue, io::Error>>>,
    waker: Mutex<Option<Waker>>,
    submitted_at: Instant,
    deadline: Option<Instant>,
    /// The slab key of the `Source` this op is registered against, if any
    /// (timers have none).
    source_key: Option<usize>,
}

impl OpCell {
    fn complete(&self, result: Result<OpValue, io::Error>) {
        let mut state = self.state.lock();
        if *state != CellState::Pending {
            // Late completion after timeout/cancellation: discard (spec §4.4).
            return;
        }
        *state = if result.is_ok() { CellState::Ready } else { CellState::Error };
        drop(state);
        *self.result.lock() = Some(result);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// A live handle to a submitted reactor operation. Polls extract the typed
/// result once the cell transitions out of `Pending`.
pub struct OpHandle<T> {
    reactor: Arc<ReactorInner>,
    cell: Arc<OpCell>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: FromOpValue> OpHandle<T> {
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, OpError>> {
        let now = Instant::now(&self.reactor.clock);

        {
            let mut state = self.cell.state.lock();
            if *state == CellState::Pending {
                if let Some(deadline) = self.cell.deadline {
                    if now >= deadline {
                        *state = CellState::Timeout;
                        drop(state);
                        self.reactor.ops_timed_out.fetch_add(1, Ordering::Relaxed);
                        self.release();
                        return Poll::Ready(Err(OpError::Timeout));
                    }
                }
            }
        }

        let state = *self.cell.state.lock();
        match state {
            CellState::Pending => {
                *self.cell.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
            CellState::Timeout => {
                self.release();
                Poll::Ready(Err(OpError::Timeout))
            }
            CellState::Cancelled => {
                self.release();
                Poll::Ready(Err(OpError::Cancelled))
            }
            CellState::Shutdown => {
                self.release();
                Poll::Ready(Err(OpError::Shutdown))
            }
            CellState::Ready | CellState::Error => {
                let result = self.cell.result.lock().take().expect("ready cell has a result");
                self.reactor.ops_completed.fetch_add(1, Ordering::Relaxed);
                self.record_latency();
                self.release();
                match result {
                    Ok(value) => Poll::Ready(Ok(T::from_op_value(self.cell.kind, value))),
                    Err(err) => Poll::Ready(Err(OpError::Io(err))),
                }
            }
        }
    }

    fn record_latency(&self) {
        let now = Instant::now(&self.reactor.clock);
        let nanos = now.saturating_duration_since(self.cell.submitted_at).as_nanos();
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX);
        self.reactor.latency_nanos_total.fetch_add(nanos, Ordering::Relaxed);
        self.reactor.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases this handle's reference to the operation cell, removing it
    /// from the reactor's bookkeeping.
    fn release(&mut self) {
        self.reactor.release_op(self.cell.id, self.cell.source_key);
    }
}

impl<T> Drop for OpHandle<T> {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock();
        if *state == CellState::Pending {
            *state = CellState::Cancelled;
            drop(state);
            self.reactor.withdraw(&self.cell);
            self.reactor.release_op(self.cell.id, self.cell.source_key);
        }
    }
}

/// A registered file descriptor's read/write interest bookkeeping.
struct Source {
    raw_fd: RawFd,
    registered: bool,
    read: Option<Arc<OpCell>>,
    write: Option<Arc<OpCell>>,
}

struct ReactorInner {
    clock: Clock,
    poller: Poller,
    sources: Mutex<Slab<Source>>,
    timers: Mutex<Vec<Arc<OpCell>>>,
    next_op_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
    /// Applied to `submit_read`/`submit_write`/`submit_accept`/`submit_connect`
    /// calls that pass `None` (spec §6.1's `default_op_timeout`).
    default_op_timeout: Option<Duration>,

    // Observability counters (spec §6.1): emitted, not consumed by the core.
    ops_submitted: AtomicU64,
    ops_completed: AtomicU64,
    ops_timed_out: AtomicU64,
    latency_nanos_total: AtomicU64,
    latency_samples: AtomicU64,
}

impl ReactorInner {
    fn release_op(&self, _id: u64, source_key: Option<usize>) {
        let Some(key) = source_key else { return };
        let mut sources = self.sources.lock();
        if let Some(source) = sources.get_mut(key) {
            if source.read.is_none() && source.write.is_none() {
                let registered = source.registered;
                let raw_fd = source.raw_fd;
                sources.remove(key);
                if registered {
                    // Safety: `raw_fd` was added with `poller.add` below and
                    // has not been closed out from under us.
                    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw_fd) };
                    let _ = self.poller.delete(&borrowed);
                }
            }
        }
    }

    fn withdraw(&self, cell: &Arc<OpCell>) {
        match cell.kind {
            OpKind::Timer => {
                self.timers.lock().retain(|t| t.id != cell.id);
            }
            _ => {
                // Backend does not support per-interest withdrawal beyond
                // dropping the stored waker; `release_op` removes the fd's
                // registration once both directions are unused.
            }
        }
    }
}

/// The reactor: submits operations to the OS event loop and wakes the
/// originating task's stored waker on completion (spec §4.4).
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("ops_submitted", &self.inner.ops_submitted.load(Ordering::Relaxed))
            .field("ops_completed", &self.inner.ops_completed.load(Ordering::Relaxed))
            .field("ops_timed_out", &self.inner.ops_timed_out.load(Ordering::Relaxed))
            .finish()
    }
}

impl Reactor {
    /// Builds a new reactor bound to `clock`, backed by a fresh OS poller,
    /// with no default operation timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Os`] if the OS poller could not be created.
    pub fn new(clock: Clock) -> Result<Self, SubmitError> {
        Self::with_default_op_timeout(clock, None)
    }

    /// Builds a new reactor bound to `clock`, applying `default_op_timeout`
    /// to any `submit_read`/`submit_write`/`submit_accept`/`submit_connect`
    /// call that doesn't specify its own deadline (spec §6.1's
    /// `RuntimeConfig::default_op_timeout`).
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Os`] if the OS poller could not be created.
    pub fn with_default_op_timeout(clock: Clock, default_op_timeout: Option<Duration>) -> Result<Self, SubmitError> {
        let poller = Poller::new().map_err(SubmitError::Os)?;
        Ok(Self {
            inner: Arc::new(ReactorInner {
                clock,
                poller,
                sources: Mutex::new(Slab::new()),
                timers: Mutex::new(Vec::new()),
                next_op_id: AtomicU64::new(0),
                closed: std::sync::atomic::AtomicBool::new(false),
                default_op_timeout,
                ops_submitted: AtomicU64::new(0),
                ops_completed: AtomicU64::new(0),
                ops_timed_out: AtomicU64::new(0),
                latency_nanos_total: AtomicU64::new(0),
                latency_samples: AtomicU64::new(0),
            }),
        })
    }

    fn next_id(&self) -> u64 {
        self.inner.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    fn new_cell(&self, kind: OpKind, timeout: Option<Duration>, source_key: Option<usize>) -> Arc<OpCell> {
        self.inner.ops_submitted.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now(&self.inner.clock);
        Arc::new(OpCell {
            id: self.next_id(),
            kind,
            state: Mutex::new(CellState::Pending),
            result: Mutex::new(None),
            waker: Mutex::new(None),
            submitted_at: now,
            deadline: timeout.and_then(|d| now.checked_add(d)),
            source_key,
        })
    }

    fn handle<T>(&self, cell: Arc<OpCell>) -> OpHandle<T> {
        OpHandle {
            reactor: self.inner.clone(),
            cell,
            _marker: std::marker::PhantomData,
        }
    }

    fn submit_io(&self, raw_fd: RawFd, kind: OpKind, timeout: Option<Duration>, readable: bool) -> Result<Arc<OpCell>, SubmitError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }

        let timeout = timeout.or(self.inner.default_op_timeout);
        let mut sources = self.inner.sources.lock();
        let key = sources
            .iter()
            .find(|(_, s)| s.raw_fd == raw_fd)
            .map(|(k, _)| k)
            .unwrap_or_else(|| {
                sources.insert(Source { raw_fd, registered: false, read: None, write: None })
            });

        let cell = self.new_cell(kind, timeout, Some(key));
        {
            let source = &mut sources[key];
            if readable {
                source.read = Some(cell.clone());
            } else {
                source.write = Some(cell.clone());
            }
            self.arm(key, source)?;
        }

        Ok(cell)
    }

    fn arm(&self, key: usize, source: &mut Source) -> Result<(), SubmitError> {
        let interest = Event::new(key, source.read.is_some(), source.write.is_some());
        if source.registered {
            // Safety: `raw_fd` stays open and registered for as long as
            // `source` remains in the slab; it is deregistered in
            // `release_op` before removal.
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(source.raw_fd) };
            self.inner.poller.modify(borrowed, interest).map_err(SubmitError::Os)?;
        } else {
            // Safety: `raw_fd` is owned by the caller for the lifetime of
            // this registration and is deregistered before the caller closes
            // it (see `release_op`).
            unsafe { self.inner.poller.add(source.raw_fd, interest) }.map_err(SubmitError::Os)?;
            source.registered = true;
        }
        Ok(())
    }

    /// Submits a read-readiness wait for `fd`.
    pub fn submit_read(&self, fd: RawFd, timeout: Option<Duration>) -> Result<OpHandle<usize>, SubmitError> {
        self.submit_io(fd, OpKind::Read, timeout, true).map(|cell| self.handle(cell))
    }

    /// Submits a write-readiness wait for `fd`.
    pub fn submit_write(&self, fd: RawFd, timeout: Option<Duration>) -> Result<OpHandle<usize>, SubmitError> {
        self.submit_io(fd, OpKind::Write, timeout, false).map(|cell| self.handle(cell))
    }

    /// Submits an accept-readiness wait for a listening socket `fd`.
    pub fn submit_accept(&self, fd: RawFd, timeout: Option<Duration>) -> Result<OpHandle<RawFd>, SubmitError> {
        self.submit_io(fd, OpKind::Accept, timeout, true).map(|cell| self.handle(cell))
    }

    /// Submits a connect-readiness wait for `fd` (the connect syscall having
    /// already been issued in non-blocking mode by the caller).
    pub fn submit_connect(&self, fd: RawFd, timeout: Option<Duration>) -> Result<OpHandle<()>, SubmitError> {
        self.submit_io(fd, OpKind::Connect, timeout, false).map(|cell| self.handle(cell))
    }

    /// Submits a close operation for `fd`. Completes immediately: closing a
    /// descriptor is a synchronous syscall, so this exists only to give
    /// callers a uniform `OpHandle`-shaped API (spec §6's `submit_close`).
    pub fn submit_close(&self, fd: RawFd) -> Result<OpHandle<()>, SubmitError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }
        let cell = self.new_cell(OpKind::Close, None, None);
        // Safety: the caller hands over ownership of `fd` by calling
        // `submit_close`; wrapping it in an `OwnedFd` and dropping it closes
        // it exactly once, with the same syscall a direct `close(2)` would make.
        drop(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) });
        cell.complete(Ok(OpValue::Unit));
        Ok(self.handle(cell))
    }

    /// Submits a timer that fires after `duration`.
    pub fn submit_timer(&self, duration: Duration) -> OpHandle<()> {
        let cell = self.new_cell(OpKind::Timer, Some(duration), None);
        self.inner.timers.lock().push(cell.clone());
        self.handle(cell)
    }

    /// Drives one iteration of the event loop: processes expired timers,
    /// waits on the OS poller for up to `timeout` (or indefinitely if
    /// `None`), and wakes every task whose operation is now resolved.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`io::Error`] if the OS poller wait fails.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<()> {
        let now = Instant::now(&self.inner.clock);

        {
            let mut timers = self.inner.timers.lock();
            let mut i = 0;
            while i < timers.len() {
                let fires = timers[i].deadline.is_none_or(|d| now >= d);
                if fires {
                    let cell = timers.swap_remove(i);
                    cell.complete(Ok(OpValue::Unit));
                } else {
                    i += 1;
                }
            }
        }

        let next_timer_deadline = self.inner.timers.lock().iter().filter_map(|t| t.deadline).min();
        let effective_timeout = match (timeout, next_timer_deadline) {
            (t, None) => t,
            (t, Some(deadline)) => {
                let until = deadline.saturating_duration_since(now);
                Some(t.map_or(until, |t| t.min(until)))
            }
        };

        let mut events = Events::new();
        self.inner.poller.wait(&mut events, effective_timeout)?;

        let mut wakers = Vec::new();
        {
            let mut sources = self.inner.sources.lock();
            for ev in events.iter() {
                if let Some(source) = sources.get_mut(ev.key) {
                    if ev.readable {
                        if let Some(cell) = source.read.take() {
                            *cell.state.lock() = CellState::Ready;
                            *cell.result.lock() = Some(Ok(OpValue::Bytes(0)));
                            if let Some(w) = cell.waker.lock().take() {
                                wakers.push(w);
                            }
                        }
                    }
                    if ev.writable {
                        if let Some(cell) = source.write.take() {
                            *cell.state.lock() = CellState::Ready;
                            *cell.result.lock() = Some(Ok(OpValue::Unit));
                            if let Some(w) = cell.waker.lock().take() {
                                wakers.push(w);
                            }
                        }
                    }
                }
            }
        }

        for waker in wakers {
            waker.wake();
        }

        Ok(())
    }

    /// Shuts the reactor down: no further submissions are accepted, and all
    /// in-flight operations resolve with [`OpError::Shutdown`] (spec §7).
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let timers = std::mem::take(&mut *self.inner.timers.lock());
        for cell in timers {
            *cell.state.lock() = CellState::Shutdown;
            if let Some(w) = cell.waker.lock().take() {
                w.wake();
            }
        }

        let mut sources = self.inner.sources.lock();
        for (_, source) in sources.iter_mut() {
            for cell in [source.read.take(), source.write.take()].into_iter().flatten() {
                *cell.state.lock() = CellState::Shutdown;
                if let Some(w) = cell.waker.lock().take() {
                    w.wake();
                }
            }
        }
    }

    /// Emits the observability counters described in spec §6.1 via
    /// `tracing::debug!`.
    pub fn report_metrics(&self) {
        let submitted = self.inner.ops_submitted.load(Ordering::Relaxed);
        let completed = self.inner.ops_completed.load(Ordering::Relaxed);
        let timed_out = self.inner.ops_timed_out.load(Ordering::Relaxed);
        let samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let total_nanos = self.inner.latency_nanos_total.load(Ordering::Relaxed);
        let avg_latency_nanos = if samples == 0 { 0 } else { total_nanos / samples };

        tracing::debug!(
            reactor.ops_submitted = submitted,
            reactor.ops_completed = completed,
            reactor.ops_timed_out = timed_out,
            reactor.avg_latency_nanos = avg_latency_nanos,
            "reactor metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_clock() -> Clock {
        Clock::system()
    }

    #[test]
    fn timer_fires_after_duration() {
        let reactor = Reactor::new(test_clock()).unwrap();
        let mut handle = reactor.submit_timer(Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(5));
        reactor.turn(Some(Duration::ZERO)).unwrap();

        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(handle.poll(&mut cx), Poll::Ready(Ok(()))));
    }

    #[test]
    fn timer_times_out_with_shorter_deadline() {
        let reactor = Reactor::new(test_clock()).unwrap();
        let mut handle: OpHandle<()> = reactor.handle(reactor.new_cell(OpKind::Timer, Some(Duration::ZERO), None));

        std::thread::sleep(Duration::from_millis(1));
        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(handle.poll(&mut cx), Poll::Ready(Err(OpError::Timeout))));
    }

    #[test]
    fn shutdown_resolves_pending_timers_with_shutdown_error() {
        let reactor = Reactor::new(test_clock()).unwrap();
        let mut handle = reactor.submit_timer(Duration::from_secs(1));
        reactor.shutdown();

        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(handle.poll(&mut cx), Poll::Ready(Err(OpError::Shutdown))));
    }

    fn futures_noop_waker() -> Waker {
        use std::task::{RawWaker, RawWakerVTable};
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        // Safety: the vtable's functions are all no-ops over a null pointer.
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }
}
