// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub(crate) mod steal;

use std::cell::{Cell, RefCell};
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use spin::Backoff;

use crate::park::{Park, Parker, ParkingLot};
use crate::task::builder::TaskBuilder;
use crate::task::{JoinHandle, TaskRef};
use crate::time::{Clock, Timer};
use steal::{GlobalQueue, LocalQueue, TryStealError};

/// How many tasks a single scheduler tick processed, and whether the local
/// queue still has runnable work left over.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tick {
    pub(crate) polled: usize,
    pub(crate) has_remaining: bool,
}

/// The behavior a task's waker needs from whatever scheduler it was spawned
/// on: enqueue it somewhere runnable again, and (for diagnostics) report
/// which task is presently running on the caller's thread.
///
/// A task is permanently bound to one concrete `Schedule` impl (spec §4.3):
/// binding it to a different implementor than the one it was constructed
/// with is a bug, guarded by `TaskRef::bind_scheduler`'s debug assertion.
pub(crate) trait Schedule: Clone + Send + Sync + 'static {
    fn current_task(&self) -> Option<TaskRef>;
    fn spawn(&self, task: TaskRef);
    fn wake(&self, task: TaskRef);
    fn tick_n(&self, n: usize) -> Tick;
    fn try_steal(&self) -> Result<TaskRef, TryStealError>;
}

/// A single worker's run queue plus enough context to enqueue work either
/// locally or, from other threads, through the shared injector.
struct WorkerQueue {
    local: LocalQueue,
    current_task: RefCell<Option<TaskRef>>,
}

// Safety: `local` (a Chase-Lev deque) is only ever pushed/popped from the
// owning worker thread; `current_task` is likewise only written by that
// thread. Other threads only ever touch this type through `Stealer` or by
// reading `current_task` for diagnostics.
unsafe impl Sync for WorkerQueue {}

/// A handle to one worker's scheduling state, shared by every `TaskRef`
/// spawned onto that worker.
#[derive(Clone)]
pub(crate) struct Scheduler {
    exec: &'static ExecutorInner,
    worker_id: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

thread_local! {
    /// The worker id of the worker currently running on this OS thread, if
    /// any. Used so a task's waker can push onto the owning worker's local
    /// queue directly when woken from that same thread, instead of always
    /// going through the (slower, contended) global injector.
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

impl Schedule for Scheduler {
    fn current_task(&self) -> Option<TaskRef> {
        self.exec.workers[self.worker_id].current_task.borrow().clone()
    }

    fn spawn(&self, task: TaskRef) {
        self.enqueue(task);
    }

    fn wake(&self, task: TaskRef) {
        self.enqueue(task);
    }

    fn tick_n(&self, n: usize) -> Tick {
        let queue = &self.exec.workers[self.worker_id];
        let mut polled = 0;
        while polled < n {
            let Some(task) = queue.local.pop() else {
                break;
            };
            *queue.current_task.borrow_mut() = Some(task.clone());
            task.poll();
            *queue.current_task.borrow_mut() = None;
            polled += 1;
        }
        Tick {
            polled,
            has_remaining: !queue.local.is_empty(),
        }
    }

    fn try_steal(&self) -> Result<TaskRef, TryStealError> {
        let queue = &self.exec.workers[self.worker_id];
        self.exec.global.try_steal_into(queue.local.inner(), self.exec.steal_batch_size)
    }
}

/// Returns the id of the worker currently running on this OS thread, if any.
///
/// Used by [`Runtime::block_on`](crate::runtime::Runtime::block_on) to
/// enforce spec §6's "must not be called from inside a worker" rule.
pub(crate) fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER.with(Cell::get)
}

impl Scheduler {
    fn enqueue(&self, task: TaskRef) {
        let on_owning_thread = CURRENT_WORKER.with(|c| c.get() == Some(self.worker_id));
        if on_owning_thread {
            self.exec.workers[self.worker_id].local.push(task);
        } else {
            self.exec.global.push(task);
            self.exec.parking_lot.unpark_one();
        }
    }
}

/// Scheduler tunables applied at construction (spec §4.3 / §6.1's
/// `steal_batch_size`).
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Maximum number of tasks opportunistically taken in a single
    /// successful steal.
    pub steal_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { steal_batch_size: 32 }
    }
}

struct ExecutorInner {
    workers: Box<[WorkerQueue]>,
    stealers: Box<[crossbeam_deque::Stealer<TaskRef>]>,
    global: GlobalQueue,
    stop: AtomicBool,
    num_stealing: AtomicUsize,
    timer: Timer,
    steal_batch_size: usize,
}

/// The work-stealing executor: a fixed pool of per-core run queues plus a
/// shared injector queue and timer, driven by one [`Worker`] loop per OS
/// thread (spec §4.3).
pub struct Executor<P> {
    inner: ExecutorInner,
    parking_lot: ParkingLot<P>,
}

impl<P> std::fmt::Debug for Executor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("num_workers", &self.inner.workers.len())
            .finish()
    }
}

impl<P> Executor<P> {
    #[inline]
    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }
}

impl<P> Executor<P>
where
    P: Park + Send + Sync,
{
    #[must_use]
    pub fn new(num_workers: usize, clock: Clock) -> Self {
        Self::with_config(num_workers, clock, SchedulerConfig::default())
    }

    /// Builds an executor with explicit scheduler tunables (spec §6.1's
    /// `steal_batch_size`), rather than [`SchedulerConfig::default`].
    #[must_use]
    pub fn with_config(num_workers: usize, clock: Clock, config: SchedulerConfig) -> Self {
        let queues: Vec<LocalQueue> = (0..num_workers).map(|_| LocalQueue::new()).collect();
        let stealers: Box<[_]> = queues.iter().map(LocalQueue::stealer).collect();
        let workers: Box<[_]> = queues
            .into_iter()
            .map(|local| WorkerQueue {
                local,
                current_task: RefCell::new(None),
            })
            .collect();

        Self {
            inner: ExecutorInner {
                workers,
                stealers,
                global: GlobalQueue::new(),
                stop: AtomicBool::new(false),
                num_stealing: AtomicUsize::new(0),
                timer: Timer::new(clock),
                steal_batch_size: config.steal_batch_size.max(1),
            },
            parking_lot: ParkingLot::with_capacity(num_workers),
        }
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.parking_lot.unpark_all();
    }

    /// Returns a [`Scheduler`] handle bound to `worker_id`.
    ///
    /// # Panics
    ///
    /// Panics if `worker_id` is out of range.
    pub(crate) fn scheduler(&'static self, worker_id: usize) -> Scheduler {
        assert!(worker_id < self.inner.workers.len());
        Scheduler {
            exec: &self.inner,
            worker_id,
        }
    }

    /// Attempt to spawn this [`Future`] onto the executor.
    ///
    /// Returns a [`JoinHandle`] that can be used to await the future's
    /// output and control some aspects of its runtime behavior (such as
    /// cancelling it). Tasks spawned from outside a worker thread land on a
    /// pseudo-randomly chosen worker's queue.
    #[inline]
    #[track_caller]
    pub fn spawn<F>(&'static self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let worker_id = self.pick_worker();
        let scheduler = self.scheduler(worker_id);
        let (task, join) = TaskBuilder::new().build::<F, Scheduler>(future);
        // Safety: `scheduler` is the same `Scheduler` type this task was
        // constructed with.
        unsafe {
            task.bind_scheduler(scheduler);
        }
        self.spawn_allocated(task, worker_id);
        join
    }

    pub(crate) fn spawn_allocated(&'static self, task: TaskRef, worker_id: usize) {
        let on_owning_thread = CURRENT_WORKER.with(|c| c.get() == Some(worker_id));
        if on_owning_thread {
            tracing::trace!("spawning locally {task:?}");
            self.inner.workers[worker_id].local.push(task);
        } else {
            tracing::trace!("spawning remote {task:?}");
            self.inner.global.push(task);
            self.parking_lot.unpark_one();
        }
    }

    fn pick_worker(&self) -> usize {
        fastrand::usize(..self.inner.workers.len().max(1))
    }

    fn try_transition_worker_to_stealing(&self, worker: &mut Worker<P>) -> bool {
        debug_assert!(!worker.is_stealing);

        let num_stealing = self.inner.num_stealing.load(Ordering::Acquire);
        let num_parked = self.parking_lot.num_parked();

        if 2 * num_stealing >= self.active_workers().saturating_sub(num_parked) {
            return false;
        }

        worker.is_stealing = true;
        self.inner.num_stealing.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn transition_worker_from_stealing(&self, worker: &mut Worker<P>) -> bool {
        debug_assert!(worker.is_stealing);
        worker.is_stealing = false;

        let prev = self.inner.num_stealing.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev == 1
    }

    fn active_workers(&self) -> usize {
        self.inner.workers.len()
    }
}

/// A single OS thread driving one of the executor's run queues.
pub struct Worker<P: 'static> {
    id: usize,
    exec: &'static Executor<P>,
    scheduler: Scheduler,
    parker: Parker<P>,
    is_stealing: bool,
}

impl<P> Worker<P>
where
    P: Park + Send + Sync,
{
    #[must_use]
    pub fn new(exec: &'static Executor<P>, id: usize, park: P) -> Self {
        let scheduler = exec.scheduler(id);
        Self {
            id,
            exec,
            scheduler,
            parker: Parker::new(park),
            is_stealing: false,
        }
    }

    pub fn run(&mut self) {
        let _span = tracing::debug_span!("worker main loop", worker = self.id).entered();
        CURRENT_WORKER.with(|c| c.set(Some(self.id)));

        loop {
            if self.tick() {
                continue;
            }

            if self.exec.inner.stop.load(Ordering::Acquire) {
                tracing::debug!(worker = self.id, "stop signal received, shutting down");
                break;
            }

            tracing::trace!("turning timer...");
            let (expired, maybe_next_deadline) =
                self.exec.inner.timer.try_turn().unwrap_or((0, None));

            if expired > 0 {
                continue;
            }

            tracing::trace!(maybe_next_deadline = ?maybe_next_deadline, "going to sleep");
            if let Some(next_deadline) = maybe_next_deadline {
                self.exec.parking_lot.park_until(
                    self.parker.clone(),
                    next_deadline,
                    self.exec.inner.timer.clock(),
                );
            } else {
                self.exec.parking_lot.park(self.parker.clone());
            }
            tracing::trace!("woke up");
        }
    }

    #[track_caller]
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        let _span = tracing::debug_span!("worker block_on", worker = self.id).entered();
        CURRENT_WORKER.with(|c| c.set(Some(self.id)));

        let waker = self.parker.clone().into_unpark().into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut future = pin!(future);

        loop {
            if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                return v;
            }

            if self.tick() {
                continue;
            }

            tracing::trace!("turning timer...");
            let (expired, maybe_next_deadline) =
                self.exec.inner.timer.try_turn().unwrap_or((0, None));

            if expired > 0 {
                continue;
            }

            tracing::trace!(maybe_next_deadline = ?maybe_next_deadline, "going to sleep");
            if let Some(next_deadline) = maybe_next_deadline {
                self.exec.parking_lot.park_until(
                    self.parker.clone(),
                    next_deadline,
                    self.exec.inner.timer.clock(),
                );
            } else {
                self.exec.parking_lot.park(self.parker.clone());
            }
            tracing::trace!("woke up");
        }
    }

    fn tick(&mut self) -> bool {
        let tick = self.scheduler.tick_n(256);
        tracing::trace!(worker = self.id, ?tick.polled, ?tick.has_remaining, "worker tick");

        if tick.has_remaining {
            return true;
        }

        if self.exec.try_transition_worker_to_stealing(self) {
            if let Some(stolen) = self.try_steal() {
                tracing::trace!(tick.stolen = stolen.get());
                self.exec.transition_worker_from_stealing(self);
                return true;
            }
            self.exec.transition_worker_from_stealing(self);
        }

        false
    }

    fn try_steal(&mut self) -> Option<NonZeroUsize> {
        const ROUNDS: usize = 4;

        if self.scheduler.try_steal().is_ok() {
            return NonZeroUsize::new(1);
        }

        let num_workers = self.exec.active_workers();
        if num_workers <= 1 {
            return None;
        }

        let mut backoff = Backoff::new();
        for _ in 0..ROUNDS {
            let start = fastrand::usize(..num_workers);
            if let Some(stolen) = self.steal_one_round(num_workers, start) {
                return Some(stolen);
            }
            backoff.spin();
        }

        if self.scheduler.try_steal().is_ok() {
            return NonZeroUsize::new(1);
        }

        None
    }

    fn steal_one_round(&mut self, num_workers: usize, start: usize) -> Option<NonZeroUsize> {
        let dest = self.exec.inner.workers[self.id].local.inner();
        for i in 0..num_workers {
            let i = (start + i) % num_workers;
            if i == self.id {
                continue;
            }

            match steal::steal_into(&self.exec.inner.stealers[i], dest, self.exec.inner.steal_batch_size) {
                Ok(_) => {
                    tracing::trace!("stole a task from worker {i}");
                    return NonZeroUsize::new(1);
                }
                Err(_) => continue,
            }
        }
        None
    }
}

impl<P> std::fmt::Debug for Worker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::StdPark;
    use std::hint::black_box;
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn test_clock() -> Clock {
        Clock::system()
    }

    #[test]
    fn single_threaded_executor() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default();

        static EXEC: std::sync::OnceLock<Executor<StdPark>> = std::sync::OnceLock::new();
        let exec = EXEC.get_or_init(|| Executor::new(1, test_clock()));
        let exec: &'static Executor<StdPark> = exec;

        exec.spawn(async move {
            tracing::info!("Hello World!");
            exec.stop();
        });

        let mut worker = Worker::new(exec, 0, StdPark::for_current());
        worker.run();
    }

    #[test]
    fn block_on() {
        async fn work(num_polls: &AtomicUsize) -> usize {
            num_polls.fetch_add(1, Ordering::Relaxed);
            let val = 1 + 1;
            crate::task::yield_now().await;
            num_polls.fetch_add(1, Ordering::Relaxed);
            black_box(val)
        }

        static NUM_POLLS: AtomicUsize = AtomicUsize::new(0);
        static EXEC: std::sync::OnceLock<Executor<StdPark>> = std::sync::OnceLock::new();
        let exec = EXEC.get_or_init(|| Executor::new(1, test_clock()));

        let mut worker = Worker::new(exec, 0, StdPark::for_current());
        let out = worker.block_on(work(&NUM_POLLS));
        assert_eq!(out, 2);
        assert_eq!(NUM_POLLS.load(Ordering::Relaxed), 2);
    }
}
