// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::OnceLock;

use criterion::{Criterion, criterion_group, criterion_main};
use zokio::executor::{Executor, Worker};
use zokio::park::StdPark;
use zokio::task::yield_now;
use zokio::time::Clock;

fn single_worker_executor() -> &'static Executor<StdPark> {
    static EXEC: OnceLock<Executor<StdPark>> = OnceLock::new();
    EXEC.get_or_init(|| Executor::new(1, Clock::system()))
}

fn two_worker_executor() -> &'static Executor<StdPark> {
    static EXEC: OnceLock<Executor<StdPark>> = OnceLock::new();
    EXEC.get_or_init(|| Executor::new(2, Clock::system()))
}

const PINGS: usize = 10_000;

async fn yield_n(n: usize) {
    for _ in 0..n {
        yield_now().await;
    }
}

fn ping_10k_single_threaded(c: &mut Criterion) {
    let exec = single_worker_executor();
    let mut worker = Worker::new(exec, 0, StdPark::for_current());

    c.bench_function("ping_10k_single_threaded", |b| {
        b.iter(|| {
            let h = exec.spawn(yield_n(PINGS));
            worker.block_on(h).unwrap();
        });
    });
}

fn ping_pong_10k_single_threaded(c: &mut Criterion) {
    let exec = single_worker_executor();
    let mut worker = Worker::new(exec, 0, StdPark::for_current());

    c.bench_function("ping_pong_10k_single_threaded", |b| {
        b.iter(|| {
            let h1 = exec.spawn(yield_n(PINGS));
            let h2 = exec.spawn(yield_n(PINGS));
            let (r1, r2) = worker.block_on(futures::future::join(h1, h2));
            r1.unwrap();
            r2.unwrap();
        });
    });
}

fn ping_10k_multi_threaded(c: &mut Criterion) {
    let exec = two_worker_executor();
    let mut worker = Worker::new(exec, 0, StdPark::for_current());

    let stealer = std::thread::spawn(move || {
        let mut worker = Worker::new(exec, 1, StdPark::for_current());
        worker.run();
    });

    c.bench_function("ping_10k_multi_threaded", |b| {
        b.iter(|| {
            let h = exec.spawn(yield_n(PINGS));
            worker.block_on(h).unwrap();
        });
    });

    exec.stop();
    stealer.join().unwrap();
}

fn ping_pong_10k_multi_threaded(c: &mut Criterion) {
    let exec = two_worker_executor();
    let mut worker = Worker::new(exec, 0, StdPark::for_current());

    let stealer = std::thread::spawn(move || {
        let mut worker = Worker::new(exec, 1, StdPark::for_current());
        worker.run();
    });

    c.bench_function("ping_pong_10k_multi_threaded", |b| {
        b.iter(|| {
            let h1 = exec.spawn(yield_n(PINGS));
            let h2 = exec.spawn(yield_n(PINGS));
            let (r1, r2) = worker.block_on(futures::future::join(h1, h2));
            r1.unwrap();
            r2.unwrap();
        });
    });

    exec.stop();
    stealer.join().unwrap();
}

criterion_group!(
    ping_pong,
    ping_10k_single_threaded,
    ping_pong_10k_single_threaded,
    ping_10k_multi_threaded,
    ping_pong_10k_multi_threaded,
);
criterion_main!(ping_pong);
