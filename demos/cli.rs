// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run example scenarios on a thread pool.

use clap::{Parser, ValueEnum};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use waitpool::{
    EventResetMode, EventWaitHandle, Semaphore, ThreadPool, ThreadPoolBuilder, ThreadSpawning,
    Timer, WaitHandle,
};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if cli.inline && cli.scenario == Scenario::RegisteredWait {
        // The wait loop would run on this thread, and never return.
        eprintln!("The registered-wait scenario requires background threads");
        return;
    }

    let thread_pool = ThreadPoolBuilder {
        max_worker_threads: cli.max_worker_threads,
        max_completion_threads: cli.max_completion_threads,
        thread_spawning: if cli.inline {
            ThreadSpawning::Disabled
        } else {
            ThreadSpawning::Enabled
        },
        ..Default::default()
    }
    .build();

    let start = Instant::now();
    match cli.scenario {
        Scenario::Submit => submit(&thread_pool, cli.count),
        Scenario::Timer => timer(cli.count, cli.period_ms),
        Scenario::WaitAll => wait_all(&thread_pool, cli.count),
        Scenario::RegisteredWait => registered_wait(&thread_pool, cli.count, cli.period_ms),
    }
    println!("elapsed = {:?}", start.elapsed());
    println!("{thread_pool:?}");
}

/// Submits `count` jobs half to each queue, and waits for all of them.
fn submit(thread_pool: &ThreadPool, count: usize) {
    let remaining = Arc::new(AtomicUsize::new(count));
    let done = EventWaitHandle::new(count == 0, EventResetMode::ManualReset);
    for i in 0..count {
        let remaining = remaining.clone();
        let done = done.clone();
        let job = move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                done.set().unwrap();
            }
        };
        if i % 2 == 0 {
            thread_pool.submit_work(job);
        } else {
            thread_pool.submit_completion_work(job);
        }
    }
    assert_eq!(done.wait_one(-1), Ok(true));
    println!("executed {count} jobs");
}

/// Runs a periodic timer until it fired `count` times.
fn timer(count: usize, period_ms: i32) {
    let fires = Semaphore::new(0, count.max(1)).unwrap();
    let start = Instant::now();
    let timer = Timer::new(
        {
            let fires = fires.clone();
            move || {
                // Extra fires after the last one are ignored.
                let _ = fires.release(1);
            }
        },
        0,
        period_ms,
    )
    .unwrap();
    for i in 0..count {
        assert_eq!(fires.wait_one(-1), Ok(true));
        println!("fire #{i} at {:?}", start.elapsed());
    }

    let disposed = EventWaitHandle::new(false, EventResetMode::ManualReset);
    timer.dispose_with(&disposed);
    assert_eq!(disposed.wait_one(-1), Ok(true));
}

/// Signals `count` events from pool jobs in a shuffled order, while waiting
/// for all of them at once.
fn wait_all(thread_pool: &ThreadPool, count: usize) {
    let events = (0..count)
        .map(|_| EventWaitHandle::new(false, EventResetMode::AutoReset))
        .collect::<Vec<_>>();
    let mut order = (0..count).collect::<Vec<_>>();
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    order.shuffle(&mut rng);

    for (delay, &index) in order.iter().enumerate() {
        let event = events[index].clone();
        thread_pool.submit_work(move || {
            std::thread::sleep(Duration::from_millis(delay as u64));
            event.set().unwrap();
        });
    }

    let handles = events.iter().map(|e| e.handle()).collect::<Vec<&WaitHandle>>();
    match WaitHandle::wait_all(&handles, -1) {
        Ok(all) => println!("acquired all {count} events = {all}"),
        Err(e) => println!("wait failed: {e}"),
    }
}

/// Registers a wait on a semaphore, releases it `count` times and
/// unregisters the wait.
fn registered_wait(thread_pool: &ThreadPool, count: usize, timeout_ms: i32) {
    let semaphore = Semaphore::new(0, count.max(1)).unwrap();
    let signals = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let registered = thread_pool
        .register_wait(
            &semaphore,
            {
                let signals = signals.clone();
                let timeouts = timeouts.clone();
                move |timed_out| {
                    if timed_out {
                        timeouts.fetch_add(1, Ordering::Relaxed);
                    } else {
                        signals.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            timeout_ms,
            false,
        )
        .unwrap();

    for _ in 0..count {
        semaphore.release(1).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    while signals.load(Ordering::Relaxed) < count {
        std::thread::sleep(Duration::from_millis(1));
    }

    let unregistered = EventWaitHandle::new(false, EventResetMode::ManualReset);
    thread_pool.unregister_wait(&registered, Some(&unregistered));
    // Closing the handle also ends a loop waiting without timeout.
    semaphore.close();
    assert_eq!(unregistered.wait_one(-1), Ok(true));
    println!(
        "signals = {}, timeouts = {}",
        signals.load(Ordering::Relaxed),
        timeouts.load(Ordering::Relaxed)
    );
}

/// CLI tool to run example scenarios on a thread pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Maximum number of worker threads.
    #[arg(long, default_value_t = NonZeroUsize::new(waitpool::DEFAULT_MAX_WORKER_THREADS).unwrap())]
    max_worker_threads: NonZeroUsize,

    /// Maximum number of completion threads.
    #[arg(long, default_value_t = NonZeroUsize::new(waitpool::DEFAULT_MAX_COMPLETION_THREADS).unwrap())]
    max_completion_threads: NonZeroUsize,

    /// Whether to run all the work on the submitting thread.
    #[arg(long, default_value_t = false)]
    inline: bool,

    /// Number of jobs, fires or signals, depending on the scenario.
    #[arg(long, default_value_t = 100)]
    count: usize,

    /// Period of the timer, or timeout of the registered wait, in
    /// milliseconds.
    #[arg(long, default_value_t = 10)]
    period_ms: i32,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Submit jobs to both queues.
    Submit,
    /// Run a periodic timer.
    Timer,
    /// Wait for events signaled in a random order.
    WaitAll,
    /// Register a wait on a semaphore.
    RegisteredWait,
}
