// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool with two independently bounded queues.

use super::queue::{QueueKind, WorkQueue};
use super::registered_wait::{RegisteredWait, RegisteredWaitHandle};
use super::util::Timeout;
use super::wait::{EventWaitHandle, WaitHandle};
use super::work_item::{Task, WorkItem};
use crate::error::Result;
use crate::macros::log_debug;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

/// Default maximum number of threads draining the worker queue.
pub const DEFAULT_MAX_WORKER_THREADS: usize = 16;
/// Default maximum number of threads draining the completion queue.
pub const DEFAULT_MAX_COMPLETION_THREADS: usize = 16;

/// Policy to spawn dispatcher threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadSpawning {
    /// Spawn background threads as needed, up to the configured bounds. If a
    /// thread can't be spawned while no dispatcher is alive, the queue is
    /// drained synchronously by the submitting thread.
    Enabled,
    /// Never spawn threads: every submission drains the queue synchronously
    /// before returning.
    Disabled,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct ThreadPoolBuilder {
    /// Maximum number of threads draining the worker queue.
    pub max_worker_threads: NonZeroUsize,
    /// Maximum number of threads draining the completion queue.
    pub max_completion_threads: NonZeroUsize,
    /// Policy to spawn dispatcher threads.
    pub thread_spawning: ThreadSpawning,
    /// Prefix of the names of the dispatcher threads.
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self {
            max_worker_threads: bound(DEFAULT_MAX_WORKER_THREADS),
            max_completion_threads: bound(DEFAULT_MAX_COMPLETION_THREADS),
            thread_spawning: ThreadSpawning::Enabled,
            thread_name_prefix: "waitpool".to_owned(),
        }
    }
}

fn bound(count: usize) -> NonZeroUsize {
    NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN)
}

impl ThreadPoolBuilder {
    /// Creates a thread pool. Threads are only spawned once work is submitted.
    ///
    /// ```
    /// # use waitpool::ThreadPoolBuilder;
    /// # use std::num::NonZeroUsize;
    /// let pool = ThreadPoolBuilder {
    ///     max_worker_threads: NonZeroUsize::new(4).unwrap(),
    ///     ..Default::default()
    /// }
    /// .build();
    /// assert_eq!(pool.max_threads(), (4, 16));
    /// assert_eq!(pool.live_threads(), (0, 0));
    /// ```
    pub fn build(&self) -> ThreadPool {
        let spawn_threads = self.thread_spawning == ThreadSpawning::Enabled;
        ThreadPool {
            inner: Arc::new(ThreadPoolInner {
                worker: WorkQueue::new(
                    QueueKind::Worker,
                    self.max_worker_threads.get(),
                    spawn_threads,
                    self.thread_name_prefix.clone(),
                ),
                completion: WorkQueue::new(
                    QueueKind::Completion,
                    self.max_completion_threads.get(),
                    spawn_threads,
                    self.thread_name_prefix.clone(),
                ),
            }),
        }
    }
}

/// A pool of background threads running submitted callbacks.
///
/// The pool has two independent queues, each drained by its own bounded set
/// of threads: the worker queue (general work and registered waits) and the
/// completion queue, so that a backlog in one doesn't starve the other.
/// Threads are spawned on demand and live as long as the pool.
///
/// Cloning a pool yields another handle to the same queues. Once every handle
/// is dropped, the threads exit after draining their queue.
///
/// ```
/// # use waitpool::{EventResetMode, EventWaitHandle, ThreadPoolBuilder};
/// let pool = ThreadPoolBuilder::default().build();
/// let done = EventWaitHandle::new(false, EventResetMode::ManualReset);
/// pool.submit_work({
///     let done = done.clone();
///     move || done.set().unwrap()
/// });
/// assert_eq!(done.wait_one(10_000), Ok(true));
/// ```
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<ThreadPoolInner>,
}

struct ThreadPoolInner {
    worker: WorkQueue,
    completion: WorkQueue,
}

impl ThreadPool {
    /// Returns the process-wide pool, created with the default bounds on first
    /// use. It is never dropped.
    pub fn global() -> &'static ThreadPool {
        static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            log_debug!("Creating the global thread pool");
            ThreadPoolBuilder::default().build()
        })
    }

    /// Queues a callback on the worker queue. The execution context of the
    /// current thread is captured and installed while the callback runs.
    ///
    /// Always returns true: a backlog is absorbed by queueing.
    pub fn submit_work(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.inner
            .worker
            .submit(WorkItem::new(Task::User(Box::new(f))));
        true
    }

    /// Queues a callback on the worker queue, without capturing the execution
    /// context of the current thread.
    pub fn submit_work_without_context(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.inner
            .worker
            .submit(WorkItem::without_context(Task::User(Box::new(f))));
        true
    }

    /// Queues a callback on the completion queue.
    pub fn submit_completion_work(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.inner
            .completion
            .submit(WorkItem::new(Task::Completion(Box::new(f))));
        true
    }

    /// Registers a callback to run on the worker queue whenever `handle` is
    /// signaled, with `timed_out == false`, or when the timeout (in
    /// milliseconds, `-1` for infinite) expires, with `timed_out == true`.
    ///
    /// If `once` is true, the callback runs at most once. Otherwise the wait
    /// repeats until unregistered via the returned handle. The wait occupies
    /// one worker thread while it loops.
    pub fn register_wait(
        &self,
        handle: &WaitHandle,
        callback: impl FnMut(bool) + Send + 'static,
        timeout_ms: i32,
        once: bool,
    ) -> Result<RegisteredWaitHandle> {
        Timeout::from_millis(timeout_ms)?;
        let (wait, registered) =
            RegisteredWait::new(handle.clone(), Box::new(callback), timeout_ms, once);
        self.inner
            .worker
            .submit(WorkItem::new(Task::RegisteredWait(wait)));
        Ok(registered)
    }

    /// Unregisters a wait registered on this pool. See
    /// [`RegisteredWaitHandle::unregister()`].
    pub fn unregister_wait(
        &self,
        registered: &RegisteredWaitHandle,
        notify: Option<&EventWaitHandle>,
    ) -> bool {
        registered.unregister(notify)
    }

    /// Returns the number of threads that are available to run new work, for
    /// the worker and completion queues respectively.
    pub fn available_threads(&self) -> (usize, usize) {
        (
            self.inner.worker.available_threads(),
            self.inner.completion.available_threads(),
        )
    }

    /// Returns the maximum number of threads of the worker and completion
    /// queues respectively.
    pub fn max_threads(&self) -> (usize, usize) {
        (
            self.inner.worker.max_threads(),
            self.inner.completion.max_threads(),
        )
    }

    /// Returns the number of threads spawned so far by the worker and
    /// completion queues respectively.
    pub fn live_threads(&self) -> (usize, usize) {
        (
            self.inner.worker.live_threads(),
            self.inner.completion.live_threads(),
        )
    }

    /// Returns the number of submitted callbacks not yet picked up by a thread,
    /// on the worker and completion queues respectively.
    pub fn pending_work(&self) -> (usize, usize) {
        (
            self.inner.worker.pending_items(),
            self.inner.completion.pending_items(),
        )
    }

    /// Returns the number of callbacks that panicked, on the worker and
    /// completion queues respectively.
    pub fn panicked_callbacks(&self) -> (usize, usize) {
        (
            self.inner.worker.statistics().panics.load(Ordering::Relaxed),
            self.inner
                .completion
                .statistics()
                .panics
                .load(Ordering::Relaxed),
        )
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("max_threads", &self.max_threads())
            .field("live_threads", &self.live_threads())
            .field("available_threads", &self.available_threads())
            .field("pending_work", &self.pending_work())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::wait::EventResetMode;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    fn pool_with_bounds(worker: usize, completion: usize) -> ThreadPool {
        ThreadPoolBuilder {
            max_worker_threads: NonZeroUsize::new(worker).unwrap(),
            max_completion_threads: NonZeroUsize::new(completion).unwrap(),
            ..Default::default()
        }
        .build()
    }

    fn manual_event() -> EventWaitHandle {
        EventWaitHandle::new(false, EventResetMode::ManualReset)
    }

    #[test]
    fn test_default_bounds() {
        let builder = ThreadPoolBuilder::default();
        assert_eq!(builder.max_worker_threads.get(), 16);
        assert_eq!(builder.max_completion_threads.get(), 16);
        assert_eq!(builder.thread_spawning, ThreadSpawning::Enabled);

        let pool = builder.build();
        assert_eq!(pool.max_threads(), (16, 16));
        assert_eq!(pool.available_threads(), (16, 16));
        assert_eq!(pool.live_threads(), (0, 0));
    }

    #[test]
    fn test_global_pool() {
        assert!(std::ptr::eq(ThreadPool::global(), ThreadPool::global()));
        assert_eq!(
            ThreadPool::global().max_threads(),
            (DEFAULT_MAX_WORKER_THREADS, DEFAULT_MAX_COMPLETION_THREADS)
        );
        let done = manual_event();
        assert!(ThreadPool::global().submit_work({
            let done = done.clone();
            move || done.set().unwrap()
        }));
        assert_eq!(done.wait_one(10_000), Ok(true));
    }

    #[test]
    fn test_queues_are_independent() {
        let pool = pool_with_bounds(1, 1);
        let gate = Arc::new(Barrier::new(2));
        // Block the only worker thread.
        pool.submit_work({
            let gate = gate.clone();
            move || {
                gate.wait();
            }
        });

        let done = manual_event();
        pool.submit_completion_work({
            let done = done.clone();
            move || done.set().unwrap()
        });
        assert_eq!(done.wait_one(10_000), Ok(true));
        assert_eq!(pool.live_threads(), (1, 1));

        gate.wait();
    }

    #[test]
    fn test_available_threads_track_busy() {
        let pool = pool_with_bounds(4, 2);
        let started = Arc::new(Barrier::new(3));
        let release = Arc::new(Barrier::new(3));
        for _ in 0..2 {
            let started = started.clone();
            let release = release.clone();
            pool.submit_work(move || {
                started.wait();
                release.wait();
            });
        }
        started.wait();
        assert_eq!(pool.available_threads(), (2, 2));
        release.wait();
    }

    #[test]
    fn test_pending_work_counts_queued_callbacks() {
        let pool = pool_with_bounds(1, 1);
        assert_eq!(pool.pending_work(), (0, 0));

        let started = manual_event();
        let gate = Arc::new(Barrier::new(2));
        pool.submit_work({
            let started = started.clone();
            let gate = gate.clone();
            move || {
                started.set().unwrap();
                gate.wait();
            }
        });
        assert_eq!(started.wait_one(10_000), Ok(true));

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            pool.submit_work(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        // The only worker thread is blocked, the completion queue is idle.
        assert_eq!(pool.pending_work(), (3, 0));

        gate.wait();
        let start = Instant::now();
        while done.load(Ordering::SeqCst) < 3 {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.pending_work(), (0, 0));
    }

    #[test]
    fn test_register_wait_invalid_timeout() {
        let pool = pool_with_bounds(1, 1);
        let event = manual_event();
        let result = pool.register_wait(&event, |_| (), -2, true);
        assert_eq!(result.unwrap_err(), Error::InvalidTimeout(-2));
        assert_eq!(pool.live_threads(), (0, 0));
    }

    #[test]
    fn test_register_wait_signal_and_timeout() {
        let pool = pool_with_bounds(2, 1);
        let event = EventWaitHandle::new(false, EventResetMode::AutoReset);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registered = pool
            .register_wait(
                &event,
                {
                    let calls = calls.clone();
                    move |timed_out| calls.lock().unwrap().push(timed_out)
                },
                50,
                false,
            )
            .unwrap();

        event.set().unwrap();
        let start = Instant::now();
        while calls.lock().unwrap().len() < 3 {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }

        let done = manual_event();
        assert!(pool.unregister_wait(&registered, Some(&done)));
        assert!(!pool.unregister_wait(&registered, None));
        assert_eq!(done.wait_one(10_000), Ok(true));
        assert!(registered.is_finished());

        let calls = calls.lock().unwrap();
        assert!(!calls[0]);
        assert!(calls[1..].iter().all(|&timed_out| timed_out));
    }

    #[test]
    fn test_disabled_spawning_runs_inline() {
        let pool = ThreadPoolBuilder {
            thread_spawning: ThreadSpawning::Disabled,
            ..Default::default()
        }
        .build();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            pool.submit_work(move || order.lock().unwrap().push(i));
        }
        let completion_order = order.clone();
        pool.submit_completion_work(move || completion_order.lock().unwrap().push(3));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(pool.live_threads(), (0, 0));
    }

    #[test]
    fn test_thread_names() {
        let pool = ThreadPoolBuilder {
            thread_name_prefix: "named".to_owned(),
            ..Default::default()
        }
        .build();
        let name = Arc::new(Mutex::new(None));
        let done = manual_event();
        pool.submit_work({
            let name = name.clone();
            let done = done.clone();
            move || {
                *name.lock().unwrap() = thread::current().name().map(str::to_owned);
                done.set().unwrap();
            }
        });
        assert_eq!(done.wait_one(10_000), Ok(true));
        assert_eq!(name.lock().unwrap().as_deref(), Some("named-worker-0"));
    }
}
