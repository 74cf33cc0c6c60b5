// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A FIFO work queue drained by a bounded, only-growing set of dispatcher
//! threads.

use super::util::Status;
use super::work_item::WorkItem;
#[cfg(feature = "log_statistics")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_trace, log_warn};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use std::thread;

/// Which of the two queues of a pool this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// General purpose work and registered waits.
    Worker,
    /// Completion callbacks.
    Completion,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Worker => f.write_str("worker"),
            QueueKind::Completion => f.write_str("completion"),
        }
    }
}

/// Counters updated outside of the queue lock.
#[derive(Default)]
pub struct QueueStatistics {
    /// Number of work items executed.
    pub executed: CachePadded<AtomicUsize>,
    /// Number of callbacks that panicked.
    pub panics: CachePadded<AtomicUsize>,
    /// Number of dispatcher threads spawned.
    pub spawned: CachePadded<AtomicUsize>,
}

/// State guarded by the queue lock.
struct QueueState {
    /// Pending items, in submission order.
    items: VecDeque<WorkItem>,
    /// Number of dispatcher threads spawned. Never decreases while the queue
    /// is alive.
    live_threads: usize,
    /// Number of dispatcher threads currently executing an item.
    busy_threads: usize,
    /// Set when the owning pool is dropped.
    shutdown: bool,
}

/// Starts a thread configured by the builder, running the given function.
type Spawner = fn(thread::Builder, Box<dyn FnOnce() + Send>) -> io::Result<()>;

fn spawn_os_thread(builder: thread::Builder, f: Box<dyn FnOnce() + Send>) -> io::Result<()> {
    builder.spawn(f).map(drop)
}

/// Context shared between a [`WorkQueue`] and its dispatcher threads.
struct SharedQueue {
    kind: QueueKind,
    max_threads: usize,
    spawn_threads: bool,
    spawner: Spawner,
    thread_name_prefix: String,
    status: Status<QueueState>,
    statistics: QueueStatistics,
}

/// A FIFO queue of [`WorkItem`]s with its own pool of dispatcher threads.
pub struct WorkQueue {
    shared: Arc<SharedQueue>,
}

impl WorkQueue {
    /// Creates an empty queue. No thread is spawned until work is submitted.
    ///
    /// If `spawn_threads` is false, submitted work runs synchronously on the
    /// submitting thread.
    pub fn new(
        kind: QueueKind,
        max_threads: usize,
        spawn_threads: bool,
        thread_name_prefix: String,
    ) -> Self {
        Self::with_spawner(
            kind,
            max_threads,
            spawn_threads,
            thread_name_prefix,
            spawn_os_thread,
        )
    }

    fn with_spawner(
        kind: QueueKind,
        max_threads: usize,
        spawn_threads: bool,
        thread_name_prefix: String,
        spawner: Spawner,
    ) -> Self {
        Self {
            shared: Arc::new(SharedQueue {
                kind,
                max_threads,
                spawn_threads,
                spawner,
                thread_name_prefix,
                status: Status::new(QueueState {
                    items: VecDeque::new(),
                    live_threads: 0,
                    busy_threads: 0,
                    shutdown: false,
                }),
                statistics: QueueStatistics::default(),
            }),
        }
    }

    /// Enqueues an item, then either spawns one more dispatcher thread (if
    /// below the bound) or wakes up an idle one.
    pub fn submit(&self, item: WorkItem) {
        let shared = &self.shared;
        let mut state = shared.status.lock();
        state.items.push_back(item);

        if !shared.spawn_threads {
            shared.drain_synchronously(state);
            return;
        }

        if state.live_threads < shared.max_threads {
            match shared.spawn_dispatcher(state.live_threads) {
                Ok(()) => {
                    state.live_threads += 1;
                    log_debug!(
                        "[{} queue] Spawned dispatcher thread, {} live",
                        shared.kind,
                        state.live_threads
                    );
                }
                Err(_e) => {
                    log_warn!("[{} queue] Failed to spawn a thread: {_e}", shared.kind);
                    if state.live_threads == 0 {
                        shared.drain_synchronously(state);
                        return;
                    }
                    shared.status.notify_one();
                }
            }
        } else {
            shared.status.notify_one();
        }
    }

    /// Returns the maximum number of dispatcher threads.
    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    /// Returns the number of dispatcher threads not busy executing an item,
    /// counting the ones that may still be spawned.
    pub fn available_threads(&self) -> usize {
        let state = self.shared.status.lock();
        self.shared.max_threads - state.busy_threads
    }

    /// Returns the number of dispatcher threads spawned so far.
    pub fn live_threads(&self) -> usize {
        self.shared.status.lock().live_threads
    }

    /// Returns the number of items waiting to be dequeued.
    pub fn pending_items(&self) -> usize {
        self.shared.status.lock().items.len()
    }

    /// Returns the counters of this queue.
    pub fn statistics(&self) -> &QueueStatistics {
        &self.shared.statistics
    }
}

impl Drop for WorkQueue {
    /// Lets the dispatcher threads exit once the queue is drained.
    ///
    /// Threads aren't joined, as they may be blocked in a callback.
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.status.lock().shutdown = true;
        shared.status.notify_all();
        log_debug!("[{} queue] Shutting down", shared.kind);

        #[cfg(feature = "log_statistics")]
        log_info!(
            "[{} queue] Executed {} items, {} callbacks panicked, spawned {} threads",
            shared.kind,
            shared.statistics.executed.load(Ordering::Relaxed),
            shared.statistics.panics.load(Ordering::Relaxed),
            shared.statistics.spawned.load(Ordering::Relaxed),
        );
    }
}

impl SharedQueue {
    /// Spawns a background dispatcher thread.
    fn spawn_dispatcher(self: &Arc<Self>, id: usize) -> io::Result<()> {
        let shared = self.clone();
        let builder =
            thread::Builder::new().name(format!("{}-{}-{id}", self.thread_name_prefix, self.kind));
        (self.spawner)(builder, Box::new(move || shared.dispatch_loop(id)))?;
        self.statistics.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Executes every queued item on the current thread, in FIFO order,
    /// including items submitted while draining.
    fn drain_synchronously<'a>(&'a self, mut state: MutexGuard<'a, QueueState>) {
        while let Some(item) = state.items.pop_front() {
            drop(state);
            log_trace!("[{} queue] Executing an item synchronously", self.kind);
            item.execute(&self.statistics);
            state = self.status.lock();
        }
    }

    /// Main function of a dispatcher thread.
    fn dispatch_loop(&self, _id: usize) {
        log_debug!("[{} thread {_id}] Started", self.kind);
        let mut state = self.status.lock();
        loop {
            state = self
                .status
                .wait_while(state, |state| state.items.is_empty() && !state.shutdown);
            let Some(item) = state.items.pop_front() else {
                // Shut down with an empty queue.
                break;
            };
            state.busy_threads += 1;
            drop(state);

            item.execute(&self.statistics);

            state = self.status.lock();
            state.busy_threads -= 1;
        }
        log_debug!("[{} thread {_id}] Exiting", self.kind);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::work_item::Task;
    use std::sync::{Barrier, Mutex};
    use std::time::{Duration, Instant};

    fn user_item(f: impl FnOnce() + Send + 'static) -> WorkItem {
        WorkItem::new(Task::User(Box::new(f)))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "condition not reached in time"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_no_thread_before_submit() {
        let queue = WorkQueue::new(QueueKind::Worker, 4, true, "test".into());
        assert_eq!(queue.live_threads(), 0);
        assert_eq!(queue.available_threads(), 4);
        assert_eq!(queue.max_threads(), 4);
    }

    #[test]
    fn test_single_thread_fifo() {
        let queue = WorkQueue::new(QueueKind::Worker, 1, true, "test".into());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            queue.submit(user_item(move || order.lock().unwrap().push(i)));
        }
        wait_until(|| order.lock().unwrap().len() == 100);
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
        assert_eq!(queue.live_threads(), 1);
    }

    #[test]
    fn test_growth_bounded() {
        const MAX: usize = 3;
        const EXTRA: usize = 2;
        let queue = WorkQueue::new(QueueKind::Completion, MAX, true, "test".into());
        let release = Arc::new(Barrier::new(MAX + 1));
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..MAX + EXTRA {
            let release = release.clone();
            let started = started.clone();
            queue.submit(user_item(move || {
                if started.fetch_add(1, Ordering::SeqCst) < MAX {
                    release.wait();
                }
            }));
        }

        wait_until(|| started.load(Ordering::SeqCst) == MAX);
        assert_eq!(queue.live_threads(), MAX);
        assert_eq!(queue.available_threads(), 0);
        assert_eq!(queue.pending_items(), EXTRA);

        release.wait();
        wait_until(|| queue.statistics().executed.load(Ordering::SeqCst) == MAX + EXTRA);
        assert_eq!(queue.live_threads(), MAX);
        assert_eq!(queue.statistics().spawned.load(Ordering::SeqCst), MAX);
    }

    #[test]
    fn test_synchronous_drain() {
        let queue = Arc::new(WorkQueue::new(QueueKind::Worker, 4, false, "test".into()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let caller = thread::current().id();

        queue.submit(user_item({
            let order = order.clone();
            move || {
                assert_eq!(thread::current().id(), caller);
                order.lock().unwrap().push(1);
            }
        }));
        // Drained before returning.
        assert_eq!(*order.lock().unwrap(), vec![1]);

        queue.submit(user_item({
            let order = order.clone();
            move || order.lock().unwrap().push(2)
        }));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(queue.live_threads(), 0);
        assert_eq!(queue.pending_items(), 0);
        assert_eq!(queue.statistics().panics.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatcher_survives_panics() {
        let queue = WorkQueue::new(QueueKind::Worker, 1, true, "test".into());
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let done = done.clone();
            queue.submit(user_item(move || {
                done.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    panic!("callback failure");
                }
            }));
        }
        wait_until(|| queue.statistics().executed.load(Ordering::SeqCst) == 10);
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(queue.statistics().panics.load(Ordering::SeqCst), 5);
        assert_eq!(queue.live_threads(), 1);
    }

    #[test]
    fn test_drop_drains_pending_items() {
        let queue = WorkQueue::new(QueueKind::Worker, 1, true, "test".into());
        let gate = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicUsize::new(0));
        queue.submit(user_item({
            let gate = gate.clone();
            move || {
                gate.wait();
            }
        }));
        for _ in 0..5 {
            let done = done.clone();
            queue.submit(user_item(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(queue);
        gate.wait();
        wait_until(|| done.load(Ordering::SeqCst) == 5);
    }

    fn failing_spawner(_: thread::Builder, _: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        Err(io::Error::other("out of threads"))
    }

    static SPAWN_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

    /// Succeeds for the first spawn only.
    fn spawn_once(builder: thread::Builder, f: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        if SPAWN_ATTEMPTS.fetch_add(1, Ordering::SeqCst) == 0 {
            spawn_os_thread(builder, f)
        } else {
            failing_spawner(builder, f)
        }
    }

    #[test]
    fn test_spawn_failure_without_threads_drains_synchronously() {
        let queue =
            WorkQueue::with_spawner(QueueKind::Worker, 4, true, "test".into(), failing_spawner);
        let order = Arc::new(Mutex::new(Vec::new()));
        let caller = thread::current().id();
        for i in 0..3 {
            let order_clone = order.clone();
            queue.submit(user_item(move || {
                assert_eq!(thread::current().id(), caller);
                order_clone.lock().unwrap().push(i);
            }));
            // Executed before `submit` returns.
            assert_eq!(order.lock().unwrap().len(), i + 1);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.live_threads(), 0);
        assert_eq!(queue.pending_items(), 0);
        assert_eq!(queue.statistics().spawned.load(Ordering::SeqCst), 0);
        assert_eq!(queue.statistics().panics.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_spawn_failure_with_live_thread_enqueues() {
        let queue =
            WorkQueue::with_spawner(QueueKind::Completion, 4, true, "test".into(), spawn_once);
        let caller = thread::current().id();
        let runners = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let runners = runners.clone();
            queue.submit(user_item(move || {
                runners.lock().unwrap().push(thread::current().id())
            }));
        }
        wait_until(|| runners.lock().unwrap().len() == 3);
        assert!(runners.lock().unwrap().iter().all(|&id| id != caller));
        assert_eq!(queue.live_threads(), 1);
        assert_eq!(queue.statistics().spawned.load(Ordering::SeqCst), 1);
    }
}
