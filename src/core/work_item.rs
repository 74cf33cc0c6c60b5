// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Units of work scheduled on a [`WorkQueue`](super::queue::WorkQueue).

use super::context::ExecutionContext;
use super::queue::QueueStatistics;
use super::registered_wait::RegisteredWait;
use crate::macros::{log_error, log_trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;

/// A one-shot callback.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// What a [`WorkItem`] does when executed.
pub enum Task {
    /// Work submitted by the user to the worker queue.
    User(Job),
    /// Completion callback submitted to the completion queue.
    Completion(Job),
    /// A registered wait, looping on its wait handle.
    RegisteredWait(RegisteredWait),
}

/// A task together with the execution context captured when it was submitted.
///
/// Items are owned by their queue until dequeued, then by the thread that
/// executes them, and are consumed by [`execute()`](Self::execute).
pub struct WorkItem {
    context: Option<ExecutionContext>,
    task: Task,
}

impl WorkItem {
    /// Creates an item capturing the context of the current thread.
    pub fn new(task: Task) -> Self {
        Self {
            context: ExecutionContext::current(),
            task,
        }
    }

    /// Creates an item that will run without any context.
    pub fn without_context(task: Task) -> Self {
        Self {
            context: None,
            task,
        }
    }

    /// Runs the task with its captured context installed. Panics of the
    /// callback(s) never escape this function.
    pub fn execute(self, statistics: &QueueStatistics) {
        let _guard = ExecutionContext::enter(self.context);
        match self.task {
            Task::User(job) => {
                log_trace!("Executing a user work item");
                run_isolated(job, statistics);
            }
            Task::Completion(job) => {
                log_trace!("Executing a completion work item");
                run_isolated(job, statistics);
            }
            Task::RegisteredWait(wait) => wait.run(statistics),
        }
        statistics.executed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs a callback, catching and discarding any panic.
pub fn run_isolated(f: impl FnOnce(), statistics: &QueueStatistics) {
    if let Err(_payload) = catch_unwind(AssertUnwindSafe(f)) {
        log_error!(
            "A callback panicked, discarding: {}",
            panic_message(_payload.as_ref())
        );
        statistics.panics.fetch_add(1, Ordering::Relaxed);
    }
}

/// Extracts a printable message from a panic payload.
#[cfg(feature = "log")]
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string payload>"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_execute_runs_job() {
        let statistics = QueueStatistics::default();
        let ran = Arc::new(Mutex::new(false));
        let item = WorkItem::new(Task::User(Box::new({
            let ran = ran.clone();
            move || *ran.lock().unwrap() = true
        })));
        item.execute(&statistics);
        assert!(*ran.lock().unwrap());
        assert_eq!(statistics.executed.load(Ordering::Relaxed), 1);
        assert_eq!(statistics.panics.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_execute_swallows_panic() {
        let statistics = QueueStatistics::default();
        WorkItem::new(Task::Completion(Box::new(|| panic!("callback failure"))))
            .execute(&statistics);
        assert_eq!(statistics.executed.load(Ordering::Relaxed), 1);
        assert_eq!(statistics.panics.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_execute_installs_and_restores_context() {
        let statistics = QueueStatistics::default();
        let submitted = ExecutionContext::new("submitter");
        let item = {
            let _guard = ExecutionContext::enter(Some(submitted.clone()));
            let seen = submitted.clone();
            WorkItem::new(Task::User(Box::new(move || {
                assert!(ExecutionContext::current().unwrap().ptr_eq(&seen));
            })))
        };

        let running = ExecutionContext::new("runner");
        let _guard = ExecutionContext::enter(Some(running.clone()));
        item.execute(&statistics);
        assert_eq!(statistics.panics.load(Ordering::Relaxed), 0);
        assert!(ExecutionContext::current().unwrap().ptr_eq(&running));
    }

    #[test]
    fn test_without_context() {
        let statistics = QueueStatistics::default();
        let item = {
            let _guard = ExecutionContext::enter(Some(ExecutionContext::new(7)));
            WorkItem::without_context(Task::User(Box::new(|| {
                assert!(ExecutionContext::current().is_none());
            })))
        };
        item.execute(&statistics);
        assert_eq!(statistics.panics.load(Ordering::Relaxed), 0);
    }
}
