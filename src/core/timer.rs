// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A recurring timer running its callback on a dedicated thread.

use super::util::{check_millis, Status};
use super::wait::EventWaitHandle;
use crate::error::{Error, Result};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single wait of the timer thread.
const MAX_WAIT: Duration = Duration::from_millis(i32::MAX as u64);

/// Callback of a timer.
type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Schedule and lifecycle of a timer, guarded by the timer lock.
struct TimerState {
    /// Next time the callback is due, or [`None`] for never.
    next_due: Option<Instant>,
    /// Interval between fires, or [`None`] to fire only once.
    period: Option<Duration>,
    /// Bumped by every call to [`Timer::change()`], so that the run loop can
    /// tell whether the schedule changed while the callback was running.
    generation: u64,
    /// Set when [`Timer::change()`] or [`Timer::dispose()`] wakes the thread.
    pulsed: bool,
    shutdown: bool,
    /// Event to signal once the timer thread has exited.
    notify: Option<EventWaitHandle>,
}

impl TimerState {
    /// Recomputes the schedule from millisecond arguments, as validated by
    /// [`check_millis()`].
    fn reschedule(&mut self, due_ms: i32, period_ms: i32) {
        self.next_due = match u64::try_from(due_ms) {
            Ok(due_ms) => Instant::now().checked_add(Duration::from_millis(due_ms)),
            // -1: never fire.
            Err(_) => None,
        };
        self.period = match u64::try_from(period_ms) {
            Ok(period_ms) if period_ms > 0 => Some(Duration::from_millis(period_ms)),
            _ => None,
        };
        self.generation = self.generation.wrapping_add(1);
    }
}

/// A timer that invokes a callback on its own thread after a due time, and
/// then optionally at a fixed period.
///
/// If the callback runs late (e.g. because a previous invocation took longer
/// than the period), the missed periods are collapsed into a single catch-up
/// invocation, and the schedule restarts from that invocation.
///
/// Dropping the timer disposes it.
///
/// ```
/// # use waitpool::Timer;
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # use std::sync::Arc;
/// let count = Arc::new(AtomicUsize::new(0));
/// let timer = Timer::new(
///     {
///         let count = count.clone();
///         move || {
///             count.fetch_add(1, Ordering::SeqCst);
///         }
///     },
///     0,
///     -1,
/// )
/// .unwrap();
/// # while count.load(Ordering::SeqCst) == 0 {
/// #     std::thread::sleep(std::time::Duration::from_millis(1));
/// # }
/// assert!(timer.dispose());
/// assert!(!timer.dispose());
/// assert_eq!(count.load(Ordering::SeqCst), 1);
/// ```
pub struct Timer {
    shared: Arc<Status<TimerState>>,
}

impl Timer {
    /// Creates a timer and starts its thread.
    ///
    /// The callback first runs after `due_ms` milliseconds (`-1` to never run
    /// until [`change()`](Self::change) is called), then every `period_ms`
    /// milliseconds. A `period_ms` of `0` or `-1` runs the callback only once.
    pub fn new(
        callback: impl FnMut() + Send + 'static,
        due_ms: i32,
        period_ms: i32,
    ) -> Result<Self> {
        check_millis(due_ms)?;
        check_millis(period_ms)?;

        let mut state = TimerState {
            next_due: None,
            period: None,
            generation: 0,
            pulsed: false,
            shutdown: false,
            notify: None,
        };
        state.reschedule(due_ms, period_ms);
        let shared = Arc::new(Status::new(state));

        let callback: TimerCallback = Box::new(callback);
        let thread_shared = shared.clone();
        std::thread::Builder::new()
            .name("waitpool-timer".to_owned())
            .spawn(move || run(&thread_shared, callback))
            .map_err(|_e| {
                log_error!("Failed to spawn a timer thread: {_e}");
                Error::ThreadSpawn
            })?;
        log_debug!("Started a timer thread (due {due_ms} ms, period {period_ms} ms)");

        Ok(Self { shared })
    }

    /// Changes the due time and period of the timer, with the same meaning as
    /// in [`new()`](Self::new). Returns false if the timer was disposed.
    pub fn change(&self, due_ms: i32, period_ms: i32) -> Result<bool> {
        check_millis(due_ms)?;
        check_millis(period_ms)?;

        let mut state = self.shared.lock();
        if state.shutdown {
            return Ok(false);
        }
        state.reschedule(due_ms, period_ms);
        state.pulsed = true;
        self.shared.notify_all();
        Ok(true)
    }

    /// Stops the timer. A callback in progress isn't interrupted, and no
    /// callback starts after this returns.
    ///
    /// Returns false if the timer was already disposed.
    pub fn dispose(&self) -> bool {
        self.shutdown(None)
    }

    /// Stops the timer like [`dispose()`](Self::dispose), and signals `notify`
    /// once the timer thread has exited, i.e. after any callback in progress
    /// returned.
    pub fn dispose_with(&self, notify: &EventWaitHandle) -> bool {
        self.shutdown(Some(notify))
    }

    fn shutdown(&self, notify: Option<&EventWaitHandle>) -> bool {
        let mut state = self.shared.lock();
        if state.shutdown {
            return false;
        }
        state.shutdown = true;
        state.pulsed = true;
        state.notify = notify.cloned();
        self.shared.notify_all();
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Timer")
            .field("next_due", &state.next_due)
            .field("period", &state.period)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Main function of the timer thread.
fn run(shared: &Status<TimerState>, mut callback: TimerCallback) {
    let mut state = shared.lock();
    while !state.shutdown {
        let wait = state
            .next_due
            .map(|due| due.saturating_duration_since(Instant::now()).min(MAX_WAIT));
        state.pulsed = false;
        state = shared.wait_once(state, wait);

        if state.pulsed || state.shutdown {
            // Woken by `change()` or `dispose()`: re-read the schedule.
            continue;
        }
        let now = Instant::now();
        match state.next_due {
            Some(due) if due <= now => (),
            // Spurious wake-up, or a wait capped by `MAX_WAIT`.
            _ => continue,
        }

        // Drift correction: restart the schedule from this fire, so that any
        // number of missed periods yields a single invocation.
        state.next_due = Some(now);
        let generation = state.generation;
        drop(state);

        log_trace!("Timer fired");
        if catch_unwind(AssertUnwindSafe(&mut callback)).is_err() {
            log_error!("A timer callback panicked, discarding");
        }

        state = shared.lock();
        if state.generation == generation {
            state.next_due = match (state.next_due, state.period) {
                (Some(due), Some(period)) => due.checked_add(period),
                _ => None,
            };
        }
    }

    log_debug!("Timer thread exiting");
    if let Some(notify) = state.notify.take() {
        if let Err(_e) = notify.set() {
            log_warn!("Failed to signal the timer disposal event: {_e}");
        }
    }
}
