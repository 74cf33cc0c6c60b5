// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::error::{Error, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// No user code ever runs while the mutex is held, so a poisoned mutex can
/// only result from a panic inside this crate's own bookkeeping. The state is
/// recovered rather than propagating the poison to unrelated threads.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes up one thread waiting on this status.
    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    /// Wakes up all the threads waiting on this status.
    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        self.condvar
            .wait_while(guard, predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the predicate is false on this status, or until the
    /// deadline passes. A [`None`] deadline waits forever.
    ///
    /// The returned boolean is true if the deadline passed while the predicate
    /// still held.
    pub fn wait_deadline_while<'a>(
        &'a self,
        mut guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'a, T>, bool) {
        let Some(deadline) = deadline else {
            return (self.wait_while(guard, predicate), false);
        };
        loop {
            if !predicate(&mut *guard) {
                return (guard, false);
            }
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            guard = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Waits on the condition variable once, for at most the given duration. A
    /// [`None`] duration waits until notified.
    ///
    /// Spurious wake-ups are possible, the caller must re-check its state.
    pub fn wait_once<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        duration: Option<Duration>,
    ) -> MutexGuard<'a, T> {
        match duration {
            None => self
                .condvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner),
            Some(duration) => {
                self.condvar
                    .wait_timeout(guard, duration)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        }
    }
}

/// A validated timeout in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever.
    Infinite,
    /// Wait for the given number of milliseconds. Zero polls.
    Millis(u32),
}

impl Timeout {
    /// Validates a signed millisecond timeout, where `-1` means infinite.
    pub fn from_millis(millis: i32) -> Result<Self> {
        match millis {
            -1 => Ok(Timeout::Infinite),
            millis => u32::try_from(millis)
                .map(Timeout::Millis)
                .map_err(|_| Error::InvalidTimeout(millis)),
        }
    }

    /// Converts this timeout into an absolute deadline starting from now.
    /// [`None`] means no deadline.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(millis) => {
                Instant::now().checked_add(Duration::from_millis(u64::from(millis)))
            }
        }
    }
}

/// Validates a millisecond time argument of a timer, which accepts the same
/// range as a [`Timeout`].
pub fn check_millis(millis: i32) -> Result<()> {
    Timeout::from_millis(millis).map(|_| ())
}
