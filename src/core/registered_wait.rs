// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Callbacks registered to run whenever a wait handle is signaled.

use super::queue::QueueStatistics;
use super::wait::{EventWaitHandle, WaitHandle};
use super::work_item::run_isolated;
use crate::macros::{log_debug, log_warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Callback of a registered wait. The argument is true if the wait timed out.
pub type WaitCallback = Box<dyn FnMut(bool) + Send + 'static>;

/// Registration state shared between a [`RegisteredWait`] running on a pool
/// thread and its [`RegisteredWaitHandle`]s.
struct Registration {
    state: Mutex<RegistrationState>,
}

struct RegistrationState {
    /// Cleared by [`RegisteredWaitHandle::unregister()`].
    live: bool,
    /// Set once the wait loop has exited.
    finished: bool,
    /// Event to signal once the wait loop has exited.
    notify: Option<EventWaitHandle>,
}

impl Registration {
    fn lock(&self) -> MutexGuard<'_, RegistrationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self) -> bool {
        self.lock().live
    }

    /// Marks the wait loop as exited, signaling the notify event if
    /// unregistration already happened.
    fn finish(&self) {
        let mut state = self.lock();
        state.finished = true;
        if let Some(notify) = state.notify.take() {
            signal(&notify);
        }
    }
}

fn signal(notify: &EventWaitHandle) {
    if let Err(_e) = notify.set() {
        log_warn!("Failed to signal the unregistration event: {_e}");
    }
}

/// A wait loop scheduled on the worker queue: it repeatedly waits on a handle
/// and invokes its callback on signal or timeout.
pub struct RegisteredWait {
    handle: WaitHandle,
    callback: WaitCallback,
    timeout_ms: i32,
    once: bool,
    registration: Arc<Registration>,
}

impl RegisteredWait {
    /// Creates a registered wait with an already validated timeout, together
    /// with the handle to unregister it.
    pub fn new(
        handle: WaitHandle,
        callback: WaitCallback,
        timeout_ms: i32,
        once: bool,
    ) -> (Self, RegisteredWaitHandle) {
        let registration = Arc::new(Registration {
            state: Mutex::new(RegistrationState {
                live: true,
                finished: false,
                notify: None,
            }),
        });
        let wait = Self {
            handle,
            callback,
            timeout_ms,
            once,
            registration: registration.clone(),
        };
        (wait, RegisteredWaitHandle { registration })
    }

    /// Runs the wait loop on the current thread. Each invocation of the
    /// callback is isolated: a panic doesn't stop the loop.
    pub fn run(mut self, statistics: &QueueStatistics) {
        loop {
            let signaled = match self.handle.wait_one(self.timeout_ms) {
                Ok(signaled) => signaled,
                Err(_e) => {
                    log_warn!("Registered wait stopped: {_e}");
                    break;
                }
            };
            // A signal was acquired and is always delivered, a timeout is only
            // reported while the registration is live.
            if signaled || self.registration.is_live() {
                let callback = &mut self.callback;
                run_isolated(|| callback(!signaled), statistics);
            }
            if self.once || !self.registration.is_live() {
                break;
            }
        }
        log_debug!("Registered wait loop exited");
        self.registration.finish();
    }
}

/// Handle to a callback registered with
/// [`ThreadPool::register_wait()`](crate::ThreadPool::register_wait).
///
/// Dropping this handle doesn't unregister the wait.
#[derive(Clone)]
pub struct RegisteredWaitHandle {
    registration: Arc<Registration>,
}

impl RegisteredWaitHandle {
    /// Unregisters the wait. This is cooperative: a wait or callback in
    /// progress isn't interrupted, and the loop exits at its next checkpoint,
    /// i.e. after the current wait returns.
    ///
    /// The `notify` event, if any, is signaled once the wait loop has exited.
    /// Returns false if the wait was already unregistered, in which case
    /// `notify` is ignored.
    pub fn unregister(&self, notify: Option<&EventWaitHandle>) -> bool {
        let mut state = self.registration.lock();
        if !state.live {
            return false;
        }
        state.live = false;
        if let Some(notify) = notify {
            if state.finished {
                signal(notify);
            } else {
                state.notify = Some(notify.clone());
            }
        }
        true
    }

    /// Returns true until the wait is unregistered.
    pub fn is_registered(&self) -> bool {
        self.registration.is_live()
    }

    /// Returns true once the wait loop has exited.
    pub fn is_finished(&self) -> bool {
        self.registration.lock().finished
    }
}

impl fmt::Debug for RegisteredWaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.registration.lock();
        f.debug_struct("RegisteredWaitHandle")
            .field("live", &state.live)
            .field("finished", &state.finished)
            .finish()
    }
}
