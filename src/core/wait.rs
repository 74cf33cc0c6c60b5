// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wait handles, and waits multiplexed over several of them.
//!
//! Every wait call creates a private [`Wakeup`] and registers it with each
//! handle it waits on. A signaled handle grants itself to registered wakeups
//! (consuming the signal for auto-reset events and semaphores, or taking
//! ownership for mutexes) as long as the wakeup still accepts grants. Once the
//! wait is over the wakeup is frozen and unregistered from every handle, and
//! grants that the waiter doesn't keep are given back. This makes [`WaitHandle::wait_all()`] a simultaneous wait: it
//! succeeds as soon as every handle has been granted, regardless of the order
//! in which they were signaled, and doesn't lose any signal on timeout.
//!
//! Lock order: a handle's lock may be held while taking a wakeup's lock, never
//! the other way around.

use super::util::{Status, Timeout};
use crate::error::{Error, Result};
use crate::macros::log_trace;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Waiting side of a single wait call.
struct Wakeup {
    status: Status<WakeupState>,
    /// Thread blocked in the wait call, which becomes the owner of granted
    /// mutexes.
    thread: ThreadId,
}

/// How a handle granted itself to a wakeup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Grant {
    /// The wait wasn't satisfied yet: the grant is given back unless the wait
    /// eventually succeeds.
    Tentative,
    /// The grant that satisfied the wait, which is always kept.
    Final,
}

struct WakeupState {
    /// Number of grants after which the wait is satisfied.
    limit: usize,
    /// Number of grants received so far.
    count: usize,
    /// Grants received from each of the registered handles.
    granted: Vec<Option<Grant>>,
    /// Index of the first handle that granted itself.
    first: Option<usize>,
    /// Set when the wait is over, after which no grant is accepted.
    frozen: bool,
    /// Set when one of the registered handles was closed during the wait.
    abandoned: bool,
}

/// Result of waiting on a [`Wakeup`].
struct WakeupOutcome {
    satisfied: bool,
    abandoned: bool,
    first: Option<usize>,
}

impl Wakeup {
    fn new(num_handles: usize, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            status: Status::new(WakeupState {
                limit,
                count: 0,
                granted: vec![None; num_handles],
                first: None,
                frozen: false,
                abandoned: false,
            }),
            thread: thread::current().id(),
        })
    }

    /// Offers the handle registered at `index` to this wakeup. Returns the
    /// grant if accepted, in which case the caller must consume the signal.
    fn try_grant(&self, index: usize) -> Option<Grant> {
        let mut state = self.status.lock();
        if state.frozen || state.abandoned || state.count >= state.limit {
            return None;
        }
        state.count += 1;
        if state.first.is_none() {
            state.first = Some(index);
        }
        let grant = if state.count >= state.limit {
            self.status.notify_all();
            Grant::Final
        } else {
            Grant::Tentative
        };
        state.granted[index] = Some(grant);
        Some(grant)
    }

    /// Notifies the waiter that a handle was closed under its feet.
    fn abandon(&self) {
        let mut state = self.status.lock();
        if !state.frozen {
            state.abandoned = true;
            self.status.notify_all();
        }
    }

    fn is_satisfied(&self) -> bool {
        let state = self.status.lock();
        state.count >= state.limit
    }

    fn grant(&self, index: usize) -> Option<Grant> {
        self.status.lock().granted[index]
    }

    /// Waits until the limit is reached, a handle is abandoned or the deadline
    /// passes, then freezes the wakeup.
    fn wait(&self, deadline: Option<Instant>) -> WakeupOutcome {
        let (mut state, _timed_out) =
            self.status
                .wait_deadline_while(self.status.lock(), deadline, |state| {
                    state.count < state.limit && !state.abandoned
                });
        state.frozen = true;
        WakeupOutcome {
            satisfied: state.count >= state.limit,
            abandoned: state.abandoned,
            first: state.first,
        }
    }

    fn freeze(&self) {
        self.status.lock().frozen = true;
    }
}

/// Flavor of waitable object behind a [`WaitHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    ManualReset,
    AutoReset,
    Semaphore { maximum: usize },
    Mutex,
}

struct Waiter {
    wakeup: Arc<Wakeup>,
    index: usize,
}

struct HandleState {
    /// Signal count: 0 or 1 for events, the current count for semaphores.
    /// Unused for mutexes.
    count: usize,
    /// Semaphore units taken by tentative grants. They still count towards
    /// the maximum, as they return to `count` if the wait fails.
    held: usize,
    /// Thread owning a mutex.
    owner: Option<ThreadId>,
    /// Number of times the owner acquired the mutex.
    recursion: usize,
    /// Wakeups registered with this handle, in registration order.
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl HandleState {
    /// Drops one level of mutex ownership.
    fn release_ownership(&mut self) {
        self.recursion -= 1;
        if self.recursion == 0 {
            self.owner = None;
        }
    }
}

struct HandleInner {
    kind: Kind,
    state: Mutex<HandleState>,
}

impl HandleInner {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if this handle can be granted to the given wakeup.
    fn is_available(&self, state: &HandleState, wakeup: &Wakeup) -> bool {
        match self.kind {
            Kind::Mutex => state.owner.map_or(true, |owner| owner == wakeup.thread),
            _ => state.count > 0,
        }
    }

    /// Takes one unit of signal after a grant.
    fn consume(&self, state: &mut HandleState, wakeup: &Wakeup, grant: Grant) {
        match self.kind {
            Kind::ManualReset => (),
            Kind::AutoReset => state.count = 0,
            Kind::Semaphore { .. } => {
                state.count -= 1;
                if grant == Grant::Tentative {
                    state.held += 1;
                }
            }
            Kind::Mutex => {
                state.owner = Some(wakeup.thread);
                state.recursion += 1;
            }
        }
    }

    /// Returns the unit of signal taken by a tentative grant that wasn't kept.
    fn give_back(&self, state: &mut HandleState) {
        match self.kind {
            Kind::ManualReset => (),
            Kind::AutoReset => state.count = 1,
            Kind::Semaphore { maximum } => {
                state.held -= 1;
                state.count += 1;
                debug_assert!(state.count + state.held <= maximum);
            }
            Kind::Mutex => state.release_ownership(),
        }
    }

    /// Settles a tentative grant that the waiter keeps.
    fn commit(&self, state: &mut HandleState) {
        if let Kind::Semaphore { .. } = self.kind {
            state.held -= 1;
        }
    }

    /// Grants this handle to registered waiters, in registration order, for as
    /// long as it remains available to them.
    fn dispatch(&self, state: &mut HandleState) {
        let mut i = 0;
        while i < state.waiters.len() {
            let waiter = &state.waiters[i];
            let grant = if self.is_available(state, &waiter.wakeup) {
                waiter.wakeup.try_grant(waiter.index)
            } else {
                None
            };
            match grant {
                Some(grant) => {
                    if let Some(waiter) = state.waiters.remove(i) {
                        self.consume(state, &waiter.wakeup, grant);
                    }
                }
                // Either not available to this waiter, or the waiter is
                // already satisfied or frozen and will unregister itself.
                None => i += 1,
            }
        }
    }

    fn register(&self, wakeup: &Arc<Wakeup>, index: usize) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let grant = if self.is_available(&state, wakeup) {
            wakeup.try_grant(index)
        } else {
            None
        };
        match grant {
            Some(grant) => self.consume(&mut state, wakeup, grant),
            None => state.waiters.push_back(Waiter {
                wakeup: wakeup.clone(),
                index,
            }),
        }
        Ok(())
    }

    fn unregister(&self, wakeup: &Arc<Wakeup>, index: usize, release: bool) {
        let mut state = self.lock();
        state
            .waiters
            .retain(|waiter| !(Arc::ptr_eq(&waiter.wakeup, wakeup) && waiter.index == index));
        // A final grant means the wait succeeded, so it is never released.
        if wakeup.grant(index) == Some(Grant::Tentative) {
            if release {
                log_trace!("Giving back an unused grant of a {:?} handle", self.kind);
                self.give_back(&mut state);
                self.dispatch(&mut state);
            } else {
                self.commit(&mut state);
            }
        }
    }
}

/// A waitable object, which can be waited on alone or together with other
/// handles.
///
/// Cloning a handle yields another reference to the same underlying object.
/// Concrete handles are created via [`EventWaitHandle`], [`Semaphore`] and
/// [`MutexWaitHandle`], which dereference to a [`WaitHandle`].
#[derive(Clone)]
pub struct WaitHandle {
    inner: Arc<HandleInner>,
}

impl WaitHandle {
    fn new(kind: Kind, count: usize) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                kind,
                state: Mutex::new(HandleState {
                    count,
                    held: 0,
                    owner: None,
                    recursion: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Returns true if both handles refer to the same object.
    pub fn same_handle(&self, other: &WaitHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Blocks until this handle is signaled or the timeout (in milliseconds)
    /// expires. A timeout of `-1` waits forever and `0` only polls.
    ///
    /// Returns whether the handle was acquired.
    pub fn wait_one(&self, timeout_ms: i32) -> Result<bool> {
        let timeout = Timeout::from_millis(timeout_ms)?;
        let outcome = wait_multiple(&[self], 1, timeout)?;
        Ok(outcome.is_some())
    }

    /// Blocks until any of the handles is signaled or the timeout (in
    /// milliseconds) expires, and returns the index of the acquired handle.
    /// [`None`] means that the wait timed out.
    ///
    /// If several handles are already signaled, the one with the lowest index
    /// is acquired. Fails without blocking if the list is empty or contains
    /// the same handle twice.
    ///
    /// ```
    /// # use waitpool::{EventResetMode, EventWaitHandle, WaitHandle};
    /// let a = EventWaitHandle::new(false, EventResetMode::AutoReset);
    /// let b = EventWaitHandle::new(true, EventResetMode::AutoReset);
    /// assert_eq!(WaitHandle::wait_any(&[&a, &b], 0), Ok(Some(1)));
    /// assert_eq!(WaitHandle::wait_any(&[&a, &b], 0), Ok(None));
    /// ```
    pub fn wait_any(handles: &[&WaitHandle], timeout_ms: i32) -> Result<Option<usize>> {
        validate_handles(handles)?;
        let timeout = Timeout::from_millis(timeout_ms)?;
        wait_multiple(handles, 1, timeout)
    }

    /// Blocks until all the handles are signaled or the timeout (in
    /// milliseconds) expires. Returns true if all the handles were acquired.
    ///
    /// On timeout, none of the handles is acquired: signals taken during the
    /// wait are given back. Fails without blocking if the list is empty or
    /// contains the same handle twice.
    pub fn wait_all(handles: &[&WaitHandle], timeout_ms: i32) -> Result<bool> {
        validate_handles(handles)?;
        let timeout = Timeout::from_millis(timeout_ms)?;
        let outcome = wait_multiple(handles, handles.len(), timeout)?;
        Ok(outcome.is_some())
    }

    /// Closes this handle. Pending and future waits on it fail with
    /// [`Error::Closed`].
    ///
    /// Returns false if the handle was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.inner.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            waiter.wakeup.abandon();
        }
        true
    }

    /// Returns true if this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("WaitHandle")
            .field("kind", &self.inner.kind)
            .field("count", &state.count)
            .field("held", &state.held)
            .field("owner", &state.owner)
            .field("recursion", &state.recursion)
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Checks that the list of handles is non-empty and has no duplicates.
fn validate_handles(handles: &[&WaitHandle]) -> Result<()> {
    if handles.is_empty() {
        return Err(Error::InvalidArgument("the list of wait handles is empty"));
    }
    // Handles aren't hashable, so compare them pairwise.
    for (second, handle) in handles.iter().enumerate().rev() {
        for (first, other) in handles[..second].iter().enumerate().rev() {
            if handle.same_handle(other) {
                return Err(Error::DuplicateWaitObject { first, second });
            }
        }
    }
    Ok(())
}

/// Waits until `limit` of the given handles are acquired. Returns the index of
/// the first acquired handle, or [`None`] on timeout.
fn wait_multiple(handles: &[&WaitHandle], limit: usize, timeout: Timeout) -> Result<Option<usize>> {
    let deadline = timeout.deadline();
    let wakeup = Wakeup::new(handles.len(), limit);

    let mut registered = 0;
    let mut result = Ok(());
    for (index, handle) in handles.iter().enumerate() {
        if let Err(e) = handle.inner.register(&wakeup, index) {
            result = Err(e);
            break;
        }
        registered = index + 1;
        if wakeup.is_satisfied() {
            break;
        }
    }

    let outcome = match result {
        Ok(()) => Some(wakeup.wait(deadline)),
        Err(_) => {
            wakeup.freeze();
            None
        }
    };
    let keep = outcome.as_ref().is_some_and(|outcome| outcome.satisfied);

    for (index, handle) in handles[..registered].iter().enumerate() {
        handle.inner.unregister(&wakeup, index, !keep);
    }

    result?;
    match outcome {
        Some(outcome) if outcome.satisfied => Ok(outcome.first),
        Some(outcome) if outcome.abandoned => Err(Error::Closed),
        _ => Ok(None),
    }
}

/// Whether an event resets itself after releasing a waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResetMode {
    /// The event stays signaled, releasing every waiter, until it is reset.
    ManualReset,
    /// The event releases a single waiter, and is then reset automatically.
    AutoReset,
}

/// An event that threads can wait on.
///
/// ```
/// # use waitpool::{EventResetMode, EventWaitHandle};
/// let event = EventWaitHandle::new(false, EventResetMode::ManualReset);
/// assert_eq!(event.wait_one(0), Ok(false));
/// event.set().unwrap();
/// assert_eq!(event.wait_one(0), Ok(true));
/// assert_eq!(event.wait_one(0), Ok(true));
/// event.reset().unwrap();
/// assert_eq!(event.wait_one(0), Ok(false));
/// ```
#[derive(Clone, Debug)]
pub struct EventWaitHandle {
    handle: WaitHandle,
}

impl EventWaitHandle {
    /// Creates an event in the given initial state.
    pub fn new(initially_set: bool, mode: EventResetMode) -> Self {
        let kind = match mode {
            EventResetMode::ManualReset => Kind::ManualReset,
            EventResetMode::AutoReset => Kind::AutoReset,
        };
        Self {
            handle: WaitHandle::new(kind, usize::from(initially_set)),
        }
    }

    /// Returns the underlying wait handle.
    pub fn handle(&self) -> &WaitHandle {
        &self.handle
    }

    /// Signals the event.
    pub fn set(&self) -> Result<()> {
        let inner = &self.handle.inner;
        let mut state = inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.count = 1;
        inner.dispatch(&mut state);
        Ok(())
    }

    /// Resets the event to the non-signaled state.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.handle.inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.count = 0;
        Ok(())
    }
}

impl Deref for EventWaitHandle {
    type Target = WaitHandle;

    fn deref(&self) -> &WaitHandle {
        &self.handle
    }
}

/// A counting semaphore that threads can wait on. Each successful wait takes
/// one unit of its count.
#[derive(Clone, Debug)]
pub struct Semaphore {
    handle: WaitHandle,
    maximum: usize,
}

impl Semaphore {
    /// Creates a semaphore with the given initial and maximum counts.
    pub fn new(initial: usize, maximum: usize) -> Result<Self> {
        if maximum == 0 {
            return Err(Error::InvalidArgument("the maximum count must be positive"));
        }
        if initial > maximum {
            return Err(Error::InvalidArgument(
                "the initial count exceeds the maximum count",
            ));
        }
        Ok(Self {
            handle: WaitHandle::new(Kind::Semaphore { maximum }, initial),
            maximum,
        })
    }

    /// Returns the underlying wait handle.
    pub fn handle(&self) -> &WaitHandle {
        &self.handle
    }

    /// Increases the count by `count`, waking up waiters accordingly. Returns
    /// the previous count.
    ///
    /// Units held by a pending [`WaitHandle::wait_all()`] still count towards
    /// the maximum, since they are given back if that wait fails.
    pub fn release(&self, count: usize) -> Result<usize> {
        if count == 0 {
            return Err(Error::InvalidArgument("the release count must be positive"));
        }
        let maximum = self.maximum;
        let inner = &self.handle.inner;
        let mut state = inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let previous = state.count;
        match previous.checked_add(count) {
            Some(new_count) if new_count <= maximum - state.held => state.count = new_count,
            _ => return Err(Error::SemaphoreFull { maximum }),
        }
        inner.dispatch(&mut state);
        Ok(previous)
    }
}

impl Deref for Semaphore {
    type Target = WaitHandle;

    fn deref(&self) -> &WaitHandle {
        &self.handle
    }
}

/// A recursive mutex that threads can wait on, alone or together with other
/// handles.
///
/// A successful wait makes the calling thread the owner. The owner can acquire
/// the mutex again without blocking, and must release it once per
/// acquisition before another thread can acquire it.
///
/// ```
/// # use waitpool::MutexWaitHandle;
/// let mutex = MutexWaitHandle::new(false);
/// assert_eq!(mutex.wait_one(0), Ok(true));
/// assert_eq!(mutex.wait_one(0), Ok(true));
/// mutex.release().unwrap();
/// mutex.release().unwrap();
/// assert!(mutex.release().is_err());
/// ```
#[derive(Clone, Debug)]
pub struct MutexWaitHandle {
    handle: WaitHandle,
}

impl MutexWaitHandle {
    /// Creates a mutex, owned by the calling thread if `initially_owned`.
    pub fn new(initially_owned: bool) -> Self {
        let handle = WaitHandle::new(Kind::Mutex, 0);
        if initially_owned {
            let mut state = handle.inner.lock();
            state.owner = Some(thread::current().id());
            state.recursion = 1;
        }
        Self { handle }
    }

    /// Returns the underlying wait handle.
    pub fn handle(&self) -> &WaitHandle {
        &self.handle
    }

    /// Releases one acquisition of the mutex, waking up a waiter once the
    /// calling thread no longer owns it.
    ///
    /// Fails with [`Error::NotOwner`] if the calling thread doesn't own the
    /// mutex.
    pub fn release(&self) -> Result<()> {
        let inner = &self.handle.inner;
        let mut state = inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.owner != Some(thread::current().id()) {
            return Err(Error::NotOwner);
        }
        state.release_ownership();
        if state.owner.is_none() {
            inner.dispatch(&mut state);
        }
        Ok(())
    }
}

impl Deref for MutexWaitHandle {
    type Target = WaitHandle;

    fn deref(&self) -> &WaitHandle {
        &self.handle
    }
}
