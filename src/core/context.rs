// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ambient execution context, propagated from the submitting thread to the
//! thread that runs a work item.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// An opaque value attached to the current thread.
///
/// When work is submitted to a [`ThreadPool`](crate::ThreadPool), the
/// context of the submitting thread is captured and installed on the pool
/// thread for the duration of the callback.
///
/// ```
/// # use waitpool::ExecutionContext;
/// assert!(ExecutionContext::current().is_none());
/// {
///     let _guard = ExecutionContext::enter(Some(ExecutionContext::new(42u64)));
///     let current = ExecutionContext::current().unwrap();
///     assert_eq!(current.downcast_ref::<u64>(), Some(&42));
/// }
/// assert!(ExecutionContext::current().is_none());
/// ```
#[derive(Clone)]
pub struct ExecutionContext {
    value: Arc<dyn Any + Send + Sync>,
}

impl ExecutionContext {
    /// Wraps the given value into a context.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// Returns the wrapped value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Returns true if both contexts wrap the same value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    /// Returns the context of the current thread.
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Installs the given context on the current thread, until the returned
    /// guard is dropped. The previous context is then restored.
    pub fn enter(context: Option<ExecutionContext>) -> ContextGuard {
        let previous = CURRENT.with(|current| current.replace(context));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

/// Restores the previous [`ExecutionContext`] of the thread when dropped.
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<ExecutionContext>,
    // The guard must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}
