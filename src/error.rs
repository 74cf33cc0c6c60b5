// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error type shared by the pool, timers and wait handles.

use thiserror::Error;

/// Errors returned synchronously by the APIs of this crate.
///
/// Failures of user callbacks are never reported through this type: they are
/// caught and discarded on the thread that ran them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A timeout was neither `-1` (infinite) nor a non-negative number of
    /// milliseconds.
    #[error("timeout must be non-negative or -1, got {0}")]
    InvalidTimeout(i32),
    /// Some other argument was out of its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The same wait handle appeared twice in a multi-handle wait.
    #[error("wait handle at index {second} duplicates the one at index {first}")]
    DuplicateWaitObject {
        /// Index of the first occurrence.
        first: usize,
        /// Index of the duplicate.
        second: usize,
    },
    /// The wait handle was closed.
    #[error("wait handle is closed")]
    Closed,
    /// Releasing a semaphore would exceed its maximum count.
    #[error("semaphore count would exceed its maximum of {maximum}")]
    SemaphoreFull {
        /// Maximum count of the semaphore.
        maximum: usize,
    },
    /// The calling thread doesn't own the mutex it tried to release.
    #[error("mutex is not owned by the calling thread")]
    NotOwner,
    /// The operating system refused to spawn a thread.
    #[error("failed to spawn a thread")]
    ThreadSpawn,
}

impl Error {
    /// Returns true for the "invalid argument" family of errors, which are
    /// raised before any blocking or scheduling happens.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::InvalidTimeout(_) | Error::InvalidArgument(_) | Error::DuplicateWaitObject { .. }
        )
    }
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;
