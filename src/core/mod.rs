// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: work queues, timers and wait handles.

mod context;
mod queue;
mod registered_wait;
mod thread_pool;
mod timer;
mod util;
mod wait;
mod work_item;

pub use context::{ContextGuard, ExecutionContext};
pub use registered_wait::RegisteredWaitHandle;
pub use thread_pool::{
    ThreadPool, ThreadPoolBuilder, ThreadSpawning, DEFAULT_MAX_COMPLETION_THREADS,
    DEFAULT_MAX_WORKER_THREADS,
};
pub use timer::Timer;
pub use wait::{EventResetMode, EventWaitHandle, MutexWaitHandle, Semaphore, WaitHandle};
