// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread abstraction

use std::io;
use std::panic;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::thread::Thread;

/// State a worker thread watches to learn that it should return.
pub trait Stoppable: Send + Sync {
    /// Asks the worker to return from its thread function.
    ///
    /// Implementations must wake the worker if it is blocked waiting for work.
    fn request_stop(&self);
}

/// Wrapper object for a named worker thread that is stopped through a [`Stoppable`].
pub struct WorkerThread<T: Send + 'static> {
    worker: Option<(Arc<dyn Stoppable>, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Starts a worker thread named `thread_name` running the `thread_func` function.
    ///
    /// The `thread_func` implementation must return once `stopper.request_stop()` has been called.
    /// Call [`stop()`](Self::stop) to stop the thread.
    pub fn start<F>(
        thread_name: impl Into<String>,
        stopper: Arc<dyn Stoppable>,
        thread_func: F,
    ) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let thread_handle = thread::Builder::new()
            .name(thread_name.into())
            .spawn(thread_func)?;

        Ok(WorkerThread {
            worker: Some((stopper, thread_handle)),
        })
    }

    /// Stops the worker thread.
    ///
    /// Returns the value returned by the function running in the thread, or `None` if the thread
    /// was already stopped.
    pub fn stop(mut self) -> Option<T> {
        self.stop_internal()
    }

    // `stop_internal` accepts a reference so it can be called from `drop`.
    fn stop_internal(&mut self) -> Option<T> {
        self.worker.take().map(|(stopper, thread_handle)| {
            stopper.request_stop();
            match thread_handle.join() {
                Ok(v) => v,
                Err(e) => panic::resume_unwind(e),
            }
        })
    }

    /// Returns a handle to the running thread.
    pub fn thread(&self) -> Option<&Thread> {
        self.worker.as_ref().map(|(_, handle)| handle.thread())
    }
}

impl<T: Send + 'static> Drop for WorkerThread<T> {
    /// Stops the thread if the `WorkerThread` is dropped without calling [`stop()`](Self::stop).
    fn drop(&mut self) {
        let _ = self.stop_internal();
    }
}
