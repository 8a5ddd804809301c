// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Display;

use crate::Condvar;
use crate::Mutex;

#[derive(Debug, Default)]
struct State {
    value: u32,
    cancelled: bool,
}

/// A monotonic progress counter that threads can block on.
///
/// One side publishes progress with [`advance_to`](Counter::advance_to) or
/// [`add`](Counter::add); the other side blocks in [`wait_for`](Counter::wait_for) until the
/// counter reaches a target. [`cancel`](Counter::cancel) wakes every waiter with [`Cancelled`] and
/// stays in effect until [`reset`](Counter::reset).
#[derive(Debug, Default)]
pub struct Counter {
    state: Mutex<State>,
    cond: Condvar,
}

impl Counter {
    pub fn new() -> Counter {
        Default::default()
    }

    /// Current value of the counter.
    pub fn value(&self) -> u32 {
        self.state.lock().value
    }

    /// Raises the counter to `value`. Lower values are ignored so progress never goes backwards.
    pub fn advance_to(&self, value: u32) {
        let mut state = self.state.lock();
        if value > state.value {
            state.value = value;
            self.cond.notify_all();
        }
    }

    /// Blocks until the counter is at least `target`.
    ///
    /// Returns the value observed when the wait ended, or `Cancelled` if the counter was cancelled
    /// before reaching the target.
    pub fn wait_for(&self, target: u32) -> Result<u32, Cancelled> {
        let state = self
            .cond
            .wait_while(self.state.lock(), |s| s.value < target && !s.cancelled);
        if state.value >= target {
            Ok(state.value)
        } else {
            Err(Cancelled)
        }
    }

    /// Wakes all waiters; waits that have not reached their target fail until `reset`.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Sets the counter back to zero and clears cancellation.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.value = 0;
        state.cancelled = false;
    }
}

/// A wait on a [`Counter`] was abandoned because the counter was cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cancelled;

impl Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wait cancelled")
    }
}

impl std::error::Error for Cancelled {}
