// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronization primitives shared by the decoder and its worker threads.
//!
//! The Mutex/Condvar types wrap the standard library versions and panic where the standard library
//! would return a poison error.
//!
//! [`Counter`] is the wait/signal primitive the pipeline stages use to publish progress to each
//! other (rows reconstructed, rows deblocked).

mod condvar;
mod counter;
mod mutex;

pub use crate::condvar::Condvar;
pub use crate::counter::Cancelled;
pub use crate::counter::Counter;
pub use crate::mutex::Mutex;
