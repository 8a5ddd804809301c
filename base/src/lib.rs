// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-level helpers shared by the decoder crates: logging and worker threads.

pub mod syslog;
mod worker_thread;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;

pub use crate::worker_thread::Stoppable;
pub use crate::worker_thread::WorkerThread;
