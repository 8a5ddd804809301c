// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded row job queue shared between the calling thread and pipeline workers.
//!
//! Jobs are stored as fixed-size little-endian records in a ring carved from the job queue memory
//! record; the ring's head, length and closed flag live in a small header in front of it.

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use enumn::N;
use sync::Condvar;
use sync::Mutex;

use crate::negotiate::JOB_RECORD_SIZE;

const RECORD_SIZE: usize = JOB_RECORD_SIZE as usize;
/// Bytes of ring header: head, length and closed flag.
pub const RING_HEADER_SIZE: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum JobKind {
    Reconstruct = 1,
    Deblock = 2,
    ReconstructAndDeblock = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    /// Picture sequence number the job belongs to.
    pub picture: u32,
    pub row: u32,
}

impl Job {
    fn write(&self, mut buf: &mut [u8]) {
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(self.picture);
        buf.put_u32_le(self.row);
        buf.put_u32_le(0);
    }

    fn read(mut buf: &[u8]) -> Option<Job> {
        let kind = JobKind::n(buf.get_u32_le())?;
        let picture = buf.get_u32_le();
        let row = buf.get_u32_le();
        Some(Job { kind, picture, row })
    }
}

struct Ring {
    header: BytesMut,
    records: BytesMut,
    capacity: usize,
}

impl Ring {
    fn field(&self, index: usize) -> u32 {
        (&self.header[index * 4..]).get_u32_le()
    }

    fn set_field(&mut self, index: usize, value: u32) {
        (&mut self.header[index * 4..]).put_u32_le(value);
    }

    fn head(&self) -> usize {
        self.field(0) as usize
    }

    fn len(&self) -> usize {
        self.field(1) as usize
    }

    fn closed(&self) -> bool {
        self.field(2) != 0
    }

    fn record(&mut self, index: usize) -> &mut [u8] {
        let start = index * RECORD_SIZE;
        &mut self.records[start..start + RECORD_SIZE]
    }
}

/// A blocking FIFO of [`Job`]s with a fixed capacity.
pub struct JobQueue {
    ring: Mutex<Ring>,
    cond: Condvar,
}

impl JobQueue {
    /// Creates a queue whose ring state lives in `header` (at least [`RING_HEADER_SIZE`] bytes)
    /// and whose records fill `records`.
    pub fn new(header: BytesMut, records: BytesMut) -> Self {
        let capacity = records.len() / RECORD_SIZE;
        let mut ring = Ring {
            header,
            records,
            capacity,
        };
        for field in 0..3 {
            ring.set_field(field, 0);
        }
        JobQueue {
            ring: Mutex::new(ring),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `job`, waiting for room if the queue is full.
    ///
    /// Returns false if the queue is closed.
    pub fn push(&self, job: Job) -> bool {
        let mut ring = self.cond.wait_while(self.ring.lock(), |r| {
            !r.closed() && r.len() == r.capacity
        });
        if ring.closed() {
            return false;
        }
        let tail = (ring.head() + ring.len()) % ring.capacity;
        job.write(ring.record(tail));
        let len = ring.len() as u32 + 1;
        ring.set_field(1, len);
        self.cond.notify_all();
        true
    }

    /// Removes the oldest job, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed, even if jobs are still pending.
    pub fn pop(&self) -> Option<Job> {
        let mut ring = self
            .cond
            .wait_while(self.ring.lock(), |r| !r.closed() && r.len() == 0);
        if ring.closed() {
            return None;
        }
        let head = ring.head();
        let job = Job::read(ring.record(head));
        let next = ((head + 1) % ring.capacity) as u32;
        let len = ring.len() as u32 - 1;
        ring.set_field(0, next);
        ring.set_field(1, len);
        self.cond.notify_all();
        job
    }

    /// Wakes every waiter and makes further pushes and pops fail.
    pub fn close(&self) {
        self.ring.lock().set_field(2, 1);
        self.cond.notify_all();
    }

    /// Empties the queue and opens it again.
    pub fn reopen(&self) {
        let mut ring = self.ring.lock();
        for field in 0..3 {
            ring.set_field(field, 0);
        }
    }
}
