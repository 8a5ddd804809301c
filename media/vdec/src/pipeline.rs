// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode pipeline coordinator.
//!
//! The calling thread always parses. Macroblock rows become reconstruct and deblock work as soon
//! as parsing has covered them:
//!
//! * 1 core: both stages run synchronously on the calling thread.
//! * 2 cores: one worker reconstructs and then deblocks each row.
//! * 3 cores: one worker reconstructs, another deblocks.
//!
//! Rows are handed out in raster order. Progress is published through two [`Counter`]s; the
//! deblocker waits until the reconstruct counter has passed a row before filtering it, and the
//! calling thread waits for the deblock counter before it starts another picture.

use std::fmt;
use std::sync::Arc;

use base::debug;
use base::error;
use base::Stoppable;
use base::WorkerThread;
use bytes::BytesMut;
use sync::Counter;
use sync::Mutex;

use crate::arena::Region;
use crate::backend::MbState;
use crate::backend::RowJob;
use crate::backend::RowKernels;
use crate::error::Cause;
use crate::error::Error;
use crate::error::Result;
use crate::format::Resolution;
use crate::jobs::Job;
use crate::jobs::JobKind;
use crate::jobs::JobQueue;
use crate::negotiate::JOB_QUEUE_HEADER_SIZE;
use crate::negotiate::MAX_CORES;
use crate::pool::Frame;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PictureState {
    Idle,
    Parsing,
    Reconstructing,
    Deblocking,
    Done,
    Aborted,
}

impl PictureState {
    fn is_settled(self) -> bool {
        matches!(
            self,
            PictureState::Idle | PictureState::Done | PictureState::Aborted
        )
    }
}

/// Per-macroblock parse map and value map of the picture being decoded.
#[derive(Clone)]
pub struct MbMaps {
    data: Arc<Mutex<BytesMut>>,
    capacity: usize,
}

impl MbMaps {
    /// Wraps a region holding two maps of `capacity` macroblocks each.
    pub fn new(region: Region, capacity: usize) -> Self {
        MbMaps {
            data: Arc::new(Mutex::new(region.bytes)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Marks the first `total` macroblocks pending.
    pub fn clear(&self, total: usize) {
        let mut data = self.data.lock();
        data[..total].fill(MbState::Pending as u8);
        data[self.capacity..self.capacity + total].fill(0);
    }

    pub fn set(&self, mb: usize, state: MbState, value: u8) {
        let mut data = self.data.lock();
        data[mb] = state as u8;
        data[self.capacity + mb] = value;
    }

    /// Records `values` for consecutive macroblocks starting at `first`.
    pub fn set_decoded(&self, first: usize, values: &[u8]) {
        let mut data = self.data.lock();
        data[first..first + values.len()].fill(MbState::Decoded as u8);
        let start = self.capacity + first;
        data[start..start + values.len()].copy_from_slice(values);
    }

    pub fn state(&self, mb: usize) -> Option<MbState> {
        MbState::n(self.data.lock()[mb])
    }

    /// Copies the states and then the values of `len` macroblocks from `first` into `out`.
    pub fn copy_row(&self, first: usize, len: usize, out: &mut [u8]) {
        let data = self.data.lock();
        out[..len].copy_from_slice(&data[first..first + len]);
        let start = self.capacity + first;
        out[len..2 * len].copy_from_slice(&data[start..start + len]);
    }
}

impl fmt::Debug for MbMaps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MbMaps")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// What the pipeline threads need to know about the picture in flight.
#[derive(Clone, Debug)]
pub struct PictureContext {
    pub frame: Frame,
    pub reference: Option<Frame>,
    pub resolution: Resolution,
    pub maps: MbMaps,
    pub deblock: bool,
}

struct Shared {
    kernels: Arc<dyn RowKernels>,
    reconstruct_jobs: JobQueue,
    deblock_jobs: JobQueue,
    reconstructed: Counter,
    deblocked: Counter,
    picture: Mutex<Option<(u32, PictureContext)>>,
}

impl Shared {
    fn current(&self, picture: u32) -> Option<PictureContext> {
        match &*self.picture.lock() {
            Some((id, ctx)) if *id == picture => Some(ctx.clone()),
            _ => None,
        }
    }

    fn reconstruct(&self, ctx: &PictureContext, row: u32, scratch: &mut [u8]) {
        let width_mbs = ctx.resolution.width_mbs() as usize;
        let (info, rest) = scratch.split_at_mut(2 * width_mbs);
        ctx.maps
            .copy_row(row as usize * width_mbs, width_mbs, info);
        let (mb_states, mb_values) = info.split_at(width_mbs);
        let job = RowJob {
            frame: &ctx.frame,
            reference: ctx.reference.as_ref(),
            resolution: ctx.resolution,
            row,
            mb_states,
            mb_values,
        };
        self.kernels.reconstruct_row(&job, rest);
        self.reconstructed.advance_to(row + 1);
    }

    fn deblock(&self, ctx: &PictureContext, row: u32, scratch: &mut [u8]) {
        if ctx.deblock {
            self.kernels
                .deblock_row(&ctx.frame, ctx.resolution, row, scratch);
        }
        self.deblocked.advance_to(row + 1);
    }
}

impl Stoppable for Shared {
    fn request_stop(&self) {
        self.reconstruct_jobs.close();
        self.deblock_jobs.close();
        self.reconstructed.cancel();
        self.deblocked.cancel();
    }
}

fn reconstruct_worker(shared: Arc<Shared>, mut scratch: BytesMut) -> BytesMut {
    while let Some(job) = shared.reconstruct_jobs.pop() {
        let ctx = match shared.current(job.picture) {
            Some(ctx) => ctx,
            None => continue,
        };
        shared.reconstruct(&ctx, job.row, &mut scratch);
        if job.kind == JobKind::ReconstructAndDeblock {
            shared.deblock(&ctx, job.row, &mut scratch);
        }
    }
    scratch
}

fn deblock_worker(shared: Arc<Shared>, mut scratch: BytesMut) -> BytesMut {
    while let Some(job) = shared.deblock_jobs.pop() {
        if shared.reconstructed.wait_for(job.row + 1).is_err() {
            break;
        }
        if let Some(ctx) = shared.current(job.picture) {
            shared.deblock(&ctx, job.row, &mut scratch);
        }
    }
    scratch
}

/// Drives reconstruction and deblocking of one picture at a time.
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Vec<WorkerThread<BytesMut>>,
    /// Scratch of the calling thread.
    scratch: BytesMut,
    /// Worker scratch not currently lent to a thread.
    spare: Vec<BytesMut>,
    num_cores: usize,
    state: PictureState,
    picture: u32,
    rows_total: u32,
    rows_dispatched: u32,
}

impl Pipeline {
    /// Builds the pipeline over the job queue record and one scratch region per possible thread,
    /// starting workers for `num_cores`.
    pub fn new(
        kernels: Arc<dyn RowKernels>,
        mut jobs: Region,
        scratch: Vec<Region>,
        num_cores: usize,
    ) -> Result<Self> {
        if scratch.len() < MAX_CORES {
            error!("{} scratch regions for {} cores", scratch.len(), MAX_CORES);
            return Err(Cause::ArenaExhausted.into());
        }
        let mut header = jobs.split_to(JOB_QUEUE_HEADER_SIZE as usize);
        let reconstruct_header = header.split_to(header.len() / 2);
        let reconstruct_records = jobs.split_to(jobs.len() / 2);
        let shared = Arc::new(Shared {
            kernels,
            reconstruct_jobs: JobQueue::new(reconstruct_header.bytes, reconstruct_records.bytes),
            deblock_jobs: JobQueue::new(header.bytes, jobs.bytes),
            reconstructed: Counter::new(),
            deblocked: Counter::new(),
            picture: Mutex::new(None),
        });
        let mut scratch = scratch.into_iter().map(|r| r.bytes);
        let local = scratch.next().unwrap_or_default();
        let mut pipeline = Pipeline {
            shared,
            workers: Vec::new(),
            scratch: local,
            spare: scratch.collect(),
            num_cores: num_cores.clamp(1, MAX_CORES),
            state: PictureState::Idle,
            picture: 0,
            rows_total: 0,
            rows_dispatched: 0,
        };
        pipeline.start_workers()?;
        Ok(pipeline)
    }

    fn start_workers(&mut self) -> Result<()> {
        self.shared.reconstruct_jobs.reopen();
        self.shared.deblock_jobs.reopen();
        self.shared.reconstructed.reset();
        self.shared.deblocked.reset();

        let stopper: Arc<dyn Stoppable> = self.shared.clone();
        if self.num_cores >= 2 {
            let shared = self.shared.clone();
            let scratch = self.spare.pop().unwrap_or_default();
            let worker = WorkerThread::start("vdec_recon", stopper.clone(), move || {
                reconstruct_worker(shared, scratch)
            })
            .map_err(spawn_error)?;
            self.workers.push(worker);
        }
        if self.num_cores >= 3 {
            let shared = self.shared.clone();
            let scratch = self.spare.pop().unwrap_or_default();
            let worker = WorkerThread::start("vdec_deblock", stopper, move || {
                deblock_worker(shared, scratch)
            })
            .map_err(spawn_error)?;
            self.workers.push(worker);
        }
        debug!("pipeline running on {} cores", self.num_cores);
        Ok(())
    }

    fn stop_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if let Some(scratch) = worker.stop() {
                self.spare.push(scratch);
            }
        }
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Restarts the worker threads for `num_cores`. Not allowed while a picture is in flight.
    pub fn set_num_cores(&mut self, num_cores: usize) -> Result<()> {
        if !self.state.is_settled() {
            error!("core count changed with a picture in flight");
            return Err(Cause::BufferManager.into());
        }
        self.stop_workers();
        self.num_cores = num_cores.clamp(1, MAX_CORES);
        self.start_workers()
    }

    pub fn state(&self) -> PictureState {
        self.state
    }

    /// Rows whose deblocking has finished.
    pub fn rows_deblocked(&self) -> u32 {
        self.shared.deblocked.value()
    }

    /// Starts a picture. The previous one must have finished or been aborted.
    pub fn begin_picture(&mut self, ctx: PictureContext) -> Result<()> {
        if !self.state.is_settled() {
            error!("picture started while the previous one is {:?}", self.state);
            return Err(Cause::BufferManager.into());
        }
        self.picture = self.picture.wrapping_add(1);
        self.rows_total = ctx.resolution.height_mbs();
        self.rows_dispatched = 0;
        self.shared.reconstructed.reset();
        self.shared.deblocked.reset();
        *self.shared.picture.lock() = Some((self.picture, ctx));
        self.state = PictureState::Parsing;
        Ok(())
    }

    /// Hands out every row below `rows` that has not been handed out yet.
    pub fn dispatch_rows(&mut self, rows: u32) -> Result<()> {
        let rows = rows.min(self.rows_total);
        while self.rows_dispatched < rows {
            let row = self.rows_dispatched;
            self.dispatch(row)?;
            self.rows_dispatched += 1;
            self.state = PictureState::Reconstructing;
        }
        Ok(())
    }

    fn dispatch(&mut self, row: u32) -> Result<()> {
        let job = |kind| Job {
            kind,
            picture: self.picture,
            row,
        };
        let queued = match self.num_cores {
            1 => {
                let ctx = self.shared.current(self.picture).ok_or_else(|| {
                    error!("row {} dispatched without a picture", row);
                    Error::from(Cause::BufferManager)
                })?;
                self.shared.reconstruct(&ctx, row, &mut self.scratch);
                self.shared.deblock(&ctx, row, &mut self.scratch);
                true
            }
            2 => self
                .shared
                .reconstruct_jobs
                .push(job(JobKind::ReconstructAndDeblock)),
            _ => {
                self.shared
                    .reconstruct_jobs
                    .push(job(JobKind::Reconstruct))
                    && self.shared.deblock_jobs.push(job(JobKind::Deblock))
            }
        };
        if !queued {
            error!("row {} dispatched to stopped workers", row);
            return Err(Cause::BufferManager.into());
        }
        Ok(())
    }

    /// Dispatches the remaining rows and waits until the whole picture is deblocked.
    pub fn finish_picture(&mut self) -> Result<()> {
        self.dispatch_rows(self.rows_total)?;
        self.state = PictureState::Deblocking;
        self.drain(self.rows_total)?;
        self.state = PictureState::Done;
        Ok(())
    }

    /// Abandons the picture once the rows already handed out have drained.
    pub fn abort_picture(&mut self) {
        if self.state.is_settled() {
            return;
        }
        if let Err(e) = self.drain(self.rows_dispatched) {
            error!("failed to drain aborted picture: {}", e);
        }
        self.state = PictureState::Aborted;
    }

    fn drain(&mut self, rows: u32) -> Result<()> {
        let result = self.shared.deblocked.wait_for(rows);
        *self.shared.picture.lock() = None;
        result.map(|_| ()).map_err(|e| {
            error!("pipeline wait failed: {}", e);
            Cause::BufferManager.into()
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn spawn_error(e: std::io::Error) -> Error {
    error!("failed to spawn pipeline worker: {}", e);
    Cause::BufferManager.into()
}
