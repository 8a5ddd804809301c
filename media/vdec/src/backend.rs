// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec strategy interfaces.
//!
//! The control plane never looks inside a unit's syntax or touches pixel math itself. A
//! [`UnitParser`] turns unit payloads into headers and per-macroblock values on the calling thread,
//! and [`RowKernels`] reconstructs and deblocks macroblock rows on whichever pipeline thread the
//! row is scheduled on. Both are chosen once, when the decoder is constructed.

use enumn::N;

use crate::error::Error;
use crate::error::Result;
use crate::format::Resolution;
use crate::pool::Frame;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, N)]
#[repr(u8)]
pub enum PictureType {
    #[default]
    I = 0,
    P = 1,
    B = 2,
}

/// Status of one macroblock in the parse map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum MbState {
    Pending = 0,
    Decoded = 1,
    Concealed = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequenceHeader {
    pub resolution: Resolution,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub picture_type: PictureType,
    pub is_reference: bool,
    /// The slice opens a new picture.
    pub first_slice: bool,
    /// The picture starts a new prediction chain; earlier pictures are displayed first.
    pub idr: bool,
    pub poc: i32,
    pub first_mb: u32,
    pub num_mbs: u32,
    /// Offset of the macroblock data inside the unit payload.
    pub data_offset: usize,
}

impl SliceHeader {
    /// Whether `self` belongs to a different picture than the one `current` started.
    pub fn starts_new_picture(&self, current: &SliceHeader) -> bool {
        self.first_slice || self.poc != current.poc || self.picture_type != current.picture_type
    }
}

/// A parsed unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Unit {
    Sequence(SequenceHeader),
    Slice(SliceHeader),
    /// Carries nothing the decoder needs.
    Filler,
}

/// Outcome of decoding the macroblocks of one slice.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceData {
    /// Macroblocks decoded, counted from the slice's first macroblock.
    pub decoded: u32,
    /// Set when the slice stopped early or carried damaged data.
    pub error: Option<Error>,
}

/// Bitstream syntax for one codec. Runs on the calling thread only.
pub trait UnitParser: Send {
    /// Parses one unit. `payload` has its start code and emulation prevention bytes removed.
    fn parse_unit(&mut self, payload: &[u8]) -> Result<Unit>;

    /// Decodes the macroblocks of `slice`, writing one value per macroblock into `values`.
    ///
    /// `values` holds exactly `slice.num_mbs` entries.
    fn decode_macroblocks(
        &mut self,
        slice: &SliceHeader,
        payload: &[u8],
        values: &mut [u8],
    ) -> SliceData;

    /// Forgets any state carried between units.
    fn reset(&mut self) {}
}

/// Everything a kernel needs to reconstruct one macroblock row.
pub struct RowJob<'a> {
    pub frame: &'a Frame,
    /// Most recent reference picture, used to conceal missing macroblocks.
    pub reference: Option<&'a Frame>,
    pub resolution: Resolution,
    pub row: u32,
    /// One [`MbState`] per macroblock of the row.
    pub mb_states: &'a [u8],
    pub mb_values: &'a [u8],
}

/// Pixel kernels, shared by every pipeline thread.
pub trait RowKernels: Send + Sync {
    fn reconstruct_row(&self, job: &RowJob, scratch: &mut [u8]);

    /// Filters the edge between `row` and the row above it. Only called once `row` is
    /// reconstructed.
    fn deblock_row(&self, frame: &Frame, resolution: Resolution, row: u32, scratch: &mut [u8]);
}
