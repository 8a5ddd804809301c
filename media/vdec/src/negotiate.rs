// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory negotiation.
//!
//! [`Requirements::resolve`] turns a [`DecoderConfig`] into every sizing decision the decoder
//! makes: pool capacity, frame layout, unit limits and the ordered memory record table. The same
//! function runs for `fill_mem_records` and again at INIT, so the host's blocks are always checked
//! against a freshly computed table.

use base::warn;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::arena::Arena;
use crate::config::Codec;
use crate::config::DecoderConfig;
use crate::error::Cause;
use crate::error::Result;
use crate::format::align_up;
use crate::format::align_up_u64;
use crate::format::ColorFormat;
use crate::format::Resolution;
use crate::mem_record::MemClass;
use crate::mem_record::MemRecord;
use crate::mem_record::MemRole;

/// Alignment of every memory record and of every frame inside the picture pool.
pub const RECORD_ALIGNMENT: u64 = 128;
/// Largest supported core count: the calling thread plus two workers.
pub const MAX_CORES: usize = 3;
/// Decoded frames after which the instance refuses to decode further.
pub const NUM_FRAMES_LIMIT: u32 = 0x7FFF_FFFF;
pub const CODEC_CONTEXT_SIZE: u64 = 4096;
/// Bytes of the codec context reserved for the active sequence header.
pub const PARAM_SET_CACHE_SIZE: usize = 1024;
pub const JOB_RECORD_SIZE: u64 = 16;
pub const JOB_QUEUE_HEADER_SIZE: u64 = 64;
/// Per-macroblock scratch needed by one pipeline thread.
pub const MB_SCRATCH_SIZE: u64 = 1152;
/// Motion vector storage for one macroblock: 16 blocks of two 16-bit components.
pub const MV_BYTES_PER_MB: u64 = 64;
/// Bytes reserved past the end of the staged unit.
pub const BITSTREAM_PAD: u64 = 8;
/// Size of one encoded entry in the backup table.
pub const BACKUP_ENTRY_SIZE: u64 = 32;
/// Size of a plane whose storage is supplied by the host in shared mode.
pub const PLACEHOLDER_PLANE_SIZE: u64 = 64;

const H264_DEFAULT_LEVEL: u32 = 31;
const H264_MIN_LEVEL: u32 = 10;
const H264_MAX_LEVEL: u32 = 52;
/// Frames larger than this many macroblocks need at least level 3.1.
const H264_LEVEL_31_MBS: u32 = 1620;
const H264_MAX_REF_FRAMES: u32 = 16;
const H264_MAX_REORDER_FRAMES: u32 = 16;
const MAX_EXTRA_DISPLAY_BUFFERS: u32 = 16;
const H264_PAD_X: u32 = 32;
const H264_PAD_Y: u32 = 20;
const H264_MIN_UNIT_SIZE: usize = 200_000;
const H264_MIN_INPUT_SIZE: usize = 2 * 1024 * 1024;

const MPEG2_NUM_FRAMES: usize = 3;
const MPEG2_REFERENCE_WINDOW: usize = 2;
const MPEG2_MAX_UNIT_SIZE: usize = 2000 * 1024;

/// DPB depth, in frames, of a maximum-size frame at each level (MaxDpbMbs / MaxFS).
const H264_DPB_FRAMES: [(u32, u32); 16] = [
    (10, 4),
    (11, 2),
    (12, 6),
    (13, 6),
    (20, 6),
    (21, 6),
    (22, 5),
    (30, 5),
    (31, 5),
    (32, 4),
    (40, 4),
    (41, 4),
    (42, 4),
    (50, 5),
    (51, 5),
    (52, 5),
];

const H264_ROLES: [MemRole; 10] = [
    MemRole::CodecContext,
    MemRole::BitstreamBuffer,
    MemRole::PicturePool,
    MemRole::MotionVectorPool,
    MemRole::MacroblockMaps,
    MemRole::JobQueue,
    MemRole::Scratch(0),
    MemRole::Scratch(1),
    MemRole::Scratch(2),
    MemRole::BackupTable,
];

const MPEG2_ROLES: [MemRole; 9] = [
    MemRole::CodecContext,
    MemRole::BitstreamBuffer,
    MemRole::PicturePool,
    MemRole::MacroblockMaps,
    MemRole::JobQueue,
    MemRole::Scratch(0),
    MemRole::Scratch(1),
    MemRole::Scratch(2),
    MemRole::BackupTable,
];

const_assert_eq!(H264_ROLES.len(), MPEG2_ROLES.len() + 1);
// One scratch record per pipeline thread.
const_assert_eq!(MAX_CORES, 3);
const_assert!(PARAM_SET_CACHE_SIZE as u64 + 64 <= CODEC_CONTEXT_SIZE);
const_assert!(CODEC_CONTEXT_SIZE % RECORD_ALIGNMENT == 0);
const_assert_eq!(BACKUP_ENTRY_SIZE as usize, MemRecord::ENCODED_SIZE);

/// Dimension limits of a codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodecLimits {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Ceiling on `width * height`.
    pub max_frame_area: u32,
}

impl CodecLimits {
    pub fn check(&self, res: Resolution) -> bool {
        res.width >= self.min_width
            && res.height >= self.min_height
            && res.width <= self.max_width
            && res.height <= self.max_height
            && res.width * res.height <= self.max_frame_area
    }
}

pub const H264_LIMITS: CodecLimits = CodecLimits {
    min_width: 16,
    min_height: 16,
    max_width: 1920,
    max_height: 1920,
    max_frame_area: 1920 * 1088,
};

pub const MPEG2_LIMITS: CodecLimits = CodecLimits {
    min_width: 16,
    min_height: 16,
    max_width: 1920,
    max_height: 1088,
    max_frame_area: 1920 * 1088,
};

pub fn limits(codec: Codec) -> &'static CodecLimits {
    match codec {
        Codec::H264 => &H264_LIMITS,
        Codec::Mpeg2 => &MPEG2_LIMITS,
    }
}

/// The fixed, ordered role table of `codec`.
pub fn roles(codec: Codec) -> &'static [MemRole] {
    match codec {
        Codec::H264 => &H264_ROLES,
        Codec::Mpeg2 => &MPEG2_ROLES,
    }
}

pub fn num_mem_records(codec: Codec) -> usize {
    roles(codec).len()
}

/// Computes the memory record table for `config`.
pub fn fill_mem_records(config: &DecoderConfig) -> Result<Vec<MemRecord>> {
    Ok(Requirements::resolve(config)?.records())
}

fn dpb_frames(level: u32) -> u32 {
    H264_DPB_FRAMES
        .iter()
        .rev()
        .find(|(l, _)| *l <= level)
        .map(|(_, frames)| *frames)
        .unwrap_or(H264_DPB_FRAMES[0].1)
}

/// Placement of one plane inside a pool frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the plane from the start of the frame.
    pub offset: u64,
    pub size: u64,
    pub stride: u32,
    pub rows: u32,
    /// Position of the first visible sample inside the padded plane.
    pub origin_x: u32,
    pub origin_y: u32,
    /// The plane's pixels live in a host buffer bound at `set_display_frame`.
    pub host_backed: bool,
}

impl PlaneLayout {
    fn internal(offset: u64, stride: u32, rows: u32, origin_x: u32, origin_y: u32) -> Self {
        PlaneLayout {
            offset,
            size: stride as u64 * rows as u64,
            stride,
            rows,
            origin_x,
            origin_y,
            host_backed: false,
        }
    }

    fn placeholder(offset: u64) -> Self {
        PlaneLayout {
            offset,
            size: PLACEHOLDER_PLANE_SIZE,
            host_backed: true,
            ..Default::default()
        }
    }

    /// Byte offset, relative to the plane start, of the first visible sample.
    pub fn origin(&self) -> usize {
        self.origin_y as usize * self.stride as usize + self.origin_x as usize
    }
}

/// Layout of one frame slot of the picture pool: a planar 4:2:0 luma and two chroma planes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub planes: [PlaneLayout; 3],
    /// Bytes the slot occupies in the pool, a multiple of [`RECORD_ALIGNMENT`].
    pub size: u64,
}

impl FrameLayout {
    fn h264(res: Resolution, format: ColorFormat, shared: bool) -> Self {
        let stride = align_up(align_up(res.width, 16) + 2 * H264_PAD_X, 32);
        let rows = align_up(res.height, 32) + 4 * H264_PAD_Y;
        let luma = if shared {
            PlaneLayout::placeholder(0)
        } else {
            PlaneLayout::internal(0, stride, rows, H264_PAD_X, 2 * H264_PAD_Y)
        };
        let chroma_offset = align_up_u64(luma.size, RECORD_ALIGNMENT);
        let (cb, cr) = if shared && format == ColorFormat::Yuv420P {
            (
                PlaneLayout::placeholder(chroma_offset),
                PlaneLayout::placeholder(chroma_offset + PLACEHOLDER_PLANE_SIZE),
            )
        } else {
            let cb = PlaneLayout::internal(
                chroma_offset,
                stride / 2,
                rows / 2,
                H264_PAD_X / 2,
                H264_PAD_Y,
            );
            let cr = PlaneLayout {
                offset: chroma_offset + cb.size,
                ..cb
            };
            (cb, cr)
        };
        let size = chroma_offset + align_up_u64(cb.size + cr.size, RECORD_ALIGNMENT);
        FrameLayout {
            planes: [luma, cb, cr],
            size,
        }
    }

    fn mpeg2(res: Resolution, format: ColorFormat, shared: bool) -> Self {
        let stride = align_up(res.width, 16);
        let rows = align_up(res.height, 16);
        let luma = if shared {
            PlaneLayout::placeholder(0)
        } else {
            PlaneLayout::internal(0, stride, rows, 0, 0)
        };
        let (cb, cr) = if shared && format == ColorFormat::Yuv420P {
            (
                PlaneLayout::placeholder(luma.size),
                PlaneLayout::placeholder(luma.size + PLACEHOLDER_PLANE_SIZE),
            )
        } else {
            let cb = PlaneLayout::internal(luma.size, stride / 2, rows / 2, 0, 0);
            let cr = PlaneLayout {
                offset: cb.offset + cb.size,
                ..cb
            };
            (cb, cr)
        };
        let size = align_up_u64(cr.offset + cr.size, RECORD_ALIGNMENT);
        FrameLayout {
            planes: [luma, cb, cr],
            size,
        }
    }
}

/// Everything derived from a [`DecoderConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirements {
    pub codec: Codec,
    pub max_resolution: Resolution,
    pub output_format: ColorFormat,
    /// Shared display buffers, after forcing the mode off for formats that cannot use it.
    pub shared: bool,
    pub level: u32,
    pub num_ref_frames: u32,
    pub num_reorder_frames: u32,
    pub num_extra_display_buffers: u32,
    pub pool_capacity: usize,
    /// Number of reference pictures kept by the sliding window.
    pub reference_window: usize,
    /// Pictures held back in the display queue before one is output.
    pub display_depth: usize,
    pub mv_banks: usize,
    pub frame: FrameLayout,
    pub max_unit_size: usize,
    pub min_input_size: usize,
}

impl Requirements {
    /// Validates `config` and computes the decoder's sizing.
    ///
    /// This is a pure function: the same config always yields the same requirements.
    pub fn resolve(config: &DecoderConfig) -> Result<Self> {
        let codec = config.codec;
        let max_resolution = config.max_resolution();
        if !limits(codec).check(max_resolution) {
            return Err(Cause::ResolutionOutOfRange.into());
        }
        let output_format = config.output_format;
        if output_format == ColorFormat::Yuv422Ile && max_resolution.height % 2 != 0 {
            return Err(Cause::ChromaFormatHeight.into());
        }
        let mut shared = config.share_display_buffers;
        if shared && !output_format.is_yuv420() {
            warn!(
                "display buffers cannot be shared in {} output, using copies",
                output_format
            );
            shared = false;
        }
        let extra = if shared {
            config.num_extra_display_buffers.unwrap_or(0)
        } else {
            0
        };
        if extra > MAX_EXTRA_DISPLAY_BUFFERS {
            return Err(Cause::NumRefExceeded.into());
        }

        match codec {
            Codec::H264 => Self::resolve_h264(config, max_resolution, shared, extra),
            Codec::Mpeg2 => Ok(Self::resolve_mpeg2(max_resolution, output_format, shared, extra)),
        }
    }

    fn resolve_h264(
        config: &DecoderConfig,
        max_resolution: Resolution,
        shared: bool,
        extra: u32,
    ) -> Result<Self> {
        let configured = config.level.unwrap_or(H264_DEFAULT_LEVEL);
        if !(H264_MIN_LEVEL..=H264_MAX_LEVEL).contains(&configured) {
            return Err(Cause::LevelUnsupported.into());
        }
        let level = if max_resolution.total_mbs() > H264_LEVEL_31_MBS {
            configured.max(H264_DEFAULT_LEVEL)
        } else {
            configured
        };
        let num_ref_frames = config.num_ref_frames.unwrap_or(H264_MAX_REF_FRAMES);
        let num_reorder_frames = config.num_reorder_frames.unwrap_or(H264_MAX_REORDER_FRAMES);
        if num_ref_frames > H264_MAX_REF_FRAMES || num_reorder_frames > H264_MAX_REORDER_FRAMES {
            return Err(Cause::NumRefExceeded.into());
        }

        // Raising the level never shrinks the DPB below what the configured level allows.
        let dpb = dpb_frames(configured).max(dpb_frames(level));
        let frames = (num_ref_frames + num_reorder_frames + 1).max(2).min(dpb * 2 + 1);
        let pool_capacity = (frames + extra) as usize;
        let reference_window = num_ref_frames.min(dpb).max(1) as usize;
        let display_depth = (num_reorder_frames as usize)
            .min(pool_capacity.saturating_sub(reference_window + 1));
        let max_unit_size = ((max_resolution.height * max_resolution.height) as usize)
            .max(H264_MIN_UNIT_SIZE);

        Ok(Requirements {
            codec: Codec::H264,
            max_resolution,
            output_format: config.output_format,
            shared,
            level,
            num_ref_frames,
            num_reorder_frames,
            num_extra_display_buffers: extra,
            pool_capacity,
            reference_window,
            display_depth,
            mv_banks: reference_window + 1,
            frame: FrameLayout::h264(max_resolution, config.output_format, shared),
            max_unit_size,
            min_input_size: H264_MIN_INPUT_SIZE,
        })
    }

    fn resolve_mpeg2(
        max_resolution: Resolution,
        output_format: ColorFormat,
        shared: bool,
        extra: u32,
    ) -> Self {
        Requirements {
            codec: Codec::Mpeg2,
            max_resolution,
            output_format,
            shared,
            level: 0,
            num_ref_frames: MPEG2_REFERENCE_WINDOW as u32,
            num_reorder_frames: 1,
            num_extra_display_buffers: extra,
            pool_capacity: MPEG2_NUM_FRAMES + extra as usize,
            reference_window: MPEG2_REFERENCE_WINDOW,
            // A reference picture waits for the next one; B pictures go straight out.
            display_depth: 1,
            mv_banks: 0,
            frame: FrameLayout::mpeg2(max_resolution, output_format, shared),
            max_unit_size: MPEG2_MAX_UNIT_SIZE,
            min_input_size: MPEG2_MAX_UNIT_SIZE,
        }
    }

    /// Rows of macroblocks in a maximum-size picture.
    pub fn height_mbs(&self) -> u32 {
        self.max_resolution.height_mbs()
    }

    /// Job records the queue holds: one reconstruct and one deblock job per macroblock row.
    pub fn job_queue_capacity(&self) -> usize {
        2 * self.height_mbs() as usize
    }

    pub fn bitstream_buffer_size(&self) -> u64 {
        align_up_u64(self.max_unit_size as u64 + BITSTREAM_PAD, RECORD_ALIGNMENT)
    }

    pub fn mv_bank_size(&self) -> u64 {
        align_up_u64(
            self.max_resolution.total_mbs() as u64 * MV_BYTES_PER_MB,
            RECORD_ALIGNMENT,
        )
    }

    pub fn scratch_size(&self) -> u64 {
        align_up_u64(
            self.max_resolution.width_mbs() as u64 * MB_SCRATCH_SIZE,
            RECORD_ALIGNMENT,
        )
    }

    /// The `(size, align)` regions INIT carves, in order, out of the block of `role`.
    pub fn carves(&self, role: MemRole) -> Vec<(u64, u64)> {
        match role {
            MemRole::CodecContext => vec![(PARAM_SET_CACHE_SIZE as u64, 1)],
            MemRole::BitstreamBuffer => vec![(self.bitstream_buffer_size(), RECORD_ALIGNMENT)],
            MemRole::PicturePool => vec![(self.frame.size, RECORD_ALIGNMENT); self.pool_capacity],
            MemRole::MotionVectorPool => {
                vec![(self.mv_bank_size(), RECORD_ALIGNMENT); self.mv_banks]
            }
            MemRole::MacroblockMaps => vec![(2 * self.max_resolution.total_mbs() as u64, 1)],
            MemRole::JobQueue => vec![(
                JOB_QUEUE_HEADER_SIZE + self.job_queue_capacity() as u64 * JOB_RECORD_SIZE,
                RECORD_ALIGNMENT,
            )],
            MemRole::Scratch(_) => vec![(self.scratch_size(), RECORD_ALIGNMENT)],
            MemRole::BackupTable => vec![(
                num_mem_records(self.codec) as u64 * BACKUP_ENTRY_SIZE,
                1,
            )],
        }
    }

    fn size_of(&self, role: MemRole) -> u64 {
        let carved = align_up_u64(Arena::required_size(&self.carves(role)), RECORD_ALIGNMENT);
        match role {
            // The rest of the context is reserved.
            MemRole::CodecContext => carved.max(CODEC_CONTEXT_SIZE),
            _ => carved,
        }
    }

    fn class_of(role: MemRole) -> MemClass {
        match role {
            MemRole::Scratch(_) => MemClass::EXTERNAL_CACHEABLE_SCRATCH,
            _ => MemClass::EXTERNAL_CACHEABLE_PERSISTENT,
        }
    }

    /// The ordered memory record table.
    pub fn records(&self) -> Vec<MemRecord> {
        roles(self.codec)
            .iter()
            .map(|&role| MemRecord {
                role,
                size: self.size_of(role),
                alignment: RECORD_ALIGNMENT,
                class: Self::class_of(role),
            })
            .collect()
    }
}
