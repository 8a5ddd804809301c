// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder instance and its command surface.
//!
//! A [`Decoder`] starts out un-initialized. The host asks for the memory record table with
//! [`Decoder::fill_mem_records`], backs every record with a block and hands the blocks to
//! [`Decoder::init`], which validates them and carves the decoder's state out of them. From then
//! on [`Decoder::decode`] drains bitstream units from each input buffer, one picture at a time.

use std::mem;
use std::ops::Range;
use std::sync::Arc;

use base::debug;
use base::error;
use base::info;
use base::warn;
use bitflags::bitflags;
use bytes::BufMut;
use bytes::BytesMut;

use crate::arena::Arena;
use crate::arena::Region;
use crate::backend::MbState;
use crate::backend::PictureType;
use crate::backend::RowKernels;
use crate::backend::SequenceHeader;
use crate::backend::SliceHeader;
use crate::backend::Unit;
use crate::backend::UnitParser;
use crate::bitstream::next_unit;
use crate::bitstream::unescape;
use crate::bitstream::UnitSpan;
use crate::config::Codec;
use crate::config::DecoderConfig;
use crate::display::Conversion;
use crate::display::ConversionKind;
use crate::error::Cause;
use crate::error::Error;
use crate::error::Result;
use crate::format::align_up;
use crate::format::ColorFormat;
use crate::format::PlaneExtent;
use crate::format::Resolution;
use crate::format::MB_SIZE;
use crate::mem_record::validate_blocks;
use crate::mem_record::MemBlock;
use crate::mem_record::MemRecord;
use crate::mem_record::MemRole;
use crate::negotiate;
use crate::negotiate::Requirements;
use crate::negotiate::MAX_CORES;
use crate::negotiate::MV_BYTES_PER_MB;
use crate::negotiate::NUM_FRAMES_LIMIT;
use crate::pipeline::MbMaps;
use crate::pipeline::PictureContext;
use crate::pipeline::Pipeline;
use crate::pool::DisplayBuffer;
use crate::pool::Frame;
use crate::pool::Holders;
use crate::pool::MotionVectorBanks;
use crate::pool::PictureInfo;
use crate::pool::PicturePool;
use crate::pool::Plane;

const VENDOR: &str = "The ChromiumOS Authors";
/// Sample value of the first picture before anything is reconstructed into it.
const GREY: u8 = 128;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Only parse sequence headers and report the stream dimensions.
    Header,
    #[default]
    Frame,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputOrder {
    /// Hold pictures back until they can be output in presentation order.
    #[default]
    Display,
    /// Output every picture as soon as it is decoded.
    Decode,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameSkip {
    #[default]
    None,
    /// Drop B pictures that are not used for reference.
    NonReferenceB,
}

/// Per-stream decode parameters set with [`Decoder::set_params`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeParams {
    pub decode_mode: DecodeMode,
    pub output_order: OutputOrder,
    pub frame_skip: FrameSkip,
    /// Output luma stride in samples; 0 uses the frame width.
    pub display_width: u32,
}

bitflags! {
    /// Quality trade-offs the host allows.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Degrade: u32 {
        const SKIP_DEBLOCK = 1 << 0;
    }
}

/// Pictures a [`Degrade`] setting applies to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DegradePictures {
    #[default]
    None,
    NonReference,
    All,
}

/// One decode call's input.
pub struct DecodeInput<'a> {
    pub bitstream: &'a [u8],
    pub timestamp: u64,
    /// Host output planes. Required unless display buffers are shared or only headers are
    /// decoded. In decode-order output a picture spanning several calls is converted
    /// progressively, so the same buffers must be passed until it is output.
    pub output: Vec<&'a mut [u8]>,
}

impl<'a> DecodeInput<'a> {
    pub fn new(bitstream: &'a [u8]) -> Self {
        DecodeInput {
            bitstream,
            timestamp: 0,
            output: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_output(mut self, output: Vec<&'a mut [u8]>) -> Self {
        self.output = output;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeOutput {
    /// Never more than the input length. Always 0 when the call fails for lack of data.
    pub bytes_consumed: usize,
    pub output_present: bool,
    /// Pool slot of the output picture, for `release_display_frame` in shared mode.
    pub buffer_id: Option<usize>,
    pub picture_type: Option<PictureType>,
    pub timestamp: u64,
    /// Dimensions of the active sequence.
    pub resolution: Option<Resolution>,
    /// The last error the call ran into, even if it recovered.
    pub error: Option<Error>,
    pub failed: bool,
}

impl DecodeOutput {
    pub fn is_success(&self) -> bool {
        !self.failed
    }

    fn note(&mut self, err: Error) {
        if !self.error.map_or(false, |e| e.is_fatal()) {
            self.error = Some(err);
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub num_input_buffers: usize,
    pub min_input_size: usize,
    pub num_output_buffers: usize,
    pub min_output_sizes: [u32; 3],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub buffer_info: BufferInfo,
    pub max_resolution: Resolution,
    pub resolution: Option<Resolution>,
    pub output_format: ColorFormat,
    pub num_cores: usize,
    pub frames_decoded: u32,
    pub last_error: Option<Error>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneDimensions {
    pub display: PlaneExtent,
    pub buffer: PlaneExtent,
    pub x_offset: u32,
    pub y_offset: u32,
}

/// Why the unit loop of a decode call stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stop {
    EndOfInput,
    /// The last unit is still incomplete.
    Truncated,
    PictureDone,
    HeaderDone,
    /// Stopped on a recoverable error; the call fails only if nothing was consumed.
    Halt,
    /// The call fails regardless of progress.
    Fail,
}

enum Flow {
    Consumed,
    ConsumedThen(Stop),
    Stop(Stop),
}

/// The picture being decoded.
#[derive(Copy, Clone, Debug)]
struct InFlight {
    slot: usize,
    header: SliceHeader,
    resolution: Resolution,
    timestamp: u64,
    /// Macroblocks accounted for, decoded or concealed.
    next_mb: u32,
    mv_bank: Option<usize>,
    reference_bank: Option<usize>,
}

/// State carved at INIT.
struct Session {
    req: Requirements,
    param_cache: BytesMut,
    backup: BytesMut,
    bitstream: BytesMut,
    pool: PicturePool,
    mv: Option<MotionVectorBanks>,
    maps: MbMaps,
    pipeline: Pipeline,
    params: DecodeParams,
    degrade: Degrade,
    degrade_pictures: DegradePictures,
    active: Option<Resolution>,
    picture: Option<InFlight>,
    /// Conversion of a decode-order picture started before it finished.
    live: Option<(usize, Conversion)>,
    flushing: bool,
    /// Re-initialize stream state once the flush completes.
    pending_reinit: bool,
    first_picture: bool,
    epoch: u32,
    decode_order: u64,
    frames_decoded: u32,
    last_error: Option<Error>,
}

fn missing(role: MemRole) -> Error {
    error!("no {} record was carved", role);
    Cause::MemRecNotSufficient.into()
}

fn compose_frame(internal: &Frame, host: &DisplayBuffer, format: ColorFormat, stride: u32) -> Frame {
    let host_plane = |index: usize, stride: u32| Plane {
        data: host.planes[index].clone(),
        stride: stride as usize,
        origin: 0,
    };
    let chroma = if format == ColorFormat::Yuv420P {
        let chroma_stride = format.chroma_stride(stride);
        [host_plane(1, chroma_stride), host_plane(2, chroma_stride)]
    } else {
        // Semi-planar chroma is decoded planar and interleaved at output.
        [internal.planes[1].clone(), internal.planes[2].clone()]
    };
    let [cb, cr] = chroma;
    Frame {
        planes: [host_plane(0, stride), cb, cr],
    }
}

impl Session {
    fn new(req: Requirements, blocks: Vec<MemBlock>, kernels: Arc<dyn RowKernels>) -> Result<Self> {
        let records = req.records();
        let mut param_cache = None;
        let mut backup = None;
        let mut bitstream = None;
        let mut frames = None;
        let mut mv = None;
        let mut maps = None;
        let mut jobs = None;
        let mut scratch = Vec::new();
        let total_mbs = req.max_resolution.total_mbs() as u64;

        for (block, record) in blocks.into_iter().zip(&records) {
            let mut arena = Arena::new(block);
            let mut regions = req
                .carves(record.role)
                .into_iter()
                .map(|(size, align)| arena.carve(size, align))
                .collect::<Result<Vec<_>>>()?
                .into_iter();
            let mut next = || regions.next().ok_or_else(|| missing(record.role));
            match record.role {
                MemRole::CodecContext => param_cache = Some(next()?.bytes),
                MemRole::BitstreamBuffer => bitstream = Some(next()?.bytes),
                MemRole::PicturePool => {
                    frames = Some(
                        regions
                            .map(|r| Frame::from_region(r, &req.frame))
                            .collect::<Vec<_>>(),
                    );
                }
                MemRole::MotionVectorPool => {
                    mv = Some(MotionVectorBanks::new(
                        regions.collect(),
                        MV_BYTES_PER_MB as usize,
                    ));
                }
                MemRole::MacroblockMaps => maps = Some(MbMaps::new(next()?, total_mbs as usize)),
                MemRole::JobQueue => jobs = Some(next()?),
                MemRole::Scratch(_) => scratch.push(next()?),
                MemRole::BackupTable => {
                    let mut table = next()?.bytes;
                    for (entry, record) in table
                        .chunks_exact_mut(MemRecord::ENCODED_SIZE)
                        .zip(&records)
                    {
                        record.encode(entry);
                    }
                    backup = Some(table);
                }
            }
        }

        let frames = frames.ok_or_else(|| missing(MemRole::PicturePool))?;
        let jobs: Region = jobs.ok_or_else(|| missing(MemRole::JobQueue))?;
        let pipeline = Pipeline::new(kernels, jobs, scratch, 1)?;
        Ok(Session {
            param_cache: param_cache.ok_or_else(|| missing(MemRole::CodecContext))?,
            backup: backup.ok_or_else(|| missing(MemRole::BackupTable))?,
            bitstream: bitstream.ok_or_else(|| missing(MemRole::BitstreamBuffer))?,
            pool: PicturePool::new(frames, req.reference_window, req.shared),
            mv,
            maps: maps.ok_or_else(|| missing(MemRole::MacroblockMaps))?,
            pipeline,
            params: Default::default(),
            degrade: Degrade::empty(),
            degrade_pictures: DegradePictures::None,
            active: None,
            picture: None,
            live: None,
            flushing: false,
            pending_reinit: false,
            first_picture: true,
            epoch: 0,
            decode_order: 0,
            frames_decoded: 0,
            last_error: None,
            req,
        })
    }

    fn frame_resolution(&self) -> Resolution {
        self.active.unwrap_or(self.req.max_resolution)
    }

    fn shared_stride(&self) -> u32 {
        align_up(self.req.max_resolution.width, MB_SIZE)
    }

    fn output_stride(&self) -> u32 {
        if self.req.shared {
            self.shared_stride()
        } else if self.params.display_width != 0 {
            self.params.display_width
        } else {
            self.frame_resolution().width
        }
    }

    fn min_output_sizes(&self) -> [u32; 3] {
        let height = if self.req.shared {
            self.req.max_resolution.height
        } else {
            self.frame_resolution().height
        };
        self.req
            .output_format
            .min_plane_sizes(self.output_stride(), align_up(height, MB_SIZE))
    }

    fn buffer_info(&self) -> BufferInfo {
        BufferInfo {
            num_input_buffers: 1,
            min_input_size: self.req.min_input_size,
            num_output_buffers: self.req.output_format.num_planes(),
            min_output_sizes: self.min_output_sizes(),
        }
    }

    fn check_output_buffers(&self, output: &[&mut [u8]]) -> Result<()> {
        if output.is_empty() {
            return Err(Cause::ZeroOutputBuffers.into());
        }
        let num_planes = self.req.output_format.num_planes();
        let sizes = self.min_output_sizes();
        if output.len() < num_planes
            || output
                .iter()
                .zip(&sizes[..num_planes])
                .any(|(buf, &min)| (buf.len() as u64) < min as u64)
        {
            return Err(Cause::OutputBufferTooSmall.into());
        }
        Ok(())
    }

    fn skips_deblock(&self, is_reference: bool) -> bool {
        self.degrade.contains(Degrade::SKIP_DEBLOCK)
            && match self.degrade_pictures {
                DegradePictures::None => false,
                DegradePictures::NonReference => !is_reference,
                DegradePictures::All => true,
            }
    }

    fn param_set_matches(&self, payload: &[u8]) -> bool {
        let len = u16::from_le_bytes([self.param_cache[0], self.param_cache[1]]) as usize;
        len == payload.len() && &self.param_cache[2..2 + len] == payload
    }

    fn cache_param_set(&mut self, payload: &[u8]) {
        let len = if payload.len() + 2 <= self.param_cache.len() {
            payload.len()
        } else {
            0
        };
        let mut cache = &mut self.param_cache[..];
        cache.put_u16_le(len as u16);
        cache.put_slice(&payload[..len]);
    }

    fn decode(
        &mut self,
        parser: &mut dyn UnitParser,
        mut input: DecodeInput,
    ) -> Result<DecodeOutput> {
        let header_only = self.params.decode_mode == DecodeMode::Header;
        if !self.flushing && input.bitstream.is_empty() {
            return Err(Cause::NumBytesInvalid.into());
        }
        if !header_only && !self.req.shared {
            self.check_output_buffers(&input.output)?;
        }
        if self.frames_decoded >= NUM_FRAMES_LIMIT {
            error!("{} frames decoded, limit reached", self.frames_decoded);
            return Err(Cause::FrameLimitExceeded.into());
        }
        if self.flushing {
            return self.flush_step(parser, &mut input.output);
        }
        if self.req.shared && !header_only && self.picture.is_none() && !self.pool.can_take_slot()
        {
            return Err(Cause::ReferenceBufferUnavailable.into());
        }

        let mut out = self.decode_units(parser, &mut input);
        if !out.failed && !header_only {
            if let Err(e) = self.emit(&mut input.output, false, &mut out) {
                out.note(e);
                out.failed = true;
            }
        }
        if out.error.is_some() {
            self.last_error = out.error;
        }
        Ok(out)
    }

    fn decode_units(&mut self, parser: &mut dyn UnitParser, input: &mut DecodeInput) -> DecodeOutput {
        let data = input.bitstream;
        let mut out = DecodeOutput::default();
        let mut pos = 0;
        let mut found = false;
        let mut stop = Stop::EndOfInput;

        while let Some(span) = next_unit(data, pos) {
            found = true;
            if span.size > self.req.max_unit_size {
                warn!(
                    "discarding {} byte unit, the limit is {}",
                    span.size, self.req.max_unit_size
                );
                self.abort_picture();
                out.note(Cause::UnitTooLarge.into());
                pos = span.end();
                stop = Stop::Fail;
                break;
            }
            let mut staging = mem::take(&mut self.bitstream);
            let flow = self.decode_unit(parser, input, data, &span, &mut staging, &mut out);
            self.bitstream = staging;
            match flow {
                Flow::Consumed => pos = span.end(),
                Flow::ConsumedThen(s) => {
                    pos = span.end();
                    stop = s;
                    break;
                }
                Flow::Stop(s) => {
                    stop = s;
                    break;
                }
            }
        }

        let mut picture_done = stop == Stop::PictureDone;
        if !found {
            debug!("no start code in {} bytes", data.len());
            out.note(Cause::StartCodeNotFound.into());
        } else if stop == Stop::EndOfInput && self.picture.is_some() {
            // Whatever did not arrive by the end of the input is concealed.
            match self.finish_picture(&mut out) {
                Ok(()) => picture_done = true,
                Err(e) => {
                    out.note(e);
                    stop = Stop::Fail;
                }
            }
        }

        out.bytes_consumed = pos;
        out.resolution = self.active;
        let progressed = pos > 0 || picture_done;
        out.failed = stop == Stop::Fail || (out.error.is_some() && !progressed);
        out
    }

    fn decode_unit(
        &mut self,
        parser: &mut dyn UnitParser,
        input: &mut DecodeInput,
        data: &[u8],
        span: &UnitSpan,
        staging: &mut BytesMut,
        out: &mut DecodeOutput,
    ) -> Flow {
        if span.size == 0 && !span.terminated {
            out.note(Cause::BitstreamEnd.into());
            return Flow::Stop(Stop::Truncated);
        }
        let len = match unescape(span.payload(data), staging) {
            Some(len) => len,
            None => {
                out.note(Cause::UnitTooLarge.into());
                return Flow::ConsumedThen(Stop::Fail);
            }
        };
        let payload = &staging[..len];
        let unit = match parser.parse_unit(payload) {
            Ok(unit) => unit,
            Err(e) if e.cause() == Cause::BitstreamEnd && !span.terminated => {
                debug!("unit at offset {} is incomplete", span.sc_offset);
                out.note(e);
                return Flow::Stop(Stop::Truncated);
            }
            Err(e) => {
                warn!("dropping unit at offset {}: {}", span.sc_offset, e);
                out.note(e);
                return Flow::Consumed;
            }
        };
        match unit {
            Unit::Filler => Flow::Consumed,
            Unit::Sequence(seq) => self.on_sequence(seq, payload, out),
            Unit::Slice(slice) => self.on_slice(parser, &slice, payload, input, out),
        }
    }

    /// Handles a sequence header.
    ///
    /// A new resolution within the negotiated maximum finishes the picture in flight, then drains
    /// and reinitializes the stream. A header that only changes the parameter set at the current
    /// resolution is re-cached without a resync, and decoding continues with the held references.
    /// A resolution beyond the negotiated maximum is fatal.
    fn on_sequence(&mut self, seq: SequenceHeader, payload: &[u8], out: &mut DecodeOutput) -> Flow {
        let res = seq.resolution;
        let header_done = if self.params.decode_mode == DecodeMode::Header {
            Flow::ConsumedThen(Stop::HeaderDone)
        } else {
            Flow::Consumed
        };
        if !negotiate::limits(self.req.codec).check(res) {
            warn!("ignoring sequence header with unsupported dimensions {}", res);
            out.note(Cause::StreamDimensionsUnsupported.into());
            return Flow::Consumed;
        }
        if !self.req.max_resolution.can_contain(res) {
            error!(
                "stream is {} but memory was negotiated for {}",
                res, self.req.max_resolution
            );
            self.abort_picture();
            out.note(Cause::ActualResolutionGreaterThanInit.into());
            return Flow::Stop(Stop::Fail);
        }
        match self.active {
            None => {
                info!("stream resolution {}", res);
                self.active = Some(res);
                self.cache_param_set(payload);
                header_done
            }
            Some(active) if active == res => {
                if !self.param_set_matches(payload) {
                    debug!("sequence header updated");
                    self.cache_param_set(payload);
                }
                header_done
            }
            Some(active) => {
                if self.picture.is_some() {
                    return match self.finish_picture(out) {
                        Ok(()) => Flow::Stop(Stop::PictureDone),
                        Err(e) => {
                            out.note(e);
                            Flow::Stop(Stop::Fail)
                        }
                    };
                }
                info!("resolution changed from {} to {}, draining", active, res);
                self.pool.release_references();
                self.flushing = true;
                self.pending_reinit = true;
                out.note(Cause::ResolutionChanged.into());
                Flow::Stop(Stop::Fail)
            }
        }
    }

    fn on_slice(
        &mut self,
        parser: &mut dyn UnitParser,
        slice: &SliceHeader,
        payload: &[u8],
        input: &mut DecodeInput,
        out: &mut DecodeOutput,
    ) -> Flow {
        if self.params.decode_mode == DecodeMode::Header {
            return Flow::Consumed;
        }
        let res = match self.active {
            Some(res) => res,
            None => {
                warn!("slice before any sequence header");
                out.note(Cause::InvalidParamSet.into());
                return Flow::Consumed;
            }
        };
        if let Some(picture) = &self.picture {
            if slice.starts_new_picture(&picture.header) {
                return match self.finish_picture(out) {
                    Ok(()) => Flow::Stop(Stop::PictureDone),
                    Err(e) => {
                        out.note(e);
                        Flow::Stop(Stop::Fail)
                    }
                };
            }
        }
        if self.picture.is_none() {
            if self.params.frame_skip == FrameSkip::NonReferenceB
                && slice.picture_type == PictureType::B
                && !slice.is_reference
            {
                debug!("skipping non-reference B picture {}", slice.poc);
                out.note(Cause::FrameSkipped.into());
                return Flow::Consumed;
            }
            if let Err(e) = self.start_picture(slice, res, input.timestamp) {
                warn!("cannot start picture: {}", e);
                out.note(e);
                return Flow::Stop(if e.is_fatal() { Stop::Fail } else { Stop::Halt });
            }
        }

        let complete = match self.add_slice(parser, slice, payload, out) {
            Ok(complete) => complete,
            Err(e) => {
                self.abort_picture();
                out.note(e);
                return Flow::Stop(Stop::Fail);
            }
        };
        if complete {
            return match self.finish_picture(out) {
                Ok(()) => Flow::ConsumedThen(Stop::PictureDone),
                Err(e) => {
                    out.note(e);
                    Flow::ConsumedThen(Stop::Fail)
                }
            };
        }
        self.convert_live(&mut input.output);
        Flow::Consumed
    }

    fn start_picture(&mut self, slice: &SliceHeader, res: Resolution, timestamp: u64) -> Result<()> {
        if slice.idr {
            self.pool.release_references();
            if self.decode_order > 0 {
                self.epoch += 1;
            }
        }
        let latest = self.pool.latest_reference();
        let slot = self.pool.take_slot()?;
        let reference = latest.filter(|&r| r != slot);

        let mv_bank = match self.mv.as_mut() {
            Some(mv) => {
                let pool = &self.pool;
                let live = |s: usize| {
                    pool.holders(s)
                        .map_or(false, |h| h.contains(Holders::REFERENCE))
                };
                match mv.assign(slot, live) {
                    Ok(bank) => Some(bank),
                    Err(e) => {
                        self.pool.release(slot, Holders::IO)?;
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        let reference_bank = match (reference, &self.mv) {
            (Some(r), Some(mv)) => mv.bank_of(r),
            _ => None,
        };

        let frame = self.pool.frame(slot)?;
        if self.first_picture {
            frame.fill(GREY);
            self.first_picture = false;
        }
        let reference_frame = reference.map(|r| self.pool.frame(r)).transpose()?;
        self.maps.clear(res.total_mbs() as usize);
        let ctx = PictureContext {
            frame,
            reference: reference_frame,
            resolution: res,
            maps: self.maps.clone(),
            deblock: !self.skips_deblock(slice.is_reference),
        };
        if let Err(e) = self.pipeline.begin_picture(ctx) {
            self.pool.release(slot, Holders::IO)?;
            return Err(e);
        }
        debug!(
            "picture {} ({:?}, poc {}) decoding into slot {}",
            self.decode_order, slice.picture_type, slice.poc, slot
        );
        self.picture = Some(InFlight {
            slot,
            header: *slice,
            resolution: res,
            timestamp,
            next_mb: 0,
            mv_bank,
            reference_bank,
        });
        Ok(())
    }

    /// Marks `mbs` concealed, carrying over motion vectors from the reference picture.
    fn conceal(&mut self, mbs: Range<u32>, mv_bank: Option<usize>, reference_bank: Option<usize>) {
        for mb in mbs {
            self.maps.set(mb as usize, MbState::Concealed, 0);
            if let (Some(mv), Some(bank)) = (self.mv.as_mut(), mv_bank) {
                match reference_bank {
                    Some(reference) => mv.copy_entry(reference, bank, mb as usize),
                    None => mv.entry_mut(bank, mb as usize).fill(0),
                }
            }
        }
    }

    /// Decodes the slice's macroblocks into the picture. Returns whether the picture is complete.
    fn add_slice(
        &mut self,
        parser: &mut dyn UnitParser,
        slice: &SliceHeader,
        payload: &[u8],
        out: &mut DecodeOutput,
    ) -> Result<bool> {
        let picture = match self.picture {
            Some(picture) => picture,
            None => return Ok(false),
        };
        let total = picture.resolution.total_mbs();
        let first = slice.first_mb;
        if first < picture.next_mb || first >= total {
            warn!(
                "slice at macroblock {} overlaps decoded data or lies outside the picture",
                first
            );
            out.note(Cause::CorruptedSlice.into());
            return Ok(false);
        }
        if first > picture.next_mb {
            warn!(
                "macroblocks {}..{} are missing, concealing",
                picture.next_mb, first
            );
            self.conceal(picture.next_mb..first, picture.mv_bank, picture.reference_bank);
            out.note(Error::new(Cause::CorruptedSlice).concealed());
        }
        let num = slice.num_mbs.min(total - first);
        if num < slice.num_mbs {
            warn!("slice runs {} macroblocks past the picture", slice.num_mbs - num);
            out.note(Cause::CorruptedSlice.into());
        }

        let mut values = vec![0u8; num as usize];
        let data = parser.decode_macroblocks(slice, payload, &mut values);
        let decoded = data.decoded.min(num);
        self.maps
            .set_decoded(first as usize, &values[..decoded as usize]);
        if let (Some(mv), Some(bank)) = (self.mv.as_mut(), picture.mv_bank) {
            for (i, &value) in values[..decoded as usize].iter().enumerate() {
                mv.entry_mut(bank, first as usize + i)[0] = value;
            }
        }
        if decoded < num {
            warn!(
                "slice at macroblock {} decoded {} of {} macroblocks",
                first, decoded, num
            );
            self.conceal(
                first + decoded..first + num,
                picture.mv_bank,
                picture.reference_bank,
            );
            let err = data.error.unwrap_or_else(|| Cause::CorruptedSlice.into());
            out.note(err.concealed());
        } else if let Some(e) = data.error {
            out.note(e);
        }

        let next_mb = first + num;
        if let Some(p) = self.picture.as_mut() {
            p.next_mb = next_mb;
        }
        self.pipeline
            .dispatch_rows(next_mb / picture.resolution.width_mbs())?;
        Ok(next_mb == total)
    }

    fn finish_picture(&mut self, out: &mut DecodeOutput) -> Result<()> {
        let picture = match self.picture.take() {
            Some(picture) => picture,
            None => return Ok(()),
        };
        let total = picture.resolution.total_mbs();
        if picture.next_mb < total {
            warn!(
                "picture {} is missing {} macroblocks, concealing",
                self.decode_order,
                total - picture.next_mb
            );
            self.conceal(picture.next_mb..total, picture.mv_bank, picture.reference_bank);
            out.note(Error::new(Cause::IncompleteFrame).concealed());
        }
        let slot = picture.slot;
        let finished = self.pipeline.finish_picture();
        self.pool.release(slot, Holders::IO)?;
        finished?;

        let header = picture.header;
        if header.is_reference {
            self.pool.mark_reference(slot)?;
        }
        self.pool.set_info(
            slot,
            PictureInfo {
                picture_type: header.picture_type,
                is_reference: header.is_reference,
                poc: header.poc,
                epoch: self.epoch,
                decode_order: self.decode_order,
                timestamp: picture.timestamp,
                resolution: picture.resolution,
            },
        )?;
        self.pool.queue_display(slot)?;
        debug!(
            "picture {} done in slot {}, {} queued for display",
            self.decode_order,
            slot,
            self.pool.queued_len()
        );
        self.decode_order += 1;
        self.frames_decoded += 1;
        Ok(())
    }

    fn abort_picture(&mut self) {
        if let Some(picture) = self.picture.take() {
            warn!("abandoning picture in slot {}", picture.slot);
            self.pipeline.abort_picture();
            if let Err(e) = self.pool.release(picture.slot, Holders::IO) {
                error!("failed to release aborted picture: {}", e);
            }
        }
        self.live = None;
    }

    /// Converts the rows of a decode-order picture whose deblocking is final.
    fn convert_live(&mut self, output: &mut [&mut [u8]]) {
        if self.req.shared || self.params.output_order != OutputOrder::Decode {
            return;
        }
        let picture = match self.picture {
            Some(picture) => picture,
            None => return,
        };
        // Deblocking row n changes the last line of row n - 1.
        let rows = self.pipeline.rows_deblocked();
        if rows < 2 {
            return;
        }
        let frame = match self.pool.frame(picture.slot) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let stride = self.output_stride();
        let format = self.req.output_format;
        if !matches!(&self.live, Some((slot, _)) if *slot == picture.slot) {
            let conversion =
                Conversion::new(ConversionKind::Copy, format, picture.resolution, stride);
            self.live = Some((picture.slot, conversion));
        }
        if let Some((_, conversion)) = self.live.as_mut() {
            conversion.run(&frame, output, (rows - 1) * MB_SIZE);
        }
    }

    /// Outputs the next picture in presentation order once more than the display depth is
    /// queued, or unconditionally when `force` is set.
    fn emit(
        &mut self,
        output: &mut [&mut [u8]],
        force: bool,
        out: &mut DecodeOutput,
    ) -> Result<()> {
        let depth = match self.params.output_order {
            OutputOrder::Display => self.req.display_depth,
            OutputOrder::Decode => 0,
        };
        if !force && self.pool.queued_len() <= depth {
            return Ok(());
        }
        let id = match self.pool.pop_display() {
            Some(id) => id,
            None => return Ok(()),
        };
        let info = self.pool.info(id)?;
        let frame = self.pool.frame(id)?;
        let format = self.req.output_format;
        let stride = self.output_stride();

        if self.req.shared {
            if !matches!(format, ColorFormat::Yuv420P) {
                if let Some(host) = self.pool.host_buffer(id)? {
                    let mut chroma = host.planes[1].lock();
                    let mut luma: [u8; 0] = [];
                    let mut dst = [&mut luma[..], &mut chroma[..]];
                    Conversion::new(
                        ConversionKind::InterleaveChroma,
                        format,
                        info.resolution,
                        stride,
                    )
                    .finish(&frame, &mut dst);
                }
            }
        } else {
            let mut conversion = match self.live.take() {
                Some((slot, conversion)) if slot == id => conversion,
                _ => Conversion::new(ConversionKind::Copy, format, info.resolution, stride),
            };
            conversion.finish(&frame, output);
            self.pool.release(id, Holders::DISPLAY)?;
        }
        debug!("output slot {} (poc {})", id, info.poc);
        out.output_present = true;
        out.buffer_id = Some(id);
        out.picture_type = Some(info.picture_type);
        out.timestamp = info.timestamp;
        Ok(())
    }

    fn flush_step(
        &mut self,
        parser: &mut dyn UnitParser,
        output: &mut [&mut [u8]],
    ) -> Result<DecodeOutput> {
        let mut out = DecodeOutput::default();
        self.emit(output, true, &mut out)?;
        if !out.output_present {
            debug!("flush complete");
            self.flushing = false;
            if self.pending_reinit {
                self.reinit_stream(parser);
            }
        }
        out.resolution = self.active;
        Ok(out)
    }

    fn flush(&mut self) {
        let mut out = DecodeOutput::default();
        if let Err(e) = self.finish_picture(&mut out) {
            error!("failed to drain picture before flush: {}", e);
            out.note(e);
        }
        if out.error.is_some() {
            self.last_error = out.error;
        }
        self.pool.release_references();
        self.flushing = true;
    }

    /// Forgets the stream so the next sequence header starts afresh.
    fn reinit_stream(&mut self, parser: &mut dyn UnitParser) {
        info!("re-initializing stream state");
        self.active = None;
        self.cache_param_set(&[]);
        self.pending_reinit = false;
        self.first_picture = true;
        self.epoch = 0;
        if let Some(mv) = self.mv.as_mut() {
            mv.release_all();
        }
        parser.reset();
    }

    fn reset(&mut self, parser: &mut dyn UnitParser) {
        self.abort_picture();
        self.pool.release_decoder_holders();
        self.reinit_stream(parser);
        self.params = Default::default();
        self.flushing = false;
        self.decode_order = 0;
        self.frames_decoded = 0;
        self.last_error = None;
        info!("decoder reset");
    }
}

/// A video decoder instance.
pub struct Decoder {
    parser: Box<dyn UnitParser>,
    kernels: Arc<dyn RowKernels>,
    session: Option<Session>,
}

impl Decoder {
    /// Creates an un-initialized decoder over a codec's parser and pixel kernels.
    pub fn new(parser: Box<dyn UnitParser>, kernels: Arc<dyn RowKernels>) -> Self {
        Decoder {
            parser,
            kernels,
            session: None,
        }
    }

    pub fn num_mem_records(codec: Codec) -> usize {
        negotiate::num_mem_records(codec)
    }

    pub fn fill_mem_records(config: &DecoderConfig) -> Result<Vec<MemRecord>> {
        negotiate::fill_mem_records(config)
    }

    /// Validates `blocks` against the records `config` requires and builds the decoder state in
    /// them. On failure the decoder is left un-initialized and `init` may be retried.
    pub fn init(&mut self, config: &DecoderConfig, blocks: Vec<MemBlock>) -> Result<()> {
        let req = Requirements::resolve(config)?;
        validate_blocks(&req.records(), &blocks)?;
        // Tear down the previous instance, joining its workers, before building the new one.
        self.session = None;
        let session = Session::new(req, blocks, self.kernels.clone())?;
        info!(
            "{} decoder initialized for {} {}, {} picture buffers{}",
            session.req.codec,
            session.req.max_resolution,
            session.req.output_format,
            session.req.pool_capacity,
            if session.req.shared { ", shared" } else { "" }
        );
        self.parser.reset();
        self.session = Some(session);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(|| Cause::InitNotDone.into())
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or_else(|| Cause::InitNotDone.into())
    }

    /// The record table INIT accepted, read back from the backup table.
    pub fn mem_records(&self) -> Result<Vec<MemRecord>> {
        self.session()?
            .backup
            .chunks_exact(MemRecord::ENCODED_SIZE)
            .map(MemRecord::decode)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                error!("memory record backup table is corrupted");
                Cause::BufferManager.into()
            })
    }

    /// Decodes units from `input` until a picture completes or the input runs out.
    ///
    /// `Err` is returned only when the input is rejected outright; decoder state is untouched in
    /// that case. Stream errors are reported in [`DecodeOutput::error`].
    pub fn decode(&mut self, input: DecodeInput) -> Result<DecodeOutput> {
        let Decoder {
            parser, session, ..
        } = self;
        let session = session.as_mut().ok_or(Cause::InitNotDone)?;
        session.decode(parser.as_mut(), input)
    }

    pub fn set_params(&mut self, params: DecodeParams) -> Result<()> {
        let session = self.session_mut()?;
        let width = session.frame_resolution().width;
        if params.display_width != 0 && params.display_width < width {
            return Err(Cause::DisplayWidthTooSmall.into());
        }
        session.params = params;
        Ok(())
    }

    pub fn params(&self) -> Result<DecodeParams> {
        Ok(self.session()?.params)
    }

    pub fn get_status(&self) -> Result<Status> {
        let session = self.session()?;
        Ok(Status {
            buffer_info: session.buffer_info(),
            max_resolution: session.req.max_resolution,
            resolution: session.active,
            output_format: session.req.output_format,
            num_cores: session.pipeline.num_cores(),
            frames_decoded: session.frames_decoded,
            last_error: session.last_error,
        })
    }

    pub fn get_buffer_info(&self) -> Result<BufferInfo> {
        Ok(self.session()?.buffer_info())
    }

    /// Enters flush mode: the picture in flight is finished and every following `decode` call
    /// outputs one held picture, until one reports `output_present == false`.
    pub fn flush(&mut self) -> Result<()> {
        self.session_mut()?.flush();
        Ok(())
    }

    /// Drops every picture the decoder holds and forgets the stream. Memory records, display
    /// buffer bindings and worker threads survive.
    pub fn reset(&mut self) -> Result<()> {
        let Decoder {
            parser, session, ..
        } = self;
        session
            .as_mut()
            .ok_or(Cause::InitNotDone)?
            .reset(parser.as_mut());
        Ok(())
    }

    /// Sets the number of threads decoding, the calling thread included. 0 means 1.
    pub fn set_num_cores(&mut self, num_cores: usize) -> Result<()> {
        if num_cores > MAX_CORES {
            return Err(Cause::NumCoresInvalid.into());
        }
        self.session_mut()?
            .pipeline
            .set_num_cores(num_cores.max(1))
    }

    pub fn get_frame_dimensions(&self) -> Result<[PlaneDimensions; 3]> {
        let session = self.session()?;
        let format = session.req.output_format;
        let res = session.frame_resolution();
        let display = format.plane_extents(res.width, res.height);
        let buffer = format.plane_extents(
            session.output_stride(),
            align_up(res.height, MB_SIZE),
        );
        Ok([0, 1, 2].map(|i| PlaneDimensions {
            display: display[i],
            buffer: buffer[i],
            x_offset: 0,
            y_offset: 0,
        }))
    }

    fn version_string(&self) -> String {
        let codec = match &self.session {
            Some(session) => session.req.codec.to_string().to_uppercase(),
            None => "VDEC".to_string(),
        };
        format!(
            "@(#)Id:{}_DECODER Ver:{} Released by {}",
            codec,
            env!("CARGO_PKG_VERSION"),
            VENDOR
        )
    }

    /// Writes the version string into `out`, returning its length.
    pub fn get_version(&self, out: &mut [u8]) -> Result<usize> {
        let version = self.version_string();
        let dst = out
            .get_mut(..version.len())
            .ok_or(Cause::VersionBufferTooSmall)?;
        dst.copy_from_slice(version.as_bytes());
        Ok(version.len())
    }

    pub fn set_degrade(&mut self, degrade: u32, pictures: DegradePictures) -> Result<()> {
        let degrade = Degrade::from_bits(degrade).ok_or(Cause::InvalidDegrade)?;
        let session = self.session_mut()?;
        session.degrade = degrade;
        session.degrade_pictures = pictures;
        Ok(())
    }

    /// Binds host display buffers to picture slots in shared mode, returning how many were
    /// bound. Every bound buffer starts out held by the host.
    pub fn set_display_frame(&mut self, buffers: Vec<DisplayBuffer>) -> Result<usize> {
        let session = self.session_mut()?;
        if !session.req.shared {
            warn!("display buffers supplied without shared mode, ignoring them");
            return Ok(0);
        }
        let format = session.req.output_format;
        let num_planes = format.num_planes();
        let stride = session.shared_stride();
        let sizes = format.min_plane_sizes(
            stride,
            align_up(session.req.max_resolution.height, MB_SIZE),
        );
        for (id, buffer) in buffers.iter().enumerate() {
            if buffer.planes.len() < num_planes
                || (0..num_planes).any(|p| (buffer.plane_len(p) as u64) < sizes[p] as u64)
            {
                error!("display buffer {} is smaller than {:?}", id, sizes);
                return Err(Cause::OutputBufferTooSmall.into());
            }
        }
        let bound = session.pool.bind_host_frames(buffers, |internal, host| {
            compose_frame(internal, host, format, stride)
        });
        info!("{} display buffers bound", bound);
        Ok(bound)
    }

    /// Returns a display buffer to the decoder. Only meaningful in shared mode.
    pub fn release_display_frame(&mut self, id: usize) -> Result<()> {
        self.session_mut()?.pool.release_display(id)
    }

    /// Holder sets of every picture slot.
    pub fn holders(&self) -> Result<Vec<Holders>> {
        Ok(self.session()?.pool.snapshot())
    }
}
