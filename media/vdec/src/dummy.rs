// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// A dummy codec whose only purpose is to let the control plane run so it can be tested in
// isolation. Its syntax is trivial:
//
// Every unit is one type byte, a body and a 0x80 stop byte.
//
// * 0x01 sequence: width (u16 BE), height (u16 BE).
// * 0x02 slice: picture type (0 = I, 1 = P, 2 = B), flags (bit 0 reference, bit 1 first slice,
//   bit 2 IDR, others unsupported), POC (u16 BE), first macroblock (u16 BE), macroblock count (u16 BE), then either
//   one value for every macroblock or one value per macroblock.
// * 0x0f filler.
//
// A decoded macroblock is a flat block whose luma is the macroblock value; concealed macroblocks
// copy the co-located block of the reference picture.

use std::sync::Arc;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use crate::backend::MbState;
use crate::backend::PictureType;
use crate::backend::RowJob;
use crate::backend::RowKernels;
use crate::backend::SequenceHeader;
use crate::backend::SliceData;
use crate::backend::SliceHeader;
use crate::backend::Unit;
use crate::backend::UnitParser;
use crate::bitstream::write_unit;
use crate::decoder::Decoder;
use crate::error::Cause;
use crate::error::Result;
use crate::format::Resolution;
use crate::format::MB_SIZE;
use crate::pool::Frame;
use crate::pool::Plane;

pub const UNIT_SEQUENCE: u8 = 0x01;
pub const UNIT_SLICE: u8 = 0x02;
pub const UNIT_FILLER: u8 = 0x0f;
const STOP_BYTE: u8 = 0x80;
const SLICE_HEADER_SIZE: usize = 8;

const FLAG_REFERENCE: u8 = 1 << 0;
const FLAG_FIRST_SLICE: u8 = 1 << 1;
const FLAG_IDR: u8 = 1 << 2;
const KNOWN_FLAGS: u8 = FLAG_REFERENCE | FLAG_FIRST_SLICE | FLAG_IDR;

/// Differences smaller than this are smoothed across a macroblock row edge.
const DEBLOCK_THRESHOLD: u8 = 16;
const CONCEAL_VALUE: u8 = 128;

pub fn chroma_values(value: u8) -> (u8, u8) {
    (value / 2 + 64, 192 - value / 2)
}

#[derive(Default)]
pub struct DummyParser;

impl DummyParser {
    /// Splits the unit into its type and body, checking the stop byte.
    fn split(payload: &[u8]) -> Result<(u8, &[u8])> {
        match payload {
            [] => Err(Cause::UnknownUnit.into()),
            [kind, body @ .., STOP_BYTE] => Ok((*kind, body)),
            _ => Err(Cause::BitstreamEnd.into()),
        }
    }
}

impl UnitParser for DummyParser {
    fn parse_unit(&mut self, payload: &[u8]) -> Result<Unit> {
        let (kind, mut body) = Self::split(payload)?;
        match kind {
            UNIT_SEQUENCE => {
                if body.len() < 4 {
                    return Err(Cause::InvalidParamSet.into());
                }
                let width = body.get_u16() as u32;
                let height = body.get_u16() as u32;
                if width == 0 || height == 0 {
                    return Err(Cause::InvalidParamSet.into());
                }
                Ok(Unit::Sequence(SequenceHeader {
                    resolution: Resolution::new(width, height),
                }))
            }
            UNIT_SLICE => {
                if body.len() < SLICE_HEADER_SIZE {
                    return Err(Cause::CorruptedSlice.into());
                }
                let picture_type =
                    PictureType::n(body.get_u8()).ok_or(Cause::CorruptedSlice)?;
                let flags = body.get_u8();
                if flags & !KNOWN_FLAGS != 0 {
                    return Err(Cause::FeatureUnavailable.into());
                }
                let poc = body.get_u16() as i32;
                let first_mb = body.get_u16() as u32;
                let num_mbs = body.get_u16() as u32;
                if num_mbs == 0 {
                    return Err(Cause::CorruptedSlice.into());
                }
                Ok(Unit::Slice(SliceHeader {
                    picture_type,
                    is_reference: flags & FLAG_REFERENCE != 0,
                    first_slice: flags & FLAG_FIRST_SLICE != 0,
                    idr: flags & FLAG_IDR != 0,
                    poc,
                    first_mb,
                    num_mbs,
                    data_offset: 1 + SLICE_HEADER_SIZE,
                }))
            }
            UNIT_FILLER => Ok(Unit::Filler),
            _ => Err(Cause::UnknownUnit.into()),
        }
    }

    fn decode_macroblocks(
        &mut self,
        slice: &SliceHeader,
        payload: &[u8],
        values: &mut [u8],
    ) -> SliceData {
        let end = payload.len().saturating_sub(1);
        let data = payload.get(slice.data_offset..end).unwrap_or_default();
        match data.len() {
            1 => {
                values.fill(data[0]);
                SliceData {
                    decoded: values.len() as u32,
                    error: None,
                }
            }
            n if n >= values.len() => {
                let len = values.len();
                values.copy_from_slice(&data[..len]);
                SliceData {
                    decoded: len as u32,
                    error: None,
                }
            }
            n => {
                values[..n].copy_from_slice(data);
                SliceData {
                    decoded: n as u32,
                    error: Some(Cause::CorruptedSlice.into()),
                }
            }
        }
    }
}

/// Flat-block reconstruction and a simple row edge filter.
#[derive(Default)]
pub struct DummyKernels;

fn fill_block(plane: &Plane, data: &mut [u8], x: u32, y: u32, size: u32, value: u8) {
    for row in 0..size {
        if let Some(span) = data.get_mut(plane.span(x, y + row, size as usize)) {
            span.fill(value);
        }
    }
}

fn copy_block(src: &Plane, src_data: &[u8], dst: &Plane, dst_data: &mut [u8], x: u32, y: u32, size: u32) {
    for row in 0..size {
        let from = src_data.get(src.span(x, y + row, size as usize));
        let to = dst_data.get_mut(dst.span(x, y + row, size as usize));
        if let (Some(from), Some(to)) = (from, to) {
            to.copy_from_slice(from);
        }
    }
}

impl RowKernels for DummyKernels {
    fn reconstruct_row(&self, job: &RowJob, _scratch: &mut [u8]) {
        // A picture never predicts from the slot it is decoded into.
        let reference = job
            .reference
            .filter(|r| !Arc::ptr_eq(&r.planes[0].data, &job.frame.planes[0].data));
        for (index, plane) in job.frame.planes.iter().enumerate() {
            let size = if index == 0 { MB_SIZE } else { MB_SIZE / 2 };
            let mut data = plane.data.lock();
            let ref_data = reference.map(|r| (&r.planes[index], r.planes[index].data.lock()));
            for (mb, (&state, &value)) in job.mb_states.iter().zip(job.mb_values).enumerate() {
                let x = mb as u32 * size;
                let y = job.row * size;
                let value = match (index, MbState::n(state)) {
                    (_, Some(MbState::Decoded)) => {
                        let (cb, cr) = chroma_values(value);
                        [value, cb, cr][index]
                    }
                    _ => match &ref_data {
                        Some((src, src_data)) => {
                            copy_block(src, src_data, plane, &mut data, x, y, size);
                            continue;
                        }
                        None => CONCEAL_VALUE,
                    },
                };
                fill_block(plane, &mut data, x, y, size, value);
            }
        }
    }

    fn deblock_row(&self, frame: &Frame, resolution: Resolution, row: u32, _scratch: &mut [u8]) {
        if row == 0 {
            return;
        }
        let plane = &frame.planes[0];
        let mut data = plane.data.lock();
        let width = (resolution.width_mbs() * MB_SIZE) as usize;
        let above = plane.span(0, row * MB_SIZE - 1, width);
        let below = plane.span(0, row * MB_SIZE, width);
        for x in 0..width {
            let p = data[above.start + x];
            let q = data[below.start + x];
            if p.abs_diff(q) < DEBLOCK_THRESHOLD {
                let avg = ((p as u16 + q as u16 + 1) / 2) as u8;
                data[above.start + x] = avg;
                data[below.start + x] = avg;
            }
        }
    }
}

impl Decoder {
    /// A decoder running the dummy codec.
    pub fn dummy() -> Decoder {
        Decoder::new(Box::new(DummyParser), Arc::new(DummyKernels))
    }
}

/// Builds dummy bitstreams.
#[derive(Default)]
pub struct StreamWriter {
    buf: BytesMut,
}

impl StreamWriter {
    pub fn new() -> Self {
        Default::default()
    }

    fn unit(&mut self, kind: u8, body: &[u8]) -> &mut Self {
        let mut rbsp = Vec::with_capacity(body.len() + 2);
        rbsp.put_u8(kind);
        rbsp.put_slice(body);
        rbsp.put_u8(STOP_BYTE);
        write_unit(&rbsp, &mut self.buf);
        self
    }

    pub fn sequence(&mut self, width: u16, height: u16) -> &mut Self {
        self.sequence_ext(width, height, &[])
    }

    /// Appends a sequence header followed by `extension`, which the parser skips.
    pub fn sequence_ext(&mut self, width: u16, height: u16, extension: &[u8]) -> &mut Self {
        let mut body = Vec::new();
        body.put_u16(width);
        body.put_u16(height);
        body.put_slice(extension);
        self.unit(UNIT_SEQUENCE, &body)
    }

    /// Appends a slice. `data` is one value for every macroblock, or one per macroblock.
    pub fn slice(&mut self, header: &SliceHeader, data: &[u8]) -> &mut Self {
        let mut flags = 0;
        if header.is_reference {
            flags |= FLAG_REFERENCE;
        }
        if header.first_slice {
            flags |= FLAG_FIRST_SLICE;
        }
        if header.idr {
            flags |= FLAG_IDR;
        }
        let mut body = Vec::new();
        body.put_u8(header.picture_type as u8);
        body.put_u8(flags);
        body.put_u16(header.poc as u16);
        body.put_u16(header.first_mb as u16);
        body.put_u16(header.num_mbs as u16);
        body.put_slice(data);
        self.unit(UNIT_SLICE, &body)
    }

    /// Appends a complete single-slice picture filled with `value`.
    pub fn picture(
        &mut self,
        picture_type: PictureType,
        is_reference: bool,
        poc: i32,
        total_mbs: u32,
        value: u8,
    ) -> &mut Self {
        let header = SliceHeader {
            picture_type,
            is_reference,
            first_slice: true,
            idr: false,
            poc,
            first_mb: 0,
            num_mbs: total_mbs,
            data_offset: 0,
        };
        self.slice(&header, &[value])
    }

    pub fn filler(&mut self, len: usize) -> &mut Self {
        self.unit(UNIT_FILLER, &vec![0xff; len])
    }

    /// Appends bytes as they are, without start code or escaping.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn build(&self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::next_unit;
    use crate::bitstream::unescape;

    fn parse(stream: &[u8]) -> Vec<Result<Unit>> {
        let mut parser = DummyParser;
        let mut units = Vec::new();
        let mut pos = 0;
        while let Some(span) = next_unit(stream, pos) {
            let mut out = vec![0u8; span.size];
            let len = unescape(span.payload(stream), &mut out).unwrap();
            units.push(parser.parse_unit(&out[..len]));
            pos = span.end();
        }
        units
    }

    fn header(first_mb: u32, num_mbs: u32) -> SliceHeader {
        SliceHeader {
            picture_type: PictureType::P,
            is_reference: true,
            first_slice: first_mb == 0,
            idr: false,
            poc: 2,
            first_mb,
            num_mbs,
            data_offset: 0,
        }
    }

    #[test]
    fn unknown_slice_flags_are_unsupported() {
        let stream = StreamWriter::new()
            .unit(UNIT_SLICE, &[0, 0x08, 0, 2, 0, 0, 0, 1, 7])
            .build();
        let units = parse(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].as_ref().unwrap_err().cause(),
            Cause::FeatureUnavailable
        );
    }

    #[test]
    fn parses_written_units() {
        let stream = StreamWriter::new()
            .sequence(64, 32)
            .slice(&header(0, 4), &[0, 0, 0, 1])
            .filler(3)
            .build();
        let units = parse(&stream);
        assert_eq!(
            units[0],
            Ok(Unit::Sequence(SequenceHeader {
                resolution: Resolution::new(64, 32)
            }))
        );
        assert_eq!(
            units[1],
            Ok(Unit::Slice(SliceHeader {
                data_offset: 9,
                ..header(0, 4)
            }))
        );
        assert_eq!(units[2], Ok(Unit::Filler));
    }

    #[test]
    fn rejects_bad_units() {
        let mut parser = DummyParser;
        let err = |r: Result<Unit>| r.unwrap_err().cause();
        assert_eq!(err(parser.parse_unit(&[0x07, 0x80])), Cause::UnknownUnit);
        assert_eq!(err(parser.parse_unit(&[0x01, 0, 0, 0, 16])), Cause::BitstreamEnd);
        assert_eq!(
            err(parser.parse_unit(&[0x01, 0, 0, 0, 16, 0x80])),
            Cause::InvalidParamSet
        );
        assert_eq!(
            err(parser.parse_unit(&[0x02, 3, 0, 0, 0, 0, 0, 0, 1, 0x80])),
            Cause::CorruptedSlice
        );
        assert_eq!(
            err(parser.parse_unit(&[0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0x80])),
            Cause::CorruptedSlice
        );
    }

    #[test]
    fn macroblock_data() {
        let mut parser = DummyParser;
        let slice = SliceHeader {
            data_offset: 9,
            ..header(0, 3)
        };
        let mut payload = vec![0x02; 9];
        payload.extend_from_slice(&[7, 0x80]);
        let mut values = [0u8; 3];
        let data = parser.decode_macroblocks(&slice, &payload, &mut values);
        assert_eq!(data, SliceData { decoded: 3, error: None });
        assert_eq!(values, [7, 7, 7]);

        payload.truncate(9);
        payload.extend_from_slice(&[1, 2, 0x80]);
        let data = parser.decode_macroblocks(&slice, &payload, &mut values);
        assert_eq!(data.decoded, 2);
        assert_eq!(data.error.unwrap().cause(), Cause::CorruptedSlice);
        assert_eq!(&values[..2], &[1, 2]);
    }

    fn frame(width_mbs: u32, height_mbs: u32) -> Frame {
        let w = (width_mbs * MB_SIZE) as usize;
        let h = (height_mbs * MB_SIZE) as usize;
        Frame {
            planes: [
                Plane::new(BytesMut::zeroed(w * h), w, 0),
                Plane::new(BytesMut::zeroed(w * h / 4), w / 2, 0),
                Plane::new(BytesMut::zeroed(w * h / 4), w / 2, 0),
            ],
        }
    }

    #[test]
    fn reconstructs_and_conceals() {
        let kernels = DummyKernels;
        let res = Resolution::new(32, 16);
        let reference = frame(2, 1);
        reference.fill(40);
        let current = frame(2, 1);
        let states = [MbState::Decoded as u8, MbState::Concealed as u8];
        let values = [100, 0];
        kernels.reconstruct_row(
            &RowJob {
                frame: &current,
                reference: Some(&reference),
                resolution: res,
                row: 0,
                mb_states: &states,
                mb_values: &values,
            },
            &mut [],
        );
        let luma = current.planes[0].data.lock();
        assert_eq!(luma[0], 100);
        assert_eq!(luma[16], 40);
        assert_eq!(luma[32 * 15 + 15], 100);
        assert_eq!(current.planes[1].data.lock()[0], 114);
        assert_eq!(current.planes[2].data.lock()[0], 142);
        assert_eq!(current.planes[2].data.lock()[8], 40);
    }

    #[test]
    fn conceals_grey_without_reference() {
        let current = frame(1, 1);
        DummyKernels.reconstruct_row(
            &RowJob {
                frame: &current,
                reference: Some(&current),
                resolution: Resolution::new(16, 16),
                row: 0,
                mb_states: &[MbState::Concealed as u8],
                mb_values: &[0],
            },
            &mut [],
        );
        assert!(current.planes[0].data.lock().iter().all(|&b| b == 128));
    }

    #[test]
    fn deblock_smooths_small_edges() {
        let res = Resolution::new(32, 32);
        let f = frame(2, 2);
        {
            let mut luma = f.planes[0].data.lock();
            luma[32 * 15] = 100;
            luma[32 * 16] = 110;
            luma[32 * 15 + 1] = 10;
            luma[32 * 16 + 1] = 200;
        }
        DummyKernels.deblock_row(&f, res, 1, &mut []);
        let luma = f.planes[0].data.lock();
        assert_eq!((luma[32 * 15], luma[32 * 16]), (105, 105));
        assert_eq!((luma[32 * 15 + 1], luma[32 * 16 + 1]), (10, 200));
    }
}
