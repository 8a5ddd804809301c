// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion of decoded 4:2:0 pictures into the host's output format.
//!
//! A [`Conversion`] is resumable: it remembers how many rows it has written so the decoder can
//! convert the top of a picture while the bottom is still being reconstructed.

use crate::format::ColorFormat;
use crate::format::Resolution;
use crate::pool::Frame;

/// Luma rows converted per source lock.
pub const CHUNK_ROWS: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConversionKind {
    /// Write every output plane.
    Copy,
    /// Luma already lives in the host buffer; only interleave chroma into plane 1.
    InterleaveChroma,
}

/// Row-by-row conversion of one picture.
#[derive(Clone, Debug)]
pub struct Conversion {
    kind: ConversionKind,
    format: ColorFormat,
    resolution: Resolution,
    /// Output stride in samples.
    stride: u32,
    cursor: u32,
}

impl Conversion {
    pub fn new(
        kind: ConversionKind,
        format: ColorFormat,
        resolution: Resolution,
        stride: u32,
    ) -> Self {
        Conversion {
            kind,
            format,
            resolution,
            stride,
            cursor: 0,
        }
    }

    /// Luma rows converted so far.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.resolution.height
    }

    /// Converts rows up to `limit`, which is clamped to the picture height and rounded down to
    /// an even row so chroma rows are never split.
    pub fn run(&mut self, src: &Frame, dst: &mut [&mut [u8]], limit: u32) {
        let height = self.resolution.height;
        let limit = if limit >= height { height } else { limit & !1 };
        while self.cursor < limit {
            let end = (self.cursor + CHUNK_ROWS).min(limit);
            self.convert_rows(src, dst, self.cursor, end);
            self.cursor = end;
        }
    }

    /// Converts whatever is left.
    pub fn finish(&mut self, src: &Frame, dst: &mut [&mut [u8]]) {
        self.run(src, dst, self.resolution.height);
    }

    fn convert_rows(&self, src: &Frame, dst: &mut [&mut [u8]], start: u32, end: u32) {
        let [y_plane, u_plane, v_plane] = &src.planes;
        let y_data = y_plane.data.lock();
        let u_data = u_plane.data.lock();
        let v_data = v_plane.data.lock();
        let width = self.resolution.width;
        let chroma_width = (width + 1) / 2;
        let luma_stride = self.format.luma_stride(self.stride) as usize;
        let chroma_stride = self.format.chroma_stride(self.stride) as usize;

        for y in start..end {
            let luma = &y_data[y_plane.span(0, y, width as usize)];
            let cb = &u_data[u_plane.span(0, y / 2, chroma_width as usize)];
            let cr = &v_data[v_plane.span(0, y / 2, chroma_width as usize)];
            let row = y as usize;
            let chroma_row = row / 2;
            let first_of_pair = y % 2 == 0;

            match (self.format, self.kind) {
                (ColorFormat::Yuv420P, _) => {
                    copy_row(dst, 0, row * luma_stride, luma);
                    if first_of_pair {
                        copy_row(dst, 1, chroma_row * chroma_stride, cb);
                        copy_row(dst, 2, chroma_row * chroma_stride, cr);
                    }
                }
                (ColorFormat::Yuv420SpUv | ColorFormat::Yuv420SpVu, kind) => {
                    if kind == ConversionKind::Copy {
                        copy_row(dst, 0, row * luma_stride, luma);
                    }
                    if first_of_pair {
                        let (first, second) = if self.format == ColorFormat::Yuv420SpUv {
                            (cb, cr)
                        } else {
                            (cr, cb)
                        };
                        let start = chroma_row * chroma_stride;
                        let out = &mut dst[1][start..start + 2 * first.len()];
                        for (i, pair) in out.chunks_exact_mut(2).enumerate() {
                            pair[0] = first[i];
                            pair[1] = second[i];
                        }
                    }
                }
                (ColorFormat::Yuv422Ile, _) => {
                    // Whole YUYV pairs; the padded source always has the odd trailing sample.
                    let luma = &y_data[y_plane.span(0, y, 2 * chroma_width as usize)];
                    let start = row * luma_stride;
                    let out = &mut dst[0][start..start + 4 * chroma_width as usize];
                    for (i, quad) in out.chunks_exact_mut(4).enumerate() {
                        quad[0] = luma[2 * i];
                        quad[1] = cb[i];
                        quad[2] = luma[2 * i + 1];
                        quad[3] = cr[i];
                    }
                }
                (ColorFormat::Rgb565, _) => {
                    let start = row * luma_stride;
                    let out = &mut dst[0][start..start + 2 * width as usize];
                    for (x, pixel) in out.chunks_exact_mut(2).enumerate() {
                        let rgb = yuv_to_rgb565(luma[x], cb[x / 2], cr[x / 2]);
                        pixel.copy_from_slice(&rgb.to_le_bytes());
                    }
                }
            }
        }
    }
}

fn copy_row(dst: &mut [&mut [u8]], plane: usize, start: usize, row: &[u8]) {
    dst[plane][start..start + row.len()].copy_from_slice(row);
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited range YCbCr to RGB 5:6:5.
pub fn yuv_to_rgb565(y: u8, u: u8, v: u8) -> u16 {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = clamp_u8((298 * c + 409 * e + 128) >> 8) as u16;
    let g = clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8) as u16;
    let b = clamp_u8((298 * c + 516 * d + 128) >> 8) as u16;
    ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::pool::Plane;

    const W: u32 = 6;
    const H: u32 = 34;
    /// Source strides include padding like the decoder's own frames.
    const SRC_STRIDE: usize = 16;

    fn frame() -> Frame {
        let luma: Vec<u8> = (0..SRC_STRIDE * 48).map(|i| (i % 251) as u8).collect();
        let cb: Vec<u8> = (0..8 * 24).map(|i| (i % 13) as u8 + 100).collect();
        let cr: Vec<u8> = (0..8 * 24).map(|i| (i % 7) as u8 + 200).collect();
        Frame {
            planes: [
                Plane::new(BytesMut::from(&luma[..]), SRC_STRIDE, 0),
                Plane::new(BytesMut::from(&cb[..]), 8, 0),
                Plane::new(BytesMut::from(&cr[..]), 8, 0),
            ],
        }
    }

    fn output(format: ColorFormat, stride: u32) -> Vec<Vec<u8>> {
        format
            .min_plane_sizes(stride, H)
            .iter()
            .map(|&size| vec![0u8; size as usize])
            .collect()
    }

    fn convert(format: ColorFormat, limits: &[u32]) -> Vec<Vec<u8>> {
        let src = frame();
        let stride = 8;
        let mut planes = output(format, stride);
        let mut dst: Vec<&mut [u8]> = planes.iter_mut().map(|p| p.as_mut_slice()).collect();
        let mut conv = Conversion::new(
            ConversionKind::Copy,
            format,
            Resolution::new(W, H),
            stride,
        );
        for &limit in limits {
            conv.run(&src, &mut dst, limit);
        }
        conv.finish(&src, &mut dst);
        assert!(conv.is_done());
        planes
    }

    #[test]
    fn planar_copy() {
        let out = convert(ColorFormat::Yuv420P, &[]);
        let src = frame();
        let luma = src.planes[0].data.lock();
        assert_eq!(&out[0][8 * 3..8 * 3 + 6], &luma[16 * 3..16 * 3 + 6]);
        // Padding columns are left alone.
        assert_eq!(out[0][6], 0);
        assert_eq!(out[1][4], src.planes[1].data.lock()[8]);
        assert_eq!(out[2][16], src.planes[2].data.lock()[32]);
    }

    #[test]
    fn semi_planar_interleaves() {
        let src = frame();
        let cb = src.planes[1].data.lock().clone();
        let cr = src.planes[2].data.lock().clone();
        let uv = convert(ColorFormat::Yuv420SpUv, &[]);
        let vu = convert(ColorFormat::Yuv420SpVu, &[]);
        assert_eq!(&uv[1][8..12], &[cb[8], cr[8], cb[9], cr[9]]);
        assert_eq!(&vu[1][8..12], &[cr[8], cb[8], cr[9], cb[9]]);
    }

    #[test]
    fn interleave_only_leaves_luma() {
        let src = frame();
        let mut planes = output(ColorFormat::Yuv420SpUv, 8);
        let mut dst: Vec<&mut [u8]> = planes.iter_mut().map(|p| p.as_mut_slice()).collect();
        let mut conv = Conversion::new(
            ConversionKind::InterleaveChroma,
            ColorFormat::Yuv420SpUv,
            Resolution::new(W, H),
            8,
        );
        conv.finish(&src, &mut dst);
        assert!(planes[0].iter().all(|&b| b == 0));
        assert_eq!(planes[1][0], src.planes[1].data.lock()[0]);
    }

    #[test]
    fn yuyv_packs_pairs() {
        let out = convert(ColorFormat::Yuv422Ile, &[]);
        let src = frame();
        let luma = src.planes[0].data.lock();
        let cb = src.planes[1].data.lock();
        let cr = src.planes[2].data.lock();
        // Row 3 uses chroma row 1.
        let row = &out[0][16 * 3..16 * 3 + 4];
        assert_eq!(row, &[luma[48], cb[8], luma[49], cr[8]]);
    }

    #[test]
    fn rgb565_reference_colors() {
        assert_eq!(yuv_to_rgb565(16, 128, 128), 0x0000);
        assert_eq!(yuv_to_rgb565(235, 128, 128), 0xffff);
        // Saturated red.
        assert_eq!(yuv_to_rgb565(81, 90, 240), 0xf800);
        let out = convert(ColorFormat::Rgb565, &[]);
        let src = frame();
        let expected = yuv_to_rgb565(
            src.planes[0].data.lock()[16],
            src.planes[1].data.lock()[0],
            src.planes[2].data.lock()[0],
        );
        assert_eq!(&out[0][16..18], &expected.to_le_bytes());
    }

    #[test]
    fn chunked_matches_one_shot() {
        for format in [
            ColorFormat::Yuv420P,
            ColorFormat::Yuv420SpVu,
            ColorFormat::Yuv422Ile,
            ColorFormat::Rgb565,
        ] {
            let whole = convert(format, &[]);
            // Odd limits are rounded down, repeated limits are no-ops.
            let chunked = convert(format, &[5, 5, 16, 17, 31]);
            assert_eq!(whole, chunked, "{}", format);
        }
    }

    #[test]
    fn cursor_tracks_progress() {
        let src = frame();
        let mut planes = output(ColorFormat::Yuv420P, 8);
        let mut dst: Vec<&mut [u8]> = planes.iter_mut().map(|p| p.as_mut_slice()).collect();
        let mut conv = Conversion::new(
            ConversionKind::Copy,
            ColorFormat::Yuv420P,
            Resolution::new(W, H),
            8,
        );
        conv.run(&src, &mut dst, 17);
        assert_eq!(conv.cursor(), 16);
        assert!(!conv.is_done());
        conv.run(&src, &mut dst, 100);
        assert_eq!(conv.cursor(), H);
    }
}
