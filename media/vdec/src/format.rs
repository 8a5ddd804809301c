// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture geometry and the closed set of output color formats.

use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use enumn::N;
use serde::Deserialize;
use serde::Serialize;

/// Width and height of a macroblock, in luma samples.
pub const MB_SIZE: u32 = 16;

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// `u64` flavor of [`align_up`] for byte sizes and addresses.
pub const fn align_up_u64(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    /// Number of macroblock columns.
    pub fn width_mbs(&self) -> u32 {
        align_up(self.width, MB_SIZE) / MB_SIZE
    }

    /// Number of macroblock rows.
    pub fn height_mbs(&self) -> u32 {
        align_up(self.height, MB_SIZE) / MB_SIZE
    }

    pub fn total_mbs(&self) -> u32 {
        self.width_mbs() * self.height_mbs()
    }

    /// Returns true if a picture of `other` dimensions fits in buffers sized for `self`.
    pub fn can_contain(&self, other: Resolution) -> bool {
        other.width <= self.width && other.height <= self.height
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Output color formats the display stage can produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, N)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum ColorFormat {
    /// Planar 4:2:0, three planes.
    Yuv420P = 1,
    /// Semi-planar 4:2:0 with interleaved Cb/Cr.
    Yuv420SpUv = 2,
    /// Semi-planar 4:2:0 with interleaved Cr/Cb.
    Yuv420SpVu = 3,
    /// Interleaved 4:2:2 in YUYV order.
    Yuv422Ile = 4,
    /// Packed RGB 5:6:5, little endian.
    Rgb565 = 5,
}

/// Extent of one output plane as reported by `get_frame_dimensions`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneExtent {
    pub width: u32,
    pub height: u32,
}

impl ColorFormat {
    /// Number of host buffers the format is written into.
    pub fn num_planes(self) -> usize {
        match self {
            ColorFormat::Yuv420P => 3,
            ColorFormat::Yuv420SpUv | ColorFormat::Yuv420SpVu => 2,
            ColorFormat::Yuv422Ile | ColorFormat::Rgb565 => 1,
        }
    }

    /// Whether host buffers in this format can back the decoder's pictures directly.
    pub fn is_yuv420(self) -> bool {
        matches!(
            self,
            ColorFormat::Yuv420P | ColorFormat::Yuv420SpUv | ColorFormat::Yuv420SpVu
        )
    }

    /// Stride of the chroma plane(s) that go with a luma plane of `stride` bytes.
    ///
    /// Planar 4:2:0 halves the stride; semi-planar keeps it since Cb and Cr are interleaved.
    /// Packed formats have no separate chroma plane.
    pub fn chroma_stride(self, stride: u32) -> u32 {
        match self {
            ColorFormat::Yuv420P => (stride + 1) / 2,
            ColorFormat::Yuv420SpUv | ColorFormat::Yuv420SpVu => 2 * ((stride + 1) / 2),
            ColorFormat::Yuv422Ile | ColorFormat::Rgb565 => 0,
        }
    }

    /// Bytes per row of the first plane for a picture `stride` samples wide.
    pub fn luma_stride(self, stride: u32) -> u32 {
        match self {
            ColorFormat::Yuv422Ile | ColorFormat::Rgb565 => stride * 2,
            _ => stride,
        }
    }

    /// Minimum size of each output plane for a picture with luma `stride` and `height` rows.
    pub fn min_plane_sizes(self, stride: u32, height: u32) -> [u32; 3] {
        let luma = self.luma_stride(stride) * height;
        let chroma = self.chroma_stride(stride) * ((height + 1) / 2);
        match self {
            ColorFormat::Yuv420P => [luma, chroma, chroma],
            ColorFormat::Yuv420SpUv | ColorFormat::Yuv420SpVu => [luma, chroma, 0],
            ColorFormat::Yuv422Ile | ColorFormat::Rgb565 => [luma, 0, 0],
        }
    }

    /// Extent of each plane for a `width` x `height` picture.
    ///
    /// Semi-planar formats report the interleaved chroma plane at full luma width and leave the
    /// third plane empty.
    pub fn plane_extents(self, width: u32, height: u32) -> [PlaneExtent; 3] {
        let luma = PlaneExtent { width, height };
        let chroma = PlaneExtent {
            width: (width + 1) >> 1,
            height: (height + 1) >> 1,
        };
        match self {
            ColorFormat::Yuv420P => [luma, chroma, chroma],
            ColorFormat::Yuv420SpUv | ColorFormat::Yuv420SpVu => [
                luma,
                PlaneExtent {
                    width: chroma.width << 1,
                    height: chroma.height,
                },
                PlaneExtent::default(),
            ],
            ColorFormat::Yuv422Ile | ColorFormat::Rgb565 => [
                PlaneExtent {
                    width: width * 2,
                    height,
                },
                PlaneExtent::default(),
                PlaneExtent::default(),
            ],
        }
    }
}

impl Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ColorFormat::Yuv420P => "yuv420p",
            ColorFormat::Yuv420SpUv => "yuv420sp-uv",
            ColorFormat::Yuv420SpVu => "yuv420sp-vu",
            ColorFormat::Yuv422Ile => "yuv422ile",
            ColorFormat::Rgb565 => "rgb565",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ColorFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yuv420p" | "i420" => Ok(ColorFormat::Yuv420P),
            "yuv420sp-uv" | "nv12" => Ok(ColorFormat::Yuv420SpUv),
            "yuv420sp-vu" | "nv21" => Ok(ColorFormat::Yuv420SpVu),
            "yuv422ile" | "yuyv" => Ok(ColorFormat::Yuv422Ile),
            "rgb565" => Ok(ColorFormat::Rgb565),
            _ => Err(format!("unsupported color format: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1080, 16), 1088);
        assert_eq!(align_up(1088, 32), 1088);
        assert_eq!(align_up(1090, 32), 1120);
        assert_eq!(align_up_u64(129, 128), 256);
    }

    #[test]
    fn macroblock_counts_round_up() {
        let res = Resolution::new(1920, 1080);
        assert_eq!(res.width_mbs(), 120);
        assert_eq!(res.height_mbs(), 68);
        assert_eq!(res.total_mbs(), 8160);
    }

    #[test]
    fn min_plane_sizes_per_format() {
        assert_eq!(ColorFormat::Yuv420P.min_plane_sizes(64, 32), [2048, 512, 512]);
        assert_eq!(ColorFormat::Yuv420SpVu.min_plane_sizes(64, 32), [2048, 1024, 0]);
        assert_eq!(ColorFormat::Yuv422Ile.min_plane_sizes(64, 32), [4096, 0, 0]);
        assert_eq!(ColorFormat::Yuv420P.min_plane_sizes(33, 17), [561, 153, 153]);
        assert_eq!(ColorFormat::Yuv420SpUv.chroma_stride(33), 34);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let extents = ColorFormat::Yuv420P.plane_extents(33, 17);
        assert_eq!(extents[1], PlaneExtent { width: 17, height: 9 });
        let sp = ColorFormat::Yuv420SpUv.plane_extents(33, 17);
        assert_eq!(sp[1].width, 34);
        assert_eq!(sp[2], PlaneExtent::default());
    }

    #[test]
    fn format_names_round_trip_through_from_str() {
        for n in 1..=5 {
            let format = ColorFormat::n(n).unwrap();
            assert_eq!(format.to_string().parse::<ColorFormat>(), Ok(format));
        }
        assert!(ColorFormat::n(6).is_none());
        assert!("yuv444".parse::<ColorFormat>().is_err());
    }
}
