// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Creation-time decoder configuration.

use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::format::ColorFormat;
use crate::format::Resolution;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    H264,
    Mpeg2,
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "h264"),
            Codec::Mpeg2 => write!(f, "mpeg2"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "avc" => Ok(Codec::H264),
            "mpeg2" => Ok(Codec::Mpeg2),
            _ => Err(format!("unknown codec: {}", s)),
        }
    }
}

/// Parameters the host fixes before negotiating memory.
///
/// Optional fields are left `None` when the host has no preference; the negotiator substitutes
/// codec-specific defaults for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub codec: Codec,
    pub max_width: u32,
    pub max_height: u32,
    pub output_format: ColorFormat,
    /// Bind host buffers directly as picture storage. Ignored for non 4:2:0 output formats.
    pub share_display_buffers: bool,
    /// Codec level times ten, e.g. `31` for level 3.1.
    pub level: Option<u32>,
    pub num_ref_frames: Option<u32>,
    pub num_reorder_frames: Option<u32>,
    /// Extra pool slots the host may hold for display. Only honored in shared mode.
    pub num_extra_display_buffers: Option<u32>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig::new(Codec::H264, 1920, 1088)
    }
}

impl DecoderConfig {
    pub fn new(codec: Codec, max_width: u32, max_height: u32) -> Self {
        DecoderConfig {
            codec,
            max_width,
            max_height,
            output_format: ColorFormat::Yuv420P,
            share_display_buffers: false,
            level: None,
            num_ref_frames: None,
            num_reorder_frames: None,
            num_extra_display_buffers: None,
        }
    }

    pub fn with_output_format(mut self, format: ColorFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_shared_display_buffers(mut self, shared: bool) -> Self {
        self.share_display_buffers = shared;
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_ref_frames(mut self, num: u32) -> Self {
        self.num_ref_frames = Some(num);
        self
    }

    pub fn with_reorder_frames(mut self, num: u32) -> Self {
        self.num_reorder_frames = Some(num);
        self
    }

    pub fn with_extra_display_buffers(mut self, num: u32) -> Self {
        self.num_extra_display_buffers = Some(num);
        self
    }

    pub fn max_resolution(&self) -> Resolution {
        Resolution::new(self.max_width, self.max_height)
    }

    /// Whether shared-buffer mode is in effect once unsupported formats force it off.
    pub fn shares_display_buffers(&self) -> bool {
        self.share_display_buffers && self.output_format.is_yuv420()
    }
}
