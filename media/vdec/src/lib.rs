// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control plane of a block-based video decoder.
//!
//! The host negotiates every byte of memory the decoder uses up front ([`negotiate`],
//! [`mem_record`]), then drives a [`Decoder`] with bitstream buffers. Pictures live in a
//! fixed [`pool`] of slots, are reconstructed and deblocked by a small row [`pipeline`] and
//! are converted to the host's output format by [`display`]. Every failure is reported as a
//! classified [`Error`].
//!
//! Codec syntax and pixel math sit behind the [`backend`] traits; [`dummy`] provides a trivial
//! codec that exercises the whole control plane.

pub mod arena;
pub mod backend;
pub mod bitstream;
pub mod config;
pub mod decoder;
pub mod display;
pub mod dummy;
pub mod error;
pub mod format;
pub mod jobs;
pub mod mem_record;
pub mod negotiate;
pub mod pipeline;
pub mod pool;

pub use crate::config::Codec;
pub use crate::config::DecoderConfig;
pub use crate::decoder::DecodeInput;
pub use crate::decoder::DecodeOutput;
pub use crate::decoder::DecodeParams;
pub use crate::decoder::Decoder;
pub use crate::error::Cause;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::Severity;
pub use crate::format::ColorFormat;
pub use crate::format::Resolution;
pub use crate::mem_record::MemBlock;
pub use crate::mem_record::MemRecord;
