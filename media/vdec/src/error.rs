// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error classification.
//!
//! Every failure carries a specific [`Cause`] and the [`Severity`] classes derived from it. Hosts
//! branch on the severity and log the cause. The packed 32-bit form keeps the severity classes in
//! the high bits and the cause code in the low byte.

use std::fmt;

use bitflags::bitflags;
use enumn::N;
use remain::sorted;
use thiserror::Error as ThisError;

/// Bits of a packed error code that hold the cause.
pub const CAUSE_MASK: u32 = 0xff;

bitflags! {
    /// Severity classes of an error, each one orthogonal to the others.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Severity: u32 {
        /// Informational: the decoder already concealed the damage.
        const APPLIED_CONCEALMENT = 1 << 9;
        /// More input is needed; the input itself is not at fault.
        const INSUFFICIENT_DATA = 1 << 10;
        /// Picture data was damaged; recoverable through concealment.
        const CORRUPTED_DATA = 1 << 11;
        /// A sequence or picture header was damaged.
        const CORRUPTED_HEADER = 1 << 12;
        /// The stream uses something this decoder does not implement.
        const UNSUPPORTED_INPUT = 1 << 13;
        /// The host passed an invalid argument; decoder state is untouched.
        const UNSUPPORTED_PARAM = 1 << 14;
        /// The instance is unusable until it is re-initialized.
        const FATAL = 1 << 15;
    }
}

/// Specific reason for a failure.
#[sorted]
#[derive(ThisError, Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum Cause {
    #[error("stream resolution is larger than the negotiated maximum")]
    ActualResolutionGreaterThanInit = 0x30,
    #[error("memory record exhausted while carving decoder state")]
    ArenaExhausted = 0x01,
    #[error("bitstream ended in the middle of a syntax element")]
    BitstreamEnd = 0x20,
    #[error("picture buffer manager invariant violated")]
    BufferManager = 0x02,
    #[error("interleaved 4:2:2 output requires an even height")]
    ChromaFormatHeight = 0x10,
    #[error("corrupted slice data")]
    CorruptedSlice = 0x21,
    #[error("display width is smaller than the picture width")]
    DisplayWidthTooSmall = 0x11,
    #[error("stream uses an unimplemented feature")]
    FeatureUnavailable = 0x31,
    #[error("decoded frame limit exceeded")]
    FrameLimitExceeded = 0x03,
    #[error("non-reference picture skipped")]
    FrameSkipped = 0x12,
    #[error("picture is missing macroblocks")]
    IncompleteFrame = 0x22,
    #[error("decoder is not initialized")]
    InitNotDone = 0x04,
    #[error("unknown display buffer id")]
    InvalidBufferId = 0x13,
    #[error("invalid degrade setting")]
    InvalidDegrade = 0x1d,
    #[error("invalid parameter set")]
    InvalidParamSet = 0x23,
    #[error("codec level is not supported")]
    LevelUnsupported = 0x32,
    #[error("memory record alignment does not match the requirement")]
    MemRecAlignment = 0x40,
    #[error("memory record base address is null")]
    MemRecBaseNull = 0x41,
    #[error("memory record has the wrong role or memory class")]
    MemRecIncorrectType = 0x42,
    #[error("memory record is smaller than required")]
    MemRecInsufficientSize = 0x43,
    #[error("not enough memory records supplied")]
    MemRecNotSufficient = 0x44,
    #[error("memory records overlap")]
    MemRecOverlap = 0x45,
    #[error("no motion vector buffer available")]
    MvBufUnavailable = 0x24,
    #[error("invalid number of input bytes")]
    NumBytesInvalid = 0x14,
    #[error("invalid number of cores")]
    NumCoresInvalid = 0x15,
    #[error("too many reference or reorder frames requested")]
    NumRefExceeded = 0x16,
    #[error("output buffer is too small")]
    OutputBufferTooSmall = 0x17,
    #[error("no picture buffer available")]
    PictureBufferUnavailable = 0x28,
    #[error("all picture buffers are held for display")]
    ReferenceBufferUnavailable = 0x18,
    #[error("stream resolution changed; renegotiate memory")]
    ResolutionChanged = 0x33,
    #[error("resolution is outside the supported range")]
    ResolutionOutOfRange = 0x19,
    #[error("no start code found in input")]
    StartCodeNotFound = 0x25,
    #[error("stream dimensions are not supported")]
    StreamDimensionsUnsupported = 0x34,
    #[error("bitstream unit exceeds the maximum unit size")]
    UnitTooLarge = 0x26,
    #[error("unknown bitstream unit")]
    UnknownUnit = 0x27,
    #[error("version buffer is too small")]
    VersionBufferTooSmall = 0x1b,
    #[error("no output buffers supplied")]
    ZeroOutputBuffers = 0x1c,
}

/// Maps a cause to its severity classes.
pub fn classify(cause: Cause) -> Severity {
    use Cause::*;

    match cause {
        ArenaExhausted | BufferManager | FrameLimitExceeded | InitNotDone
        | ActualResolutionGreaterThanInit => Severity::FATAL,
        CorruptedSlice | IncompleteFrame | MvBufUnavailable | PictureBufferUnavailable
        | UnitTooLarge | UnknownUnit => Severity::CORRUPTED_DATA,
        InvalidParamSet => Severity::CORRUPTED_HEADER,
        FeatureUnavailable | StreamDimensionsUnsupported => Severity::UNSUPPORTED_INPUT,
        LevelUnsupported => Severity::UNSUPPORTED_INPUT | Severity::FATAL,
        BitstreamEnd | StartCodeNotFound => Severity::INSUFFICIENT_DATA,
        ChromaFormatHeight | DisplayWidthTooSmall | FrameSkipped | InvalidBufferId
        | InvalidDegrade | MemRecAlignment | MemRecBaseNull | MemRecIncorrectType
        | MemRecInsufficientSize | MemRecNotSufficient | MemRecOverlap | NumBytesInvalid
        | NumCoresInvalid | NumRefExceeded | OutputBufferTooSmall | ReferenceBufferUnavailable
        | ResolutionOutOfRange | VersionBufferTooSmall | ZeroOutputBuffers => {
            Severity::UNSUPPORTED_PARAM
        }
        ResolutionChanged => Severity::empty(),
    }
}

/// A classified failure: the specific cause plus its severity classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Error {
    cause: Cause,
    severity: Severity,
}

impl Error {
    pub fn new(cause: Cause) -> Self {
        Error {
            cause,
            severity: classify(cause),
        }
    }

    pub fn cause(&self) -> Cause {
        self.cause
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Marks the error as already concealed by the decoder.
    pub fn concealed(mut self) -> Self {
        self.severity |= Severity::APPLIED_CONCEALMENT;
        self
    }

    /// Packed form: severity bits in the high bits, cause code in the low byte.
    pub fn code(&self) -> u32 {
        self.severity.bits() | self.cause as u32
    }

    /// Unpacks a code produced by [`code`](Error::code).
    pub fn from_code(code: u32) -> Option<Self> {
        let cause = Cause::n(code & CAUSE_MASK)?;
        let severity = Severity::from_bits(code & !CAUSE_MASK)?;
        Some(Error { cause, severity })
    }

    pub fn is_fatal(&self) -> bool {
        self.severity.contains(Severity::FATAL)
    }

    /// True when the stream outgrew the negotiated memory. The host must renegotiate at the new
    /// size and re-run INIT before decoding further.
    pub fn needs_renegotiation(&self) -> bool {
        self.cause == Cause::ActualResolutionGreaterThanInit
    }

    /// True when a new sequence header changed the resolution within the negotiated maximum.
    ///
    /// The decoder handles this itself: the call consumes nothing, the host drains the held
    /// pictures by flushing, and the next decode call reinitializes the stream at the new size
    /// from the same memory records.
    pub fn is_resolution_change(&self) -> bool {
        self.cause == Cause::ResolutionChanged
    }
}

impl From<Cause> for Error {
    fn from(cause: Cause) -> Self {
        Error::new(cause)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (error code {:#x})", self.cause, self.code())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causes_fit_in_the_cause_byte() {
        for code in 0..=CAUSE_MASK {
            if let Some(cause) = Cause::n(code) {
                assert_eq!(cause as u32 & !CAUSE_MASK, 0);
            }
        }
    }

    #[test]
    fn code_round_trips() {
        let err = Error::new(Cause::CorruptedSlice).concealed();
        let code = err.code();
        assert_eq!(code & CAUSE_MASK, Cause::CorruptedSlice as u32);
        assert!(Severity::from_bits_truncate(code).contains(Severity::APPLIED_CONCEALMENT));
        assert_eq!(Error::from_code(code), Some(err));
    }

    #[test]
    fn severity_classes() {
        assert!(Error::new(Cause::FrameLimitExceeded).is_fatal());
        assert!(Error::new(Cause::BufferManager).is_fatal());
        assert_eq!(classify(Cause::UnitTooLarge), Severity::CORRUPTED_DATA);
        assert_eq!(classify(Cause::StartCodeNotFound), Severity::INSUFFICIENT_DATA);
        assert_eq!(classify(Cause::FeatureUnavailable), Severity::UNSUPPORTED_INPUT);
        assert_eq!(classify(Cause::MemRecOverlap), Severity::UNSUPPORTED_PARAM);
        assert!(!Error::new(Cause::ReferenceBufferUnavailable).is_fatal());
    }

    #[test]
    fn resolution_change_is_distinguished() {
        let err = Error::new(Cause::ResolutionChanged);
        assert!(err.is_resolution_change());
        assert!(!err.needs_renegotiation());
        assert!(!err.is_fatal());
        assert_eq!(err.code(), Cause::ResolutionChanged as u32);

        let err = Error::new(Cause::ActualResolutionGreaterThanInit);
        assert!(err.needs_renegotiation());
        assert!(!err.is_resolution_change());
        assert!(err.is_fatal());
    }

    #[test]
    fn display_names_cause_and_code() {
        let err = Error::new(Cause::MemRecOverlap);
        assert_eq!(err.to_string(), "memory records overlap (error code 0x4045)");
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(Error::from_code(0xff), None);
        assert_eq!(Error::from_code(1 << 20 | Cause::CorruptedSlice as u32), None);
    }
}
