// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory record descriptors and the checks INIT runs on host-supplied blocks.

use std::cmp;
use std::fmt;

use base::error;
use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Cause;
use crate::error::Result;
use crate::format::align_up_u64;

/// Range of addresses from `start` to `end`, inclusive.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
}

impl MemRange {
    /// Creates a new `MemRange` from `start` extending `size` bytes.
    ///
    /// Returns `None` if the range is not representable.
    pub const fn from_start_and_size(start: u64, size: u64) -> Option<Self> {
        if size == 0 {
            Some(MemRange::empty())
        } else if let Some(end) = start.checked_add(size - 1) {
            Some(MemRange { start, end })
        } else {
            None
        }
    }

    pub const fn empty() -> Self {
        MemRange { start: 1, end: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Returns `true` if the two ranges have any addresses in common.
    pub fn overlaps(&self, other: MemRange) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Find the overlapping region of two ranges, empty if there is none.
    pub fn intersect(&self, other: MemRange) -> MemRange {
        let start = cmp::max(self.start, other.start);
        let end = cmp::min(self.end, other.end);
        MemRange { start, end }
    }
}

impl fmt::Debug for MemRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            f.write_str("empty")
        } else {
            write!(f, "{:#x}..={:#x}", self.start, self.end)
        }
    }
}

impl fmt::Display for MemRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a memory record is used for once INIT carves it up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemRole {
    /// Persistent decoder context, including the parameter-set cache.
    CodecContext,
    /// Staging copy of the unit being parsed.
    BitstreamBuffer,
    /// Pixel storage for every picture buffer slot.
    PicturePool,
    /// Per-picture motion vector banks.
    MotionVectorPool,
    /// Per-macroblock parse and reconstruction status maps.
    MacroblockMaps,
    /// Backing for the row job queue shared with worker threads.
    JobQueue,
    /// Scratch space for one pipeline thread.
    Scratch(u8),
    /// Copy of the validated record table.
    BackupTable,
}

impl fmt::Display for MemRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemRole::CodecContext => write!(f, "codec context"),
            MemRole::BitstreamBuffer => write!(f, "bitstream buffer"),
            MemRole::PicturePool => write!(f, "picture pool"),
            MemRole::MotionVectorPool => write!(f, "motion vector pool"),
            MemRole::MacroblockMaps => write!(f, "macroblock maps"),
            MemRole::JobQueue => write!(f, "job queue"),
            MemRole::Scratch(i) => write!(f, "scratch {}", i),
            MemRole::BackupTable => write!(f, "backup table"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemLocation {
    Internal,
    External,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Persistence {
    /// Contents must survive between calls.
    Persistent,
    /// Contents may be clobbered between calls.
    Scratch,
}

/// Memory class of a record: location, cacheability and persistence.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemClass {
    pub location: MemLocation,
    pub cacheable: bool,
    pub persistence: Persistence,
}

impl MemClass {
    pub const EXTERNAL_CACHEABLE_PERSISTENT: MemClass = MemClass {
        location: MemLocation::External,
        cacheable: true,
        persistence: Persistence::Persistent,
    };
    pub const EXTERNAL_CACHEABLE_SCRATCH: MemClass = MemClass {
        location: MemLocation::External,
        cacheable: true,
        persistence: Persistence::Scratch,
    };

    /// Returns whether memory of this class may back a record that requires `required`.
    ///
    /// Apart from an exact match, persistent memory may stand in for scratch memory of the same
    /// location and cacheability. Nothing else is accepted.
    pub fn satisfies(&self, required: MemClass) -> bool {
        *self == required
            || (required.persistence == Persistence::Scratch
                && self.persistence == Persistence::Persistent
                && self.location == required.location
                && self.cacheable == required.cacheable)
    }
}

/// One entry of the negotiated memory table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemRecord {
    pub role: MemRole,
    pub size: u64,
    pub alignment: u64,
    pub class: MemClass,
}

impl MemRole {
    fn code(self) -> u32 {
        match self {
            MemRole::CodecContext => 1,
            MemRole::BitstreamBuffer => 2,
            MemRole::PicturePool => 3,
            MemRole::MotionVectorPool => 4,
            MemRole::MacroblockMaps => 5,
            MemRole::JobQueue => 6,
            MemRole::BackupTable => 7,
            MemRole::Scratch(i) => 0x10 + i as u32,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => MemRole::CodecContext,
            2 => MemRole::BitstreamBuffer,
            3 => MemRole::PicturePool,
            4 => MemRole::MotionVectorPool,
            5 => MemRole::MacroblockMaps,
            6 => MemRole::JobQueue,
            7 => MemRole::BackupTable,
            0x10..=0x1f => MemRole::Scratch((code - 0x10) as u8),
            _ => return None,
        })
    }
}

impl MemClass {
    fn bits(&self) -> u32 {
        (self.location == MemLocation::External) as u32
            | (self.cacheable as u32) << 1
            | ((self.persistence == Persistence::Scratch) as u32) << 2
    }

    fn from_bits(bits: u32) -> Self {
        MemClass {
            location: if bits & 1 != 0 {
                MemLocation::External
            } else {
                MemLocation::Internal
            },
            cacheable: bits & 2 != 0,
            persistence: if bits & 4 != 0 {
                Persistence::Scratch
            } else {
                Persistence::Persistent
            },
        }
    }
}

impl MemRecord {
    /// Bytes taken by one record in the backup table.
    pub const ENCODED_SIZE: usize = 32;

    /// Writes the little-endian backup table entry for the record.
    pub fn encode(&self, mut buf: &mut [u8]) {
        buf.put_u32_le(self.role.code());
        buf.put_u32_le(self.class.bits());
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.alignment);
        buf.put_u64_le(0);
    }

    /// Reads a backup table entry, or `None` if the entry is not a valid record.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return None;
        }
        let role = MemRole::from_code(buf.get_u32_le())?;
        let class = MemClass::from_bits(buf.get_u32_le());
        let size = buf.get_u64_le();
        let alignment = buf.get_u64_le();
        Some(MemRecord {
            role,
            size,
            alignment,
            class,
        })
    }
}

/// A host-supplied memory block: the record as the host echoes it back, the address the host
/// placed it at, and the bytes backing it.
#[derive(Debug)]
pub struct MemBlock {
    pub record: MemRecord,
    /// Host address of the block, zero for a missing block.
    pub base: u64,
    pub mem: BytesMut,
}

impl MemBlock {
    /// Address range covered by the block as declared by the host.
    pub fn range(&self) -> Option<MemRange> {
        MemRange::from_start_and_size(self.base, self.record.size)
    }
}

/// Lays out zeroed blocks for `records` back to back from `start`, each at its required alignment.
///
/// This is what a host with a flat address space would do; tests and the command-line tool use
/// it to satisfy the negotiated table.
pub fn allocate_blocks(records: &[MemRecord], start: u64) -> Vec<MemBlock> {
    let mut next = start;
    records
        .iter()
        .map(|record| {
            let base = align_up_u64(next, record.alignment);
            next = base + record.size;
            let mut mem = BytesMut::with_capacity(record.size as usize);
            mem.resize(record.size as usize, 0);
            MemBlock {
                record: *record,
                base,
                mem,
            }
        })
        .collect()
}

/// Checks host blocks against the `required` table.
///
/// Checks run in a fixed order: record count, pairwise overlap, then per record the base address,
/// role, alignment, size and memory class. The first violation is returned.
pub fn validate_blocks(required: &[MemRecord], blocks: &[MemBlock]) -> Result<()> {
    if blocks.len() < required.len() {
        error!(
            "{} memory records supplied, {} required",
            blocks.len(),
            required.len()
        );
        return Err(Cause::MemRecNotSufficient.into());
    }

    check_overlap(blocks)?;

    for (block, req) in blocks.iter().zip(required) {
        if block.base == 0 {
            error!("{} record has a null base", req.role);
            return Err(Cause::MemRecBaseNull.into());
        }
        if block.record.role != req.role {
            error!("record {} supplied where {} is required", block.record.role, req.role);
            return Err(Cause::MemRecIncorrectType.into());
        }
        if block.record.alignment != req.alignment || block.base % req.alignment != 0 {
            error!(
                "{} record alignment {} at {:#x}, {} required",
                req.role, block.record.alignment, block.base, req.alignment
            );
            return Err(Cause::MemRecAlignment.into());
        }
        if block.record.size < req.size || (block.mem.len() as u64) < req.size {
            error!(
                "{} record is {} bytes ({} backed), {} required",
                req.role,
                block.record.size,
                block.mem.len(),
                req.size
            );
            return Err(Cause::MemRecInsufficientSize.into());
        }
        if !block.record.class.satisfies(req.class) {
            error!(
                "{} record class {:?} does not satisfy {:?}",
                req.role, block.record.class, req.class
            );
            return Err(Cause::MemRecIncorrectType.into());
        }
    }
    Ok(())
}

fn check_overlap(blocks: &[MemBlock]) -> Result<()> {
    let mut ranges = Vec::with_capacity(blocks.len());
    for block in blocks.iter().filter(|b| b.base != 0) {
        match block.range() {
            Some(range) if !range.is_empty() => ranges.push((range, block.record.role)),
            Some(_) => {}
            None => {
                error!("{} record wraps the address space", block.record.role);
                return Err(Cause::MemRecOverlap.into());
            }
        }
    }
    ranges.sort_by_key(|(range, _)| (range.start, range.end));
    for pair in ranges.windows(2) {
        let (a, a_role) = pair[0];
        let (b, b_role) = pair[1];
        if a.overlaps(b) {
            error!(
                "{} record {} overlaps {} record {}",
                a_role, a, b_role, b
            );
            return Err(Cause::MemRecOverlap.into());
        }
    }
    Ok(())
}
