// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bump allocation of aligned sub-regions out of one validated memory block.

use base::error;
use bytes::BytesMut;

use crate::error::Cause;
use crate::error::Result;
use crate::format::align_up_u64;
use crate::mem_record::MemBlock;
use crate::mem_record::MemRole;

/// A carved sub-region: the host address it corresponds to and the bytes backing it.
#[derive(Debug)]
pub struct Region {
    pub addr: u64,
    pub bytes: BytesMut,
}

impl Region {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Splits the first `at` bytes off into their own region.
    pub fn split_to(&mut self, at: usize) -> Region {
        let addr = self.addr;
        self.addr += at as u64;
        Region {
            addr,
            bytes: self.bytes.split_to(at),
        }
    }
}

/// Hands out consecutive, aligned regions of a single block.
///
/// Alignment is computed on host addresses, so a carve that is aligned here is aligned for the
/// host as well. The arena never reuses space; dropping a region does not return it.
#[derive(Debug)]
pub struct Arena {
    role: MemRole,
    next: u64,
    mem: BytesMut,
}

impl Arena {
    pub fn new(block: MemBlock) -> Self {
        Arena {
            role: block.record.role,
            next: block.base,
            mem: block.mem,
        }
    }

    /// Bytes left after the last carve.
    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.mem.len()
    }

    /// Carves `size` bytes aligned to `align`.
    pub fn carve(&mut self, size: u64, align: u64) -> Result<Region> {
        if !align.is_power_of_two() {
            return Err(Cause::BufferManager.into());
        }
        let addr = align_up_u64(self.next, align);
        let pad = addr - self.next;
        if pad + size > self.mem.len() as u64 {
            error!(
                "{} exhausted: {} bytes at alignment {} requested, {} left",
                self.role,
                size,
                align,
                self.mem.len()
            );
            return Err(Cause::ArenaExhausted.into());
        }
        let _ = self.mem.split_to(pad as usize);
        let bytes = self.mem.split_to(size as usize);
        self.next = addr + size;
        Ok(Region { addr, bytes })
    }

    /// Carves `count` regions of `size` bytes, each aligned to `align`.
    pub fn carve_many(&mut self, count: usize, size: u64, align: u64) -> Result<Vec<Region>> {
        (0..count).map(|_| self.carve(size, align)).collect()
    }

    /// Size a block aligned to the largest requested alignment needs to satisfy `requests`, a
    /// list of `(size, align)` pairs carved in order.
    pub fn required_size(requests: &[(u64, u64)]) -> u64 {
        requests
            .iter()
            .fold(0, |end, &(size, align)| align_up_u64(end, align) + size)
    }
}
