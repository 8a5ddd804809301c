// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Start code delimited bitstream units.
//!
//! Units are introduced by a `00 00 01` start code, optionally preceded by an extra zero byte.
//! Inside a unit, any `00 00` followed by a byte in `00..=03` is escaped by inserting an
//! emulation prevention byte `03`.

use bytes::BufMut;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const EMULATION_PREVENTION_BYTE: u8 = 0x03;

/// Location of one unit inside an input buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnitSpan {
    /// Offset of the start code, including a leading zero byte.
    pub sc_offset: usize,
    /// Offset of the first payload byte, right after the start code.
    pub offset: usize,
    /// Payload bytes, trailing zero bytes excluded.
    pub size: usize,
    /// A later start code delimits the unit. When false the unit runs to the end of the input and
    /// may still be growing.
    pub terminated: bool,
}

impl UnitSpan {
    /// Offset right past the unit's payload.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.end()]
    }
}

/// Returns the offset of the next `00 00 01` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(START_CODE.len())
        .position(|window| window == START_CODE)
        .map(|pos| from + pos)
}

/// Finds the unit whose start code is the first one at or after `from`.
pub fn next_unit(data: &[u8], from: usize) -> Option<UnitSpan> {
    let start = find_start_code(data, from)?;
    let sc_offset = if start > from && data[start - 1] == 0 {
        start - 1
    } else {
        start
    };
    let offset = start + START_CODE.len();
    let (mut end, terminated) = match find_start_code(data, offset) {
        Some(next) => (next, true),
        None => (data.len(), false),
    };
    // Discard trailing_zero_8bits.
    while end > offset && data[end - 1] == 0 {
        end -= 1;
    }
    Some(UnitSpan {
        sc_offset,
        offset,
        size: end - offset,
        terminated,
    })
}

/// Copies `payload` into `out` with emulation prevention bytes removed.
///
/// Returns the number of bytes written, or `None` if `out` is too small.
pub fn unescape(payload: &[u8], out: &mut [u8]) -> Option<usize> {
    let mut zeros = 0;
    let mut len = 0;
    for &byte in payload {
        if zeros >= 2 && byte == EMULATION_PREVENTION_BYTE {
            zeros = 0;
            continue;
        }
        *out.get_mut(len)? = byte;
        len += 1;
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    Some(len)
}

/// Appends `rbsp` to `out`, inserting emulation prevention bytes where needed.
pub fn escape<B: BufMut>(rbsp: &[u8], out: &mut B) {
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= EMULATION_PREVENTION_BYTE {
            out.put_u8(EMULATION_PREVENTION_BYTE);
            zeros = 0;
        }
        out.put_u8(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
}

/// Appends a start code followed by the escaped `rbsp`.
pub fn write_unit<B: BufMut>(rbsp: &[u8], out: &mut B) {
    out.put_slice(&START_CODE);
    escape(rbsp, out);
}
