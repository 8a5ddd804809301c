// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture buffer pool.
//!
//! Every slot carries a set of [`Holders`]; a slot is free exactly when the set is empty. The
//! decoder marks the slot it reconstructs into with `IO`, pictures later pictures may predict
//! from with `REFERENCE`, and pictures waiting in or handed out by the display queue with
//! `DISPLAY`. All state lives behind one pool-wide lock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use base::debug;
use base::error;
use base::warn;
use bitflags::bitflags;
use bytes::BytesMut;
use sync::Mutex;

use crate::arena::Region;
use crate::backend::PictureType;
use crate::error::Cause;
use crate::error::Result;
use crate::format::Resolution;
use crate::negotiate::FrameLayout;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Holders: u8 {
        /// A later picture may predict from this one.
        const REFERENCE = 1 << 0;
        /// Queued for display, or handed to the host and not yet released.
        const DISPLAY = 1 << 1;
        /// The decoder is writing the slot.
        const IO = 1 << 2;
    }
}

/// Storage of one plane, shared between the decoder, its workers and possibly the host.
pub type PlaneData = Arc<Mutex<BytesMut>>;

#[derive(Clone, Debug)]
pub struct Plane {
    pub data: PlaneData,
    pub stride: usize,
    /// Offset of the first visible sample.
    pub origin: usize,
}

impl Plane {
    pub fn new(bytes: BytesMut, stride: usize, origin: usize) -> Self {
        Plane {
            data: Arc::new(Mutex::new(bytes)),
            stride,
            origin,
        }
    }

    /// Byte range of `len` samples of visible row `y`, starting at column `x`.
    pub fn span(&self, x: u32, y: u32, len: usize) -> Range<usize> {
        let start = self.origin + y as usize * self.stride + x as usize;
        start..start + len
    }

    pub fn fill(&self, value: u8) {
        self.data.lock().fill(value);
    }
}

/// A planar 4:2:0 picture: luma, Cb and Cr.
#[derive(Clone, Debug)]
pub struct Frame {
    pub planes: [Plane; 3],
}

impl Frame {
    /// Splits a pool slot into its planes according to `layout`.
    pub fn from_region(mut region: Region, layout: &FrameLayout) -> Self {
        let mut consumed = 0;
        let planes = layout.planes.map(|plane| {
            let _ = region.split_to((plane.offset - consumed) as usize);
            consumed = plane.offset + plane.size;
            let bytes = region.split_to(plane.size as usize).bytes;
            Plane::new(bytes, plane.stride as usize, plane.origin())
        });
        Frame { planes }
    }

    pub fn fill(&self, value: u8) {
        for plane in &self.planes {
            plane.fill(value);
        }
    }
}

/// Planes of one host display buffer bound in shared mode.
#[derive(Clone, Debug)]
pub struct DisplayBuffer {
    pub planes: Vec<PlaneData>,
}

impl DisplayBuffer {
    pub fn new(planes: Vec<BytesMut>) -> Self {
        DisplayBuffer {
            planes: planes
                .into_iter()
                .map(|p| Arc::new(Mutex::new(p)))
                .collect(),
        }
    }

    pub fn plane_len(&self, index: usize) -> usize {
        self.planes.get(index).map_or(0, |p| p.lock().len())
    }
}

/// What is known about the picture a slot holds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureInfo {
    pub picture_type: PictureType,
    pub is_reference: bool,
    pub poc: i32,
    /// Incremented at every IDR picture so earlier pictures display first.
    pub epoch: u32,
    pub decode_order: u64,
    pub timestamp: u64,
    pub resolution: Resolution,
}

/// Display queue entry ordered so the lowest presentation key sits on top of a `BinaryHeap`.
#[derive(Debug, PartialEq, Eq)]
struct ReadyPicture {
    key: (u32, i32, u64),
    slot: usize,
}

impl PartialOrd for ReadyPicture {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyPicture {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

#[derive(Debug)]
struct Slot {
    holders: Holders,
    /// Frame the decoder reconstructs into. In shared mode host planes replace the placeholders.
    frame: Frame,
    /// Pool-backed frame as carved at INIT.
    internal: Frame,
    host: Option<DisplayBuffer>,
    queued: bool,
    info: PictureInfo,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    queue: BinaryHeap<ReadyPicture>,
    /// Reference slots, oldest first.
    references: VecDeque<usize>,
    window: usize,
    shared: bool,
}

impl PoolState {
    fn slot(&self, id: usize) -> Result<&Slot> {
        self.slots.get(id).ok_or_else(|| {
            error!("picture buffer {} does not exist", id);
            Cause::InvalidBufferId.into()
        })
    }

    fn slot_mut(&mut self, id: usize) -> Result<&mut Slot> {
        self.slots.get_mut(id).ok_or_else(|| {
            error!("picture buffer {} does not exist", id);
            Cause::InvalidBufferId.into()
        })
    }

    fn find_free(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.holders.is_empty() && (!self.shared || s.host.is_some()))
    }

    fn evict_oldest_reference(&mut self) -> bool {
        match self.references.pop_front() {
            Some(id) => {
                self.slots[id].holders.remove(Holders::REFERENCE);
                true
            }
            None => false,
        }
    }

    /// Position in `references` of the oldest reference nothing else holds.
    fn recyclable_reference(&self) -> Option<usize> {
        self.references.iter().position(|&id| {
            let slot = &self.slots[id];
            slot.holders == Holders::REFERENCE && (!self.shared || slot.host.is_some())
        })
    }

    fn host_holds_display(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.holders.contains(Holders::DISPLAY) && !s.queued)
    }
}

/// Fixed-capacity set of picture buffers.
#[derive(Debug)]
pub struct PicturePool {
    state: Mutex<PoolState>,
}

impl PicturePool {
    /// Creates a pool over `frames`, keeping at most `window` reference pictures.
    ///
    /// In shared mode a slot only becomes usable once a host buffer is bound to it.
    pub fn new(frames: Vec<Frame>, window: usize, shared: bool) -> Self {
        let slots = frames
            .into_iter()
            .map(|frame| Slot {
                holders: Holders::empty(),
                internal: frame.clone(),
                frame,
                host: None,
                queued: false,
                info: Default::default(),
            })
            .collect();
        PicturePool {
            state: Mutex::new(PoolState {
                slots,
                queue: BinaryHeap::new(),
                references: VecDeque::new(),
                window,
                shared,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Returns a slot with no holders, or `None`. Never blocks.
    pub fn find_free(&self) -> Option<usize> {
        self.state.lock().find_free()
    }

    pub fn num_free(&self) -> usize {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .filter(|s| s.holders.is_empty())
            .count()
    }

    pub fn holders(&self, id: usize) -> Result<Holders> {
        Ok(self.state.lock().slot(id)?.holders)
    }

    /// Takes the free slot `id` on behalf of `holder`.
    pub fn acquire(&self, id: usize, holder: Holders) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(id)?;
        if !slot.holders.is_empty() {
            error!(
                "picture buffer {} acquired for {:?} while held by {:?}",
                id, holder, slot.holders
            );
            return Err(Cause::BufferManager.into());
        }
        slot.holders = holder;
        Ok(())
    }

    /// Adds `holder` to a slot that may already be held.
    pub fn set_status(&self, id: usize, holder: Holders) -> Result<()> {
        self.state.lock().slot_mut(id)?.holders.insert(holder);
        Ok(())
    }

    /// Drops `holder` from the slot. Dropping a holder the slot does not have is a no-op.
    pub fn release(&self, id: usize, holder: Holders) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(id)?;
        slot.holders.remove(holder);
        if holder.contains(Holders::REFERENCE) {
            state.references.retain(|&r| r != id);
        }
        Ok(())
    }

    /// Finds a slot for a new picture and marks it `IO`.
    ///
    /// When every slot is held the oldest reference held by nothing else is recycled, unless the
    /// host is holding pictures for display: then it has to release one first and
    /// `ReferenceBufferUnavailable` is returned. The pool is left untouched on error.
    pub fn take_slot(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let id = match state.find_free() {
            Some(id) => id,
            None => {
                if state.host_holds_display() {
                    return Err(Cause::ReferenceBufferUnavailable.into());
                }
                let pos = match state.recyclable_reference() {
                    Some(pos) => pos,
                    None => {
                        error!("no picture buffer can be recycled");
                        return Err(Cause::PictureBufferUnavailable.into());
                    }
                };
                debug!("recycling reference picture {}", state.references[pos]);
                state.references.remove(pos).ok_or(Cause::BufferManager)?
            }
        };
        state.slots[id].holders = Holders::IO;
        Ok(id)
    }

    /// Whether `take_slot` would find a slot right now.
    pub fn can_take_slot(&self) -> bool {
        let state = self.state.lock();
        state.find_free().is_some()
            || (!state.host_holds_display() && state.recyclable_reference().is_some())
    }

    pub fn frame(&self, id: usize) -> Result<Frame> {
        Ok(self.state.lock().slot(id)?.frame.clone())
    }

    /// Host buffer bound to the slot in shared mode.
    pub fn host_buffer(&self, id: usize) -> Result<Option<DisplayBuffer>> {
        Ok(self.state.lock().slot(id)?.host.clone())
    }

    pub fn info(&self, id: usize) -> Result<PictureInfo> {
        Ok(self.state.lock().slot(id)?.info)
    }

    pub fn set_info(&self, id: usize, info: PictureInfo) -> Result<()> {
        self.state.lock().slot_mut(id)?.info = info;
        Ok(())
    }

    /// Adds the slot to the reference window, releasing the oldest reference if it overflows.
    pub fn mark_reference(&self, id: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.slot_mut(id)?.holders.insert(Holders::REFERENCE);
        state.references.retain(|&r| r != id);
        state.references.push_back(id);
        while state.references.len() > state.window {
            state.evict_oldest_reference();
        }
        Ok(())
    }

    /// Most recently marked reference picture.
    pub fn latest_reference(&self) -> Option<usize> {
        self.state.lock().references.back().copied()
    }

    pub fn num_references(&self) -> usize {
        self.state.lock().references.len()
    }

    /// Drops every `REFERENCE` holder, leaving queued pictures to drain through display.
    pub fn release_references(&self) {
        let mut state = self.state.lock();
        while state.evict_oldest_reference() {}
    }

    /// Queues the slot for display.
    pub fn queue_display(&self, id: usize) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(id)?;
        slot.holders.insert(Holders::DISPLAY);
        slot.queued = true;
        let key = (slot.info.epoch, slot.info.poc, slot.info.decode_order);
        state.queue.push(ReadyPicture { key, slot: id });
        Ok(())
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Pops the next picture in presentation order. The slot keeps its `DISPLAY` holder.
    pub fn pop_display(&self) -> Option<usize> {
        let mut state = self.state.lock();
        let ready = state.queue.pop()?;
        state.slots[ready.slot].queued = false;
        Some(ready.slot)
    }

    pub fn host_holds_display(&self) -> bool {
        self.state.lock().host_holds_display()
    }

    /// Binds host buffers to slots `0..buffers.len()`, clamped to the pool capacity.
    ///
    /// `compose` builds the frame the decoder writes into from the slot's internal frame and the
    /// host buffer. Bound slots are marked `DISPLAY`: the host owns them until it releases them.
    /// Slots the decoder still holds keep their current binding. Returns the number bound.
    pub fn bind_host_frames<F>(&self, buffers: Vec<DisplayBuffer>, compose: F) -> usize
    where
        F: Fn(&Frame, &DisplayBuffer) -> Frame,
    {
        let mut state = self.state.lock();
        let capacity = state.slots.len();
        if buffers.len() > capacity {
            warn!(
                "{} display buffers supplied, binding the first {}",
                buffers.len(),
                capacity
            );
        }
        let mut bound = 0;
        for (id, buffer) in buffers.into_iter().take(capacity).enumerate() {
            let slot = &mut state.slots[id];
            if !(slot.holders - Holders::DISPLAY).is_empty() || slot.queued {
                warn!("display buffer {} is in use by the decoder, not rebinding", id);
                continue;
            }
            slot.frame = compose(&slot.internal, &buffer);
            slot.host = Some(buffer);
            slot.holders = Holders::DISPLAY;
            bound += 1;
        }
        bound
    }

    /// Returns a display buffer from the host.
    ///
    /// Only meaningful in shared mode; otherwise it does nothing. Releasing a buffer the host
    /// does not hold is a no-op, and other holders of the slot are untouched.
    pub fn release_display(&self, id: usize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.shared {
            return Ok(());
        }
        let slot = state.slot_mut(id)?;
        if slot.queued {
            warn!("display buffer {} released before it was output", id);
            return Ok(());
        }
        slot.holders.remove(Holders::DISPLAY);
        Ok(())
    }

    /// Releases everything the decoder holds: references, `IO` and queued display entries.
    ///
    /// Pictures the host holds for display in shared mode stay held, and bindings survive.
    pub fn release_decoder_holders(&self) {
        let mut state = self.state.lock();
        state.references.clear();
        state.queue.clear();
        for slot in state.slots.iter_mut() {
            slot.holders.remove(Holders::REFERENCE | Holders::IO);
            if slot.queued {
                slot.holders.remove(Holders::DISPLAY);
                slot.queued = false;
            }
        }
    }

    /// Holder sets of every slot, in slot order.
    pub fn snapshot(&self) -> Vec<Holders> {
        self.state.lock().slots.iter().map(|s| s.holders).collect()
    }
}

/// Motion vector banks, one per picture that may still be predicted from.
#[derive(Debug)]
pub struct MotionVectorBanks {
    banks: Vec<BytesMut>,
    owner: Vec<Option<usize>>,
    entry_size: usize,
}

impl MotionVectorBanks {
    pub fn new(regions: Vec<Region>, entry_size: usize) -> Self {
        let owner = vec![None; regions.len()];
        MotionVectorBanks {
            banks: regions.into_iter().map(|r| r.bytes).collect(),
            owner,
            entry_size,
        }
    }

    /// Assigns a bank to the picture in `slot`. `live` reports whether a slot still holds a
    /// picture whose motion vectors may be needed.
    pub fn assign(&mut self, slot: usize, live: impl Fn(usize) -> bool) -> Result<usize> {
        for owner in self.owner.iter_mut() {
            if let Some(s) = *owner {
                if s == slot || !live(s) {
                    *owner = None;
                }
            }
        }
        let bank = self
            .owner
            .iter()
            .position(Option::is_none)
            .ok_or(Cause::MvBufUnavailable)?;
        self.owner[bank] = Some(slot);
        Ok(bank)
    }

    pub fn bank_of(&self, slot: usize) -> Option<usize> {
        self.owner.iter().position(|&o| o == Some(slot))
    }

    /// Mutable motion vector entry of macroblock `mb` in `bank`.
    pub fn entry_mut(&mut self, bank: usize, mb: usize) -> &mut [u8] {
        let start = mb * self.entry_size;
        &mut self.banks[bank][start..start + self.entry_size]
    }

    /// Copies the co-located entry of `mb` from bank `from` into bank `to`.
    pub fn copy_entry(&mut self, from: usize, to: usize, mb: usize) {
        if from == to {
            return;
        }
        let range = mb * self.entry_size..(mb + 1) * self.entry_size;
        let (low, high) = self.banks.split_at_mut(from.max(to));
        let (src, dst) = if from < to {
            (&low[from], &mut high[0])
        } else {
            (&high[0], &mut low[to])
        };
        dst[range.clone()].copy_from_slice(&src[range]);
    }

    pub fn release_all(&mut self) {
        self.owner.iter_mut().for_each(|o| *o = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|_| Frame {
                planes: [
                    Plane::new(BytesMut::zeroed(64), 8, 0),
                    Plane::new(BytesMut::zeroed(16), 4, 0),
                    Plane::new(BytesMut::zeroed(16), 4, 0),
                ],
            })
            .collect()
    }

    fn bind_all(pool: &PicturePool, n: usize) -> usize {
        let buffers = (0..n)
            .map(|_| DisplayBuffer::new(vec![BytesMut::zeroed(64); 3]))
            .collect();
        pool.bind_host_frames(buffers, |internal, _| internal.clone())
    }

    #[test]
    fn holders_return_to_free() {
        let pool = PicturePool::new(frames(3), 2, false);
        let id = pool.find_free().unwrap();
        pool.acquire(id, Holders::IO).unwrap();
        pool.set_status(id, Holders::REFERENCE).unwrap();
        assert_eq!(pool.num_free(), 2);
        pool.release(id, Holders::IO).unwrap();
        assert_eq!(pool.holders(id).unwrap(), Holders::REFERENCE);
        pool.release(id, Holders::REFERENCE).unwrap();
        pool.release(id, Holders::REFERENCE).unwrap();
        assert_eq!(pool.num_free(), 3);
    }

    #[test]
    fn acquire_requires_free_slot() {
        let pool = PicturePool::new(frames(2), 2, false);
        pool.acquire(0, Holders::IO).unwrap();
        assert_eq!(
            pool.acquire(0, Holders::REFERENCE).unwrap_err().cause(),
            Cause::BufferManager
        );
        assert_eq!(
            pool.acquire(7, Holders::IO).unwrap_err().cause(),
            Cause::InvalidBufferId
        );
    }

    #[test]
    fn references_slide() {
        let pool = PicturePool::new(frames(4), 2, false);
        for _ in 0..3 {
            let id = pool.take_slot().unwrap();
            pool.mark_reference(id).unwrap();
            pool.release(id, Holders::IO).unwrap();
        }
        assert_eq!(pool.num_references(), 2);
        assert_eq!(
            pool.snapshot(),
            vec![
                Holders::empty(),
                Holders::REFERENCE,
                Holders::REFERENCE,
                Holders::empty()
            ]
        );
        assert_eq!(pool.latest_reference(), Some(2));
    }

    #[test]
    fn greedy_recycle_without_display() {
        let pool = PicturePool::new(frames(2), 4, false);
        for _ in 0..2 {
            let id = pool.take_slot().unwrap();
            pool.mark_reference(id).unwrap();
            pool.release(id, Holders::IO).unwrap();
        }
        assert!(pool.find_free().is_none());
        assert!(pool.can_take_slot());
        assert_eq!(pool.take_slot().unwrap(), 0);
        assert_eq!(pool.num_references(), 1);
    }

    #[test]
    fn failed_take_keeps_references() {
        let pool = PicturePool::new(frames(2), 2, false);
        for _ in 0..2 {
            let id = pool.take_slot().unwrap();
            pool.mark_reference(id).unwrap();
            pool.release(id, Holders::IO).unwrap();
            pool.queue_display(id).unwrap();
        }
        let before = pool.snapshot();
        assert!(!pool.can_take_slot());
        assert_eq!(
            pool.take_slot().unwrap_err().cause(),
            Cause::PictureBufferUnavailable
        );
        assert_eq!(pool.snapshot(), before);
        assert_eq!(pool.num_references(), 2);

        // Only the slot that becomes free loses its reference.
        assert_eq!(pool.pop_display(), Some(0));
        pool.release(0, Holders::DISPLAY).unwrap();
        assert_eq!(pool.pop_display(), Some(1));
        pool.release(1, Holders::DISPLAY).unwrap();
        assert_eq!(pool.take_slot().unwrap(), 0);
        assert_eq!(pool.latest_reference(), Some(1));
        assert_eq!(pool.num_references(), 1);
    }

    #[test]
    fn display_order_follows_presentation_key() {
        let pool = PicturePool::new(frames(4), 4, false);
        for (decode_order, poc) in [(0, 0), (1, 6), (2, 2), (3, 4)] {
            let id = pool.take_slot().unwrap();
            let info = PictureInfo {
                poc,
                decode_order,
                ..Default::default()
            };
            pool.set_info(id, info).unwrap();
            pool.queue_display(id).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| pool.pop_display()).collect();
        assert_eq!(order, vec![0, 2, 3, 1]);
    }

    #[test]
    fn new_epoch_displays_after_old_pictures() {
        let pool = PicturePool::new(frames(2), 2, false);
        for (epoch, poc) in [(0, 8), (1, 0)] {
            let id = pool.take_slot().unwrap();
            let info = PictureInfo {
                poc,
                epoch,
                ..Default::default()
            };
            pool.set_info(id, info).unwrap();
            pool.queue_display(id).unwrap();
        }
        assert_eq!(pool.pop_display(), Some(0));
        assert_eq!(pool.pop_display(), Some(1));
        assert_eq!(pool.pop_display(), None);
    }

    #[test]
    fn shared_slots_need_bindings() {
        let pool = PicturePool::new(frames(3), 2, true);
        assert!(pool.find_free().is_none());
        assert_eq!(bind_all(&pool, 5), 3);
        // Bound buffers start out held by the host.
        assert_eq!(
            pool.take_slot().unwrap_err().cause(),
            Cause::ReferenceBufferUnavailable
        );
        pool.release_display(1).unwrap();
        assert_eq!(pool.take_slot().unwrap(), 1);
    }

    #[test]
    fn release_display_is_idempotent_and_keeps_references() {
        let pool = PicturePool::new(frames(2), 2, true);
        bind_all(&pool, 2);
        pool.release_display(0).unwrap();
        let id = pool.take_slot().unwrap();
        pool.mark_reference(id).unwrap();
        pool.release(id, Holders::IO).unwrap();
        pool.queue_display(id).unwrap();
        assert_eq!(pool.pop_display(), Some(id));
        pool.release_display(id).unwrap();
        assert_eq!(pool.holders(id).unwrap(), Holders::REFERENCE);
        pool.release_display(id).unwrap();
        assert_eq!(pool.holders(id).unwrap(), Holders::REFERENCE);
        assert_eq!(
            pool.release_display(9).unwrap_err().cause(),
            Cause::InvalidBufferId
        );
    }

    #[test]
    fn release_display_ignored_without_sharing() {
        let pool = PicturePool::new(frames(2), 2, false);
        pool.acquire(0, Holders::DISPLAY).unwrap();
        pool.release_display(0).unwrap();
        assert_eq!(pool.holders(0).unwrap(), Holders::DISPLAY);
        pool.release_display(9).unwrap();
    }

    #[test]
    fn decoder_holders_released_host_holders_kept() {
        let pool = PicturePool::new(frames(3), 2, true);
        bind_all(&pool, 3);
        pool.release_display(0).unwrap();
        pool.release_display(1).unwrap();
        let a = pool.take_slot().unwrap();
        pool.mark_reference(a).unwrap();
        pool.queue_display(a).unwrap();
        let b = pool.take_slot().unwrap();
        pool.release_decoder_holders();
        assert_eq!(pool.holders(a).unwrap(), Holders::empty());
        assert_eq!(pool.holders(b).unwrap(), Holders::empty());
        assert_eq!(pool.holders(2).unwrap(), Holders::DISPLAY);
        assert_eq!(pool.queued_len(), 0);
        assert_eq!(pool.num_references(), 0);
    }

    #[test]
    fn capacity_is_conserved() {
        let pool = PicturePool::new(frames(4), 2, false);
        let mut taken = Vec::new();
        for _ in 0..4 {
            let id = pool.take_slot().unwrap();
            taken.push(id);
            let held = pool.snapshot().iter().filter(|h| !h.is_empty()).count();
            assert_eq!(held + pool.num_free(), pool.capacity());
        }
        for id in taken {
            pool.release(id, Holders::IO).unwrap();
        }
        assert_eq!(pool.num_free(), 4);
    }

    #[test]
    fn frame_from_region_splits_planes() {
        use crate::config::Codec;
        use crate::config::DecoderConfig;
        use crate::negotiate::Requirements;

        let req = Requirements::resolve(&DecoderConfig::new(Codec::Mpeg2, 32, 32)).unwrap();
        let region = Region {
            addr: 0x1000,
            bytes: BytesMut::zeroed(req.frame.size as usize),
        };
        let frame = Frame::from_region(region, &req.frame);
        assert_eq!(frame.planes[0].data.lock().len(), 1024);
        assert_eq!(frame.planes[1].data.lock().len(), 256);
        assert_eq!(frame.planes[2].stride, 16);
    }

    #[test]
    fn mv_banks_follow_live_pictures() {
        let regions = (0..2)
            .map(|i| Region {
                addr: i * 0x100,
                bytes: BytesMut::zeroed(64),
            })
            .collect();
        let mut banks = MotionVectorBanks::new(regions, 16);
        assert_eq!(banks.assign(0, |_| true).unwrap(), 0);
        assert_eq!(banks.assign(1, |_| true).unwrap(), 1);
        assert_eq!(
            banks.assign(2, |_| true).unwrap_err().cause(),
            Cause::MvBufUnavailable
        );
        assert_eq!(banks.assign(2, |s| s != 0).unwrap(), 0);
        banks.entry_mut(1, 2)[0] = 9;
        banks.copy_entry(1, 0, 2);
        assert_eq!(banks.entry_mut(0, 2)[0], 9);
        assert_eq!(banks.bank_of(2), Some(0));
    }
}
