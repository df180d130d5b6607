// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The memory manager (CS2): a region/free-block-list allocator over RAM
//! capabilities, with first-fit allocation, split-on-alloc, and
//! coalesce-on-free.
//!
//! Each [`MemoryManager::add`] call registers one RAM capability as a
//! region; `alloc_aligned` walks every region's free-block list for the
//! first block that can satisfy the request once aligned, splitting off
//! an alignment-hole block when the match isn't already aligned and a
//! leftover block when it's larger than needed. `free` does the reverse:
//! delete the capability, then merge the freed range with whichever free
//! neighbor(s) it now abuts.
//!
//! Free-block records come from a [`substrate_slab::Slab`] rather than
//! the general heap: this allocator is frequently invoked from a page
//! fault handler (see the paging layer built on top of it), and a
//! dedicated, low-water-refilled slab keeps that path from depending on
//! the general allocator's own bookkeeping.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use num_enum::{FromPrimitive, IntoPrimitive};
use substrate_kernel_sys::{Capref, Invocation, KernelError, SyscallGate};
use substrate_slab::Slab;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum MmError {
    NotEnoughMemory = 0,
    InvalidAlignment,
    SlotAllocFailed,
    /// There is free memory, but none of it fits within the requested
    /// `[base, limit]` range once aligned.
    AllocConstraints,
    /// The requested `[base, limit]` range is not a valid range at all
    /// (`base > limit`).
    OutOfBounds,
    Kernel,
    #[num_enum(default)]
    Unknown,
}

impl From<KernelError> for MmError {
    fn from(_: KernelError) -> Self { MmError::Kernel }
}

/// Supplies a CSpace slot to hold the capability produced by retyping a
/// carved-off range of a region. Implemented by the slot allocator (CS1);
/// kept as a trait to avoid a circular crate dependency between the two.
pub trait SlotSource {
    fn alloc_slot(&mut self) -> Option<Capref>;
    fn free_slot(&mut self, cap: Capref);
}

struct Block {
    base: usize,
    bytes: usize,
}

struct Region {
    cap: Capref,
    base: usize,
    bytes: usize,
}

const fn align_up(v: usize, align: usize) -> usize { (v + align - 1) & !(align - 1) }

pub struct MemoryManager<S: SlotSource> {
    regions: Vec<Region>,
    /// (region index, free-block handle), unordered across regions but
    /// the scan order matches `mm_alloc_aligned`'s region-then-free-list
    /// walk closely enough to preserve first-fit behavior.
    free: Vec<(usize, NonNull<Block>)>,
    block_slab: Slab<Block>,
    refilling_slab: bool,
    mem_total: usize,
    mem_available: usize,
    gate: &'static dyn SyscallGate,
    slots: S,
}

// SAFETY: all NonNull<Block> handles are allocated from `block_slab` and
// never escape this type or alias mutable data external to it.
unsafe impl<S: SlotSource> Send for MemoryManager<S> {}

impl<S: SlotSource> MemoryManager<S> {
    pub fn new(gate: &'static dyn SyscallGate, slots: S) -> Self {
        let mut block_slab = Slab::new(32);
        block_slab.grow();
        MemoryManager {
            regions: Vec::new(),
            free: Vec::new(),
            block_slab,
            refilling_slab: false,
            mem_total: 0,
            mem_available: 0,
            gate,
            slots,
        }
    }

    pub fn mem_total(&self) -> usize { self.mem_total }
    pub fn mem_available(&self) -> usize { self.mem_available }

    /// Returns the `(base, size)` of the single largest free range, or
    /// `None` if there is no free memory at all.
    pub fn mem_get_free_range(&self) -> Option<(usize, usize)> {
        self.free
            .iter()
            .map(|(_, b)| unsafe { (b.as_ref().base, b.as_ref().bytes) })
            .max_by_key(|&(_, bytes)| bytes)
    }

    /// Registers `cap`, a RAM capability covering `[base, base+bytes)`,
    /// as a new region the allocator can carve blocks out of.
    pub fn add(&mut self, cap: Capref, base: usize, bytes: usize) {
        let region_idx = self.regions.len();
        self.regions.push(Region { cap, base, bytes });
        self.push_free_block(region_idx, base, bytes);
        self.mem_total += bytes;
        self.mem_available += bytes;
        self.try_refill_slab();
    }

    fn push_free_block(&mut self, region_idx: usize, base: usize, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let ptr = self.block_slab.alloc().unwrap_or_else(|| {
            self.block_slab.grow();
            self.block_slab.alloc().expect("substrate-mm: slab exhausted after grow")
        });
        unsafe { ptr.as_ptr().write(Block { base, bytes }) };
        self.free.push((region_idx, ptr));
    }

    fn try_refill_slab(&mut self) {
        if self.refilling_slab || self.block_slab.free() > 4 {
            return;
        }
        self.refilling_slab = true;
        self.block_slab.grow();
        self.refilling_slab = false;
    }

    /// Allocates `bytes` aligned to `align` (a power of two), splitting
    /// the first free block that fits once aligned. Returns the new
    /// capability and the (possibly padded-past) base address it covers.
    ///
    /// Thin wrapper over [`Self::alloc_from_range_aligned`] with no range
    /// constraint, matching the original's own `mm_alloc_aligned` ->
    /// `mm_alloc_from_range_aligned(0, -1, ...)` delegation.
    pub fn alloc_aligned(&mut self, bytes: usize, align: usize) -> Result<(Capref, usize), MmError> {
        self.alloc_from_range_aligned(0, usize::MAX, bytes, align)
    }

    /// Allocates `bytes` aligned to `align` (a power of two) from a free
    /// block whose aligned base address falls within `[base, limit]`,
    /// splitting the first such block that fits. Returns the new
    /// capability and the (possibly padded-past) base address it covers.
    pub fn alloc_from_range_aligned(
        &mut self,
        base: usize,
        limit: usize,
        bytes: usize,
        align: usize,
    ) -> Result<(Capref, usize), MmError> {
        if bytes == 0 || align == 0 || (align & (align - 1)) != 0 {
            return Err(MmError::InvalidAlignment);
        }
        if base > limit {
            return Err(MmError::OutOfBounds);
        }
        if self.mem_available < bytes {
            return Err(MmError::NotEnoughMemory);
        }
        let pos = self.free.iter().position(|&(_, b)| {
            let blk = unsafe { b.as_ref() };
            let aligned = align_up(blk.base, align);
            aligned >= base && aligned <= limit && aligned - blk.base + bytes <= blk.bytes
        });
        let (free_idx, (region_idx, blk_ptr)) = match pos {
            Some(i) => (i, self.free[i]),
            None => return Err(MmError::AllocConstraints),
        };
        let (base, total) = unsafe { (blk_ptr.as_ref().base, blk_ptr.as_ref().bytes) };
        let aligned_base = align_up(base, align);
        let pad = aligned_base - base;
        let leftover = total - pad - bytes;

        // Consumed entirely: drop from the free list.
        self.free.remove(free_idx);
        if pad > 0 {
            // The alignment hole in front stays free.
            unsafe { blk_ptr.as_ptr().write(Block { base, bytes: pad }) };
            self.free.push((region_idx, blk_ptr));
        } else {
            unsafe { self.block_slab.dealloc(blk_ptr) };
        }
        if leftover > 0 {
            self.push_free_block(region_idx, aligned_base + bytes, leftover);
        }

        let region = &self.regions[region_idx];
        let slot = self.slots.alloc_slot().ok_or(MmError::SlotAllocFailed)?;
        let offset = aligned_base - region.base;
        let (_, err) = self.gate.invoke(
            Invocation::Retype,
            slot,
            &[region.cap.root, region.cap.cnode, region.cap.slot, offset, bytes],
        );
        let result: Result<(), KernelError> = err.into();
        if let Err(e) = result {
            self.slots.free_slot(slot);
            // Roll back: re-merge the carved range back into the free list.
            self.push_free_block(region_idx, aligned_base, bytes);
            return Err(e.into());
        }
        self.mem_available -= bytes;
        self.try_refill_slab();
        Ok((slot, aligned_base))
    }

    /// Finds the region owning `base`, deletes `cap`, and returns the
    /// range to the free list, merging with whichever free neighbor(s)
    /// now abut it.
    pub fn free(&mut self, cap: Capref, base: usize, bytes: usize) -> Result<(), MmError> {
        let region_idx = self
            .regions
            .iter()
            .position(|r| base >= r.base && base + bytes <= r.base + r.bytes)
            .ok_or(MmError::NotEnoughMemory)?;

        let (_, err) = self.gate.invoke(Invocation::Delete, cap, &[]);
        let result: Result<(), KernelError> = err.into();
        result?;

        // Look for a predecessor (ends exactly at `base`) and a successor
        // (starts exactly at `base+bytes`) among this region's free blocks.
        let mut pred_idx = None;
        let mut succ_idx = None;
        for (i, &(idx, b)) in self.free.iter().enumerate() {
            if idx != region_idx {
                continue;
            }
            let blk = unsafe { b.as_ref() };
            if blk.base + blk.bytes == base {
                pred_idx = Some(i);
            } else if base + bytes == blk.base {
                succ_idx = Some(i);
            }
        }

        match (pred_idx, succ_idx) {
            (Some(pi), Some(si)) => {
                let succ_bytes = unsafe { self.free[si].1.as_ref().bytes };
                let pred_ptr = self.free[pi].1;
                unsafe { (*pred_ptr.as_ptr()).bytes += bytes + succ_bytes };
                // Remove the (now absorbed) successor block.
                let (_, succ_ptr) = self.free.remove(si);
                unsafe { self.block_slab.dealloc(succ_ptr) };
            }
            (Some(pi), None) => {
                unsafe { (*self.free[pi].1.as_ptr()).bytes += bytes };
            }
            (None, Some(si)) => {
                let blk = self.free[si].1;
                unsafe {
                    let b = &mut *blk.as_ptr();
                    b.base = base;
                    b.bytes += bytes;
                }
            }
            (None, None) => {
                self.push_free_block(region_idx, base, bytes);
            }
        }

        self.mem_available += bytes;
        self.try_refill_slab();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_kernel_sys::{Invocation, KernelError};

    struct FakeGate;
    impl SyscallGate for FakeGate {
        fn invoke(&self, _op: Invocation, _target: Capref, _args: &[usize]) -> (usize, KernelError) {
            (0, KernelError::NoError)
        }
    }
    static GATE: FakeGate = FakeGate;

    struct FakeSlots {
        next: usize,
    }
    impl SlotSource for FakeSlots {
        fn alloc_slot(&mut self) -> Option<Capref> {
            self.next += 1;
            Some(Capref { root: 1, cnode: 1, slot: self.next, depth: 32 })
        }
        fn free_slot(&mut self, _cap: Capref) {}
    }

    fn region_cap() -> Capref { Capref { root: 1, cnode: 1, slot: 1, depth: 32 } }

    #[test]
    fn alloc_then_free_restores_available() {
        let mut mm = MemoryManager::new(&GATE, FakeSlots { next: 1000 });
        mm.add(region_cap(), 0x1000, 0x10000);
        assert_eq!(mm.mem_available(), 0x10000);

        let (cap, base) = mm.alloc_aligned(0x1000, 0x1000).unwrap();
        assert_eq!(base, 0x1000);
        assert_eq!(mm.mem_available(), 0x10000 - 0x1000);

        mm.free(cap, base, 0x1000).unwrap();
        assert_eq!(mm.mem_available(), 0x10000);
        assert_eq!(mm.mem_get_free_range(), Some((0x1000, 0x10000)));
    }

    #[test]
    fn alloc_splits_alignment_hole_and_leftover() {
        let mut mm = MemoryManager::new(&GATE, FakeSlots { next: 1000 });
        mm.add(region_cap(), 0x1004, 0x10000);
        let (_cap, base) = mm.alloc_aligned(0x100, 0x1000).unwrap();
        assert_eq!(base, 0x2000);
        // Alignment hole [0x1004,0x2000) and leftover after the allocation
        // should both still be free, summing to total minus the alloc.
        assert_eq!(mm.mem_available(), 0x10000 - 0x100);
    }

    #[test]
    fn coalesces_adjacent_frees() {
        let mut mm = MemoryManager::new(&GATE, FakeSlots { next: 1000 });
        mm.add(region_cap(), 0x0, 0x4000);
        let (c1, b1) = mm.alloc_aligned(0x1000, 0x1000).unwrap();
        let (c2, b2) = mm.alloc_aligned(0x1000, 0x1000).unwrap();
        assert_eq!(b2, b1 + 0x1000);
        mm.free(c1, b1, 0x1000).unwrap();
        mm.free(c2, b2, 0x1000).unwrap();
        // Both freed ranges plus the untouched remainder should merge into
        // one contiguous block spanning the whole region again.
        assert_eq!(mm.mem_get_free_range(), Some((0x0, 0x4000)));
    }

    #[test]
    fn out_of_memory_when_nothing_fits() {
        let mut mm = MemoryManager::new(&GATE, FakeSlots { next: 1000 });
        mm.add(region_cap(), 0x0, 0x1000);
        assert_eq!(mm.alloc_aligned(0x2000, 0x1000), Err(MmError::NotEnoughMemory));
    }

    #[test]
    fn range_bounded_alloc_rejects_blocks_outside_the_window() {
        let mut mm = MemoryManager::new(&GATE, FakeSlots { next: 1000 });
        mm.add(region_cap(), 0x1000, 0x10000);
        // There is plenty of free memory, but none of it starts within
        // [0x2000, 0x2fff].
        assert_eq!(
            mm.alloc_from_range_aligned(0x2000, 0x2fff, 0x1000, 0x1000),
            Err(MmError::AllocConstraints)
        );
        // A window that does cover the region succeeds.
        let (_cap, base) = mm.alloc_from_range_aligned(0x1000, 0x20000, 0x1000, 0x1000).unwrap();
        assert_eq!(base, 0x1000);
    }

    #[test]
    fn range_bounded_alloc_rejects_inverted_range() {
        let mut mm = MemoryManager::new(&GATE, FakeSlots { next: 1000 });
        mm.add(region_cap(), 0x0, 0x1000);
        assert_eq!(mm.alloc_from_range_aligned(0x2000, 0x1000, 0x100, 0x100), Err(MmError::OutOfBounds));
    }
}
