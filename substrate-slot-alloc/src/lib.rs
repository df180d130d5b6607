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

//! The shared-CSpace slot allocator (CS1): a two-tier, ping-pong L2-CNode
//! allocator with lazy refill.
//!
//! A domain's CSpace is a tree of CNodes; this allocator hands out slots
//! in leaf (L2) CNodes one at a time, bump-allocator style, and refills by
//! retyping a fresh chunk of untyped/RAM memory into a brand new L2 CNode
//! once the current one is exhausted. Because building a new L2 CNode
//! requires both a RAM capability (from the memory manager) *and* a root
//! CNode slot to hold the new L2 CNode's own capability, and the memory
//! manager in turn needs CSpace slots for its own bookkeeping, the two
//! allocators can call into each other. Two tiers (`meta[0]`/`meta[1]`)
//! broken by a reentrancy guard (`refilling`) is what keeps that mutual
//! recursion from looping forever: initialization pre-seeds both tiers,
//! so ordinary allocation never needs to refill while a refill for the
//! *other* tier is already in flight.
#![cfg_attr(not(test), no_std)]

use substrate_kernel_sys::{Capref, Invocation, KernelError, SyscallGate};

pub type CPtr = usize;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAllocError {
    NoSpace,
    RootSlotExhausted,
    Kernel(KernelError),
}

impl From<KernelError> for SlotAllocError {
    fn from(e: KernelError) -> Self { SlotAllocError::Kernel(e) }
}

/// Supplies RAM capabilities to back a new L2 CNode. Implemented by the
/// memory manager; kept as a trait (rather than a direct crate
/// dependency) so the two allocators can refer to each other without a
/// circular `Cargo.toml` dependency -- the owning component wires them
/// together at startup.
pub trait RamSource {
    fn alloc_ram(&mut self, bytes: usize) -> Result<Capref, SlotAllocError>;
    fn free_ram(&mut self, cap: Capref);
}

/// Supplies a free slot in the root CNode to hold a new L2 CNode's own
/// capability. Growing the root CNode itself when this runs out is a
/// kernel-specific, rare operation this allocator does not implement;
/// `alloc_root_slot` returning `None` surfaces as
/// [`SlotAllocError::RootSlotExhausted`].
pub trait RootSlotSource {
    fn alloc_root_slot(&mut self) -> Option<CPtr>;
    fn free_root_slot(&mut self, slot: CPtr);
}

#[derive(Debug, Clone, Copy, Default)]
struct Meta {
    /// The L2 CNode backing this tier, once refilled.
    cnode: Capref,
    /// Slots already bump-allocated out of this tier.
    used: usize,
    /// Total slot capacity of this tier's L2 CNode.
    space: usize,
}

/// A two-tier, lazily-refilling slot allocator over L2 CNodes of a fixed
/// `slots_per_cnode` size.
pub struct SlotAllocator {
    meta: [Meta; 2],
    current: usize,
    refilling: bool,
    slots_per_cnode: usize,
    root: Capref,
    gate: &'static dyn SyscallGate,
}

impl SlotAllocator {
    /// Creates an allocator with both tiers empty; call `init` before use.
    pub fn new(root: Capref, gate: &'static dyn SyscallGate, slots_per_cnode: usize) -> Self {
        SlotAllocator {
            meta: [Meta::default(); 2],
            current: 0,
            refilling: false,
            slots_per_cnode,
            root,
            gate,
        }
    }

    /// Pre-seeds both tiers. Must be called once before `alloc`/`free`;
    /// this is what lets the very first allocation from either this
    /// allocator or its `RamSource` succeed without recursing through an
    /// empty tier.
    pub fn init(
        &mut self,
        ram: &mut impl RamSource,
        root_slots: &mut impl RootSlotSource,
    ) -> Result<(), SlotAllocError> {
        self.refill(0, ram, root_slots)?;
        self.refill(1, ram, root_slots)?;
        Ok(())
    }

    fn l2_cnode_bytes(&self) -> usize {
        // A conservative per-slot byte cost; real sizing is kernel/arch
        // specific and supplied by the caller's memory layout constants.
        self.slots_per_cnode * core::mem::size_of::<usize>() * 4
    }

    fn refill(
        &mut self,
        tier: usize,
        ram: &mut impl RamSource,
        root_slots: &mut impl RootSlotSource,
    ) -> Result<(), SlotAllocError> {
        if self.refilling {
            // Another refill (of the other tier, or of our own RamSource
            // calling back into us) is already in flight; the pre-seeded
            // tier carries the load until it unwinds.
            return Ok(());
        }
        self.refilling = true;
        let result = (|| {
            let ram_cap = ram.alloc_ram(self.l2_cnode_bytes())?;
            let root_slot = root_slots.alloc_root_slot().ok_or(SlotAllocError::RootSlotExhausted)?;
            let l2cnode = Capref { root: self.root.root, cnode: self.root.cnode, slot: root_slot, depth: self.root.depth };
            let (_, err) = self.gate.invoke(
                Invocation::Retype,
                l2cnode,
                &[ram_cap.root, ram_cap.cnode, ram_cap.slot, self.slots_per_cnode],
            );
            let result: Result<(), KernelError> = err.into();
            if let Err(e) = result {
                root_slots.free_root_slot(root_slot);
                ram.free_ram(ram_cap);
                return Err(SlotAllocError::Kernel(e));
            }
            self.meta[tier] = Meta { cnode: l2cnode, used: 0, space: self.slots_per_cnode };
            Ok(())
        })();
        self.refilling = false;
        result
    }

    /// Bump-allocates `count` contiguous slots from the current tier,
    /// flipping to the other tier (and triggering its refill) when the
    /// current one can't satisfy the request.
    pub fn alloc(
        &mut self,
        count: usize,
        ram: &mut impl RamSource,
        root_slots: &mut impl RootSlotSource,
    ) -> Result<Capref, SlotAllocError> {
        if self.meta[0].space + self.meta[1].space - self.meta[0].used - self.meta[1].used < count {
            return Err(SlotAllocError::NoSpace);
        }
        if self.meta[self.current].used + count > self.meta[self.current].space {
            self.current = 1 - self.current;
        }
        let m = &mut self.meta[self.current];
        let offset = m.used;
        m.used += count;
        let cnode = m.cnode;
        let flipped_is_low = self.meta[1 - self.current].used >= self.meta[1 - self.current].space;
        if flipped_is_low {
            let other = 1 - self.current;
            self.refill(other, ram, root_slots)?;
        }
        Ok(Capref { root: cnode.root, cnode: cnode.slot, slot: offset, depth: cnode.depth })
    }

    /// Frees `cap` if (and only if) it is the most-recently-allocated
    /// slot range of the current tier -- a bump allocator can undo its
    /// last allocation but cannot reclaim an arbitrary earlier one.
    /// Anything else is intentionally leaked, matching the allocator it
    /// is modeled on: slots are cheap and the CSpace is large relative to
    /// the lifetime of most allocations.
    pub fn free(&mut self, cap: Capref, count: usize) {
        let m = &mut self.meta[self.current];
        if cap.cnode == m.cnode.slot && cap.slot + count == m.used {
            m.used -= count;
        }
    }

    pub fn used_slots(&self) -> usize { self.meta[0].used + self.meta[1].used }
    pub fn total_space(&self) -> usize { self.meta[0].space + self.meta[1].space }
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

    struct FakeRam {
        next_slot: usize,
    }
    impl RamSource for FakeRam {
        fn alloc_ram(&mut self, _bytes: usize) -> Result<Capref, SlotAllocError> {
            self.next_slot += 1;
            Ok(Capref { root: 1, cnode: 1, slot: self.next_slot, depth: 32 })
        }
        fn free_ram(&mut self, _cap: Capref) {}
    }

    struct FakeRootSlots {
        next: CPtr,
    }
    impl RootSlotSource for FakeRootSlots {
        fn alloc_root_slot(&mut self) -> Option<CPtr> {
            self.next += 1;
            Some(self.next)
        }
        fn free_root_slot(&mut self, _slot: CPtr) {}
    }

    fn make() -> (SlotAllocator, FakeRam, FakeRootSlots) {
        let root = Capref { root: 1, cnode: 0, slot: 0, depth: 32 };
        (SlotAllocator::new(root, &GATE, 16), FakeRam { next_slot: 100 }, FakeRootSlots { next: 200 })
    }

    #[test]
    fn init_seeds_both_tiers() {
        let (mut sa, mut ram, mut root) = make();
        sa.init(&mut ram, &mut root).unwrap();
        assert_eq!(sa.total_space(), 32);
        assert_eq!(sa.used_slots(), 0);
    }

    #[test]
    fn alloc_flips_tier_and_refills_the_other() {
        let (mut sa, mut ram, mut root) = make();
        sa.init(&mut ram, &mut root).unwrap();
        for _ in 0..16 {
            sa.alloc(1, &mut ram, &mut root).unwrap();
        }
        // Tier 0 exhausted; next alloc flips to tier 1 and its space grows
        // again once a fresh tier 0 gets queued behind it.
        let cap = sa.alloc(1, &mut ram, &mut root).unwrap();
        assert_eq!(cap.slot, 0);
    }

    #[test]
    fn free_of_last_allocation_is_reclaimed() {
        let (mut sa, mut ram, mut root) = make();
        sa.init(&mut ram, &mut root).unwrap();
        let used_before = sa.used_slots();
        let cap = sa.alloc(1, &mut ram, &mut root).unwrap();
        assert_eq!(sa.used_slots(), used_before + 1);
        sa.free(cap, 1);
        assert_eq!(sa.used_slots(), used_before);
    }

    #[test]
    fn free_of_non_tail_allocation_leaks_silently() {
        let (mut sa, mut ram, mut root) = make();
        sa.init(&mut ram, &mut root).unwrap();
        let first = sa.alloc(1, &mut ram, &mut root).unwrap();
        let _second = sa.alloc(1, &mut ram, &mut root).unwrap();
        let used_before = sa.used_slots();
        sa.free(first, 1); // not the tail allocation; silently leaked
        assert_eq!(sa.used_slots(), used_before);
    }
}
