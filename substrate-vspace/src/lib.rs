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

//! A domain's virtual address space (CS3): a four-level page-table shadow
//! tree mirroring the kernel's own, plus a tree of free and allocated
//! virtual-address ranges so `alloc`/`map`/`unmap` can hand out and
//! reclaim address ranges without ever asking the kernel "what's free".
//!
//! The range tree reuses [`substrate_rbtree::RbTree`] with a trick
//! borrowed whole from the layer this is grounded on: a node's `size`
//! field doubles as an allocated/free tag. A zero-size node is a
//! boundary marker -- the allocated range it opens runs from its `start`
//! to the `start` of its in-order successor. Freeing an allocation looks
//! up that marker, recomputes its size from the successor, and then
//! coalesces with whichever free neighbor(s) now abut it.
//!
//! Page-table nodes live in a [`substrate_slab::Slab`] for the same
//! reason free-block records do in the memory manager built on top of
//! this layer: `try_map`'s lazy fault path must be able to grow its own
//! bookkeeping without assuming the general heap is safe to touch from
//! fault context.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::boxed::Box;
use core::ptr::NonNull;
use num_enum::{FromPrimitive, IntoPrimitive};
use substrate_kernel_sys::{
    config::{BASE_PAGE_SIZE, PTABLE_NUM_ENTRIES},
    Capref, Invocation, KernelError, ObjType, SyscallGate,
};
use substrate_rbtree::RbTree;
use substrate_slab::Slab;

pub const VREGION_FLAGS_READ: u32 = 0x01;
pub const VREGION_FLAGS_WRITE: u32 = 0x02;
pub const VREGION_FLAGS_EXECUTE: u32 = 0x04;
pub const VREGION_FLAGS_NOCACHE: u32 = 0x08;
pub const VREGION_FLAGS_READ_WRITE: u32 = VREGION_FLAGS_READ | VREGION_FLAGS_WRITE;
pub const VREGION_FLAGS_READ_EXECUTE: u32 = VREGION_FLAGS_READ | VREGION_FLAGS_EXECUTE;

const LEVEL_BITS: u32 = 9;
const PAGE_BITS: u32 = 12;

/// `try_refill_va` tops the VA tree's node headroom back up once free
/// capacity drops to or below this, mirroring `node_slab`'s own
/// low-water refill threshold.
const VA_NODE_LOW_WATER: usize = 4;
/// Capacity `reserve`d per VA-tree refill -- splitting or coalescing one
/// range never needs more than a couple of fresh nodes.
const VA_NODE_HEADROOM: usize = 8;

fn index_at(vaddr: usize, level: Level) -> usize {
    let shift = PAGE_BITS + LEVEL_BITS * (3 - level as u32);
    (vaddr >> shift) & (PTABLE_NUM_ENTRIES - 1)
}

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum VSpaceError {
    OutOfVirtualAddr = 0,
    BadAlignment,
    NotFound,
    SlotAllocFailed,
    Kernel,
    #[num_enum(default)]
    Unknown,
}

impl From<KernelError> for VSpaceError {
    fn from(_: KernelError) -> Self { VSpaceError::Kernel }
}

/// Supplies CSpace slots and backing frames the paging layer cannot get
/// from anywhere else without depending directly on the slot allocator
/// and memory manager crates (which would in turn have to depend back on
/// this one to learn how a page fault needs a frame). Glue code at a
/// higher layer wires concrete implementations of both together.
pub trait PagingBackend {
    fn alloc_slot(&mut self) -> Result<Capref, VSpaceError>;
    fn free_slot(&mut self, cap: Capref);
    /// Allocates and returns a fresh frame capability covering at least
    /// `bytes`, used only by `try_map`'s lazy fault-driven path (eager
    /// mappings are handed an already-allocated frame by the caller).
    fn alloc_frame(&mut self, bytes: usize) -> Result<Capref, VSpaceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
}
impl Level {
    fn child(self) -> Option<Level> {
        match self {
            Level::L0 => Some(Level::L1),
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => None,
        }
    }
    fn obj_type(self) -> ObjType {
        match self {
            Level::L0 => ObjType::VNodeL0,
            Level::L1 => ObjType::VNodeL1,
            Level::L2 => ObjType::VNodeL2,
            Level::L3 => ObjType::VNodeL3,
        }
    }
}

enum Entries {
    Intermediate(Box<[Option<NonNull<PageTableNode>>; PTABLE_NUM_ENTRIES]>),
    Leaf(Box<[Option<Capref>; PTABLE_NUM_ENTRIES]>),
}

struct PageTableNode {
    level: Level,
    table_cap: Capref,
    mapping_cap: Capref,
    entries: Entries,
    lazy: [bool; PTABLE_NUM_ENTRIES],
    num_children: u32,
    /// `(parent, index)` this node occupies in its parent's `Intermediate`
    /// array -- `None` only for the L0 root, which has no parent and is
    /// never a reclamation candidate.
    parent: Option<(NonNull<PageTableNode>, usize)>,
}

impl PageTableNode {
    fn new_root(level: Level, table_cap: Capref) -> Self {
        PageTableNode {
            level,
            table_cap,
            mapping_cap: Capref::NULL,
            entries: Entries::Intermediate(Box::new([None; PTABLE_NUM_ENTRIES])),
            lazy: [false; PTABLE_NUM_ENTRIES],
            num_children: 0,
            parent: None,
        }
    }

    fn new_child(level: Level, table_cap: Capref, mapping_cap: Capref, parent: NonNull<PageTableNode>, index: usize) -> Self {
        let entries = if level == Level::L3 {
            Entries::Leaf(Box::new([None; PTABLE_NUM_ENTRIES]))
        } else {
            Entries::Intermediate(Box::new([None; PTABLE_NUM_ENTRIES]))
        };
        PageTableNode {
            level,
            table_cap,
            mapping_cap,
            entries,
            lazy: [false; PTABLE_NUM_ENTRIES],
            num_children: 0,
            parent: Some((parent, index)),
        }
    }
}

/// A domain's virtual address space: page-table shadow tree plus the
/// range allocator tracking which virtual addresses are free.
pub struct VSpace<B: PagingBackend> {
    l0: NonNull<PageTableNode>,
    node_slab: Slab<PageTableNode>,
    refilling_slab: bool,
    va: RbTree,
    /// Independent of `refilling_slab`: a fault that needs to grow the VA
    /// tree's node storage must not be blocked on (or re-enter through)
    /// the page-table slab's own refill, and vice versa.
    refilling_va: bool,
    gate: &'static dyn SyscallGate,
    backend: B,
}

// SAFETY: every NonNull<PageTableNode> handle is allocated from
// `node_slab` and never escapes this type.
unsafe impl<B: PagingBackend> Send for VSpace<B> {}

impl<B: PagingBackend> VSpace<B> {
    pub fn new(gate: &'static dyn SyscallGate, backend: B, root_vnode: Capref, start_vaddr: usize) -> Self {
        let mut node_slab = Slab::new(16);
        node_slab.grow();
        let l0_ptr = node_slab.alloc().expect("fresh slab has room for the root page table");
        unsafe { l0_ptr.as_ptr().write(PageTableNode::new_root(Level::L0, root_vnode)) };

        let mut va = RbTree::new();
        va.reserve(VA_NODE_HEADROOM);
        va.insert(start_vaddr, usize::MAX - start_vaddr);

        VSpace { l0: l0_ptr, node_slab, refilling_slab: false, va, refilling_va: false, gate, backend }
    }

    fn try_refill_slab(&mut self) {
        if self.refilling_slab || self.node_slab.free() > 4 {
            return;
        }
        self.refilling_slab = true;
        self.node_slab.grow();
        self.refilling_slab = false;
    }

    fn try_refill_va(&mut self) {
        if self.refilling_va || self.va.free_capacity() > VA_NODE_LOW_WATER {
            return;
        }
        self.refilling_va = true;
        self.va.reserve(VA_NODE_HEADROOM);
        self.refilling_va = false;
    }

    fn node<'a>(ptr: NonNull<PageTableNode>) -> &'a PageTableNode { unsafe { ptr.as_ref() } }
    fn node_mut<'a>(mut ptr: NonNull<PageTableNode>) -> &'a mut PageTableNode { unsafe { ptr.as_mut() } }

    /// Walks from `parent` to its child table covering `vaddr`, creating
    /// (and installing in the kernel) the child if it's missing.
    fn get_or_create_child(&mut self, parent: NonNull<PageTableNode>, vaddr: usize) -> Result<NonNull<PageTableNode>, VSpaceError> {
        let level = Self::node(parent).level;
        let child_level = level.child().expect("get_or_create_child called on an L3 node");
        let index = index_at(vaddr, level);

        let existing = match &Self::node(parent).entries {
            Entries::Intermediate(children) => children[index],
            Entries::Leaf(_) => unreachable!("intermediate walk over a leaf node"),
        };
        if let Some(child) = existing {
            return Ok(child);
        }

        let table_cap = self.backend.alloc_slot()?;
        let (_, err) = self.gate.invoke(Invocation::Retype, table_cap, &[child_level.obj_type().into()]);
        let result: Result<(), KernelError> = err.into();
        if let Err(e) = result {
            self.backend.free_slot(table_cap);
            return Err(e.into());
        }

        let mapping_cap = match self.backend.alloc_slot() {
            Ok(c) => c,
            Err(e) => {
                self.backend.free_slot(table_cap);
                return Err(e);
            }
        };
        let parent_cap = Self::node(parent).table_cap;
        let (_, err) = self.gate.invoke(Invocation::VNodeMap, parent_cap, &[table_cap.slot, index, mapping_cap.slot]);
        let result: Result<(), KernelError> = err.into();
        if let Err(e) = result {
            self.backend.free_slot(mapping_cap);
            self.backend.free_slot(table_cap);
            return Err(e.into());
        }

        self.try_refill_slab();
        let child_ptr = self.node_slab.alloc().unwrap_or_else(|| {
            self.node_slab.grow();
            self.node_slab.alloc().expect("substrate-vspace: node slab exhausted after grow")
        });
        unsafe { child_ptr.as_ptr().write(PageTableNode::new_child(child_level, table_cap, mapping_cap, parent, index)) };

        match &mut Self::node_mut(parent).entries {
            Entries::Intermediate(children) => children[index] = Some(child_ptr),
            Entries::Leaf(_) => unreachable!(),
        }
        Self::node_mut(parent).num_children += 1;
        Ok(child_ptr)
    }

    fn walk_to_l3(&mut self, vaddr: usize) -> Result<NonNull<PageTableNode>, VSpaceError> {
        let l1 = self.get_or_create_child(self.l0, vaddr)?;
        let l2 = self.get_or_create_child(l1, vaddr)?;
        self.get_or_create_child(l2, vaddr)
    }

    /// Looks up the existing L3 table covering `vaddr` without creating
    /// any missing intermediate levels. Returns `None` if any level along
    /// the way hasn't been populated yet.
    fn lookup_l3(&self, vaddr: usize) -> Option<NonNull<PageTableNode>> {
        let mut cur = self.l0;
        loop {
            let level = Self::node(cur).level;
            if level == Level::L3 {
                return Some(cur);
            }
            let index = index_at(vaddr, level);
            let next = match &Self::node(cur).entries {
                Entries::Intermediate(children) => children[index]?,
                Entries::Leaf(_) => unreachable!(),
            };
            cur = next;
        }
    }

    fn map_single_page(&mut self, vaddr: usize, frame: Capref, offset: usize, flags: u32, lazy: bool) -> Result<(), VSpaceError> {
        let l3 = self.walk_to_l3(vaddr)?;
        let index = index_at(vaddr, Level::L3);
        let already_mapped = match &Self::node(l3).entries {
            Entries::Leaf(frames) => frames[index].is_some(),
            Entries::Intermediate(_) => unreachable!(),
        };
        if already_mapped {
            return Ok(());
        }

        let frame_slot = self.backend.alloc_slot()?;
        let table_cap = Self::node(l3).table_cap;
        let (_, err) = self.gate.invoke(
            Invocation::VNodeMap,
            table_cap,
            &[frame.root, frame.cnode, frame.slot, index, offset, flags as usize, frame_slot.slot],
        );
        let result: Result<(), KernelError> = err.into();
        if let Err(e) = result {
            self.backend.free_slot(frame_slot);
            return Err(e.into());
        }

        let node = Self::node_mut(l3);
        match &mut node.entries {
            Entries::Leaf(frames) => frames[index] = Some(frame_slot),
            Entries::Intermediate(_) => unreachable!(),
        }
        node.lazy[index] = lazy;
        node.num_children += 1;
        Ok(())
    }

    fn map_range(&mut self, vaddr: usize, frame: Capref, bytes: usize, mut offset: usize, flags: u32, lazy: bool) -> Result<(), VSpaceError> {
        let mut addr = vaddr;
        let end = vaddr + bytes;
        while addr < end {
            self.map_single_page(addr, frame, offset, flags, lazy)?;
            addr += BASE_PAGE_SIZE;
            offset += BASE_PAGE_SIZE;
        }
        Ok(())
    }

    fn unmap_single_frame(&mut self, vaddr: usize) -> Result<(), VSpaceError> {
        let l3 = self.lookup_l3(vaddr).ok_or(VSpaceError::NotFound)?;
        let index = index_at(vaddr, Level::L3);
        let frame_cap = match &Self::node(l3).entries {
            Entries::Leaf(frames) => frames[index],
            Entries::Intermediate(_) => unreachable!(),
        };
        let frame_cap = match frame_cap {
            Some(c) => c,
            None => return Ok(()), // nothing mapped here; matches the original's lazy-unmapped-hole tolerance
        };

        let table_cap = Self::node(l3).table_cap;
        let (_, err) = self.gate.invoke(Invocation::VNodeUnmap, table_cap, &[index]);
        let result: Result<(), KernelError> = err.into();
        result?;
        self.backend.free_slot(frame_cap);

        let node = Self::node_mut(l3);
        match &mut node.entries {
            Entries::Leaf(frames) => frames[index] = None,
            Entries::Intermediate(_) => unreachable!(),
        }
        node.lazy[index] = false;
        node.num_children -= 1;
        if node.num_children == 0 {
            self.reclaim_if_empty(l3);
        }
        Ok(())
    }

    /// Destroys `node` and cascades up through its ancestors as long as
    /// each one's `num_children` drops to zero in turn -- the L0 root
    /// (whose `parent` is `None`) is never a candidate.
    fn reclaim_if_empty(&mut self, node: NonNull<PageTableNode>) {
        let Some((parent, index)) = Self::node(node).parent else { return };

        let parent_cap = Self::node(parent).table_cap;
        let (_, err) = self.gate.invoke(Invocation::VNodeUnmap, parent_cap, &[index]);
        let result: Result<(), KernelError> = err.into();
        if result.is_err() {
            return; // leave the (now-empty but still installed) table in place
        }

        let table_cap = Self::node(node).table_cap;
        let mapping_cap = Self::node(node).mapping_cap;
        self.backend.free_slot(table_cap);
        self.backend.free_slot(mapping_cap);

        match &mut Self::node_mut(parent).entries {
            Entries::Intermediate(children) => children[index] = None,
            Entries::Leaf(_) => unreachable!(),
        }
        Self::node_mut(parent).num_children -= 1;

        // SAFETY: `node` was allocated from `node_slab` by
        // `get_or_create_child` and is being retired exactly once, with
        // its parent's entry already cleared above so nothing else can
        // reach it.
        unsafe { self.node_slab.dealloc(node) };

        if Self::node(parent).num_children == 0 {
            self.reclaim_if_empty(parent);
        }
    }

    // -- virtual-address range bookkeeping, mirroring the free/allocated
    // boundary-marker trick described at the top of this file --

    fn vaddr_alloc_inner(&mut self, node: substrate_rbtree::NodeId, vaddr: usize, bytes: usize) {
        let original_start = self.va.start(node);
        let original_size = self.va.size(node);
        // The node itself becomes the zero-size marker opening the
        // allocated range; `update_size` keeps position, only touching size.
        self.va.update_size(node, 0);
        if vaddr > original_start {
            self.va.insert(original_start, vaddr - original_start);
        }
        if original_start + original_size > vaddr + bytes {
            self.va.insert(vaddr + bytes, original_start + original_size - (vaddr + bytes));
        }
    }

    /// Allocates a free virtual-address range of at least `bytes`, aligned
    /// to `alignment` (a power of two), without mapping anything into it.
    pub fn alloc(&mut self, bytes: usize, alignment: usize) -> Result<usize, VSpaceError> {
        if alignment == 0 || (alignment & (alignment - 1)) != 0 {
            return Err(VSpaceError::BadAlignment);
        }
        let requested = bytes + alignment - 1;
        let id = self.va.find_minsize(requested).ok_or(VSpaceError::OutOfVirtualAddr)?;
        let start = self.va.start(id);
        let aligned = (start + alignment - 1) & !(alignment - 1);
        self.vaddr_alloc_inner(id, aligned, bytes);
        Ok(aligned)
    }

    /// Maps `frame` at a freshly allocated virtual address and returns it.
    pub fn map_frame_attr_offset(&mut self, bytes: usize, frame: Capref, offset: usize, flags: u32) -> Result<usize, VSpaceError> {
        let vaddr = self.alloc(bytes, BASE_PAGE_SIZE)?;
        self.map_range(vaddr, frame, bytes, offset, flags, false)?;
        Ok(vaddr)
    }

    /// Maps `frame` at a caller-chosen, currently-free virtual address.
    pub fn map_fixed_attr_offset(&mut self, vaddr: usize, frame: Capref, bytes: usize, offset: usize, flags: u32) -> Result<(), VSpaceError> {
        let id = self.va.find(vaddr).ok_or(VSpaceError::OutOfVirtualAddr)?;
        if self.va.start(id) + self.va.size(id) < vaddr + bytes {
            return Err(VSpaceError::OutOfVirtualAddr);
        }
        self.vaddr_alloc_inner(id, vaddr, bytes);
        self.map_range(vaddr, frame, bytes, offset, flags, false)
    }

    /// Unmaps every page in `[vaddr, vaddr+bytes)` without freeing the
    /// virtual-address range: a later `try_map` can fault pages back in.
    pub fn decommit(&mut self, vaddr: usize, bytes: usize) -> Result<(), VSpaceError> {
        if vaddr % BASE_PAGE_SIZE != 0 || bytes == 0 || bytes % BASE_PAGE_SIZE != 0 {
            return Err(VSpaceError::BadAlignment);
        }
        let mut addr = vaddr;
        while addr < vaddr + bytes {
            self.unmap_single_frame(addr)?;
            addr += BASE_PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmaps and frees the whole allocated region starting at `vaddr`.
    pub fn unmap(&mut self, vaddr: usize) -> Result<(), VSpaceError> {
        let id = self.va.find_lower(vaddr).ok_or(VSpaceError::NotFound)?;
        if self.va.size(id) != 0 || self.va.start(id) != vaddr {
            return Err(VSpaceError::NotFound);
        }
        let succ = self.va.successor(id).ok_or(VSpaceError::NotFound)?;
        let bytes = self.va.start(succ) - vaddr;

        let mut addr = vaddr;
        while addr < vaddr + bytes {
            self.unmap_single_frame(addr)?;
            addr += BASE_PAGE_SIZE;
        }

        let mut new_start = vaddr;
        let mut new_size = bytes;
        if let Some(pred) = self.va.predecessor(id) {
            if self.va.size(pred) > 0 && self.va.start(pred) + self.va.size(pred) == vaddr {
                new_start = self.va.start(pred);
                new_size += self.va.size(pred);
                self.va.delete(pred);
            }
        }
        if self.va.size(succ) > 0 && self.va.start(succ) == new_start + new_size {
            new_size += self.va.size(succ);
            self.va.delete(succ);
        }
        // `id`'s start may have shifted left to absorb a predecessor; the
        // node's position in the tree is keyed on start, so reinsert.
        if new_start != vaddr {
            self.va.delete(id);
            self.va.insert(new_start, new_size);
        } else {
            self.va.update_size(id, new_size);
        }
        Ok(())
    }

    /// Lazily maps a single page at `vaddr`, which must fall within an
    /// already-`alloc`ated region but not yet be mapped. Intended to be
    /// called from a page-fault handler.
    pub fn try_map(&mut self, vaddr: usize) -> Result<(), VSpaceError> {
        let vaddr = vaddr & !(BASE_PAGE_SIZE - 1);
        let lower = self.va.find_lower(vaddr).ok_or(VSpaceError::NotFound)?;
        if self.va.size(lower) != 0 {
            return Err(VSpaceError::NotFound); // `vaddr` falls in a free range: never allocated
        }

        if let Some(l3) = self.lookup_l3(vaddr) {
            let index = index_at(vaddr, Level::L3);
            let mapped = match &Self::node(l3).entries {
                Entries::Leaf(frames) => frames[index].is_some(),
                Entries::Intermediate(_) => unreachable!(),
            };
            if mapped {
                return Ok(()); // already mapped, nothing to do
            }
        }

        let frame = self.backend.alloc_frame(BASE_PAGE_SIZE)?;
        self.map_single_page(vaddr, frame, 0, VREGION_FLAGS_READ_WRITE, true)
    }

    /// The page-fault handler a domain's runtime registers with the
    /// kernel: rejects an obviously-wild access below the first page as
    /// fatal, tops up both node pools' headroom (guarded so a refill that
    /// itself faults or allocates can't recurse into this same path), then
    /// lazily maps the faulting page. A `try_map` failure past that point
    /// -- the access falls outside any `alloc`ated region -- is as fatal
    /// as the low-VA case, just reported with the instruction that caused
    /// it.
    pub fn handle_page_fault(&mut self, vaddr: usize, faulting_ip: usize) {
        if vaddr < BASE_PAGE_SIZE {
            panic!("page fault at {:#x} (ip {:#x}): access below the first page", vaddr, faulting_ip);
        }
        self.try_refill_slab();
        self.try_refill_va();
        if let Err(e) = self.try_map(vaddr) {
            panic!("page fault at {:#x} (ip {:#x}): {:?}", vaddr, faulting_ip, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_kernel_sys::KernelError;

    struct FakeGate;
    impl SyscallGate for FakeGate {
        fn invoke(&self, _op: Invocation, _target: Capref, _args: &[usize]) -> (usize, KernelError) {
            (0, KernelError::NoError)
        }
    }
    static GATE: FakeGate = FakeGate;

    struct FakeBackend {
        next: usize,
    }
    impl PagingBackend for FakeBackend {
        fn alloc_slot(&mut self) -> Result<Capref, VSpaceError> {
            self.next += 1;
            Ok(Capref { root: 1, cnode: 1, slot: self.next, depth: 32 })
        }
        fn free_slot(&mut self, _cap: Capref) {}
        fn alloc_frame(&mut self, _bytes: usize) -> Result<Capref, VSpaceError> {
            self.next += 1;
            Ok(Capref { root: 1, cnode: 2, slot: self.next, depth: 32 })
        }
    }

    fn vspace() -> VSpace<FakeBackend> {
        let root = Capref { root: 1, cnode: 1, slot: 0, depth: 32 };
        VSpace::new(&GATE, FakeBackend { next: 100 }, root, 0x1_0000_0000)
    }

    fn frame_cap() -> Capref { Capref { root: 1, cnode: 2, slot: 1, depth: 32 } }

    #[test]
    fn alloc_then_map_fixed_and_unmap() {
        let mut vs = vspace();
        let vaddr = vs.alloc(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        assert_eq!(vaddr, 0x1_0000_0000);
        vs.unmap(vaddr).unwrap();
        // the range should be free and mergeable with a fresh allocation
        let vaddr2 = vs.alloc(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        assert_eq!(vaddr2, 0x1_0000_0000);
    }

    #[test]
    fn map_frame_attr_offset_creates_page_tables_on_demand() {
        let mut vs = vspace();
        let vaddr = vs.map_frame_attr_offset(BASE_PAGE_SIZE, frame_cap(), 0, VREGION_FLAGS_READ_WRITE).unwrap();
        assert!(vs.lookup_l3(vaddr).is_some());
    }

    #[test]
    fn try_map_populates_a_previously_allocated_but_unmapped_page() {
        let mut vs = vspace();
        let vaddr = vs.alloc(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        vs.try_map(vaddr).unwrap();
        let l3 = vs.lookup_l3(vaddr).unwrap();
        let index = index_at(vaddr, Level::L3);
        match &VSpace::<FakeBackend>::node(l3).entries {
            Entries::Leaf(frames) => assert!(frames[index].is_some()),
            _ => panic!("expected a leaf table"),
        }
    }

    #[test]
    fn try_map_outside_any_allocation_fails() {
        let mut vs = vspace();
        assert_eq!(vs.try_map(0x2_0000_0000), Err(VSpaceError::NotFound));
    }

    #[test]
    fn decommit_then_try_map_remaps_without_reallocating_va() {
        let mut vs = vspace();
        let vaddr = vs.map_frame_attr_offset(BASE_PAGE_SIZE, frame_cap(), 0, VREGION_FLAGS_READ_WRITE).unwrap();
        vs.decommit(vaddr, BASE_PAGE_SIZE).unwrap();
        vs.try_map(vaddr).unwrap();
        let l3 = vs.lookup_l3(vaddr).unwrap();
        let index = index_at(vaddr, Level::L3);
        match &VSpace::<FakeBackend>::node(l3).entries {
            Entries::Leaf(frames) => assert!(frames[index].is_some()),
            _ => panic!("expected a leaf table"),
        }
    }

    #[test]
    fn handle_page_fault_maps_an_allocated_page() {
        let mut vs = vspace();
        let vaddr = vs.alloc(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        vs.handle_page_fault(vaddr, 0xdead_beef);
        let l3 = vs.lookup_l3(vaddr).unwrap();
        let index = index_at(vaddr, Level::L3);
        match &VSpace::<FakeBackend>::node(l3).entries {
            Entries::Leaf(frames) => assert!(frames[index].is_some()),
            _ => panic!("expected a leaf table"),
        }
    }

    #[test]
    #[should_panic(expected = "access below the first page")]
    fn handle_page_fault_below_base_page_size_is_fatal() {
        let mut vs = vspace();
        vs.handle_page_fault(0, 0x1000);
    }

    #[test]
    #[should_panic(expected = "ip 0x1000")]
    fn handle_page_fault_outside_any_allocation_reports_the_faulting_ip() {
        let mut vs = vspace();
        vs.handle_page_fault(0x2_0000_0000, 0x1000);
    }

    #[test]
    fn unmapping_the_only_frame_reclaims_the_whole_empty_table_chain() {
        let mut vs = vspace();
        let vaddr = vs.map_frame_attr_offset(BASE_PAGE_SIZE, frame_cap(), 0, VREGION_FLAGS_READ_WRITE).unwrap();
        assert!(vs.lookup_l3(vaddr).is_some());
        vs.decommit(vaddr, BASE_PAGE_SIZE).unwrap();
        // the L1/L2/L3 tables built solely to hold this one frame should
        // all have been unmapped and freed once they emptied out, leaving
        // nothing for `lookup_l3` to find without re-creating it.
        assert!(vs.lookup_l3(vaddr).is_none());
    }
}
