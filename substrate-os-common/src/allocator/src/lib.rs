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

//! Global heap allocator for domains built on this substrate.
//!
//! Two usage patterns map onto the two ways a domain can back its heap:
//! a fixed region set up once with [`SubstrateHeap::init`] (the common
//! case -- a statically sized early heap), or a region that grows lazily
//! as the domain's own paging layer backs more of it, via repeated calls
//! to [`SubstrateHeap::extend`].

#![no_std]
#![cfg_attr(not(test), feature(alloc_error_handler))]

extern crate alloc;
use alloc::alloc::{alloc, dealloc};
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};
use linked_list_allocator::Heap;
use spin::Mutex;

/// Backs [`SubstrateHeap`]'s growth: reserves more virtual address space
/// immediately following the heap's current top so the wrapped
/// `linked_list_allocator::Heap` can be widened over it. Physical frames
/// are expected to be faulted in lazily by the domain's own page-fault
/// handler on first touch, not eagerly backed here.
pub trait HeapGrower: Sync {
    /// Reserves at least `additional` bytes past the current top of the
    /// heap, returning how many bytes were actually reserved (may exceed
    /// `additional`), or `None` if the VSpace allocator has no more room.
    fn grow(&self, additional: usize) -> Option<usize>;
}

/// Minimum chunk requested from the grower per exhaustion, so a run of
/// small allocations doesn't reserve a fresh VA block on every one.
const GROWTH_CHUNK_BYTES: usize = 1024 * 1024;

pub struct SubstrateHeap {
    heap: Mutex<Heap>,
    grower: Mutex<Option<&'static dyn HeapGrower>>,
}

#[cfg(not(test))]
#[global_allocator]
pub static ALLOCATOR: SubstrateHeap = SubstrateHeap::empty();

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    core::panic!("Global allocation failure: {:?}", layout);
}

impl SubstrateHeap {
    /// Create a new UNINITIALIZED heap allocator. You must initialize this
    /// heap using `init` before using the allocator.
    pub const fn empty() -> SubstrateHeap {
        SubstrateHeap { heap: Mutex::new(Heap::empty()), grower: Mutex::new(None) }
    }

    /// Registers the VSpace-backed grower `alloc`'s exhaustion path calls
    /// into before giving up. Typically set once, early in domain startup.
    pub fn set_grower(&self, grower: &'static dyn HeapGrower) {
        *self.grower.lock() = Some(grower);
    }

    /// Initializes the heap over `[start_addr, start_addr + size)`.
    ///
    /// # Safety
    ///
    /// - Must be called exactly ONCE (per thread) before any allocation.
    /// - `size > 0` and the range must not overlap any other allocator.
    pub unsafe fn init(&self, start_addr: *mut u8, size: usize) {
        (*self.heap.lock()).init(start_addr, size);
    }

    /// Extends a previously initialized heap by `additional` bytes taken
    /// from freshly backed memory immediately following the existing
    /// region. Used by a domain's paging layer when it backs another
    /// lazily-mapped slice of the heap's virtual range on demand.
    ///
    /// # Safety
    ///
    /// `additional` bytes starting at the current top of the heap must
    /// already be mapped and owned by this allocator.
    pub unsafe fn extend(&self, additional: usize) { (*self.heap.lock()).extend(additional); }

    /// Returns an estimate of the amount of bytes in use.
    pub fn used(&self) -> usize { (*self.heap.lock()).used() }

    /// Returns an estimate of the amount of bytes available.
    pub fn free(&self) -> usize { (*self.heap.lock()).free() }
}

unsafe impl GlobalAlloc for SubstrateHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Ok(allocation) = (*self.heap.lock()).allocate_first_fit(layout) {
            return allocation.as_ptr();
        }
        let grower = *self.grower.lock();
        let grower = match grower {
            Some(g) => g,
            None => return ptr::null_mut(),
        };
        let needed = layout.size().max(GROWTH_CHUNK_BYTES);
        let reserved = match grower.grow(needed) {
            Some(bytes) => bytes,
            None => return ptr::null_mut(),
        };
        self.extend(reserved);
        (*self.heap.lock())
            .allocate_first_fit(layout)
            .ok()
            .map_or(ptr::null_mut(), |allocation| allocation.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        (*self.heap.lock()).deallocate(NonNull::new_unchecked(ptr), layout)
    }
}

// rust_{malloc, free, strdup} are drop-in replacements for their C
// equivalents, callable from whatever loader-provided libc a domain still
// links. rust_ prefix avoids symbol clashes with that libc's own malloc,
// which on this target hard-requires SIZE_ALIGN = 4*sizeof(size_t)
// alignment. rust_malloc gives the same guarantee: the allocation is
// prepended with a DeallocArgs header so rust_free can recover the Layout
// from just the C pointer.

#[derive(Copy, Clone)]
#[repr(C, align(16))]
struct DeallocArgs {
    layout: Layout,
    ptr: *mut u8,
}

#[no_mangle]
pub unsafe extern "C" fn rust_malloc(size: usize) -> *mut u8 {
    let malloc_layout = Layout::from_size_align(size, 4 * size_of::<usize>()).unwrap();
    let (alloc_layout, offset) = Layout::new::<DeallocArgs>().extend(malloc_layout).unwrap();
    let alloc_ptr = alloc(alloc_layout);
    let malloc_ptr = alloc_ptr.add(offset);
    ptr::write(alloc_ptr as *mut DeallocArgs, DeallocArgs { layout: alloc_layout, ptr: alloc_ptr });
    malloc_ptr
}

#[no_mangle]
pub unsafe extern "C" fn rust_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let arg_ptr = (ptr as *mut DeallocArgs).sub(1);
    let arg = arg_ptr.read();
    assert!(arg.ptr == arg_ptr as *mut u8);
    dealloc(arg.ptr, arg.layout);
}

#[no_mangle]
pub unsafe extern "C" fn rust_strdup(ptr: *const u8) -> *mut u8 {
    let strlen = cstr_core::CStr::from_ptr(ptr).to_bytes().len();
    let dst_ptr = rust_malloc(strlen + 1);
    ptr::copy_nonoverlapping(ptr, dst_ptr, strlen + 1);
    dst_ptr
}
