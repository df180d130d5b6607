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

//! Builds a new domain from an ELF image: lays out its CSpace, loads its
//! loadable segments into a freshly-constructed address space, hands it an
//! arguments page and a dispatcher, and carries it through the spawn state
//! machine (spawning -> ready -> running <-> suspended -> terminated).
//!
//! A spawned domain's own page tables are not represented as a
//! [`substrate_vspace::VSpace`] here: loading only ever performs the
//! handful of eager mappings the steps below describe, never a fault-driven
//! `try_map`, so the [`SpawnBackend::map_into_child`] primitive is enough.
//! Once the child is running, its own runtime links against
//! `substrate-vspace` for its *own* lazy fault handling -- that tree is
//! built inside the child, not by the code spawning it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::string::String;
use num_enum::{FromPrimitive, IntoPrimitive};
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use substrate_cmdline::make_argv;
use substrate_kernel_sys::{config::BASE_PAGE_SIZE, taskcn, Capref, KernelError};

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum SpawnError {
    DomainNotFound = 0,
    ElfMap,
    CreateDispatcher,
    SetupCspace,
    SetupDispatcher,
    UnmapModule,
    Kernel,
    #[num_enum(default)]
    Unknown,
}
impl From<KernelError> for SpawnError {
    fn from(_: KernelError) -> Self { SpawnError::Kernel }
}
impl core::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Mirrors the spawn record's state field (§ data model): spawning -> ready
/// -> running <-> suspended; running -> killed; running -> terminated (via
/// exit); any state -> cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    Spawning,
    Ready,
    Running,
    Suspended,
    Killed,
    Terminated,
    Cleanup,
}

impl SpawnState {
    fn can_transition_to(self, next: SpawnState) -> bool {
        use SpawnState::*;
        match (self, next) {
            (Spawning, Ready) => true,
            (Ready, Running) => true,
            (Running, Suspended) => true,
            (Suspended, Running) => true,
            (Running, Killed) => true,
            (Running, Terminated) => true,
            (_, Cleanup) => true,
            _ => false,
        }
    }
}

/// The handful of capability operations spawn needs from whatever layer owns
/// slot/frame allocation and the current domain's own page tables --
/// narrowed to exactly what building another domain requires, so this crate
/// doesn't pull in a concrete slot allocator or memory manager.
pub trait SpawnBackend {
    fn alloc_slot(&mut self) -> Result<Capref, SpawnError>;
    fn free_slot(&mut self, cap: Capref);
    fn alloc_cnode(&mut self, size_bits: u8) -> Result<Capref, SpawnError>;
    fn alloc_vnode_l0(&mut self) -> Result<Capref, SpawnError>;
    fn alloc_dispatcher(&mut self) -> Result<Capref, SpawnError>;
    fn alloc_frame(&mut self, bytes: usize) -> Result<Capref, SpawnError>;
    /// Maps `frame` somewhere in the *caller's* own address space so its
    /// bytes can be written, returning the local pointer.
    fn map_local(&mut self, frame: Capref, bytes: usize) -> Result<*mut u8, SpawnError>;
    fn unmap_local(&mut self, ptr: *mut u8, bytes: usize);
    /// Installs `frame` at `vaddr` in the child's address space rooted at
    /// `child_l0`, with the given R/W/X flag bits (see `substrate-vspace`'s
    /// `VREGION_FLAGS_*`). This is the one primitive substrate-vspace's
    /// fuller lazily-faulting tree would otherwise provide; spawn only ever
    /// needs eager, one-shot mappings.
    fn map_into_child(
        &mut self,
        child_l0: Capref,
        vaddr: usize,
        frame: Capref,
        bytes: usize,
        flags: u32,
    ) -> Result<(), SpawnError>;
    fn install_cnode_slot(&mut self, cnode: Capref, slot: usize, cap: Capref) -> Result<(), SpawnError>;
    fn copy_cap(&mut self, dest_cnode: Capref, dest_slot: usize, src: Capref) -> Result<Capref, SpawnError>;
}

const VREGION_FLAGS_READ: u32 = 0x01;
const VREGION_FLAGS_WRITE: u32 = 0x02;
const VREGION_FLAGS_EXECUTE: u32 = 0x04;

/// ~1 MiB, handed to a freshly spawned domain as EARLYMEM so it can
/// bootstrap its own allocator before the memory-server RPC is up.
const EARLY_MEM_BYTES: usize = 1024 * 1024;

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// A spawned domain's identity and owned top-level capabilities; the
/// record the process manager keeps per child.
pub struct SpawnInfo {
    pub binary_name: String,
    pub cmdline: String,
    pub pid: u32,
    pub state: SpawnState,
    pub exitcode: i32,
    pub cspace: Capref,     // L1 CNode root
    pub vspace: Capref,     // L0 VNode root
    pub dispatcher: Capref,
    pub entry_point: usize,
    pub got_vaddr: Option<usize>,
    pub args_page_child_vaddr: usize,
}

impl SpawnInfo {
    fn set_state(&mut self, next: SpawnState) -> Result<(), SpawnError> {
        if !self.state.can_transition_to(next) {
            return Err(SpawnError::SetupDispatcher);
        }
        self.state = next;
        Ok(())
    }
}

/// Lays out one loadable ELF segment's page-rounded frame geometry.
struct SegmentLayout {
    vaddr: usize,
    frame_bytes: usize,
    frame_offset: usize,
    file_range: (usize, usize),
    flags: u32,
}

fn segment_layout(vaddr: u64, offset: u64, file_size: u64, flags_r: bool, flags_w: bool, flags_x: bool) -> SegmentLayout {
    let base = vaddr as usize;
    let page_base = (base / BASE_PAGE_SIZE) * BASE_PAGE_SIZE;
    let in_page_offset = base - page_base;
    let frame_bytes = round_up(in_page_offset + file_size as usize, BASE_PAGE_SIZE);
    let mut flags = 0u32;
    if flags_r {
        flags |= VREGION_FLAGS_READ;
    }
    if flags_w {
        flags |= VREGION_FLAGS_WRITE;
    }
    if flags_x {
        flags |= VREGION_FLAGS_EXECUTE;
    }
    SegmentLayout {
        vaddr: page_base,
        frame_bytes,
        frame_offset: in_page_offset,
        file_range: (offset as usize, (offset + file_size) as usize),
        flags,
    }
}

/// Smallest `size_bits` whose `2^size_bits` slots can hold `count` capabilities.
fn size_bits_for_count(count: usize) -> u8 {
    let mut bits = 0u8;
    while (1usize << bits) < count.max(1) {
        bits += 1;
    }
    bits
}

/// Builds a new domain from `elf_image` and starts it through the spawn
/// sequence up to "ready for scheduling" (step 8); the process manager
/// flips it to `Running` later via [`spawn_start`].
///
/// `capv` is copied into a fresh CNode installed at `taskcn::CAPV` so the
/// child can address each capability the caller handed it; `stdin`/
/// `stdout`, when present, are copied straight into `taskcn::STDIN_FRAME`/
/// `taskcn::STDOUT_FRAME`.
pub fn spawn_load_with_caps(
    backend: &mut impl SpawnBackend,
    binary_name: &str,
    cmdline: &str,
    elf_image: &[u8],
    pid: u32,
    capv: &[Capref],
    stdin: Option<Capref>,
    stdout: Option<Capref>,
) -> Result<SpawnInfo, SpawnError> {
    // Step 1: CSpace construction -- an L1 root plus the well-known L2
    // CNodes a new domain expects at TASKCN.
    const L1_SIZE_BITS: u8 = 4; // enough slots for TASKCN, PAGECN, the SLOT_ALLOC_Ns, CAPV
    let cspace = backend.alloc_cnode(L1_SIZE_BITS)?;
    let taskcn = backend.alloc_cnode(8).map_err(|_| SpawnError::SetupCspace)?;
    backend
        .install_cnode_slot(cspace, taskcn::TASKCN, taskcn)
        .map_err(|_| SpawnError::SetupCspace)?;
    let pagecn = backend.alloc_cnode(8).map_err(|_| SpawnError::SetupCspace)?;
    backend
        .install_cnode_slot(cspace, taskcn::PAGECN, pagecn)
        .map_err(|_| SpawnError::SetupCspace)?;
    for slot in [taskcn::SLOT_ALLOC_0, taskcn::SLOT_ALLOC_1, taskcn::SLOT_ALLOC_2] {
        let alloc_cn = backend.alloc_cnode(8).map_err(|_| SpawnError::SetupCspace)?;
        backend.install_cnode_slot(cspace, slot, alloc_cn).map_err(|_| SpawnError::SetupCspace)?;
    }

    // Step 2: VSpace construction -- a fresh L0 VNode, copied into the
    // child's own PAGECN so it can address its own root later.
    let vspace = backend.alloc_vnode_l0()?;
    backend
        .copy_cap(pagecn, 0, vspace)
        .map_err(|_| SpawnError::SetupCspace)?;

    // Step 3: ELF load.
    let elf = ElfFile::new(elf_image).map_err(|_| SpawnError::ElfMap)?;
    let entry_point = elf.header.pt2.entry_point() as usize;
    let mut got_vaddr = None;
    for segment in elf.program_iter() {
        if segment.get_type() != Ok(Type::Load) {
            continue;
        }
        let layout = segment_layout(
            segment.virtual_addr(),
            segment.offset(),
            segment.file_size(),
            true,
            segment.flags().is_write(),
            segment.flags().is_execute(),
        );
        let frame = backend.alloc_frame(layout.frame_bytes)?;
        let local = backend.map_local(frame, layout.frame_bytes)?;
        // SAFETY: `local` was just mapped by this call for exactly
        // `frame_bytes` bytes and is not aliased elsewhere yet.
        unsafe {
            core::ptr::write_bytes(local, 0, layout.frame_bytes);
            let (start, end) = layout.file_range;
            let dst = local.add(layout.frame_offset);
            core::ptr::copy_nonoverlapping(elf_image[start..end].as_ptr(), dst, end - start);
        }
        backend.unmap_local(local, layout.frame_bytes);
        backend
            .map_into_child(vspace, layout.vaddr, frame, layout.frame_bytes, layout.flags | VREGION_FLAGS_READ)
            .map_err(|_| SpawnError::ElfMap)?;
    }
    for section in elf.section_iter() {
        if section.get_name(&elf) == Ok(".got") {
            got_vaddr = Some(section.address() as usize);
        }
    }

    // Step 4: arguments page -- argc/argv laid out for the child, with
    // pointers rewritten to the child's own virtual address of the page.
    let argv = make_argv(cmdline);
    let args_page_vaddr = 0x1000_0000usize; // fixed slot, matching a reserved low-memory region
    let args_frame = backend.alloc_frame(BASE_PAGE_SIZE)?;
    let args_local = backend.map_local(args_frame, BASE_PAGE_SIZE)?;
    layout_args_page(args_local, &argv, args_page_vaddr);
    backend.unmap_local(args_local, BASE_PAGE_SIZE);
    backend
        .map_into_child(vspace, args_page_vaddr, args_frame, BASE_PAGE_SIZE, VREGION_FLAGS_READ | VREGION_FLAGS_WRITE)
        .map_err(|_| SpawnError::SetupDispatcher)?;
    backend
        .install_cnode_slot(taskcn, taskcn::ARGSPAGE, args_frame)
        .map_err(|_| SpawnError::SetupCspace)?;

    // Step 5: dispatcher.
    let dispframe = backend.alloc_frame(BASE_PAGE_SIZE).map_err(|_| SpawnError::CreateDispatcher)?;
    let dispatcher = backend.alloc_dispatcher().map_err(|_| SpawnError::CreateDispatcher)?;
    backend
        .install_cnode_slot(taskcn, taskcn::DISPATCHER, dispatcher)
        .map_err(|_| SpawnError::SetupDispatcher)?;
    backend
        .install_cnode_slot(taskcn, taskcn::DISPFRAME, dispframe)
        .map_err(|_| SpawnError::SetupDispatcher)?;
    backend
        .map_into_child(vspace, 0x2000_0000, dispframe, BASE_PAGE_SIZE, VREGION_FLAGS_READ | VREGION_FLAGS_WRITE)
        .map_err(|_| SpawnError::SetupDispatcher)?;

    // Step 6: bootstrap endpoint.
    let selfep = backend.alloc_slot().map_err(|_| SpawnError::SetupDispatcher)?;
    backend
        .install_cnode_slot(taskcn, taskcn::SELFEP, selfep)
        .map_err(|_| SpawnError::SetupDispatcher)?;
    let initep = backend.alloc_slot().map_err(|_| SpawnError::SetupDispatcher)?;
    backend
        .install_cnode_slot(taskcn, taskcn::INITEP, initep)
        .map_err(|_| SpawnError::SetupDispatcher)?;

    // Step 7: early memory donation.
    let earlymem = backend.alloc_frame(EARLY_MEM_BYTES)?;
    backend
        .install_cnode_slot(taskcn, taskcn::EARLYMEM, earlymem)
        .map_err(|_| SpawnError::SetupCspace)?;

    // Step 7.5: self-reference, inherited caps, and standard frames -- the
    // rest of TASKCN's well-known slots (see external interfaces).
    backend
        .copy_cap(taskcn, taskcn::ROOTCN, cspace)
        .map_err(|_| SpawnError::SetupCspace)?;
    if !capv.is_empty() {
        let capv_cn = backend
            .alloc_cnode(size_bits_for_count(capv.len()))
            .map_err(|_| SpawnError::SetupCspace)?;
        for (slot, cap) in capv.iter().enumerate() {
            backend.copy_cap(capv_cn, slot, *cap).map_err(|_| SpawnError::SetupCspace)?;
        }
        backend
            .install_cnode_slot(taskcn, taskcn::CAPV, capv_cn)
            .map_err(|_| SpawnError::SetupCspace)?;
    }
    if let Some(stdin) = stdin {
        backend
            .copy_cap(taskcn, taskcn::STDIN_FRAME, stdin)
            .map_err(|_| SpawnError::SetupCspace)?;
    }
    if let Some(stdout) = stdout {
        backend
            .copy_cap(taskcn, taskcn::STDOUT_FRAME, stdout)
            .map_err(|_| SpawnError::SetupCspace)?;
    }

    // Step 8: ready for scheduling; the process manager starts it later.
    Ok(SpawnInfo {
        binary_name: String::from(binary_name),
        cmdline: String::from(cmdline),
        pid,
        state: SpawnState::Ready,
        exitcode: 0,
        cspace,
        vspace,
        dispatcher,
        entry_point,
        got_vaddr,
        args_page_child_vaddr: args_page_vaddr,
    })
}

/// Writes argc/argv (no envp) into `local`, a page mapped at `child_vaddr`
/// in the child's own address space, so that `argv[i]` pointers stored in
/// the page are already valid once the child reads them.
fn layout_args_page(local: *mut u8, argv: &[String], child_vaddr: usize) {
    const HEADER_WORDS: usize = 2 + substrate_cmdline::MAX_CMDLINE_ARGS + 1; // argc, page_size, argv[]+null
    let header_bytes = HEADER_WORDS * core::mem::size_of::<usize>();
    // SAFETY: `local` points at a BASE_PAGE_SIZE buffer owned by the
    // caller for the duration of this call.
    unsafe {
        let words = local as *mut usize;
        core::ptr::write(words, argv.len());
        core::ptr::write(words.add(1), BASE_PAGE_SIZE);
        let mut string_offset = header_bytes;
        for (i, arg) in argv.iter().enumerate() {
            let dst = local.add(string_offset);
            core::ptr::copy_nonoverlapping(arg.as_ptr(), dst, arg.len());
            *local.add(string_offset + arg.len()) = 0;
            core::ptr::write(words.add(2 + i), child_vaddr + string_offset);
            string_offset += arg.len() + 1;
        }
        core::ptr::write(words.add(2 + argv.len()), 0); // argv null terminator
    }
}

pub fn spawn_start(info: &mut SpawnInfo) -> Result<(), SpawnError> {
    info.set_state(SpawnState::Running)
}

pub fn spawn_suspend(info: &mut SpawnInfo) -> Result<(), SpawnError> {
    info.set_state(SpawnState::Suspended)
}

pub fn spawn_resume(info: &mut SpawnInfo) -> Result<(), SpawnError> {
    info.set_state(SpawnState::Running)
}

pub fn spawn_kill(info: &mut SpawnInfo) -> Result<(), SpawnError> {
    info.set_state(SpawnState::Killed)
}

pub fn spawn_exit(info: &mut SpawnInfo, exitcode: i32) -> Result<(), SpawnError> {
    info.set_state(SpawnState::Terminated)?;
    info.exitcode = exitcode;
    Ok(())
}

/// Frees the top-level capabilities this domain owned. Full reclamation of
/// everything the child itself allocated (walking its CSpace) is out of
/// scope for the core.
pub fn spawn_cleanup(backend: &mut impl SpawnBackend, info: &mut SpawnInfo) -> Result<(), SpawnError> {
    info.set_state(SpawnState::Cleanup)?;
    backend.free_slot(info.dispatcher);
    backend.free_slot(info.vspace);
    backend.free_slot(info.cspace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec as StdVec;
    use std::collections::HashMap;

    struct FakeBackend {
        next_slot: usize,
        local_pages: HashMap<usize, StdVec<u8>>,
        child_maps: StdVec<(usize, usize, u32)>, // vaddr, bytes, flags
        installed: StdVec<(Capref, usize, Capref)>, // cnode, slot, cap -- from copy_cap
    }

    impl FakeBackend {
        fn new() -> Self {
            FakeBackend { next_slot: 1, local_pages: HashMap::new(), child_maps: StdVec::new(), installed: StdVec::new() }
        }
        fn next(&mut self) -> Capref {
            let slot = self.next_slot;
            self.next_slot += 1;
            Capref { root: 0, cnode: 1, slot, depth: 32 }
        }
    }

    impl SpawnBackend for FakeBackend {
        fn alloc_slot(&mut self) -> Result<Capref, SpawnError> { Ok(self.next()) }
        fn free_slot(&mut self, _cap: Capref) {}
        fn alloc_cnode(&mut self, _size_bits: u8) -> Result<Capref, SpawnError> { Ok(self.next()) }
        fn alloc_vnode_l0(&mut self) -> Result<Capref, SpawnError> { Ok(self.next()) }
        fn alloc_dispatcher(&mut self) -> Result<Capref, SpawnError> { Ok(self.next()) }
        fn alloc_frame(&mut self, bytes: usize) -> Result<Capref, SpawnError> {
            let cap = self.next();
            self.local_pages.insert(cap.slot, vec![0u8; bytes]);
            Ok(cap)
        }
        fn map_local(&mut self, frame: Capref, bytes: usize) -> Result<*mut u8, SpawnError> {
            let buf = self.local_pages.entry(frame.slot).or_insert_with(|| vec![0u8; bytes]);
            Ok(buf.as_mut_ptr())
        }
        fn unmap_local(&mut self, _ptr: *mut u8, _bytes: usize) {}
        fn map_into_child(
            &mut self,
            _child_l0: Capref,
            vaddr: usize,
            _frame: Capref,
            bytes: usize,
            flags: u32,
        ) -> Result<(), SpawnError> {
            self.child_maps.push((vaddr, bytes, flags));
            Ok(())
        }
        fn install_cnode_slot(&mut self, _cnode: Capref, _slot: usize, _cap: Capref) -> Result<(), SpawnError> { Ok(()) }
        fn copy_cap(&mut self, dest_cnode: Capref, dest_slot: usize, src: Capref) -> Result<Capref, SpawnError> {
            self.installed.push((dest_cnode, dest_slot, src));
            Ok(src)
        }
    }

    fn tiny_elf() -> StdVec<u8> {
        // A single PT_LOAD segment covering the whole file at vaddr 0x1000,
        // entry point equal to the segment start -- enough for ElfFile to
        // parse program headers without needing a real toolchain-built
        // binary on disk.
        let mut buf = vec![0u8; 0x1000 + 0x40 + 0x20];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // little-endian
        buf[6] = 1; // EI_VERSION
        let eh_size = 64usize;
        let ph_off = eh_size;
        let ph_entsize = 56usize;
        buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type ET_EXEC
        buf[18..20].copy_from_slice(&0x3e_u16.to_le_bytes()); // e_machine x86_64
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // e_entry
        buf[32..40].copy_from_slice(&(ph_off as u64).to_le_bytes());
        buf[40..48].copy_from_slice(&0u64.to_le_bytes()); // e_shoff
        buf[52..54].copy_from_slice(&(eh_size as u16).to_le_bytes());
        buf[54..56].copy_from_slice(&(ph_entsize as u16).to_le_bytes());
        buf[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        buf[58..60].copy_from_slice(&0u16.to_le_bytes()); // e_shentsize
        buf[60..62].copy_from_slice(&0u16.to_le_bytes()); // e_shnum
        buf[62..64].copy_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        let ph = ph_off;
        buf[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // p_type PT_LOAD
        buf[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes()); // p_flags R+X
        buf[ph + 8..ph + 16].copy_from_slice(&0u64.to_le_bytes()); // p_offset
        buf[ph + 16..ph + 24].copy_from_slice(&0x1000u64.to_le_bytes()); // p_vaddr
        buf[ph + 24..ph + 32].copy_from_slice(&0x1000u64.to_le_bytes()); // p_paddr
        buf[ph + 32..ph + 40].copy_from_slice(&0x40u64.to_le_bytes()); // p_filesz
        buf[ph + 40..ph + 48].copy_from_slice(&0x40u64.to_le_bytes()); // p_memsz
        buf[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes()); // p_align
        buf
    }

    #[test]
    fn spawn_loads_segments_and_reaches_ready() {
        let mut backend = FakeBackend::new();
        let elf = tiny_elf();
        let info = spawn_load_with_caps(&mut backend, "hello", "hello arg1", &elf, 7, &[], None, None).unwrap();
        assert_eq!(info.state, SpawnState::Ready);
        assert_eq!(info.entry_point, 0x1000);
        assert!(backend.child_maps.iter().any(|(vaddr, _, _)| *vaddr == 0x1000));
    }

    #[test]
    fn spawn_installs_inherited_caps_and_self_reference() {
        let mut backend = FakeBackend::new();
        let elf = tiny_elf();
        let stdin = backend.next();
        let stdout = backend.next();
        let inherited = backend.next();
        let info = spawn_load_with_caps(
            &mut backend,
            "hello",
            "hello",
            &elf,
            3,
            &[inherited],
            Some(stdin),
            Some(stdout),
        )
        .unwrap();
        assert_eq!(info.state, SpawnState::Ready);
        assert_eq!(backend.installed.iter().filter(|(_, slot, _)| *slot == taskcn::ROOTCN).count(), 1);
        assert_eq!(backend.installed.iter().filter(|(_, slot, _)| *slot == taskcn::CAPV).count(), 1);
        assert_eq!(backend.installed.iter().filter(|(_, slot, _)| *slot == taskcn::STDIN_FRAME).count(), 1);
        assert_eq!(backend.installed.iter().filter(|(_, slot, _)| *slot == taskcn::STDOUT_FRAME).count(), 1);
    }

    #[test]
    fn spawn_skips_capv_cnode_when_no_caps_are_passed() {
        let mut backend = FakeBackend::new();
        let elf = tiny_elf();
        let info = spawn_load_with_caps(&mut backend, "hello", "hello", &elf, 4, &[], None, None).unwrap();
        assert_eq!(info.state, SpawnState::Ready);
        assert!(backend.installed.iter().all(|(_, slot, _)| *slot != taskcn::CAPV));
    }

    #[test]
    fn state_machine_rejects_invalid_transitions() {
        let mut backend = FakeBackend::new();
        let elf = tiny_elf();
        let mut info = spawn_load_with_caps(&mut backend, "hello", "hello", &elf, 1, &[], None, None).unwrap();
        assert!(spawn_suspend(&mut info).is_err()); // ready -> suspended is not legal
        spawn_start(&mut info).unwrap();
        assert_eq!(info.state, SpawnState::Running);
        spawn_suspend(&mut info).unwrap();
        assert_eq!(info.state, SpawnState::Suspended);
        spawn_resume(&mut info).unwrap();
        assert_eq!(info.state, SpawnState::Running);
        spawn_exit(&mut info, 0).unwrap();
        assert_eq!(info.state, SpawnState::Terminated);
        assert!(spawn_resume(&mut info).is_err());
    }

    #[test]
    fn cleanup_is_reachable_from_any_state() {
        let mut backend = FakeBackend::new();
        let elf = tiny_elf();
        let mut info = spawn_load_with_caps(&mut backend, "hello", "hello", &elf, 1, &[], None, None).unwrap();
        spawn_cleanup(&mut backend, &mut info).unwrap();
        assert_eq!(info.state, SpawnState::Cleanup);
    }

    #[test]
    fn args_page_rewrites_pointers_into_child_address_space() {
        let mut page = vec![0u8; BASE_PAGE_SIZE];
        let argv: StdVec<String> = vec!["hello".into(), "arg1".into()];
        layout_args_page(page.as_mut_ptr(), &argv, 0x1000_0000);
        let words = unsafe { core::slice::from_raw_parts(page.as_ptr() as *const usize, 4) };
        assert_eq!(words[0], 2); // argc
        assert!(words[2] >= 0x1000_0000); // argv[0] points into the child VA range
    }
}
