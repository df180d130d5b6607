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

//! Capability-invocation gate: the one boundary between this substrate and
//! the kernel it runs atop. Every other crate in the workspace talks to the
//! kernel only through [`SyscallGate`] and the types here.
#![no_std]

use num_enum::{FromPrimitive, IntoPrimitive};
use static_assertions::assert_eq_size;

/// Machine word; matches the kernel's own `seL4_Word` convention of binding
/// to whatever the pointer width of the target is.
pub type Word = usize;
/// Opaque slot address, resolved relative to a [`Capref`]'s CNode.
pub type CPtr = usize;

assert_eq_size!(Word, usize);

/// A capability reference: (root CNode, containing CNode, slot, guard depth).
/// By-value, cheap to copy, and does not own the capability it names -- see
/// the data model notes on ownership living with the allocator that handed
/// the slot out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capref {
    pub root: CPtr,
    pub cnode: CPtr,
    pub slot: CPtr,
    pub depth: u8,
}

impl Capref {
    pub const NULL: Capref = Capref { root: 0, cnode: 0, slot: 0, depth: 0 };

    pub const fn is_null(&self) -> bool { self.cnode == 0 && self.slot == 0 }
}

/// Kind-tagged capability types the kernel can hand out or retype into.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum ObjType {
    Untyped = 0,
    Ram,
    Frame,
    DevFrame,
    CNodeL1,
    CNodeL2,
    VNodeL0,
    VNodeL1,
    VNodeL2,
    VNodeL3,
    Dispatcher,
    EndpointLmp,
    EndpointUmp,
    Irq,
    Id,
    Kernel,
    #[num_enum(default)]
    Unknown,
}

/// Mirrors the kernel's own "0 is success" error convention so invocation
/// stubs can convert directly with `.into()`.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum KernelError {
    NoError = 0,
    InvalidArgument,
    InvalidCapability,
    IllegalOperation,
    RangeError,
    AlignmentError,
    FailedLookup,
    TruncatedMessage,
    DeleteFirst,
    RevokeFirst,
    NotEnoughMemory,
    CapNotFound,
    GuardMismatch,
    VNodeNotInstalled,
    #[num_enum(default)]
    Unknown,
}

pub type KernelResult = Result<(), KernelError>;

impl From<KernelError> for KernelResult {
    fn from(err: KernelError) -> KernelResult {
        if err == KernelError::NoError { Ok(()) } else { Err(err) }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Invocation opcodes the core must know (consumed external interface, not
/// implemented here -- the real dispatch lives on the other side of
/// [`SyscallGate::invoke`]).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum Invocation {
    Retype = 0,
    Copy,
    Delete,
    Revoke,
    GetState,
    Identify,
    VNodeMap,
    VNodeUnmap,
    VNodeModifyFlags,
    CNodeGetState,
    DispatcherCreate,
    DispatcherStop,
    DispatcherResume,
    DispatcherDump,
    EndpointCreate,
    LmpSend,
    KernelGetCoreId,
    KernelGetPlatformInfo,
    #[num_enum(default)]
    Unknown,
}

/// Maximum machine-word arguments a single invocation can carry (the
/// external interface caps this at 11 plus the opcode and argument count).
pub const MAX_INVOCATION_ARGS: usize = 11;

/// The one boundary crossing into the kernel: a syscall gate with
/// (invocation, target capability, argument count, up to 11 words),
/// returning a (value, error) pair. Implementations of this trait live
/// outside this crate (either a real kernel binding or, in tests, a fake);
/// everything in this workspace is written against the trait.
pub trait SyscallGate {
    fn invoke(&self, op: Invocation, target: Capref, args: &[Word]) -> (Word, KernelError);
}

/// Identifies the physical extent of a kernel-owned capability, as returned
/// by an `Identify` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapIdentity {
    pub base: Word,
    pub bytes: usize,
    pub ty: ObjType,
}

impl Default for ObjType {
    fn default() -> Self { ObjType::Untyped }
}

/// LMP wire format: the last word of the payload is a control word, low
/// bits carry payload length, two high bits are flags. When
/// [`LMP_MSG_HASCAP`] is set, three more words follow the message payload
/// carrying the transferred capability's `(root, cnode, slot)`; its
/// `depth` is packed into the control word itself (see
/// [`LMP_MSG_DEPTH_SHIFT`]) since a guard depth never needs a full word.
pub const LMP_WORDS_PER_MSG: usize = 8;
pub const LMP_MSG_MAX_SIZE: usize = core::mem::size_of::<Word>() * (LMP_WORDS_PER_MSG - 1);
pub const LMP_MSG_MORE: Word = 1 << (Word::BITS - 1);
pub const LMP_MSG_HASCAP: Word = 1 << (Word::BITS - 2);
pub const LMP_MSG_DEPTH_SHIFT: u32 = 48;
pub const LMP_MSG_DEPTH_MASK: Word = 0xFF << LMP_MSG_DEPTH_SHIFT;
pub const LMP_MSG_SIZE_MASK: Word = !(LMP_MSG_MORE | LMP_MSG_HASCAP | LMP_MSG_DEPTH_MASK);
/// Word count of the trailing `(root, cnode, slot)` triple sent after the
/// message payload when a capability accompanies it.
pub const LMP_CAP_WORDS: usize = 3;

/// UMP cache-line wire format: 8 machine words per line, the last of which
/// is the control word `(size | MORE-bit)`.
pub const UMP_LINE_WORDS: usize = 8;
pub const UMP_CONTROL_WORD_IDX: usize = UMP_LINE_WORDS - 1;
pub const UMP_MSG_MAX_SIZE: usize = core::mem::size_of::<Word>() * (UMP_LINE_WORDS - 1);
pub const UMP_MSG_MORE: Word = 1 << (Word::BITS - 1);
pub const UMP_MSG_SIZE_MASK: Word = !UMP_MSG_MORE;

/// Well-known slots inside a new domain's TASKCN (see external interfaces).
pub mod taskcn {
    use super::CPtr;

    pub const ROOTCN: CPtr = 0;
    pub const TASKCN: CPtr = 1;
    pub const DISPATCHER: CPtr = 2;
    pub const SELFEP: CPtr = 3;
    pub const INITEP: CPtr = 4;
    pub const DISPFRAME: CPtr = 5;
    pub const ARGSPAGE: CPtr = 6;
    pub const MONITOREP: CPtr = 7;
    pub const KERNELCAP: CPtr = 8;
    pub const IRQ: CPtr = 9;
    pub const IO: CPtr = 10;
    pub const BOOTINFO: CPtr = 11;
    pub const EARLYMEM: CPtr = 12;
    pub const MODULECN: CPtr = 13;
    pub const PAGECN: CPtr = 14;
    pub const BASE_PAGE_CN: CPtr = 15;
    pub const SLOT_ALLOC_0: CPtr = 16;
    pub const SLOT_ALLOC_1: CPtr = 17;
    pub const SLOT_ALLOC_2: CPtr = 18;
    pub const ROOT_MAPPING: CPtr = 19;
    pub const STDIN_FRAME: CPtr = 20;
    pub const STDOUT_FRAME: CPtr = 21;
    pub const DEV: CPtr = 22;
    pub const CAPV: CPtr = 23;
}

/// Page and slot granularity constants shared by every layer above this
/// crate; a board port overrides these via the `config` module convention
/// described for the rest of the workspace.
pub mod config {
    pub const BASE_PAGE_SIZE: usize = 4096;
    pub const L2_CNODE_SLOTS: usize = 256;
    pub const PTABLE_NUM_ENTRIES: usize = 512;
}
