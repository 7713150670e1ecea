//! Target ABI description.
//!
//! Field offsets of the runtime structures generated code reads, and the
//! layout facts shared by the code generators.

use serde::{Deserialize, Serialize};

use super::x86_64::Reg;

/// Bytes of a patchable call/jump site (`E8`/`E9` rel32, or a 5-byte NOP).
pub const PATCH_SIZE: usize = 5;

/// Bytes at the start of every compiled program that a tail call skips:
/// the patchable NOP, the counter-init slot, `push rbp` and `mov rbp, rsp`.
pub const TAIL_CALL_OFFSET: usize = 11;

/// Upper bound on chained tail calls within one invocation.
pub const MAX_TAIL_CALL_CNT: u32 = 33;

/// Layout of the structures read by the indirect tail-call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetAbi {
    /// `u32` entry count of a program array.
    pub array_max_entries_off: i32,
    /// Start of the array's `*const ProgramImage` slots.
    pub array_ptrs_off: i32,
    /// Code address within a program image descriptor.
    pub prog_bpf_func_off: i32,
    /// Slot of each hardware register (by encoding, rax = 0 .. r15 = 15) in
    /// the saved general-register array of a signal context. A fault
    /// handler uses it to zero the destination of a faulting load.
    pub greg_slots: [u8; 16],
}

/// glibc `gregset_t` order on x86-64.
const GLIBC_GREG_SLOTS: [u8; 16] = [13, 14, 12, 11, 15, 10, 9, 8, 0, 1, 2, 3, 4, 5, 6, 7];

impl Default for TargetAbi {
    fn default() -> Self {
        Self {
            array_max_entries_off: 0,
            array_ptrs_off: 8,
            prog_bpf_func_off: 0,
            greg_slots: GLIBC_GREG_SLOTS,
        }
    }
}

impl TargetAbi {
    pub fn reg_slot(&self, reg: Reg) -> u8 {
        self.greg_slots[reg as usize]
    }
}

/// In-memory program array consumed by the indirect tail call, laid out to
/// match [`TargetAbi::default`].
#[repr(C)]
#[derive(Debug)]
pub struct ProgArray<const N: usize> {
    pub max_entries: u32,
    pub _pad: u32,
    pub ptrs: [*const ProgImage; N],
}

impl<const N: usize> ProgArray<N> {
    pub fn new() -> Self {
        Self {
            max_entries: N as u32,
            _pad: 0,
            ptrs: [std::ptr::null(); N],
        }
    }
}

impl<const N: usize> Default for ProgArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Program descriptor pointed to by [`ProgArray`] slots.
#[repr(C)]
#[derive(Debug)]
pub struct ProgImage {
    pub bpf_func: usize,
}
