//! Virtual to native register mapping.

use super::x86_64::Reg;

/// Virtual registers. `Ax` and `Aux` are never named by programs; the
/// emitter uses them as scratch for multi-instruction lowerings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VReg {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    Fp,
    Ax,
    Aux,
}

/// Native register for each virtual register, indexed by `VReg as u8`.
///
/// R0 is the return value, R1-R5 the argument registers in System V order,
/// R6-R9 callee-saved, Fp the frame pointer.
const NATIVE: [Reg; 13] = [
    Reg::Rax,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::Rbx,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rbp,
    Reg::R10,
    Reg::R11,
];

const ALL: [VReg; 13] = [
    VReg::R0,
    VReg::R1,
    VReg::R2,
    VReg::R3,
    VReg::R4,
    VReg::R5,
    VReg::R6,
    VReg::R7,
    VReg::R8,
    VReg::R9,
    VReg::Fp,
    VReg::Ax,
    VReg::Aux,
];

impl VReg {
    /// Decode a register index from an instruction. Only R0-R9 and Fp are
    /// addressable.
    pub fn from_index(index: u8) -> Option<Self> {
        if index <= VReg::Fp as u8 {
            Some(ALL[index as usize])
        } else {
            None
        }
    }

    pub fn native(self) -> Reg {
        NATIVE[self as usize]
    }
}

/// Native registers pushed by the prologue when the program touches them.
pub const CALLEE_SAVED: [VReg; 4] = [VReg::R6, VReg::R7, VReg::R8, VReg::R9];
