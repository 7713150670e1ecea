//! Virtual instruction encoding.
//!
//! Instructions are 8 bytes: opcode, a nibble pair of register indices,
//! a 16-bit signed offset and a 32-bit signed immediate (all little-endian).

/// Size of one encoded instruction in bytes.
pub const INSN_SIZE: usize = 8;

// Instruction classes
pub const LD: u8 = 0x00;
pub const LDX: u8 = 0x01;
pub const ST: u8 = 0x02;
pub const STX: u8 = 0x03;
pub const ALU: u8 = 0x04;
pub const JMP: u8 = 0x05;
pub const JMP32: u8 = 0x06;
pub const ALU64: u8 = 0x07;

// Operand sizes
pub const W: u8 = 0x00;
pub const H: u8 = 0x08;
pub const B: u8 = 0x10;
pub const DW: u8 = 0x18;

// Memory modes
pub const IMM: u8 = 0x00;
pub const MEM: u8 = 0x60;
pub const ATOMIC: u8 = 0xc0;
/// Fault-tolerant zero-extending load.
pub const PROBE_MEM: u8 = 0x20;
/// Fault-tolerant sign-extending load.
pub const PROBE_MEMSX: u8 = 0x40;
/// Sign-extending load.
pub const MEMSX: u8 = 0x80;

// Source operand
pub const K: u8 = 0x00;
pub const X: u8 = 0x08;

// ALU operations
pub const ADD: u8 = 0x00;
pub const SUB: u8 = 0x10;
pub const MUL: u8 = 0x20;
pub const DIV: u8 = 0x30;
pub const OR: u8 = 0x40;
pub const AND: u8 = 0x50;
pub const LSH: u8 = 0x60;
pub const RSH: u8 = 0x70;
pub const NEG: u8 = 0x80;
pub const MOD: u8 = 0x90;
pub const XOR: u8 = 0xa0;
pub const MOV: u8 = 0xb0;
pub const ARSH: u8 = 0xc0;
pub const END: u8 = 0xd0;

// Byte-swap direction (shares the source bit)
pub const TO_LE: u8 = 0x00;
pub const TO_BE: u8 = 0x08;

// Jump operations
pub const JA: u8 = 0x00;
pub const JEQ: u8 = 0x10;
pub const JGT: u8 = 0x20;
pub const JGE: u8 = 0x30;
pub const JSET: u8 = 0x40;
pub const JNE: u8 = 0x50;
pub const JSGT: u8 = 0x60;
pub const JSGE: u8 = 0x70;
pub const CALL: u8 = 0x80;
pub const EXIT: u8 = 0x90;
pub const JLT: u8 = 0xa0;
pub const JLE: u8 = 0xb0;
pub const JSLT: u8 = 0xc0;
pub const JSLE: u8 = 0xd0;
pub const TAIL_CALL: u8 = 0xf0;

// Atomic operations (carried in `imm`)
pub const FETCH: i32 = 0x01;
pub const XCHG: i32 = 0xe0 | FETCH;
pub const CMPXCHG: i32 = 0xf0 | FETCH;

/// `src` value marking a call into another sub-program of the same program.
pub const PSEUDO_CALL: u8 = 1;

pub const fn class(code: u8) -> u8 {
    code & 0x07
}

pub const fn size(code: u8) -> u8 {
    code & 0x18
}

pub const fn mode(code: u8) -> u8 {
    code & 0xe0
}

pub const fn op(code: u8) -> u8 {
    code & 0xf0
}

pub const fn src_kind(code: u8) -> u8 {
    code & 0x08
}

/// One virtual instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Insn {
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    pub const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self { code, dst, src, off, imm }
    }

    /// Decode one instruction from its 8-byte encoding.
    pub fn decode(bytes: &[u8; INSN_SIZE]) -> Self {
        Self {
            code: bytes[0],
            dst: bytes[1] & 0x0f,
            src: bytes[1] >> 4,
            off: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn encode(&self) -> [u8; INSN_SIZE] {
        let mut out = [0u8; INSN_SIZE];
        out[0] = self.code;
        out[1] = (self.src << 4) | (self.dst & 0x0f);
        out[2..4].copy_from_slice(&self.off.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    pub fn is_ld_imm64(&self) -> bool {
        self.code == LD | IMM | DW
    }

    /// Whether this is a load that may fault and must be covered by the
    /// exception table.
    pub fn is_probe_load(&self) -> bool {
        class(self.code) == LDX && matches!(mode(self.code), PROBE_MEM | PROBE_MEMSX)
    }

    pub fn is_pseudo_call(&self) -> bool {
        self.code == JMP | CALL && self.src == PSEUDO_CALL
    }
}

/// Small constructors used by tests and the program loader.
pub mod asm {
    use super::*;

    pub const fn mov64_imm(dst: u8, imm: i32) -> Insn {
        Insn::new(ALU64 | MOV | K, dst, 0, 0, imm)
    }

    pub const fn mov64_reg(dst: u8, src: u8) -> Insn {
        Insn::new(ALU64 | MOV | X, dst, src, 0, 0)
    }

    pub const fn mov32_imm(dst: u8, imm: i32) -> Insn {
        Insn::new(ALU | MOV | K, dst, 0, 0, imm)
    }

    pub const fn alu64_imm(op: u8, dst: u8, imm: i32) -> Insn {
        Insn::new(ALU64 | op | K, dst, 0, 0, imm)
    }

    pub const fn alu64_reg(op: u8, dst: u8, src: u8) -> Insn {
        Insn::new(ALU64 | op | X, dst, src, 0, 0)
    }

    pub const fn alu32_imm(op: u8, dst: u8, imm: i32) -> Insn {
        Insn::new(ALU | op | K, dst, 0, 0, imm)
    }

    pub const fn alu32_reg(op: u8, dst: u8, src: u8) -> Insn {
        Insn::new(ALU | op | X, dst, src, 0, 0)
    }

    /// Two-slot 64-bit immediate load.
    pub const fn ld_imm64(dst: u8, imm: u64) -> [Insn; 2] {
        [
            Insn::new(LD | IMM | DW, dst, 0, 0, imm as u32 as i32),
            Insn::new(0, 0, 0, 0, (imm >> 32) as u32 as i32),
        ]
    }

    pub const fn ldx(size: u8, dst: u8, src: u8, off: i16) -> Insn {
        Insn::new(LDX | MEM | size, dst, src, off, 0)
    }

    pub const fn probe_ldx(size: u8, dst: u8, src: u8, off: i16) -> Insn {
        Insn::new(LDX | PROBE_MEM | size, dst, src, off, 0)
    }

    pub const fn stx(size: u8, dst: u8, src: u8, off: i16) -> Insn {
        Insn::new(STX | MEM | size, dst, src, off, 0)
    }

    pub const fn st_imm(size: u8, dst: u8, off: i16, imm: i32) -> Insn {
        Insn::new(ST | MEM | size, dst, 0, off, imm)
    }

    pub const fn ja(off: i16) -> Insn {
        Insn::new(JMP | JA, 0, 0, off, 0)
    }

    pub const fn jmp_imm(op: u8, dst: u8, imm: i32, off: i16) -> Insn {
        Insn::new(JMP | op | K, dst, 0, off, imm)
    }

    pub const fn jmp_reg(op: u8, dst: u8, src: u8, off: i16) -> Insn {
        Insn::new(JMP | op | X, dst, src, off, 0)
    }

    pub const fn call(imm: i32) -> Insn {
        Insn::new(JMP | CALL, 0, 0, 0, imm)
    }

    pub const fn tail_call(poke: i32) -> Insn {
        Insn::new(JMP | TAIL_CALL, 0, 0, 0, poke)
    }

    pub const fn exit() -> Insn {
        Insn::new(JMP | EXIT, 0, 0, 0, 0)
    }
}
