//! x86-64 instruction encoding for JIT compilation.
//!
//! The free functions build prefix and ModR/M bytes from register pairs.
//! [`X86_64Assembler`] appends complete instructions to a [`CodeBuffer`],
//! always choosing the shortest correct form for immediates and
//! displacements. Uses System V AMD64 ABI conventions.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Byte stores from these need a REX prefix: without one, codes 4-7
    /// select AH/CH/DH/BH instead of SPL/BPL/SIL/DIL.
    pub fn needs_rex_for_byte(self) -> bool {
        self.needs_rex_ext() || matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
    }
}

/// x86-64 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Opcode of the two-byte `Jcc rel8` form.
    pub fn short_opcode(self) -> u8 {
        0x70 | self as u8
    }

    /// Second opcode byte of the `0F 8x rel32` form.
    pub fn near_opcode(self) -> u8 {
        0x80 | self as u8
    }
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B,
    H,
    W,
    DW,
}

impl Width {
    pub fn bytes(self) -> u8 {
        match self {
            Width::B => 1,
            Width::H => 2,
            Width::W => 4,
            Width::DW => 8,
        }
    }
}

/// Two-operand ALU operations with register and immediate forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

impl AluOp {
    /// `op r/m, reg` opcode.
    pub fn reg_opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::Sub => 0x29,
            AluOp::And => 0x21,
            AluOp::Or => 0x09,
            AluOp::Xor => 0x31,
        }
    }

    /// ModR/M base for the `83 /r` and `81 /r` immediate forms.
    fn imm_modrm(self) -> u8 {
        match self {
            AluOp::Add => 0xC0,
            AluOp::Sub => 0xE8,
            AluOp::And => 0xE0,
            AluOp::Or => 0xC8,
            AluOp::Xor => 0xF0,
        }
    }

    /// One-byte opcode of the `op eax, imm32` accumulator form.
    fn acc_opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x05,
            AluOp::Sub => 0x2D,
            AluOp::And => 0x25,
            AluOp::Or => 0x0D,
            AluOp::Xor => 0x35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn modrm(self) -> u8 {
        match self {
            ShiftOp::Shl => 0xE0,
            ShiftOp::Shr => 0xE8,
            ShiftOp::Sar => 0xF8,
        }
    }
}

// ==================== Encoding primitives ====================

/// Set REX.B in `byte` if `reg` is an extended register.
pub fn add_1mod(byte: u8, reg: Reg) -> u8 {
    if reg.needs_rex_ext() { byte | 1 } else { byte }
}

/// Set REX.B for `r1` (the r/m operand) and REX.R for `r2` (the reg operand).
pub fn add_2mod(byte: u8, r1: Reg, r2: Reg) -> u8 {
    let mut byte = byte;
    if r1.needs_rex_ext() {
        byte |= 1;
    }
    if r2.needs_rex_ext() {
        byte |= 4;
    }
    byte
}

/// Encode `reg` in the r/m field of `byte`.
pub fn add_1reg(byte: u8, reg: Reg) -> u8 {
    byte + reg.code()
}

/// Encode `dst` in the r/m field and `src` in the reg field of `byte`.
pub fn add_2reg(byte: u8, dst: Reg, src: Reg) -> u8 {
    byte + dst.code() + (src.code() << 3)
}

pub fn is_imm8(value: i64) -> bool {
    (-128..=127).contains(&value)
}

pub fn is_simm32(value: i64) -> bool {
    value == value as i32 as i64
}

pub fn is_uimm32(value: u64) -> bool {
    value == value as u32 as u64
}

// ==================== NOPs ====================

/// Longest single NOP we emit.
pub const MAX_NOP_LEN: usize = 8;

/// Recommended multi-byte NOPs, indexed by length.
const NOPS: [&[u8]; MAX_NOP_LEN + 1] = [
    &[],
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// The 5-byte NOP reserved at patchable call/jump sites.
pub const NOP5: [u8; 5] = [0x0F, 0x1F, 0x44, 0x00, 0x00];

/// Emit `len` bytes of NOPs using as few instructions as possible.
pub fn emit_nops(buf: &mut CodeBuffer, len: usize) {
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(MAX_NOP_LEN);
        buf.emit_bytes(NOPS[chunk]);
        remaining -= chunk;
    }
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Bytes emitted into the underlying buffer so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn buf(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    // ==================== REX prefix helpers ====================

    /// Emit REX for a reg/rm pair: always with W for 64-bit operations,
    /// otherwise only when an extended register is involved.
    fn emit_mod(&mut self, dst: Reg, src: Reg, is64: bool) {
        if is64 {
            self.buf.emit_u8(add_2mod(0x48, dst, src));
        } else if dst.needs_rex_ext() || src.needs_rex_ext() {
            self.buf.emit_u8(add_2mod(0x40, dst, src));
        }
    }

    /// Single-register variant of [`Self::emit_mod`].
    fn emit_1mod(&mut self, reg: Reg, is64: bool) {
        if is64 {
            self.buf.emit_u8(add_1mod(0x48, reg));
        } else if reg.needs_rex_ext() {
            self.buf.emit_u8(add_1mod(0x40, reg));
        }
    }

    /// ModR/M plus displacement for `[ptr + off]` with `reg` in the reg field.
    /// Uses disp8 when `off` fits.
    pub fn insn_suffix(&mut self, ptr: Reg, reg: Reg, off: i32) {
        if is_imm8(off as i64) {
            self.buf.emit_u8(add_2reg(0x40, ptr, reg));
            self.buf.emit_u8(off as u8);
        } else {
            self.buf.emit_u8(add_2reg(0x80, ptr, reg));
            self.buf.emit_u32(off as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r, imm32. Zero uses `xor r32, r32`; a negative value that must
    /// sign-extend uses `mov r/m64, imm32`; anything else the zero-extending
    /// `mov r32, imm32`.
    pub fn mov_imm32(&mut self, dst: Reg, imm: i32, sign_propagate: bool) {
        if sign_propagate && imm < 0 {
            self.buf.emit_u8(add_1mod(0x48, dst));
            self.buf.emit_u8(0xC7);
            self.buf.emit_u8(add_1reg(0xC0, dst));
            self.buf.emit_u32(imm as u32);
            return;
        }

        if imm == 0 {
            if dst.needs_rex_ext() {
                self.buf.emit_u8(add_2mod(0x40, dst, dst));
            }
            self.buf.emit_u8(0x31);
            self.buf.emit_u8(add_2reg(0xC0, dst, dst));
            return;
        }

        if dst.needs_rex_ext() {
            self.buf.emit_u8(add_1mod(0x40, dst));
        }
        self.buf.emit_u8(add_1reg(0xB8, dst));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, imm64. Falls back to the 32-bit form when the value
    /// zero-extends from 32 bits.
    pub fn mov_imm64(&mut self, dst: Reg, imm: u64) {
        if is_uimm32(imm) {
            self.mov_imm32(dst, imm as u32 as i32, false);
            return;
        }
        self.buf.emit_u8(add_1mod(0x48, dst));
        self.buf.emit_u8(add_1reg(0xB8, dst));
        self.buf.emit_u64(imm);
    }

    /// MOV dst, src. The 32-bit form is always emitted since it zero-extends.
    pub fn mov_reg(&mut self, dst: Reg, src: Reg, is64: bool) {
        self.emit_mod(dst, src, is64);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(add_2reg(0xC0, dst, src));
    }

    /// MOV r64, r64, omitted when the registers are the same.
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.mov_reg(dst, src, true);
        }
    }

    /// MOVZX dst32, src16.
    pub fn movzx16(&mut self, dst: Reg) {
        if dst.needs_rex_ext() {
            self.buf.emit_u8(add_2mod(0x40, dst, dst));
        }
        self.buf.emit_bytes(&[0x0F, 0xB7]);
        self.buf.emit_u8(add_2reg(0xC0, dst, dst));
    }

    /// BSWAP on the low 16/32/64 bits.
    pub fn bswap(&mut self, dst: Reg, width: Width) {
        match width {
            Width::H => {
                // ROL r16, 8
                self.buf.emit_u8(0x66);
                if dst.needs_rex_ext() {
                    self.buf.emit_u8(0x41);
                }
                self.buf.emit_u8(0xC1);
                self.buf.emit_u8(add_1reg(0xC8, dst));
                self.buf.emit_u8(8);
                self.movzx16(dst);
            }
            Width::W => {
                if dst.needs_rex_ext() {
                    self.buf.emit_u8(0x41);
                }
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(add_1reg(0xC8, dst));
            }
            Width::DW => {
                self.buf.emit_u8(add_1mod(0x48, dst));
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(add_1reg(0xC8, dst));
            }
            Width::B => {}
        }
    }

    /// MOV/MOVZX dst, [src + off].
    pub fn ldx(&mut self, width: Width, dst: Reg, src: Reg, off: i32) {
        match width {
            Width::B => {
                self.buf.emit_u8(add_2mod(0x48, src, dst));
                self.buf.emit_bytes(&[0x0F, 0xB6]);
            }
            Width::H => {
                self.buf.emit_u8(add_2mod(0x48, src, dst));
                self.buf.emit_bytes(&[0x0F, 0xB7]);
            }
            Width::W => {
                if dst.needs_rex_ext() || src.needs_rex_ext() {
                    self.buf.emit_u8(add_2mod(0x40, src, dst));
                }
                self.buf.emit_u8(0x8B);
            }
            Width::DW => {
                self.buf.emit_u8(add_2mod(0x48, src, dst));
                self.buf.emit_u8(0x8B);
            }
        }
        self.insn_suffix(src, dst, off);
    }

    /// MOVSX dst, [src + off]. There is no sign-extending 64-bit load.
    pub fn ldsx(&mut self, width: Width, dst: Reg, src: Reg, off: i32) {
        self.buf.emit_u8(add_2mod(0x48, src, dst));
        match width {
            Width::B => self.buf.emit_bytes(&[0x0F, 0xBE]),
            Width::H => self.buf.emit_bytes(&[0x0F, 0xBF]),
            Width::W | Width::DW => self.buf.emit_u8(0x63),
        }
        self.insn_suffix(src, dst, off);
    }

    /// MOV [dst + off], src.
    pub fn stx(&mut self, width: Width, dst: Reg, src: Reg, off: i32) {
        match width {
            Width::B => {
                if dst.needs_rex_ext() || src.needs_rex_for_byte() {
                    self.buf.emit_u8(add_2mod(0x40, dst, src));
                }
                self.buf.emit_u8(0x88);
            }
            Width::H => {
                self.buf.emit_u8(0x66);
                if dst.needs_rex_ext() || src.needs_rex_ext() {
                    self.buf.emit_u8(add_2mod(0x40, dst, src));
                }
                self.buf.emit_u8(0x89);
            }
            Width::W => {
                if dst.needs_rex_ext() || src.needs_rex_ext() {
                    self.buf.emit_u8(add_2mod(0x40, dst, src));
                }
                self.buf.emit_u8(0x89);
            }
            Width::DW => {
                self.buf.emit_u8(add_2mod(0x48, dst, src));
                self.buf.emit_u8(0x89);
            }
        }
        self.insn_suffix(dst, src, off);
    }

    /// MOV [dst + off], imm. The immediate is emitted at the access width
    /// (sign-extended to 64 bits for DW).
    pub fn st_imm(&mut self, width: Width, dst: Reg, off: i32, imm: i32) {
        match width {
            Width::B => {
                if dst.needs_rex_ext() {
                    self.buf.emit_u8(0x41);
                }
                self.buf.emit_u8(0xC6);
            }
            Width::H => {
                self.buf.emit_u8(0x66);
                if dst.needs_rex_ext() {
                    self.buf.emit_u8(0x41);
                }
                self.buf.emit_u8(0xC7);
            }
            Width::W => {
                if dst.needs_rex_ext() {
                    self.buf.emit_u8(0x41);
                }
                self.buf.emit_u8(0xC7);
            }
            Width::DW => {
                self.buf.emit_u8(add_1mod(0x48, dst));
                self.buf.emit_u8(0xC7);
            }
        }
        if is_imm8(off as i64) {
            self.buf.emit_u8(add_1reg(0x40, dst));
            self.buf.emit_u8(off as u8);
        } else {
            self.buf.emit_u8(add_1reg(0x80, dst));
            self.buf.emit_u32(off as u32);
        }
        let bytes = width.bytes().min(4);
        self.buf.emit_sized(imm as u32, bytes);
    }

    /// LEA dst, [base + off].
    pub fn lea(&mut self, dst: Reg, base: Reg, off: i32) {
        self.buf.emit_u8(add_2mod(0x48, base, dst));
        self.buf.emit_u8(0x8D);
        self.insn_suffix(base, dst, off);
    }

    // ==================== Atomics ====================

    /// LOCK-prefixed read-modify-write of `[dst + off]` with `src`.
    pub fn atomic(&mut self, op: AtomicOp, dst: Reg, src: Reg, off: i32, is64: bool) {
        self.buf.emit_u8(0xF0);
        self.emit_mod(dst, src, is64);
        match op {
            AtomicOp::Alu(alu) => self.buf.emit_u8(alu.reg_opcode()),
            AtomicOp::FetchAdd => self.buf.emit_bytes(&[0x0F, 0xC1]),
            AtomicOp::Xchg => self.buf.emit_u8(0x87),
            AtomicOp::Cmpxchg => self.buf.emit_bytes(&[0x0F, 0xB1]),
        }
        self.insn_suffix(dst, src, off);
    }

    // ==================== Arithmetic Operations ====================

    /// `op dst, src`.
    pub fn alu_rr(&mut self, op: AluOp, dst: Reg, src: Reg, is64: bool) {
        self.emit_mod(dst, src, is64);
        self.buf.emit_u8(op.reg_opcode());
        self.buf.emit_u8(add_2reg(0xC0, dst, src));
    }

    /// `op dst, imm`: imm8 form, then the accumulator short form, then imm32.
    pub fn alu_ri(&mut self, op: AluOp, dst: Reg, imm: i32, is64: bool) {
        self.emit_1mod(dst, is64);
        if is_imm8(imm as i64) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(add_1reg(op.imm_modrm(), dst));
            self.buf.emit_u8(imm as u8);
        } else if dst == Reg::Rax {
            self.buf.emit_u8(op.acc_opcode());
            self.buf.emit_u32(imm as u32);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(add_1reg(op.imm_modrm(), dst));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// NEG r (two's complement negation)
    pub fn neg(&mut self, dst: Reg, is64: bool) {
        self.emit_1mod(dst, is64);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(add_1reg(0xD8, dst));
    }

    /// Shift by immediate; a count of one uses the `D1` form.
    pub fn shift_ri(&mut self, op: ShiftOp, dst: Reg, imm: u8, is64: bool) {
        self.emit_1mod(dst, is64);
        if imm == 1 {
            self.buf.emit_u8(0xD1);
            self.buf.emit_u8(add_1reg(op.modrm(), dst));
        } else {
            self.buf.emit_u8(0xC1);
            self.buf.emit_u8(add_1reg(op.modrm(), dst));
            self.buf.emit_u8(imm);
        }
    }

    /// Shift by CL.
    pub fn shift_cl(&mut self, op: ShiftOp, dst: Reg, is64: bool) {
        self.emit_1mod(dst, is64);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(add_1reg(op.modrm(), dst));
    }

    /// MUL r (unsigned: RDX:RAX = RAX * r)
    pub fn mul(&mut self, src: Reg, is64: bool) {
        self.emit_1mod(src, is64);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(add_1reg(0xE0, src));
    }

    /// DIV r (unsigned: RAX = RDX:RAX / r, RDX = remainder)
    pub fn div(&mut self, src: Reg, is64: bool) {
        self.emit_1mod(src, is64);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(add_1reg(0xF0, src));
    }

    /// CMP dst, src
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg, is64: bool) {
        self.emit_mod(dst, src, is64);
        self.buf.emit_u8(0x39);
        self.buf.emit_u8(add_2reg(0xC0, dst, src));
    }

    /// CMP dst, imm (imm8 form when it fits)
    pub fn cmp_ri(&mut self, dst: Reg, imm: i32, is64: bool) {
        self.emit_1mod(dst, is64);
        if is_imm8(imm as i64) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(add_1reg(0xF8, dst));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(add_1reg(0xF8, dst));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// TEST dst, src
    pub fn test_rr(&mut self, dst: Reg, src: Reg, is64: bool) {
        self.emit_mod(dst, src, is64);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(add_2reg(0xC0, dst, src));
    }

    /// TEST dst, imm32
    pub fn test_ri(&mut self, dst: Reg, imm: i32, is64: bool) {
        self.emit_1mod(dst, is64);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(add_1reg(0xC0, dst));
        self.buf.emit_u32(imm as u32);
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(add_1reg(0x50, reg));
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(add_1reg(0x58, reg));
    }

    /// LEAVE (mov rsp, rbp; pop rbp)
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    // ==================== Control Flow ====================

    /// JMP rel8
    pub fn jmp_rel8(&mut self, offset: i8) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_u8(offset as u8);
    }

    /// JMP rel32
    pub fn jmp_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(offset as u32);
    }

    /// Jcc rel8
    pub fn jcc_rel8(&mut self, cond: Cond, offset: i8) {
        self.buf.emit_u8(cond.short_opcode());
        self.buf.emit_u8(offset as u8);
    }

    /// Jcc rel32
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(cond.near_opcode());
        self.buf.emit_u32(offset as u32);
    }

    /// CALL rel32
    pub fn call_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_u32(offset as u32);
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(add_1reg(0xE0, reg));
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nops(&mut self, len: usize) {
        emit_nops(self.buf, len);
    }
}

/// Read-modify-write forms supported under a LOCK prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Alu(AluOp),
    FetchAdd,
    Xchg,
    Cmpxchg,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.into_code()
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(add_1mod(0x48, Reg::Rax), 0x48);
        assert_eq!(add_1mod(0x48, Reg::R13), 0x49);
        assert_eq!(add_2mod(0x48, Reg::R13, Reg::R14), 0x4D);
        assert_eq!(add_2mod(0x40, Reg::Rdi, Reg::R8), 0x44);
        assert_eq!(add_2reg(0xC0, Reg::Rax, Reg::Rcx), 0xC8);
    }

    #[test]
    fn test_immediate_predicates() {
        assert!(is_imm8(127));
        assert!(is_imm8(-128));
        assert!(!is_imm8(128));
        assert!(is_simm32(i32::MIN as i64));
        assert!(!is_simm32(1 << 31));
        assert!(is_uimm32(u32::MAX as u64));
        assert!(!is_uimm32(1 << 32));
    }

    #[test]
    fn test_mov_imm32_forms() {
        // MOV EAX, 5 = B8 05 00 00 00
        assert_eq!(assemble(|a| a.mov_imm32(Reg::Rax, 5, true)), [0xB8, 5, 0, 0, 0]);
        // XOR EAX, EAX = 31 C0
        assert_eq!(assemble(|a| a.mov_imm32(Reg::Rax, 0, true)), [0x31, 0xC0]);
        // XOR R13D, R13D = 45 31 ED
        assert_eq!(assemble(|a| a.mov_imm32(Reg::R13, 0, true)), [0x45, 0x31, 0xED]);
        // MOV RDI, -1 = 48 C7 C7 FF FF FF FF
        assert_eq!(
            assemble(|a| a.mov_imm32(Reg::Rdi, -1, true)),
            [0x48, 0xC7, 0xC7, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // MOV R8D, -1 (no sign propagation) = 41 B8 FF FF FF FF
        assert_eq!(
            assemble(|a| a.mov_imm32(Reg::R8, -1, false)),
            [0x41, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_mov_imm64() {
        assert_eq!(assemble(|a| a.mov_imm64(Reg::Rsi, 0xFFFF_FFFF)), [0xBE, 0xFF, 0xFF, 0xFF, 0xFF]);
        // MOVABS R11, 0x1_0000_0000 = 49 BB 00 00 00 00 01 00 00 00
        assert_eq!(
            assemble(|a| a.mov_imm64(Reg::R11, 1 << 32)),
            [0x49, 0xBB, 0, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_mov_reg() {
        // MOV RAX, RDI = 48 89 F8
        assert_eq!(assemble(|a| a.mov_reg(Reg::Rax, Reg::Rdi, true)), [0x48, 0x89, 0xF8]);
        // MOV EAX, EAX = 89 C0
        assert_eq!(assemble(|a| a.mov_reg(Reg::Rax, Reg::Rax, false)), [0x89, 0xC0]);
        // MOV R11, RDX = 49 89 D3
        assert_eq!(assemble(|a| a.mov_reg(Reg::R11, Reg::Rdx, true)), [0x49, 0x89, 0xD3]);
        assert!(assemble(|a| a.mov_rr(Reg::Rbx, Reg::Rbx)).is_empty());
    }

    #[test]
    fn test_alu_ri_forms() {
        // ADD RDI, 127 = 48 83 C7 7F
        assert_eq!(assemble(|a| a.alu_ri(AluOp::Add, Reg::Rdi, 127, true)), [0x48, 0x83, 0xC7, 0x7F]);
        // ADD RDI, 200 = 48 81 C7 C8 00 00 00
        assert_eq!(
            assemble(|a| a.alu_ri(AluOp::Add, Reg::Rdi, 200, true)),
            [0x48, 0x81, 0xC7, 0xC8, 0, 0, 0]
        );
        // ADD RAX, 200 = 48 05 C8 00 00 00
        assert_eq!(
            assemble(|a| a.alu_ri(AluOp::Add, Reg::Rax, 200, true)),
            [0x48, 0x05, 0xC8, 0, 0, 0]
        );
        // SUB R14D, 1 = 41 83 EE 01
        assert_eq!(assemble(|a| a.alu_ri(AluOp::Sub, Reg::R14, 1, false)), [0x41, 0x83, 0xEE, 0x01]);
    }

    #[test]
    fn test_alu_rr() {
        // ADD RAX, RCX = 48 01 C8
        assert_eq!(assemble(|a| a.alu_rr(AluOp::Add, Reg::Rax, Reg::Rcx, true)), [0x48, 0x01, 0xC8]);
        // XOR EDX, EDX = 31 D2
        assert_eq!(assemble(|a| a.alu_rr(AluOp::Xor, Reg::Rdx, Reg::Rdx, false)), [0x31, 0xD2]);
    }

    #[test]
    fn test_shifts() {
        // SHL RDI, 1 = 48 D1 E7
        assert_eq!(assemble(|a| a.shift_ri(ShiftOp::Shl, Reg::Rdi, 1, true)), [0x48, 0xD1, 0xE7]);
        // SAR RAX, 3 = 48 C1 F8 03
        assert_eq!(assemble(|a| a.shift_ri(ShiftOp::Sar, Reg::Rax, 3, true)), [0x48, 0xC1, 0xF8, 0x03]);
        // SHR R11, CL = 49 D3 EB
        assert_eq!(assemble(|a| a.shift_cl(ShiftOp::Shr, Reg::R11, true)), [0x49, 0xD3, 0xEB]);
    }

    #[test]
    fn test_mul_div() {
        // MUL R11 = 49 F7 E3
        assert_eq!(assemble(|a| a.mul(Reg::R11, true)), [0x49, 0xF7, 0xE3]);
        // DIV R11D = 41 F7 F3
        assert_eq!(assemble(|a| a.div(Reg::R11, false)), [0x41, 0xF7, 0xF3]);
    }

    #[test]
    fn test_loads() {
        // MOV RAX, [RDI+8] = 48 8B 47 08
        assert_eq!(assemble(|a| a.ldx(Width::DW, Reg::Rax, Reg::Rdi, 8)), [0x48, 0x8B, 0x47, 0x08]);
        // MOV EAX, [RDI+0x100] = 8B 87 00 01 00 00
        assert_eq!(
            assemble(|a| a.ldx(Width::W, Reg::Rax, Reg::Rdi, 0x100)),
            [0x8B, 0x87, 0x00, 0x01, 0x00, 0x00]
        );
        // MOVZX RBX, BYTE [RBP-1] = 48 0F B6 5D FF
        assert_eq!(
            assemble(|a| a.ldx(Width::B, Reg::Rbx, Reg::Rbp, -1)),
            [0x48, 0x0F, 0xB6, 0x5D, 0xFF]
        );
        // MOVSXD RAX, [RSI] = 48 63 46 00
        assert_eq!(assemble(|a| a.ldsx(Width::W, Reg::Rax, Reg::Rsi, 0)), [0x48, 0x63, 0x46, 0x00]);
    }

    #[test]
    fn test_stores() {
        // MOV [RBP-8], RDI = 48 89 7D F8
        assert_eq!(assemble(|a| a.stx(Width::DW, Reg::Rbp, Reg::Rdi, -8)), [0x48, 0x89, 0x7D, 0xF8]);
        // MOV [RBP-1], SIL = 40 88 75 FF
        assert_eq!(assemble(|a| a.stx(Width::B, Reg::Rbp, Reg::Rsi, -1)), [0x40, 0x88, 0x75, 0xFF]);
        // MOV [RBX], AL = 88 43 00
        assert_eq!(assemble(|a| a.stx(Width::B, Reg::Rbx, Reg::Rax, 0)), [0x88, 0x43, 0x00]);
        // MOV WORD [RDI+2], R8W = 66 44 89 47 02
        assert_eq!(
            assemble(|a| a.stx(Width::H, Reg::Rdi, Reg::R8, 2)),
            [0x66, 0x44, 0x89, 0x47, 0x02]
        );
        // MOV QWORD [RBP-16], -1 = 48 C7 45 F0 FF FF FF FF
        assert_eq!(
            assemble(|a| a.st_imm(Width::DW, Reg::Rbp, -16, -1)),
            [0x48, 0xC7, 0x45, 0xF0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // MOV WORD [RDI], 0x1234 = 66 C7 47 00 34 12
        assert_eq!(
            assemble(|a| a.st_imm(Width::H, Reg::Rdi, 0, 0x1234)),
            [0x66, 0xC7, 0x47, 0x00, 0x34, 0x12]
        );
    }

    #[test]
    fn test_atomic() {
        // LOCK XADD [RDI], RSI = F0 48 0F C1 77 00
        assert_eq!(
            assemble(|a| a.atomic(AtomicOp::FetchAdd, Reg::Rdi, Reg::Rsi, 0, true)),
            [0xF0, 0x48, 0x0F, 0xC1, 0x77, 0x00]
        );
        // LOCK ADD [RDI+4], ESI = F0 01 77 04
        assert_eq!(
            assemble(|a| a.atomic(AtomicOp::Alu(AluOp::Add), Reg::Rdi, Reg::Rsi, 4, false)),
            [0xF0, 0x01, 0x77, 0x04]
        );
    }

    #[test]
    fn test_bswap() {
        // BSWAP EDI = 0F CF
        assert_eq!(assemble(|a| a.bswap(Reg::Rdi, Width::W)), [0x0F, 0xCF]);
        // BSWAP R13 = 49 0F CD
        assert_eq!(assemble(|a| a.bswap(Reg::R13, Width::DW)), [0x49, 0x0F, 0xCD]);
        // ROL DI, 8; MOVZX EDI, DI = 66 C1 CF 08 0F B7 FF
        assert_eq!(
            assemble(|a| a.bswap(Reg::Rdi, Width::H)),
            [0x66, 0xC1, 0xCF, 0x08, 0x0F, 0xB7, 0xFF]
        );
    }

    #[test]
    fn test_compare() {
        // CMP RDI, RSI = 48 39 F7
        assert_eq!(assemble(|a| a.cmp_rr(Reg::Rdi, Reg::Rsi, true)), [0x48, 0x39, 0xF7]);
        // CMP RAX, 0 = 48 83 F8 00
        assert_eq!(assemble(|a| a.cmp_ri(Reg::Rax, 0, true)), [0x48, 0x83, 0xF8, 0x00]);
        // TEST RCX, RCX = 48 85 C9
        assert_eq!(assemble(|a| a.test_rr(Reg::Rcx, Reg::Rcx, true)), [0x48, 0x85, 0xC9]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(assemble(|a| a.push(Reg::Rbx)), [0x53]);
        assert_eq!(assemble(|a| a.push(Reg::R13)), [0x41, 0x55]);
        assert_eq!(assemble(|a| a.pop(Reg::R15)), [0x41, 0x5F]);
    }

    #[test]
    fn test_branches() {
        assert_eq!(assemble(|a| a.jmp_rel8(-2)), [0xEB, 0xFE]);
        assert_eq!(assemble(|a| a.jcc_rel8(Cond::E, 4)), [0x74, 0x04]);
        assert_eq!(assemble(|a| a.jcc_rel32(Cond::G, 0x100)), [0x0F, 0x8F, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(assemble(|a| a.jmp_r(Reg::Rdx)), [0xFF, 0xE2]);
        assert_eq!(assemble(|a| a.jmp_r(Reg::R11)), [0x41, 0xFF, 0xE3]);
    }

    #[test]
    fn test_lea() {
        // LEA RSI, [RBP-24] = 48 8D 75 E8
        assert_eq!(assemble(|a| a.lea(Reg::Rsi, Reg::Rbp, -24)), [0x48, 0x8D, 0x75, 0xE8]);
    }

    #[test]
    fn test_nops() {
        for len in 0..=20 {
            let mut buf = CodeBuffer::new();
            emit_nops(&mut buf, len);
            assert_eq!(buf.len(), len);
        }
        let mut buf = CodeBuffer::new();
        emit_nops(&mut buf, 5);
        assert_eq!(buf.code(), &NOP5);
    }
}
