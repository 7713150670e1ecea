//! Instruction emitter.
//!
//! One pass over a program: each virtual instruction becomes one native
//! sequence appended to a fresh [`CodeBuffer`]. Branch displacements are
//! taken from the offset map of the previous pass, so the pass driver
//! repeats this until the map stops changing.

use super::abi::TargetAbi;
use super::codebuf::CodeBuffer;
use super::driver::{CallResolver, CallSite};
use super::error::{JitError, Result};
use super::extable::ProbeSite;
use super::regs::{CALLEE_SAVED, VReg};
use super::tail_call::{self, DirectSite};
use super::x86_64::{
    AluOp, AtomicOp, Cond, Reg, ShiftOp, Width, X86_64Assembler, is_imm8, is_simm32,
};
use crate::program::Program;
use crate::program::insn::{self, Insn};

/// Stack frame shape shared by the prologue, the epilogue and tail calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stack_depth: u32,
    /// Callee-saved registers the program touches, in push order.
    pub callee_regs: Vec<VReg>,
    pub tail_call_reachable: bool,
    pub is_subprog: bool,
}

impl Frame {
    pub fn for_program(prog: &Program) -> Self {
        let callee_regs = CALLEE_SAVED
            .iter()
            .copied()
            .filter(|&reg| {
                prog.insns
                    .iter()
                    .any(|i| i.dst == reg as u8 || i.src == reg as u8)
            })
            .collect();
        let has_tail_call = prog
            .insns
            .iter()
            .any(|i| i.code == insn::JMP | insn::TAIL_CALL);
        Self {
            stack_depth: prog.stack_depth,
            callee_regs,
            tail_call_reachable: prog.tail_call_reachable || has_tail_call,
            is_subprog: prog.is_subprog,
        }
    }

    pub fn rounded_depth(&self) -> u32 {
        self.stack_depth.next_multiple_of(8)
    }

    /// Displacement from rbp of the tail-call counter. The counter lives in
    /// the upper half of the slot pushed by the prologue.
    pub fn tcc_off(&self) -> i32 {
        -4 - self.rounded_depth() as i32
    }

    pub fn push_callee_regs(&self, asm: &mut X86_64Assembler) {
        for reg in &self.callee_regs {
            asm.push(reg.native());
        }
    }

    pub fn pop_callee_regs(&self, asm: &mut X86_64Assembler) {
        for reg in self.callee_regs.iter().rev() {
            asm.pop(reg.native());
        }
    }
}

/// Inputs of one emission pass.
pub(crate) struct PassParams<'a> {
    pub prog: &'a Program,
    pub frame: &'a Frame,
    pub abi: &'a TargetAbi,
    pub resolver: &'a dyn CallResolver,
    /// Offset map of the previous pass: `addrs[k]` is where instruction `k`
    /// starts, `addrs[n]` is the end of the code.
    pub addrs: &'a [usize],
    /// Known only on the final pass.
    pub image_base: Option<usize>,
    /// Pad shrinking jumps so every instruction keeps its previous length.
    pub padding: bool,
    pub max_insn_size: usize,
    pub insn_safety: usize,
}

/// Result of one emission pass.
#[derive(Debug, Default)]
pub(crate) struct PassOutput {
    pub code: Vec<u8>,
    pub addrs: Vec<usize>,
    pub cleanup_addr: Option<usize>,
    pub probes: Vec<ProbeSite>,
    pub direct_sites: Vec<DirectSite>,
    /// Calls emitted with a placeholder because the target is not known yet.
    pub pending_calls: usize,
}

pub(crate) fn emit_pass(p: &PassParams) -> Result<PassOutput> {
    let n = p.prog.insns.len();
    if p.addrs.len() != n + 1 {
        return Err(JitError::internal("offset map does not match program length"));
    }
    let capacity = p.addrs[n] + p.max_insn_size + p.insn_safety;
    let mut emitter = Emitter {
        p,
        buf: CodeBuffer::with_capacity(capacity),
        out: PassOutput {
            addrs: vec![0; n + 1],
            ..Default::default()
        },
    };

    emitter.emit_prologue();
    emitter.out.addrs[0] = emitter.buf.len();

    let mut k = 0;
    while k < n {
        let start = emitter.buf.len();
        let consumed = emitter.emit_insn(k)?;
        let len = emitter.buf.len() - start;
        if len > p.max_insn_size {
            return Err(JitError::internal(format!(
                "instruction {k} emitted {len} bytes, limit {}",
                p.max_insn_size
            )));
        }
        for j in 0..consumed {
            emitter.out.addrs[k + 1 + j] = emitter.buf.len();
        }
        k += consumed;
    }

    let Emitter { buf, mut out, .. } = emitter;
    out.code = buf.into_code();
    Ok(out)
}

fn vreg(index: u8) -> Result<(VReg, Reg)> {
    VReg::from_index(index)
        .map(|v| (v, v.native()))
        .ok_or_else(|| JitError::internal(format!("invalid register r{index}")))
}

fn width(size: u8) -> Width {
    match size {
        insn::B => Width::B,
        insn::H => Width::H,
        insn::W => Width::W,
        _ => Width::DW,
    }
}

fn alu_op(op: u8) -> Option<AluOp> {
    match op {
        insn::ADD => Some(AluOp::Add),
        insn::SUB => Some(AluOp::Sub),
        insn::AND => Some(AluOp::And),
        insn::OR => Some(AluOp::Or),
        insn::XOR => Some(AluOp::Xor),
        _ => None,
    }
}

fn shift_op(op: u8) -> Option<ShiftOp> {
    match op {
        insn::LSH => Some(ShiftOp::Shl),
        insn::RSH => Some(ShiftOp::Shr),
        insn::ARSH => Some(ShiftOp::Sar),
        _ => None,
    }
}

fn jump_cond(op: u8) -> Option<Cond> {
    match op {
        insn::JEQ => Some(Cond::E),
        insn::JNE | insn::JSET => Some(Cond::Ne),
        insn::JGT => Some(Cond::A),
        insn::JLT => Some(Cond::B),
        insn::JGE => Some(Cond::Ae),
        insn::JLE => Some(Cond::Be),
        insn::JSGT => Some(Cond::G),
        insn::JSLT => Some(Cond::L),
        insn::JSGE => Some(Cond::Ge),
        insn::JSLE => Some(Cond::Le),
        _ => None,
    }
}

fn unknown(insn: &Insn) -> JitError {
    JitError::internal(format!("unknown opcode {:#04x}", insn.code))
}

struct Emitter<'p, 'a> {
    p: &'p PassParams<'a>,
    buf: CodeBuffer,
    out: PassOutput,
}

impl Emitter<'_, '_> {
    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// Patchable NOP, counter init, frame setup, stack, counter slot and
    /// callee-saved registers. The first `TAIL_CALL_OFFSET` bytes have a
    /// fixed layout.
    fn emit_prologue(&mut self) {
        let frame = self.p.frame;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.nops(5);
        if frame.tail_call_reachable && !frame.is_subprog {
            // xor eax, eax
            asm.buf().emit_bytes(&[0x31, 0xC0]);
        } else {
            asm.nops(2);
        }
        asm.push(Reg::Rbp);
        asm.mov_reg(Reg::Rbp, Reg::Rsp, true);
        if frame.stack_depth != 0 {
            // sub rsp, depth
            asm.buf().emit_bytes(&[0x48, 0x81, 0xEC]);
            asm.buf().emit_u32(frame.rounded_depth());
        }
        if frame.tail_call_reachable {
            asm.push(Reg::Rax);
        }
        frame.push_callee_regs(&mut asm);
    }

    fn emit_insn(&mut self, k: usize) -> Result<usize> {
        let insn = self.p.prog.insns[k];
        match insn::class(insn.code) {
            insn::ALU => self.emit_alu(&insn, false)?,
            insn::ALU64 => self.emit_alu(&insn, true)?,
            insn::LD => {
                if !insn.is_ld_imm64() {
                    return Err(unknown(&insn));
                }
                let hi = self
                    .p
                    .prog
                    .insns
                    .get(k + 1)
                    .ok_or_else(|| JitError::internal("truncated 64-bit immediate load"))?;
                let (_, dst) = vreg(insn.dst)?;
                let imm = (hi.imm as u32 as u64) << 32 | insn.imm as u32 as u64;
                self.asm().mov_imm64(dst, imm);
                return Ok(2);
            }
            insn::LDX => self.emit_load(&insn)?,
            insn::ST => self.emit_store_imm(&insn)?,
            insn::STX => self.emit_store(&insn)?,
            insn::JMP => self.emit_jump(k, &insn, true)?,
            insn::JMP32 => self.emit_jump(k, &insn, false)?,
            _ => return Err(unknown(&insn)),
        }
        Ok(1)
    }

    // ==================== ALU ====================

    fn emit_alu(&mut self, insn: &Insn, is64: bool) -> Result<()> {
        let (dst_v, dst) = vreg(insn.dst)?;
        let op = insn::op(insn.code);
        let by_reg = insn::src_kind(insn.code) == insn::X;
        let imm = insn.imm;

        if let Some(alu) = alu_op(op) {
            if by_reg {
                let (_, src) = vreg(insn.src)?;
                self.asm().alu_rr(alu, dst, src, is64);
            } else {
                self.asm().alu_ri(alu, dst, imm, is64);
            }
            return Ok(());
        }

        if let Some(shift) = shift_op(op) {
            if by_reg {
                let (src_v, src) = vreg(insn.src)?;
                self.emit_shift_reg(shift, dst_v, src_v, src, is64);
            } else {
                self.asm().shift_ri(shift, dst, imm as u8, is64);
            }
            return Ok(());
        }

        match op {
            insn::MOV if by_reg => {
                let (_, src) = vreg(insn.src)?;
                self.asm().mov_reg(dst, src, is64);
            }
            insn::MOV => self.asm().mov_imm32(dst, imm, is64),
            insn::NEG => self.asm().neg(dst, is64),
            insn::MUL => {
                let src = if by_reg { Some(vreg(insn.src)?.1) } else { None };
                self.emit_mul(dst_v, src, imm, is64);
            }
            insn::DIV | insn::MOD => {
                let src = if by_reg { Some(vreg(insn.src)?.1) } else { None };
                self.emit_divmod(op == insn::MOD, dst_v, src, imm, is64);
            }
            insn::END => self.emit_endian(insn, dst)?,
            _ => return Err(unknown(insn)),
        }
        Ok(())
    }

    /// `mul` works on rdx:rax. Both are saved unless they are the
    /// destination, the multiplier goes through the aux register.
    fn emit_mul(&mut self, dst_v: VReg, src: Option<Reg>, imm: i32, is64: bool) {
        let dst = dst_v.native();
        let rax = VReg::R0.native();
        let aux = VReg::Aux.native();
        let mut asm = self.asm();

        if dst_v != VReg::R0 {
            asm.push(rax);
        }
        if dst_v != VReg::R3 {
            asm.push(VReg::R3.native());
        }
        asm.mov_rr(aux, dst);
        match src {
            Some(src) => asm.mov_reg(rax, src, is64),
            None => asm.mov_imm32(rax, imm, is64),
        }
        asm.mul(aux, is64);
        if dst_v != VReg::R3 {
            asm.pop(VReg::R3.native());
        }
        if dst_v != VReg::R0 {
            asm.mov_rr(dst, rax);
            asm.pop(rax);
        }
    }

    /// `div` divides rdx:rax. Both are saved around it and the result is
    /// moved out through the aux register.
    fn emit_divmod(&mut self, is_mod: bool, dst_v: VReg, src: Option<Reg>, imm: i32, is64: bool) {
        let dst = dst_v.native();
        let rax = VReg::R0.native();
        let rdx = VReg::R3.native();
        let aux = VReg::Aux.native();
        let mut asm = self.asm();

        asm.push(rax);
        asm.push(rdx);
        match src {
            Some(src) => asm.mov_rr(aux, src),
            None => asm.mov_imm32(aux, imm, true),
        }
        asm.mov_rr(rax, dst);
        asm.alu_rr(AluOp::Xor, rdx, rdx, false);
        asm.div(aux, is64);
        asm.mov_reg(aux, if is_mod { rdx } else { rax }, true);
        asm.pop(rdx);
        asm.pop(rax);
        asm.mov_rr(dst, aux);
    }

    /// Variable shifts take their count in cl. A destination of rcx is
    /// shifted in the aux register instead; rcx is saved unless it already
    /// holds the count.
    fn emit_shift_reg(&mut self, shift: ShiftOp, dst_v: VReg, src_v: VReg, src: Reg, is64: bool) {
        let rcx = VReg::R4.native();
        let aux = VReg::Aux.native();
        let mut dst = dst_v.native();
        let mut asm = self.asm();

        if dst_v == VReg::R4 {
            asm.mov_rr(aux, dst);
            dst = aux;
        }
        if src_v != VReg::R4 {
            asm.push(rcx);
            asm.mov_rr(rcx, src);
        }
        asm.shift_cl(shift, dst, is64);
        if src_v != VReg::R4 {
            asm.pop(rcx);
        }
        if dst_v == VReg::R4 {
            asm.mov_rr(rcx, aux);
        }
    }

    fn emit_endian(&mut self, insn: &Insn, dst: Reg) -> Result<()> {
        let to_be = insn::src_kind(insn.code) == insn::TO_BE;
        let mut asm = self.asm();
        match (to_be, insn.imm) {
            (true, 16) => asm.bswap(dst, Width::H),
            (true, 32) => asm.bswap(dst, Width::W),
            (true, 64) => asm.bswap(dst, Width::DW),
            (false, 16) => asm.movzx16(dst),
            (false, 32) => asm.mov_reg(dst, dst, false),
            (false, 64) => {}
            _ => return Err(unknown(insn)),
        }
        Ok(())
    }

    // ==================== Memory ====================

    fn emit_load(&mut self, insn: &Insn) -> Result<()> {
        let (dst_v, dst) = vreg(insn.dst)?;
        let (_, src) = vreg(insn.src)?;
        let width = width(insn::size(insn.code));
        let off = insn.off as i32;

        match insn::mode(insn.code) {
            insn::MEM => self.asm().ldx(width, dst, src, off),
            insn::MEMSX if width != Width::DW => self.asm().ldsx(width, dst, src, off),
            mode @ (insn::PROBE_MEM | insn::PROBE_MEMSX) => {
                if dst_v as u8 > VReg::R9 as u8 {
                    return Err(JitError::internal(format!(
                        "probe load into {dst_v:?} has no fault fixup slot"
                    )));
                }
                let start = self.buf.len();
                if mode == insn::PROBE_MEM {
                    self.asm().ldx(width, dst, src, off);
                } else if width != Width::DW {
                    self.asm().ldsx(width, dst, src, off);
                } else {
                    return Err(unknown(insn));
                }
                self.out.probes.push(ProbeSite {
                    insn_off: start,
                    insn_len: self.buf.len() - start,
                    reg_slot: self.p.abi.reg_slot(dst),
                });
            }
            _ => return Err(unknown(insn)),
        }
        Ok(())
    }

    fn emit_store_imm(&mut self, insn: &Insn) -> Result<()> {
        if insn::mode(insn.code) != insn::MEM {
            return Err(unknown(insn));
        }
        let (_, dst) = vreg(insn.dst)?;
        let width = width(insn::size(insn.code));
        self.asm().st_imm(width, dst, insn.off as i32, insn.imm);
        Ok(())
    }

    fn emit_store(&mut self, insn: &Insn) -> Result<()> {
        let (dst_v, dst) = vreg(insn.dst)?;
        let (src_v, src) = vreg(insn.src)?;
        let width = width(insn::size(insn.code));
        let off = insn.off as i32;

        match insn::mode(insn.code) {
            insn::MEM => self.asm().stx(width, dst, src, off),
            insn::ATOMIC if matches!(width, Width::W | Width::DW) => {
                let is64 = width == Width::DW;
                let fetch_op = insn.imm & !insn::FETCH;
                match insn.imm {
                    imm if imm == insn::FETCH | insn::AND as i32
                        || imm == insn::FETCH | insn::OR as i32
                        || imm == insn::FETCH | insn::XOR as i32 =>
                    {
                        let alu = alu_op(fetch_op as u8).ok_or_else(|| unknown(insn))?;
                        self.emit_atomic_fetch_loop(alu, width, dst_v, src_v, off)?;
                    }
                    imm => {
                        let op = match imm {
                            imm if imm == insn::ADD as i32 => AtomicOp::Alu(AluOp::Add),
                            imm if imm == insn::AND as i32 => AtomicOp::Alu(AluOp::And),
                            imm if imm == insn::OR as i32 => AtomicOp::Alu(AluOp::Or),
                            imm if imm == insn::XOR as i32 => AtomicOp::Alu(AluOp::Xor),
                            imm if imm == insn::ADD as i32 | insn::FETCH => AtomicOp::FetchAdd,
                            insn::XCHG => AtomicOp::Xchg,
                            insn::CMPXCHG => AtomicOp::Cmpxchg,
                            _ => return Err(unknown(insn)),
                        };
                        let mut asm = self.asm();
                        asm.atomic(op, dst, src, off, is64);
                        if op == AtomicOp::Cmpxchg && !is64 {
                            // A successful 32-bit cmpxchg leaves eax unwritten.
                            let rax = VReg::R0.native();
                            asm.mov_reg(rax, rax, false);
                        }
                    }
                }
            }
            _ => return Err(unknown(insn)),
        }
        Ok(())
    }

    /// Fetching and/or/xor have no native form: retry a cmpxchg of the
    /// locally computed result until no other writer intervened.
    fn emit_atomic_fetch_loop(&mut self, alu: AluOp, width: Width, dst_v: VReg, src_v: VReg, off: i32) -> Result<()> {
        let is64 = width == Width::DW;
        let rax = VReg::R0.native();
        let ax = VReg::Ax.native();
        let aux = VReg::Aux.native();
        // cmpxchg needs rax, so R0 lives in ax meanwhile
        let real_src = if src_v == VReg::R0 { ax } else { src_v.native() };
        let real_dst = if dst_v == VReg::R0 { ax } else { dst_v.native() };
        let mut asm = self.asm();

        asm.mov_reg(ax, rax, true);
        let retry = asm.len();
        asm.ldx(width, rax, real_dst, off);
        asm.mov_reg(aux, rax, is64);
        asm.alu_rr(alu, aux, real_src, is64);
        asm.atomic(AtomicOp::Cmpxchg, real_dst, aux, off, is64);
        let rel = retry as i64 - (asm.len() as i64 + 2);
        if !is_imm8(rel) {
            return Err(JitError::internal("atomic retry loop too long"));
        }
        asm.jcc_rel8(Cond::Ne, rel as i8);
        asm.mov_reg(real_src, rax, is64);
        asm.mov_reg(rax, ax, true);
        Ok(())
    }

    // ==================== Control flow ====================

    /// Previous length of instruction `k` minus what it has emitted so far.
    fn insn_size_diff(&self, k: usize, insn_start: usize) -> i64 {
        (self.p.addrs[k + 1] - self.p.addrs[k]) as i64 - (self.buf.len() - insn_start) as i64
    }

    /// Displacement from the end of `k` to the instruction `off` slots later.
    fn jump_offset(&self, k: usize, off: i16) -> Result<i64> {
        let target = k as i64 + 1 + off as i64;
        if target < 0 || target as usize >= self.p.addrs.len() {
            return Err(JitError::internal(format!("jump from {k} to {target} leaves program")));
        }
        Ok(self.p.addrs[target as usize] as i64 - self.p.addrs[k + 1] as i64)
    }

    fn pad(&mut self, k: usize, insn_start: usize, reserved: i64, allowed: &[i64]) -> Result<()> {
        if !self.p.padding {
            return Ok(());
        }
        let nops = self.insn_size_diff(k, insn_start) - reserved;
        if !allowed.contains(&nops) {
            return Err(JitError::internal(format!("unexpected jump padding of {nops} bytes at {k}")));
        }
        self.asm().nops(nops as usize);
        Ok(())
    }

    fn emit_jmp(&mut self, k: usize, insn_start: usize, offset: i64, elide_zero: bool) -> Result<()> {
        if offset == 0 && elide_zero {
            return self.pad(k, insn_start, 0, &[0, 2, 5]);
        }
        if is_imm8(offset) {
            self.pad(k, insn_start, 2, &[0, 3])?;
            self.asm().jmp_rel8(offset as i8);
        } else if is_simm32(offset) {
            self.asm().jmp_rel32(offset as i32);
        } else {
            return Err(JitError::out_of_range("jump displacement", offset));
        }
        Ok(())
    }

    fn emit_cond_jmp(&mut self, k: usize, insn_start: usize, cond: Cond, offset: i64) -> Result<()> {
        if is_imm8(offset) {
            self.pad(k, insn_start, 2, &[0, 4])?;
            self.asm().jcc_rel8(cond, offset as i8);
        } else if is_simm32(offset) {
            self.asm().jcc_rel32(cond, offset as i32);
        } else {
            return Err(JitError::out_of_range("conditional jump displacement", offset));
        }
        Ok(())
    }

    fn emit_jump(&mut self, k: usize, insn: &Insn, is64: bool) -> Result<()> {
        let insn_start = self.buf.len();
        let op = insn::op(insn.code);

        match op {
            insn::JA if is64 => {
                // A jump to itself is always two bytes back; long runs of
                // such dead-code stubs would otherwise cost extra passes.
                let offset = if insn.off == -1 { -2 } else { self.jump_offset(k, insn.off)? };
                return self.emit_jmp(k, insn_start, offset, true);
            }
            insn::EXIT if is64 => return self.emit_exit(k, insn_start),
            insn::CALL if is64 => return self.emit_call(k, insn),
            insn::TAIL_CALL if is64 => return self.emit_tail_call(insn),
            _ => {}
        }

        let cond = jump_cond(op).ok_or_else(|| unknown(insn))?;
        let (_, dst) = vreg(insn.dst)?;
        let by_reg = insn::src_kind(insn.code) == insn::X;
        {
            let mut asm = self.asm();
            match (op, by_reg) {
                (insn::JSET, true) => {
                    let (_, src) = vreg(insn.src)?;
                    asm.test_rr(dst, src, is64);
                }
                (insn::JSET, false) => asm.test_ri(dst, insn.imm, is64),
                (_, true) => {
                    let (_, src) = vreg(insn.src)?;
                    asm.cmp_rr(dst, src, is64);
                }
                (_, false) if insn.imm == 0 => asm.test_rr(dst, dst, is64),
                (_, false) => asm.cmp_ri(dst, insn.imm, is64),
            }
        }
        let offset = self.jump_offset(k, insn.off)?;
        self.emit_cond_jmp(k, insn_start, cond, offset)
    }

    /// The first exit is the shared epilogue; later ones jump to it.
    fn emit_exit(&mut self, k: usize, insn_start: usize) -> Result<()> {
        if let Some(cleanup) = self.out.cleanup_addr {
            let offset = cleanup as i64 - self.p.addrs[k + 1] as i64;
            return self.emit_jmp(k, insn_start, offset, false);
        }
        self.out.cleanup_addr = Some(insn_start);
        let frame = self.p.frame;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        frame.pop_callee_regs(&mut asm);
        asm.leave();
        asm.ret();
        Ok(())
    }

    fn emit_call(&mut self, k: usize, insn: &Insn) -> Result<()> {
        let insn_start = self.buf.len();
        let site = CallSite {
            insn_idx: k,
            imm: insn.imm,
            pseudo: insn.is_pseudo_call(),
        };
        let target = self.p.resolver.resolve(&site);
        if target.is_none() && !site.pseudo {
            return Err(JitError::internal(format!("unresolved helper {} at {k}", insn.imm)));
        }

        let frame = self.p.frame;
        if frame.tail_call_reachable {
            // mov rax, [rbp - depth - 8]: hand the counter to the callee
            self.buf.emit_bytes(&[0x48, 0x8B, 0x85]);
            self.buf.emit_u32((-(frame.rounded_depth() as i32) - 8) as u32);
        }

        let rel = match (target, self.p.image_base) {
            (Some(target), Some(base)) => {
                let ip = base + self.p.addrs[k] + (self.buf.len() - insn_start);
                let rel = target as i64 - (ip as i64 + 5);
                if !is_simm32(rel) {
                    return Err(JitError::out_of_range("call displacement", rel));
                }
                rel as i32
            }
            _ => 0,
        };
        if target.is_none() {
            self.out.pending_calls += 1;
        }
        self.asm().call_rel32(rel);
        Ok(())
    }

    fn emit_tail_call(&mut self, insn: &Insn) -> Result<()> {
        let frame = self.p.frame;
        if insn.imm == 0 {
            return tail_call::emit_indirect(&mut self.buf, frame, self.p.abi);
        }
        let index = insn.imm as usize - 1;
        if insn.imm < 0 || index >= self.p.prog.poke_tab.len() {
            return Err(JitError::internal(format!("tail call through missing descriptor {}", insn.imm)));
        }
        let site = tail_call::emit_direct(&mut self.buf, frame, index)?;
        self.out.direct_sites.push(site);
        Ok(())
    }
}
