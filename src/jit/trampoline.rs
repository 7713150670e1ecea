//! Function trampolines.
//!
//! A trampoline wraps a native function with compiled programs that run
//! before it (fentry), instead of its return value (fmod_ret) and after it
//! (fexit). Frame layout, from the frame pointer down:
//!
//! ```text
//! rbp + 8            return address
//! rbp + 0            saved rbp
//! rbp - 8            return value      (CALL_ORIG or RET_FENTRY_RET)
//!                    arg N-1
//!                    ...
//! rbp - regs_off     arg 0             ctx pointer handed to programs
//! rbp - nregs_off    argument count
//! rbp - ip_off       traced function   (IP_ARG)
//! rbp - run_ctx_off  run context       cookie, saved context
//! ```

use bitflags::bitflags;

use super::abi::PATCH_SIZE;
use super::codebuf::CodeBuffer;
use super::error::{JitError, Result};
use super::memory::{ExecutableMemory, ImageAllocator, TRAP_FILL};
use super::text_poke::{self, PokeKind, PokeOutcome};
use super::x86_64::{AluOp, NOP5, Reg, Width, X86_64Assembler, is_imm8, is_simm32};

/// Register arguments supported by the x86-64 calling convention.
pub const MAX_TRAMP_ARGS: usize = 6;

const ARG_REGS: [Reg; MAX_TRAMP_ARGS] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Cookie slot and saved context pointer.
const RUN_CTX_SIZE: i32 = 16;
const RUN_CTX_COOKIE_OFF: i32 = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrampFlags: u32 {
        /// Reload argument registers before returning.
        const RESTORE_REGS = 1 << 0;
        /// Call the wrapped function between fentry and fexit.
        const CALL_ORIG = 1 << 1;
        /// Return to the wrapped function's caller, skipping its frame.
        const SKIP_FRAME = 1 << 2;
        /// Store the traced function's address below the arguments.
        const IP_ARG = 1 << 3;
        /// Return whatever the last fentry program returned.
        const RET_FENTRY_RET = 1 << 4;
    }
}

/// Argument sizes in bytes of the wrapped function, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncModel {
    pub arg_sizes: Vec<u8>,
}

impl FuncModel {
    pub fn new(arg_sizes: impl Into<Vec<u8>>) -> Self {
        Self {
            arg_sizes: arg_sizes.into(),
        }
    }
}

/// One compiled program attached to a trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampProg {
    /// Opaque identity handed to the enter/exit hooks.
    pub handle: u64,
    pub entry: usize,
    pub cookie: u64,
    /// Use the sleepable enter/exit hooks.
    pub sleepable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrampLinks {
    pub fentry: Vec<TrampProg>,
    pub fexit: Vec<TrampProg>,
    pub fmod_ret: Vec<TrampProg>,
}

/// Bookkeeping functions called around each program and around the
/// wrapped call.
///
/// `prog_enter(handle, run_ctx) -> start` returns 0 to skip the program,
/// `prog_exit(handle, start, run_ctx)` always runs. `tramp_enter(image)`
/// and `tramp_exit(image)` bracket the wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampHooks {
    pub prog_enter: usize,
    pub prog_exit: usize,
    pub sleepable_enter: usize,
    pub sleepable_exit: usize,
    pub tramp_enter: usize,
    pub tramp_exit: usize,
}

#[derive(Debug, Clone)]
pub struct TrampolineRequest<'a> {
    pub model: &'a FuncModel,
    pub flags: TrampFlags,
    pub links: &'a TrampLinks,
    pub hooks: TrampHooks,
    /// The wrapped function.
    pub orig_call: usize,
    /// Opaque identity of this trampoline, handed to the tramp hooks.
    pub image_handle: u64,
}

/// Emitted trampoline; offsets are relative to its start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrampolineCode {
    pub code: Vec<u8>,
    /// NOP right after the wrapped call.
    pub ip_after_call: Option<usize>,
    /// Start of the exit bookkeeping.
    pub ip_epilogue: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    stack_size: i32,
    regs_off: i32,
    nregs_off: i32,
    ip_off: i32,
    run_ctx_off: i32,
    save_ret: bool,
}

impl Layout {
    fn new(nr_args: usize, flags: TrampFlags) -> Self {
        let save_ret = flags.intersects(TrampFlags::CALL_ORIG | TrampFlags::RET_FENTRY_RET);
        let mut stack_size = nr_args as i32 * 8;
        if save_ret {
            stack_size += 8;
        }
        let regs_off = stack_size;
        stack_size += 8;
        let nregs_off = stack_size;
        if flags.contains(TrampFlags::IP_ARG) {
            stack_size += 8;
        }
        let ip_off = stack_size;
        stack_size += RUN_CTX_SIZE;
        let run_ctx_off = stack_size;
        // Entered through the call at a patched function start, so rsp is
        // 16-byte aligned on entry. Keep it aligned at calls once rbp and
        // rbx are pushed.
        if stack_size % 16 != 0 {
            stack_size += 8;
        }
        Self {
            stack_size,
            regs_off,
            nregs_off,
            ip_off,
            run_ctx_off,
            save_ret,
        }
    }
}

fn check_request(req: &TrampolineRequest) -> Result<()> {
    let sizes = &req.model.arg_sizes;
    if sizes.len() > MAX_TRAMP_ARGS {
        return Err(JitError::NotSupported(format!(
            "{} arguments, at most {MAX_TRAMP_ARGS} fit in registers",
            sizes.len()
        )));
    }
    if let Some(size) = sizes.iter().find(|s| !matches!(s, 1 | 2 | 4 | 8)) {
        return Err(JitError::NotSupported(format!("argument of {size} bytes")));
    }
    if !req.links.fmod_ret.is_empty() && !req.flags.contains(TrampFlags::CALL_ORIG) {
        return Err(JitError::NotSupported("fmod_ret programs without the original call".into()));
    }
    if req.flags.contains(TrampFlags::CALL_ORIG | TrampFlags::RET_FENTRY_RET) {
        return Err(JitError::NotSupported(
            "fentry return value and original call are exclusive".into(),
        ));
    }
    Ok(())
}

fn arg_width(size: u8) -> Width {
    match size {
        1 => Width::B,
        2 => Width::H,
        4 => Width::W,
        _ => Width::DW,
    }
}

struct TrampEmitter<'r, 'a> {
    req: &'r TrampolineRequest<'a>,
    layout: Layout,
    buf: CodeBuffer,
    base: Option<usize>,
}

impl TrampEmitter<'_, '_> {
    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// `call target`; placeholder displacement until the base is known.
    fn call(&mut self, target: usize) -> Result<()> {
        let rel = match self.base {
            Some(base) => {
                let rel = target as i64 - (base + self.buf.len() + PATCH_SIZE) as i64;
                if !is_simm32(rel) {
                    return Err(JitError::out_of_range("trampoline call displacement", rel));
                }
                rel as i32
            }
            None => 0,
        };
        self.asm().call_rel32(rel);
        Ok(())
    }

    fn save_regs(&mut self) {
        let regs_off = self.layout.regs_off;
        let req = self.req;
        let mut asm = self.asm();
        for (i, &size) in req.model.arg_sizes.iter().enumerate() {
            asm.stx(arg_width(size), Reg::Rbp, ARG_REGS[i], -(regs_off - i as i32 * 8));
        }
    }

    fn restore_regs(&mut self) {
        let regs_off = self.layout.regs_off;
        let req = self.req;
        let mut asm = self.asm();
        for (i, &size) in req.model.arg_sizes.iter().enumerate() {
            asm.ldx(arg_width(size), ARG_REGS[i], Reg::Rbp, -(regs_off - i as i32 * 8));
        }
    }

    /// Run one program between its enter and exit hooks. The program is
    /// skipped when the enter hook returns 0.
    fn invoke_prog(&mut self, prog: &TrampProg, save_ret: bool) -> Result<()> {
        let hooks = self.req.hooks;
        let (enter, exit) = if prog.sleepable {
            (hooks.sleepable_enter, hooks.sleepable_exit)
        } else {
            (hooks.prog_enter, hooks.prog_exit)
        };
        let run_ctx_off = self.layout.run_ctx_off;
        let regs_off = self.layout.regs_off;

        {
            let mut asm = self.asm();
            asm.mov_imm64(Reg::Rdi, prog.cookie);
            asm.stx(Width::DW, Reg::Rbp, Reg::Rdi, -run_ctx_off + RUN_CTX_COOKIE_OFF);
            asm.mov_imm64(Reg::Rdi, prog.handle);
            asm.lea(Reg::Rsi, Reg::Rbp, -run_ctx_off);
        }
        self.call(enter)?;

        let skip = {
            let mut asm = self.asm();
            // start time survives the program call in rbx
            asm.mov_reg(Reg::Rbx, Reg::Rax, true);
            asm.test_rr(Reg::Rax, Reg::Rax, true);
            let skip = asm.len();
            asm.nops(2);
            asm.lea(Reg::Rdi, Reg::Rbp, -regs_off);
            skip
        };
        self.call(prog.entry)?;
        if save_ret {
            self.asm().stx(Width::DW, Reg::Rbp, Reg::Rax, -8);
        }

        let rel = self.buf.len() as i64 - (skip as i64 + 2);
        if !is_imm8(rel) {
            return Err(JitError::internal("trampoline skip branch too long"));
        }
        // je skip
        self.buf.patch_u8(skip, 0x74);
        self.buf.patch_u8(skip + 1, rel as u8);

        {
            let mut asm = self.asm();
            asm.mov_imm64(Reg::Rdi, prog.handle);
            asm.mov_reg(Reg::Rsi, Reg::Rbx, true);
            asm.lea(Reg::Rdx, Reg::Rbp, -run_ctx_off);
        }
        self.call(exit)
    }

    /// Run fmod_ret programs; each one that leaves a non-zero return value
    /// branches past the rest and the wrapped call. Returns the offsets of
    /// those branches.
    fn invoke_mod_ret(&mut self) -> Result<Vec<usize>> {
        {
            let mut asm = self.asm();
            // the first program must not see a stale value
            asm.mov_imm32(Reg::Rax, 0, false);
            asm.stx(Width::DW, Reg::Rbp, Reg::Rax, -8);
        }
        let req = self.req;
        let mut branches = Vec::with_capacity(req.links.fmod_ret.len());
        for prog in &req.links.fmod_ret {
            self.invoke_prog(prog, true)?;
            // cmp qword [rbp - 8], 0
            self.buf.emit_bytes(&[0x48, 0x83, 0x7D, 0xF8, 0x00]);
            branches.push(self.buf.len());
            self.asm().nops(6);
        }
        Ok(branches)
    }

    fn emit(mut self) -> Result<TrampolineCode> {
        let req = self.req;
        let flags = req.flags;
        let layout = self.layout;
        let mut orig_call = req.orig_call;
        if flags.contains(TrampFlags::SKIP_FRAME) {
            // the patched call at the function start
            orig_call += PATCH_SIZE;
        }

        {
            let mut asm = self.asm();
            asm.push(Reg::Rbp);
            asm.mov_reg(Reg::Rbp, Reg::Rsp, true);
            asm.alu_ri(AluOp::Sub, Reg::Rsp, layout.stack_size, true);
            asm.push(Reg::Rbx);

            asm.mov_imm64(Reg::Rax, req.model.arg_sizes.len() as u64);
            asm.stx(Width::DW, Reg::Rbp, Reg::Rax, -layout.nregs_off);
            if flags.contains(TrampFlags::IP_ARG) {
                asm.ldx(Width::DW, Reg::Rax, Reg::Rbp, 8);
                asm.alu_ri(AluOp::Sub, Reg::Rax, PATCH_SIZE as i32, true);
                asm.stx(Width::DW, Reg::Rbp, Reg::Rax, -layout.ip_off);
            }
        }
        self.save_regs();

        if flags.contains(TrampFlags::CALL_ORIG) {
            self.asm().mov_imm64(Reg::Rdi, req.image_handle);
            self.call(req.hooks.tramp_enter)?;
        }

        let ret_fentry = flags.contains(TrampFlags::RET_FENTRY_RET);
        for prog in &req.links.fentry {
            self.invoke_prog(prog, ret_fentry)?;
        }

        let branches = if req.links.fmod_ret.is_empty() {
            Vec::new()
        } else {
            self.invoke_mod_ret()?
        };

        let mut ip_after_call = None;
        if flags.contains(TrampFlags::CALL_ORIG) {
            self.restore_regs();
            self.call(orig_call)?;
            self.asm().stx(Width::DW, Reg::Rbp, Reg::Rax, -8);
            ip_after_call = Some(self.buf.len());
            self.buf.emit_bytes(&NOP5);
        }

        if !branches.is_empty() {
            // reached by fall-through when no program vetoed, so pad with NOPs
            let at = self.base.unwrap_or(0) + self.buf.len();
            self.asm().nops(at.next_multiple_of(16) - at);
            let do_fexit = self.buf.len();
            for at in branches {
                // jne do_fexit
                self.buf.patch_u8(at, 0x0F);
                self.buf.patch_u8(at + 1, 0x85);
                self.buf.patch_u32(at + 2, (do_fexit as i64 - (at as i64 + 6)) as u32);
            }
        }

        for prog in &req.links.fexit {
            self.invoke_prog(prog, false)?;
        }

        if flags.contains(TrampFlags::RESTORE_REGS) {
            self.restore_regs();
        }

        let mut ip_epilogue = None;
        if flags.contains(TrampFlags::CALL_ORIG) {
            ip_epilogue = Some(self.buf.len());
            self.asm().mov_imm64(Reg::Rdi, req.image_handle);
            self.call(req.hooks.tramp_exit)?;
        }

        let mut asm = self.asm();
        if layout.save_ret {
            asm.ldx(Width::DW, Reg::Rax, Reg::Rbp, -8);
        }
        asm.pop(Reg::Rbx);
        asm.leave();
        if flags.contains(TrampFlags::SKIP_FRAME) {
            // drop our return address, return to the parent
            asm.alu_ri(AluOp::Add, Reg::Rsp, 8, true);
        }
        asm.ret();

        Ok(TrampolineCode {
            code: self.buf.into_code(),
            ip_after_call,
            ip_epilogue,
        })
    }
}

/// Emit a trampoline for an image at `image_base`. Without a base, call
/// displacements are placeholders but the length is final.
pub fn emit_trampoline(req: &TrampolineRequest, image_base: Option<usize>) -> Result<TrampolineCode> {
    check_request(req)?;
    let emitter = TrampEmitter {
        req,
        layout: Layout::new(req.model.arg_sizes.len(), req.flags),
        buf: CodeBuffer::new(),
        base: image_base,
    };
    emitter.emit()
}

/// An installed trampoline.
#[derive(Debug)]
pub struct TrampolineImage {
    mem: ExecutableMemory,
    len: usize,
    ip_after_call: Option<usize>,
    ip_epilogue: Option<usize>,
}

impl TrampolineImage {
    pub fn entry(&self) -> usize {
        self.mem.addr()
    }

    pub fn code(&self) -> &[u8] {
        self.mem.bytes(0, self.len)
    }

    pub fn ip_after_call(&self) -> Option<usize> {
        self.ip_after_call.map(|off| self.entry() + off)
    }

    pub fn ip_epilogue(&self) -> Option<usize> {
        self.ip_epilogue.map(|off| self.entry() + off)
    }

    /// Route the patchable call site at `ip` into this trampoline.
    ///
    /// # Safety
    ///
    /// `ip` must be a mapped 5-byte patch site holding a NOP or a call.
    pub unsafe fn attach(&self, ip: *mut u8, old: Option<usize>) -> Result<PokeOutcome> {
        unsafe { text_poke::arch_text_poke(ip, PokeKind::Call, old, Some(self.entry())) }
    }

    /// Undo [`Self::attach`].
    ///
    /// # Safety
    ///
    /// Same as [`Self::attach`].
    pub unsafe fn detach(&self, ip: *mut u8) -> Result<PokeOutcome> {
        unsafe { text_poke::arch_text_poke(ip, PokeKind::Call, Some(self.entry()), None) }
    }
}

/// Size, allocate, emit and lock a trampoline.
pub fn build_trampoline(req: &TrampolineRequest, allocator: &dyn ImageAllocator) -> Result<TrampolineImage> {
    // Alignment padding depends on the base, so reserve its worst case.
    let sized = emit_trampoline(req, None)?;
    let mut mem = allocator.alloc(sized.code.len() + 16)?;
    mem.fill(TRAP_FILL)?;

    let code = emit_trampoline(req, Some(mem.addr()))?;
    mem.write(0, &code.code)?;
    mem.make_executable()?;
    tracing::debug!(len = code.code.len(), entry = mem.addr(), "trampoline installed");

    Ok(TrampolineImage {
        len: code.code.len(),
        mem,
        ip_after_call: code.ip_after_call,
        ip_epilogue: code.ip_epilogue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::x86_64::emit_nops;

    fn hooks() -> TrampHooks {
        TrampHooks {
            prog_enter: 0x1000,
            prog_exit: 0x2000,
            sleepable_enter: 0x3000,
            sleepable_exit: 0x4000,
            tramp_enter: 0x5000,
            tramp_exit: 0x6000,
        }
    }

    fn request<'a>(model: &'a FuncModel, links: &'a TrampLinks, flags: TrampFlags) -> TrampolineRequest<'a> {
        TrampolineRequest {
            model,
            flags,
            links,
            hooks: hooks(),
            orig_call: 0x7000,
            image_handle: 0x42,
        }
    }

    #[test]
    fn test_layout_alignment() {
        let layout = Layout::new(1, TrampFlags::CALL_ORIG);
        assert_eq!(layout.regs_off, 16);
        assert_eq!(layout.nregs_off, 24);
        assert_eq!(layout.run_ctx_off, 40);
        assert_eq!(layout.stack_size, 48);

        let layout = Layout::new(3, TrampFlags::IP_ARG);
        assert_eq!(layout.stack_size, 64);
    }

    #[test]
    fn test_too_many_args() {
        let model = FuncModel::new([8; 7]);
        let links = TrampLinks::default();
        let err = emit_trampoline(&request(&model, &links, TrampFlags::empty()), None).unwrap_err();
        assert!(matches!(err, JitError::NotSupported(_)));
    }

    #[test]
    fn test_bad_arg_size() {
        let model = FuncModel::new([8, 3]);
        let links = TrampLinks::default();
        let err = emit_trampoline(&request(&model, &links, TrampFlags::empty()), None).unwrap_err();
        assert!(matches!(err, JitError::NotSupported(_)));
    }

    #[test]
    fn test_mod_ret_needs_orig_call() {
        let model = FuncModel::new([8]);
        let prog = TrampProg {
            handle: 1,
            entry: 0x8000,
            cookie: 0,
            sleepable: false,
        };
        let links = TrampLinks {
            fmod_ret: vec![prog],
            ..Default::default()
        };
        let err = emit_trampoline(&request(&model, &links, TrampFlags::empty()), None).unwrap_err();
        assert!(matches!(err, JitError::NotSupported(_)));
    }

    #[test]
    fn test_empty_trampoline_bytes() {
        let model = FuncModel::new([8]);
        let links = TrampLinks::default();
        let code = emit_trampoline(&request(&model, &links, TrampFlags::empty()), Some(0)).unwrap();
        // stack: 8 (arg) + 8 (count) + 16 (run ctx) = 32, already aligned
        assert_eq!(
            code.code,
            vec![
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x48, 0x83, 0xEC, 0x20, // sub rsp, 32
                0x53, // push rbx
                0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
                0x48, 0x89, 0x45, 0xF0, // mov [rbp - 16], rax
                0x48, 0x89, 0x7D, 0xF8, // mov [rbp - 8], rdi
                0x5B, // pop rbx
                0xC9, // leave
                0xC3, // ret
            ]
        );
        assert_eq!(code.ip_after_call, None);
    }

    #[test]
    fn test_mod_ret_branches_reach_fexit() {
        let model = FuncModel::new([8, 8]);
        let prog = TrampProg {
            handle: 1,
            entry: 0x8000,
            cookie: 0,
            sleepable: false,
        };
        let links = TrampLinks {
            fmod_ret: vec![prog, prog],
            fexit: vec![prog],
            ..Default::default()
        };
        let code = emit_trampoline(&request(&model, &links, TrampFlags::CALL_ORIG), Some(0x10_0000)).unwrap();
        let after_call = code.ip_after_call.unwrap();
        let do_fexit = (after_call + NOP5.len()).next_multiple_of(16);

        let cmp = [0x48, 0x83, 0x7D, 0xF8, 0x00];
        let sites: Vec<usize> = code
            .code
            .windows(cmp.len())
            .enumerate()
            .filter(|(_, w)| *w == cmp)
            .map(|(i, _)| i + cmp.len())
            .collect();
        assert_eq!(sites.len(), 2);
        for at in sites {
            assert_eq!(&code.code[at..at + 2], &[0x0F, 0x85]);
            let rel = i32::from_le_bytes(code.code[at + 2..at + 6].try_into().unwrap());
            assert_eq!(at as i64 + 6 + rel as i64, do_fexit as i64);
        }
        // the gap is on the fall-through path
        let gap = &code.code[after_call + NOP5.len()..do_fexit];
        assert!(!gap.contains(&TRAP_FILL));
        let mut nops = CodeBuffer::new();
        emit_nops(&mut nops, gap.len());
        assert_eq!(gap, nops.code());
    }

    #[test]
    fn test_call_out_of_range() {
        let model = FuncModel::new([8]);
        let links = TrampLinks::default();
        let mut req = request(&model, &links, TrampFlags::CALL_ORIG);
        req.orig_call = 0x7fff_0000_0000;
        let err = emit_trampoline(&req, Some(0x1000)).unwrap_err();
        assert!(matches!(err, JitError::OutOfRange { .. }));
    }
}
