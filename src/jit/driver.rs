//! Pass driver.
//!
//! Re-runs the emitter until the instruction offset map stops changing,
//! then allocates the image and emits once more into it. A program whose
//! sub-program calls cannot be resolved yet is returned as a
//! [`PendingProgram`] that finishes with exactly one more pass.

use std::collections::HashMap;
use std::sync::Arc;

use super::emit::{self, Frame, PassOutput, PassParams};
use super::error::{JitError, Result};
use super::extable::{self, EXTABLE_ENTRY_SIZE, ExceptionTable};
use super::memory::{ExecutableMemory, ImageAllocator, MmapAllocator, TRAP_FILL};
use super::tail_call::TailCallTable;
use crate::config::JitConfig;
use crate::jit::abi::ProgImage;
use crate::program::Program;

/// A call instruction as seen by a [`CallResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub insn_idx: usize,
    pub imm: i32,
    /// Call into another sub-program rather than a helper.
    pub pseudo: bool,
}

/// Resolves call instructions to absolute addresses.
pub trait CallResolver {
    fn resolve(&self, site: &CallSite) -> Option<usize>;
}

/// Helpers by id, sub-program calls by call instruction index.
#[derive(Debug, Clone, Default)]
pub struct HelperTable {
    helpers: HashMap<i32, usize>,
    subprogs: HashMap<usize, usize>,
}

impl HelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: i32, addr: usize) -> &mut Self {
        self.helpers.insert(id, addr);
        self
    }

    /// Resolve the pseudo call at instruction `insn_idx` to `addr`.
    pub fn insert_subprog(&mut self, insn_idx: usize, addr: usize) -> &mut Self {
        self.subprogs.insert(insn_idx, addr);
        self
    }
}

impl CallResolver for HelperTable {
    fn resolve(&self, site: &CallSite) -> Option<usize> {
        if site.pseudo {
            self.subprogs.get(&site.insn_idx).copied()
        } else {
            self.helpers.get(&site.imm).copied()
        }
    }
}

/// Compiles programs into executable images.
pub struct JitCompiler<A: ImageAllocator = MmapAllocator> {
    config: JitConfig,
    allocator: A,
}

impl JitCompiler {
    pub fn new(config: JitConfig) -> Self {
        Self::with_allocator(config, MmapAllocator)
    }
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new(JitConfig::default())
    }
}

/// Result of [`JitCompiler::compile`].
#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(CompiledProgram),
    /// Sub-program calls are still unresolved.
    Pending(PendingProgram),
}

impl CompileOutcome {
    pub fn into_compiled(self) -> Option<CompiledProgram> {
        match self {
            CompileOutcome::Compiled(compiled) => Some(compiled),
            CompileOutcome::Pending(_) => None,
        }
    }
}

/// State kept between a compilation and its extra pass.
#[derive(Debug)]
pub struct JitContext {
    frame: Frame,
    addrs: Vec<usize>,
    cleanup_addr: Option<usize>,
    code_len: usize,
    padding: bool,
    passes: usize,
}

impl JitContext {
    pub fn addrs(&self) -> &[usize] {
        &self.addrs
    }

    pub fn cleanup_addr(&self) -> Option<usize> {
        self.cleanup_addr
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

/// A converged compilation waiting for its sub-program addresses.
///
/// The image is allocated but never made executable until [`Self::finish`]
/// succeeds.
#[derive(Debug)]
pub struct PendingProgram {
    ctx: JitContext,
    image: ExecutableMemory,
    config: JitConfig,
}

impl PendingProgram {
    pub fn context(&self) -> &JitContext {
        &self.ctx
    }

    /// Address the program will run at.
    pub fn entry(&self) -> usize {
        self.image.addr()
    }

    /// Emit once more with every call resolved. The offsets must match the
    /// converged ones exactly.
    pub fn finish(mut self, prog: &mut Program, resolver: &dyn CallResolver) -> Result<CompiledProgram> {
        let out = emit::emit_pass(&PassParams {
            prog,
            frame: &self.ctx.frame,
            abi: &self.config.abi,
            resolver,
            addrs: &self.ctx.addrs,
            image_base: Some(self.image.addr()),
            padding: self.ctx.padding,
            max_insn_size: self.config.max_insn_size,
            insn_safety: self.config.insn_safety,
        })?;
        self.ctx.passes += 1;
        check_final(&self.ctx, &out)?;
        if out.pending_calls > 0 {
            return Err(JitError::internal(format!(
                "{} sub-program calls still unresolved in extra pass",
                out.pending_calls
            )));
        }
        finalize(prog, self.ctx, self.image, out)
    }
}

fn check_final(ctx: &JitContext, out: &PassOutput) -> Result<()> {
    if out.code.len() != ctx.code_len {
        return Err(JitError::internal(format!(
            "final pass length {} != converged length {}",
            out.code.len(),
            ctx.code_len
        )));
    }
    if out.addrs != ctx.addrs {
        return Err(JitError::internal("final pass moved instruction offsets"));
    }
    Ok(())
}

/// Lay out code and exception table in the image, resolve direct tail
/// calls and lock the image.
fn finalize(
    prog: &mut Program,
    ctx: JitContext,
    mut image: ExecutableMemory,
    out: PassOutput,
) -> Result<CompiledProgram> {
    let num_ex = prog.num_exentries();
    if out.probes.len() != num_ex {
        return Err(JitError::internal(format!(
            "emitted {} probe loads, program has {num_ex}",
            out.probes.len()
        )));
    }

    image.write(0, &out.code)?;

    let base = image.addr();
    let table_off = out.code.len().next_multiple_of(4);
    let entries = extable::build(&out.probes, table_off)?;
    for (i, entry) in entries.iter().enumerate() {
        image.write(table_off + i * EXTABLE_ENTRY_SIZE, &entry.to_bytes())?;
    }
    let extable = ExceptionTable::new(base + table_off, entries);

    let mut tracked = Vec::with_capacity(out.direct_sites.len());
    let installed = install_direct_sites(prog, &out, &mut image, &mut tracked)
        .and_then(|()| image.make_executable().map_err(JitError::from));
    if let Err(err) = installed {
        // The image is about to be unmapped; no table may patch it later.
        for (table, token) in &tracked {
            table.untrack(*token);
        }
        return Err(err);
    }

    tracing::info!(
        name = %prog.name,
        len = ctx.code_len,
        passes = ctx.passes,
        exentries = extable.len(),
        entry = base,
        "program compiled"
    );

    Ok(CompiledProgram {
        name: prog.name.clone(),
        image,
        code_len: ctx.code_len,
        addrs: ctx.addrs,
        passes: ctx.passes,
        extable,
        tracked,
    })
}

fn install_direct_sites(
    prog: &mut Program,
    out: &PassOutput,
    image: &mut ExecutableMemory,
    tracked: &mut Vec<(Arc<TailCallTable>, u64)>,
) -> Result<()> {
    let base = image.addr();
    for direct in &out.direct_sites {
        let site = direct.at(base);
        let poke = prog
            .poke_tab
            .get_mut(direct.poke_index)
            .ok_or_else(|| JitError::internal("direct tail call lost its descriptor"))?;
        poke.site = Some(site);
        let token = poke.table.install(poke.key, site, image)?;
        tracked.push((Arc::clone(&poke.table), token));
    }
    Ok(())
}

impl<A: ImageAllocator> JitCompiler<A> {
    pub fn with_allocator(config: JitConfig, allocator: A) -> Self {
        Self { config, allocator }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compile `prog`. Direct tail-call descriptors in `prog.poke_tab` get
    /// their sites filled in.
    pub fn compile(&self, prog: &mut Program, resolver: &dyn CallResolver) -> Result<CompileOutcome> {
        let n = prog.len();
        if n == 0 {
            return Err(JitError::internal("empty program"));
        }
        let frame = Frame::for_program(prog);
        let estimate = self.config.initial_insn_estimate;
        let mut addrs: Vec<usize> = (0..=n).map(|k| (k + 1) * estimate).collect();
        let mut prev_len = 0;
        let mut image: Option<ExecutableMemory> = None;
        let mut padding = false;
        let mut pass = 0;

        loop {
            if pass >= self.config.max_passes && image.is_none() {
                tracing::error!(name = %prog.name, passes = pass, "image did not converge");
                return Err(JitError::internal(format!(
                    "image did not converge after {pass} passes"
                )));
            }
            if !padding && pass >= self.config.padding_passes {
                padding = true;
            }

            let out = emit::emit_pass(&PassParams {
                prog,
                frame: &frame,
                abi: &self.config.abi,
                resolver,
                addrs: &addrs,
                image_base: image.as_ref().map(ExecutableMemory::addr),
                padding,
                max_insn_size: self.config.max_insn_size,
                insn_safety: self.config.insn_safety,
            })?;
            pass += 1;
            let len = out.code.len();
            tracing::debug!(name = %prog.name, pass, len, padding, "jit pass");

            if let Some(image) = image {
                let ctx = JitContext {
                    frame,
                    addrs,
                    cleanup_addr: out.cleanup_addr,
                    code_len: prev_len,
                    padding,
                    passes: pass,
                };
                check_final(&ctx, &out)?;
                if out.pending_calls > 0 {
                    tracing::debug!(name = %prog.name, calls = out.pending_calls, "sub-program calls pending");
                    return Ok(CompileOutcome::Pending(PendingProgram {
                        ctx,
                        image,
                        config: self.config.clone(),
                    }));
                }
                return finalize(prog, ctx, image, out).map(CompileOutcome::Compiled);
            }

            if len == prev_len && out.addrs == addrs {
                let size = len.next_multiple_of(4) + prog.num_exentries() * EXTABLE_ENTRY_SIZE;
                let mut mem = self.allocator.alloc(size)?;
                mem.fill(TRAP_FILL)?;
                image = Some(mem);
            }
            prev_len = len;
            addrs = out.addrs;

            if n >= self.config.yield_threshold {
                std::thread::yield_now();
            }
        }
    }
}

/// An installed, executable program.
#[derive(Debug)]
pub struct CompiledProgram {
    name: String,
    image: ExecutableMemory,
    code_len: usize,
    addrs: Vec<usize>,
    passes: usize,
    extable: ExceptionTable,
    tracked: Vec<(Arc<TailCallTable>, u64)>,
}

/// Native signature of a compiled program: R1-R5 in, R0 out.
pub type ProgramFn = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;

impl CompiledProgram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> usize {
        self.image.addr()
    }

    pub fn code(&self) -> &[u8] {
        self.image.bytes(0, self.code_len)
    }

    /// Native offset of each instruction; the last element is the code length.
    pub fn addrs(&self) -> &[usize] {
        &self.addrs
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn extable(&self) -> &ExceptionTable {
        &self.extable
    }

    /// Descriptor for program arrays and tail-call tables.
    pub fn image(&self) -> ProgImage {
        ProgImage {
            bpf_func: self.entry(),
        }
    }

    /// # Safety
    ///
    /// Every helper and sub-program the program calls must still be live,
    /// and the arguments must be valid for the memory the program touches.
    pub unsafe fn as_fn(&self) -> ProgramFn {
        unsafe { std::mem::transmute::<*const u8, ProgramFn>(self.image.as_ptr()) }
    }
}

impl Drop for CompiledProgram {
    fn drop(&mut self) {
        for (table, token) in &self.tracked {
            table.untrack(*token);
        }
    }
}
