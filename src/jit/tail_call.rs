//! Tail calls.
//!
//! Both forms bound chained tail calls with a counter kept in the caller's
//! frame, then tear the frame down and jump past the target's prologue
//! (`TAIL_CALL_OFFSET` bytes) so the counter survives the transfer.
//!
//! The indirect form indexes a [`ProgArray`](super::abi::ProgArray) at run
//! time. The direct form jumps through a patchable site whose target is set
//! by [`TailCallTable::update`] when the table slot changes.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::abi::{MAX_TAIL_CALL_CNT, PATCH_SIZE, TAIL_CALL_OFFSET, TargetAbi};
use super::codebuf::CodeBuffer;
use super::emit::Frame;
use super::error::{JitError, Result};
use super::memory::ExecutableMemory;
use super::text_poke::{self, PokeKind, PokeOutcome};
use super::x86_64::{NOP5, X86_64Assembler, is_imm8};

/// Patch-site descriptor of one direct tail call in an installed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PokeSite {
    /// Jump that skips the frame teardown while the slot is empty.
    pub tailcall_bypass: usize,
    /// NOP that becomes `jmp target + adj_off` while the slot is populated.
    pub tailcall_target: usize,
    /// Where the bypass jumps: just past `tailcall_target`.
    pub bypass_addr: usize,
    pub adj_off: usize,
}

/// Offsets of a direct tail call within the code being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectSite {
    pub poke_index: usize,
    pub bypass_off: usize,
    pub target_off: usize,
}

impl DirectSite {
    pub fn at(&self, image_base: usize) -> PokeSite {
        let tailcall_target = image_base + self.target_off;
        PokeSite {
            tailcall_bypass: image_base + self.bypass_off,
            tailcall_target,
            bypass_addr: tailcall_target + PATCH_SIZE,
            adj_off: TAIL_CALL_OFFSET,
        }
    }
}

/// `mov eax, [rbp + tcc]; cmp eax, MAX; jae out` returning the offset of
/// the `jae` displacement, then `add eax, 1; mov [rbp + tcc], eax`.
fn emit_count_check(buf: &mut CodeBuffer, tcc_off: i32) -> usize {
    buf.emit_bytes(&[0x8B, 0x85]);
    buf.emit_u32(tcc_off as u32);
    buf.emit_bytes(&[0x83, 0xF8, MAX_TAIL_CALL_CNT as u8]);
    let jae = buf.len();
    buf.emit_bytes(&[0x73, 0x00]);
    buf.emit_bytes(&[0x83, 0xC0, 0x01]);
    buf.emit_bytes(&[0x89, 0x85]);
    buf.emit_u32(tcc_off as u32);
    jae
}

/// Pop callee-saved registers, the counter slot and the stack frame.
fn emit_frame_teardown(buf: &mut CodeBuffer, frame: &Frame) {
    let mut asm = X86_64Assembler::new(buf);
    frame.pop_callee_regs(&mut asm);
    // pop rax
    asm.buf().emit_u8(0x58);
    if frame.stack_depth != 0 {
        asm.buf().emit_bytes(&[0x48, 0x81, 0xC4]);
        asm.buf().emit_u32(frame.rounded_depth());
    }
}

/// Point the rel8 branch at `at` to the current end of `buf`.
fn patch_short_branch(buf: &mut CodeBuffer, at: usize) -> Result<()> {
    let rel = buf.len() as i64 - (at as i64 + 2);
    if !is_imm8(rel) {
        return Err(JitError::internal(format!("tail call branch of {rel} bytes")));
    }
    buf.patch_u8(at + 1, rel as u8);
    Ok(())
}

/// Tail call through the program array in R2, index in R3. Falls through
/// when the index is out of bounds, the slot is empty or the counter is
/// exhausted.
pub fn emit_indirect(buf: &mut CodeBuffer, frame: &Frame, abi: &TargetAbi) -> Result<()> {
    let tcc_off = frame.tcc_off();

    // mov edx, edx
    buf.emit_bytes(&[0x89, 0xD2]);
    // cmp [rsi + max_entries], edx
    buf.emit_u8(0x39);
    if is_imm8(abi.array_max_entries_off as i64) {
        buf.emit_u8(0x56);
        buf.emit_u8(abi.array_max_entries_off as u8);
    } else {
        buf.emit_u8(0x96);
        buf.emit_u32(abi.array_max_entries_off as u32);
    }
    let jbe = buf.len();
    buf.emit_bytes(&[0x76, 0x00]);

    let jae = emit_count_check(buf, tcc_off);

    // mov rcx, [rsi + rdx * 8 + ptrs]
    buf.emit_bytes(&[0x48, 0x8B, 0x8C, 0xD6]);
    buf.emit_u32(abi.array_ptrs_off as u32);
    // test rcx, rcx; je out
    buf.emit_bytes(&[0x48, 0x85, 0xC9]);
    let je = buf.len();
    buf.emit_bytes(&[0x74, 0x00]);

    emit_frame_teardown(buf, frame);

    // mov rcx, [rcx + bpf_func]
    if is_imm8(abi.prog_bpf_func_off as i64) {
        buf.emit_bytes(&[0x48, 0x8B, 0x49, abi.prog_bpf_func_off as u8]);
    } else {
        buf.emit_bytes(&[0x48, 0x8B, 0x89]);
        buf.emit_u32(abi.prog_bpf_func_off as u32);
    }
    // add rcx, TAIL_CALL_OFFSET; jmp rcx
    buf.emit_bytes(&[0x48, 0x83, 0xC1, TAIL_CALL_OFFSET as u8]);
    buf.emit_bytes(&[0xFF, 0xE1]);

    for at in [jbe, jae, je] {
        patch_short_branch(buf, at)?;
    }
    Ok(())
}

/// Tail call to a statically chosen table slot. Emitted with the bypass
/// active and the target site a NOP, i.e. "slot empty".
pub fn emit_direct(buf: &mut CodeBuffer, frame: &Frame, poke_index: usize) -> Result<DirectSite> {
    let jae = emit_count_check(buf, frame.tcc_off());

    let bypass_off = buf.len();
    buf.emit_bytes(&[0xE9, 0, 0, 0, 0]);
    emit_frame_teardown(buf, frame);
    let target_off = buf.len();
    buf.emit_bytes(&NOP5);

    let rel = (target_off + PATCH_SIZE - (bypass_off + PATCH_SIZE)) as u32;
    buf.patch_u32(bypass_off + 1, rel);
    patch_short_branch(buf, jae)?;

    Ok(DirectSite {
        poke_index,
        bypass_off,
        target_off,
    })
}

#[derive(Debug)]
struct Tracked {
    token: u64,
    key: u32,
    site: PokeSite,
}

#[derive(Debug)]
struct TableInner {
    slots: Vec<Option<usize>>,
    tracked: Vec<Tracked>,
}

/// Runtime-mutable table of direct tail-call targets.
///
/// Slots hold the entry address of a compiled program. Every installed
/// direct tail call on a key is tracked so that [`Self::update`] can repoint
/// it.
#[derive(Debug)]
pub struct TailCallTable {
    max_entries: u32,
    inner: Mutex<TableInner>,
    next_token: AtomicU64,
}

impl TailCallTable {
    pub fn new(max_entries: u32) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(TableInner {
                slots: vec![None; max_entries as usize],
                tracked: Vec::new(),
            }),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn get(&self, key: u32) -> Option<usize> {
        self.inner.lock().slots.get(key as usize).copied().flatten()
    }

    /// Number of tracked sites for `key`.
    pub fn tracked(&self, key: u32) -> usize {
        self.inner.lock().tracked.iter().filter(|t| t.key == key).count()
    }

    fn check_key(&self, key: u32) -> Result<()> {
        if key >= self.max_entries {
            return Err(JitError::out_of_range("tail call key", key as i64));
        }
        Ok(())
    }

    /// Resolve a freshly emitted site against the current slot and start
    /// tracking it. `mem` must not be executable yet.
    pub(crate) fn install(&self, key: u32, site: PokeSite, mem: &mut ExecutableMemory) -> Result<u64> {
        self.check_key(key)?;
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.slots[key as usize] {
            let base = mem.addr();
            expect_patched(text_poke::poke_unpublished(
                mem,
                site.tailcall_target - base,
                PokeKind::Jump,
                None,
                Some(entry + site.adj_off),
            )?)?;
            expect_patched(text_poke::poke_unpublished(
                mem,
                site.tailcall_bypass - base,
                PokeKind::Jump,
                Some(site.bypass_addr),
                None,
            )?)?;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        inner.tracked.push(Tracked { token, key, site });
        Ok(token)
    }

    pub(crate) fn untrack(&self, token: u64) {
        self.inner.lock().tracked.retain(|t| t.token != token);
    }

    /// Set slot `key` to the program whose code starts at `entry` (or clear
    /// it) and repoint every tracked site.
    pub fn update(&self, key: u32, entry: Option<usize>) -> Result<()> {
        self.check_key(key)?;
        let mut inner = self.inner.lock();
        let old = inner.slots[key as usize];

        for tracked in inner.tracked.iter().filter(|t| t.key == key) {
            let site = &tracked.site;
            let old_addr = old.map(|e| e + site.adj_off);
            let new_addr = entry.map(|e| e + site.adj_off);
            // Sites stay mapped while tracked: images untrack before unmapping.
            unsafe {
                if new_addr.is_some() {
                    poke(site.tailcall_target, old_addr, new_addr)?;
                    if old.is_none() {
                        poke(site.tailcall_bypass, Some(site.bypass_addr), None)?;
                    }
                } else {
                    let old_bypass = if old.is_some() { None } else { Some(site.bypass_addr) };
                    poke(site.tailcall_bypass, old_bypass, Some(site.bypass_addr))?;
                    text_poke::sync_cores();
                    poke(site.tailcall_target, old_addr, None)?;
                }
            }
        }

        inner.slots[key as usize] = entry;
        tracing::debug!(key, ?entry, "tail call slot updated");
        Ok(())
    }
}

/// # Safety
///
/// `ip` must be a tracked site in a live image.
unsafe fn poke(ip: usize, old: Option<usize>, new: Option<usize>) -> Result<()> {
    let outcome = unsafe { text_poke::arch_text_poke(ip as *mut u8, PokeKind::Jump, old, new)? };
    if outcome == PokeOutcome::Mismatch {
        return Err(JitError::internal(format!("tail call site {ip:#x} out of sync with table")));
    }
    Ok(())
}

fn expect_patched(outcome: PokeOutcome) -> Result<()> {
    match outcome {
        PokeOutcome::Mismatch => Err(JitError::internal("fresh tail call site does not hold placeholder")),
        _ => Ok(()),
    }
}
