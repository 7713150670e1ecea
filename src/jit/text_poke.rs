//! Live patching of 5-byte call/jump sites.
//!
//! Code that other threads may be executing is rewritten with the
//! trap-first protocol: write `int3` over the first byte, synchronize all
//! cores, write the tail, synchronize, then write the first byte. A thread
//! that reaches the site mid-patch either executes the old or the new
//! instruction, or traps on `int3`; the embedder's SIGTRAP handler resolves
//! such traps through [`poke_int3_handler`].
//!
//! All patches are serialized by one process-wide mutex.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

use parking_lot::Mutex;

use super::abi::PATCH_SIZE;
use super::error::{JitError, Result};
use super::memory::{ExecutableMemory, Protection, protect};
use super::x86_64::NOP5;

static TEXT_MUTEX: Mutex<()> = parking_lot::const_mutex(());

const INT3: u8 = 0xCC;
const CALL_OPCODE: u8 = 0xE8;
const JMP_OPCODE: u8 = 0xE9;

/// Which instruction a populated site holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeKind {
    Call,
    Jump,
}

/// Result of a patch request that passed range checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    Patched,
    /// The site already held the requested encoding.
    Unchanged,
    /// The site did not hold the expected old encoding; nothing was written.
    Mismatch,
}

/// Encode the site at `ip`: `call`/`jmp rel32` to `target`, or a NOP when
/// `target` is `None`.
pub fn gen_insn(ip: usize, kind: PokeKind, target: Option<usize>) -> Result<[u8; PATCH_SIZE]> {
    let Some(target) = target else {
        return Ok(NOP5);
    };
    let rel = target as i64 - (ip as i64 + PATCH_SIZE as i64);
    if rel != rel as i32 as i64 {
        return Err(JitError::out_of_range("patch target", rel));
    }
    let mut insn = [0u8; PATCH_SIZE];
    insn[0] = match kind {
        PokeKind::Call => CALL_OPCODE,
        PokeKind::Jump => JMP_OPCODE,
    };
    insn[1..].copy_from_slice(&(rel as i32).to_le_bytes());
    Ok(insn)
}

/// How a thread that hit `int3` on a site being patched should continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Int3Resolution {
    /// Emulate a call: push `return_ip`, continue at `target`.
    Call { target: usize, return_ip: usize },
    Jump { target: usize },
    /// The new encoding is a NOP; continue after the site.
    Skip { resume_ip: usize },
}

// Site currently mid-patch (0 when none) and its new encoding.
static ACTIVE_ADDR: AtomicUsize = AtomicUsize::new(0);
static ACTIVE_INSN: AtomicU64 = AtomicU64::new(0);

/// Resolve a breakpoint trap. `trap_ip` is the instruction pointer reported
/// for the trap, one past the `int3` byte. Returns `None` when the trap was
/// not raised by a site under patch.
///
/// The site stays published until every core has been synchronized with
/// its final encoding. A handler that still gets `None` for a trap at an
/// address that no longer holds `int3` should resume at that address.
pub fn poke_int3_handler(trap_ip: usize) -> Option<Int3Resolution> {
    let addr = ACTIVE_ADDR.load(Ordering::Acquire);
    if addr == 0 || trap_ip.wrapping_sub(1) != addr {
        return None;
    }
    let packed = ACTIVE_INSN.load(Ordering::Acquire).to_le_bytes();
    let mut insn = [0u8; PATCH_SIZE];
    insn.copy_from_slice(&packed[..PATCH_SIZE]);
    Some(resolve(addr, &insn))
}

fn resolve(addr: usize, insn: &[u8; PATCH_SIZE]) -> Int3Resolution {
    let next = addr + PATCH_SIZE;
    let rel = i32::from_le_bytes([insn[1], insn[2], insn[3], insn[4]]) as i64;
    let target = (next as i64 + rel) as usize;
    match insn[0] {
        CALL_OPCODE => Int3Resolution::Call {
            target,
            return_ip: next,
        },
        JMP_OPCODE => Int3Resolution::Jump { target },
        _ => Int3Resolution::Skip { resume_ip: next },
    }
}

fn publish(addr: usize, insn: &[u8; PATCH_SIZE]) {
    let mut packed = [0u8; 8];
    packed[..PATCH_SIZE].copy_from_slice(insn);
    ACTIVE_INSN.store(u64::from_le_bytes(packed), Ordering::Release);
    ACTIVE_ADDR.store(addr, Ordering::Release);
}

fn unpublish() {
    ACTIVE_ADDR.store(0, Ordering::Release);
}

#[cfg(target_os = "linux")]
pub(crate) fn sync_cores() {
    use std::sync::OnceLock;

    const REGISTER_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_long = 64;
    const PRIVATE_EXPEDITED_SYNC_CORE: libc::c_long = 32;
    static REGISTERED: OnceLock<bool> = OnceLock::new();

    fence(Ordering::SeqCst);
    let registered = *REGISTERED.get_or_init(|| {
        let ret = unsafe { libc::syscall(libc::SYS_membarrier, REGISTER_PRIVATE_EXPEDITED_SYNC_CORE, 0, 0) };
        if ret != 0 {
            tracing::debug!("membarrier sync-core unavailable, using fences only");
        }
        ret == 0
    });
    if registered {
        unsafe {
            libc::syscall(libc::SYS_membarrier, PRIVATE_EXPEDITED_SYNC_CORE, 0, 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sync_cores() {
    fence(Ordering::SeqCst);
}

/// Rewrite live code at `ip` with `insn` using the trap-first protocol.
///
/// # Safety
///
/// `ip` must point at a complete `PATCH_SIZE`-byte instruction inside a
/// mapping created by [`ExecutableMemory`]. The caller must hold
/// `TEXT_MUTEX`.
unsafe fn text_poke_bp(ip: *mut u8, insn: &[u8; PATCH_SIZE]) -> Result<()> {
    publish(ip as usize, insn);
    if let Err(e) = protect(ip, PATCH_SIZE, Protection::ReadWriteExec) {
        unpublish();
        return Err(e.into());
    }

    unsafe {
        std::ptr::write_volatile(ip, INT3);
        sync_cores();

        for (i, &byte) in insn.iter().enumerate().skip(1) {
            std::ptr::write_volatile(ip.add(i), byte);
        }
        sync_cores();

        std::ptr::write_volatile(ip, insn[0]);
        sync_cores();
    }

    let restored = protect(ip, PATCH_SIZE, Protection::ReadExec);
    // traps taken before the last write may still be in flight
    sync_cores();
    unpublish();
    restored?;
    Ok(())
}

fn read_site(ip: *const u8) -> [u8; PATCH_SIZE] {
    let mut cur = [0u8; PATCH_SIZE];
    for (i, byte) in cur.iter_mut().enumerate() {
        *byte = unsafe { std::ptr::read_volatile(ip.add(i)) };
    }
    cur
}

/// Patch the site at a raw address from `old` to `new`.
///
/// # Safety
///
/// `ip` must be the start of a `PATCH_SIZE`-byte call, jump or NOP inside
/// executable memory owned by this JIT, and that memory must stay mapped
/// for the duration of the call.
pub unsafe fn arch_text_poke(
    ip: *mut u8,
    kind: PokeKind,
    old: Option<usize>,
    new: Option<usize>,
) -> Result<PokeOutcome> {
    let old_insn = gen_insn(ip as usize, kind, old)?;
    let new_insn = gen_insn(ip as usize, kind, new)?;

    let _guard = TEXT_MUTEX.lock();
    let cur = read_site(ip);
    if cur != old_insn {
        return Ok(PokeOutcome::Mismatch);
    }
    if cur == new_insn {
        return Ok(PokeOutcome::Unchanged);
    }
    unsafe { text_poke_bp(ip, &new_insn)? };
    Ok(PokeOutcome::Patched)
}

/// Patch the site at `offset` in an executable image.
pub fn poke_site(
    mem: &ExecutableMemory,
    offset: usize,
    kind: PokeKind,
    old: Option<usize>,
    new: Option<usize>,
) -> Result<PokeOutcome> {
    if !mem.is_executable() {
        return Err(JitError::internal("live patch on an image that is not installed"));
    }
    if offset + PATCH_SIZE > mem.size() {
        return Err(JitError::internal(format!("patch site {offset:#x} outside image")));
    }
    let ip = mem.as_ptr().wrapping_add(offset) as *mut u8;
    unsafe { arch_text_poke(ip, kind, old, new) }
}

/// Patch a site in an image that no thread can be executing yet. A plain
/// copy suffices.
pub fn poke_unpublished(
    mem: &mut ExecutableMemory,
    offset: usize,
    kind: PokeKind,
    old: Option<usize>,
    new: Option<usize>,
) -> Result<PokeOutcome> {
    let ip = mem.addr() + offset;
    let old_insn = gen_insn(ip, kind, old)?;
    let new_insn = gen_insn(ip, kind, new)?;

    let _guard = TEXT_MUTEX.lock();
    if mem.bytes(offset, PATCH_SIZE) != old_insn {
        return Ok(PokeOutcome::Mismatch);
    }
    if old_insn == new_insn {
        return Ok(PokeOutcome::Unchanged);
    }
    mem.write(offset, &new_insn)?;
    Ok(PokeOutcome::Patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_image() -> ExecutableMemory {
        let mut mem = ExecutableMemory::new(64).unwrap();
        mem.fill(0xCC).unwrap();
        mem.write(0, &NOP5).unwrap();
        mem.write(5, &[0xC3]).unwrap();
        mem.make_executable().unwrap();
        mem
    }

    #[test]
    fn test_gen_insn() {
        assert_eq!(gen_insn(0x1000, PokeKind::Call, None).unwrap(), NOP5);
        assert_eq!(
            gen_insn(0x1000, PokeKind::Jump, Some(0x1010)).unwrap(),
            [0xE9, 0x0B, 0, 0, 0]
        );
        assert_eq!(
            gen_insn(0x1000, PokeKind::Call, Some(0x1000)).unwrap(),
            [0xE8, 0xFB, 0xFF, 0xFF, 0xFF]
        );
        assert!(matches!(
            gen_insn(0x1000, PokeKind::Jump, Some(0x1000 + (1 << 32))),
            Err(JitError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_patch_and_restore() {
        let mem = site_image();
        let target = mem.addr() + 0x20;

        let outcome = poke_site(&mem, 0, PokeKind::Jump, None, Some(target)).unwrap();
        assert_eq!(outcome, PokeOutcome::Patched);
        assert_eq!(mem.bytes(0, 5), &[0xE9, 0x1B, 0, 0, 0]);
        assert!(mem.is_executable());

        // The site no longer holds a NOP.
        let outcome = poke_site(&mem, 0, PokeKind::Jump, None, Some(target)).unwrap();
        assert_eq!(outcome, PokeOutcome::Mismatch);

        let outcome = poke_site(&mem, 0, PokeKind::Jump, Some(target), Some(target)).unwrap();
        assert_eq!(outcome, PokeOutcome::Unchanged);

        let outcome = poke_site(&mem, 0, PokeKind::Jump, Some(target), None).unwrap();
        assert_eq!(outcome, PokeOutcome::Patched);
        assert_eq!(mem.bytes(0, 5), &NOP5);
    }

    #[test]
    fn test_range_error_leaves_site_untouched() {
        let mem = site_image();
        let far = mem.addr().wrapping_add(1 << 33);
        assert!(matches!(
            poke_site(&mem, 0, PokeKind::Call, None, Some(far)),
            Err(JitError::OutOfRange { .. })
        ));
        assert_eq!(mem.bytes(0, 5), &NOP5);
    }

    #[test]
    fn test_poke_requires_installed_image() {
        let mem = ExecutableMemory::new(64).unwrap();
        assert!(matches!(
            poke_site(&mem, 0, PokeKind::Jump, None, None),
            Err(JitError::Internal(_))
        ));
    }

    #[test]
    fn test_poke_unpublished() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        mem.write(0, &NOP5).unwrap();
        let target = mem.addr() + 0x10;
        let outcome = poke_unpublished(&mut mem, 0, PokeKind::Call, None, Some(target)).unwrap();
        assert_eq!(outcome, PokeOutcome::Patched);
        assert_eq!(mem.bytes(0, 5), &[0xE8, 0x0B, 0, 0, 0]);
    }

    #[test]
    fn test_concurrent_reader_sees_committed_encodings() {
        use std::sync::atomic::AtomicBool;

        let mem = site_image();
        let ip = mem.addr();
        let target = ip + 0x20;
        let jmp = gen_insn(ip, PokeKind::Jump, Some(target)).unwrap();
        let done = AtomicBool::new(false);

        let (samples, traps) = std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let (mut samples, mut traps) = (0usize, 0usize);
                while !done.load(Ordering::Acquire) {
                    // one aligned load covers the whole site
                    let word = unsafe { std::ptr::read_volatile(ip as *const u64) }.to_le_bytes();
                    let site = &word[..PATCH_SIZE];
                    assert!(site == NOP5 || site == jmp || site[0] == INT3, "torn site {site:02x?}");
                    if site[0] == INT3 {
                        traps += 1;
                        if let Some(res) = poke_int3_handler(ip + 1) {
                            assert!(
                                res == Int3Resolution::Jump { target }
                                    || res == Int3Resolution::Skip { resume_ip: ip + PATCH_SIZE }
                            );
                        }
                    }
                    samples += 1;
                }
                (samples, traps)
            });

            for _ in 0..200 {
                let outcome = poke_site(&mem, 0, PokeKind::Jump, None, Some(target)).unwrap();
                assert_eq!(outcome, PokeOutcome::Patched);
                let outcome = poke_site(&mem, 0, PokeKind::Jump, Some(target), None).unwrap();
                assert_eq!(outcome, PokeOutcome::Patched);
            }
            done.store(true, Ordering::Release);
            reader.join().unwrap()
        });
        assert!(samples > 0);
        assert!(traps <= samples);
        assert_eq!(mem.bytes(0, PATCH_SIZE), &NOP5);
    }

    #[test]
    fn test_int3_handler_resolves_published_site() {
        let _guard = TEXT_MUTEX.lock();
        let insn = gen_insn(0x7000, PokeKind::Call, Some(0x7100)).unwrap();
        publish(0x7000, &insn);
        assert_eq!(
            poke_int3_handler(0x7001),
            Some(Int3Resolution::Call {
                target: 0x7100,
                return_ip: 0x7005
            })
        );
        // only the byte after the int3 identifies the site
        assert_eq!(poke_int3_handler(0x7002), None);
        unpublish();
        assert_eq!(poke_int3_handler(0x7001), None);
    }

    #[test]
    fn test_int3_resolution() {
        assert_eq!(
            resolve(0x1000, &[0xE8, 0x0B, 0, 0, 0]),
            Int3Resolution::Call {
                target: 0x1010,
                return_ip: 0x1005
            }
        );
        assert_eq!(
            resolve(0x1000, &[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]),
            Int3Resolution::Jump { target: 0x1000 }
        );
        assert_eq!(resolve(0x1000, &NOP5), Int3Resolution::Skip { resume_ip: 0x1005 });
        assert_eq!(poke_int3_handler(0x1001), None);
    }
}
