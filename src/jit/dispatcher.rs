//! Dispatcher: binary search from a function pointer in rdx to a direct
//! jump.
//!
//! Known targets get a compare-and-branch leaf each; anything else falls
//! through to `jmp rdx`. Subtree entries are 16-byte aligned.

use super::codebuf::CodeBuffer;
use super::error::{JitError, Result};
use super::memory::{ExecutableMemory, ImageAllocator, TRAP_FILL};
use super::x86_64::{Cond, Reg, X86_64Assembler, is_imm8, is_simm32};

const BRANCH_ALIGN: usize = 16;

struct DispatchEmitter<'a> {
    funcs: &'a [i64],
    buf: CodeBuffer,
    base: Option<usize>,
}

impl DispatchEmitter<'_> {
    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// `cmp rdx, func`, through r11 when the address does not sign-extend
    /// from 32 bits.
    fn emit_cmp(&mut self, func: i64) {
        let mut asm = self.asm();
        if is_simm32(func) {
            asm.cmp_ri(Reg::Rdx, func as i32, true);
        } else {
            asm.mov_imm64(Reg::R11, func as u64);
            asm.cmp_rr(Reg::Rdx, Reg::R11, true);
        }
    }

    fn align(&mut self) {
        let base = self.base.unwrap_or(0);
        self.buf.align(base, BRANCH_ALIGN, TRAP_FILL);
    }

    fn emit_leaf(&mut self, func: i64) -> Result<()> {
        self.emit_cmp(func);
        let rel = match self.base {
            Some(base) => {
                let rel = func - (base + self.buf.len() + 6) as i64;
                if !is_simm32(rel) {
                    return Err(JitError::out_of_range("dispatcher jump displacement", rel));
                }
                rel as i32
            }
            None => 0,
        };
        let mut asm = self.asm();
        asm.jcc_rel32(Cond::E, rel);
        asm.jmp_r(Reg::Rdx);
        Ok(())
    }

    /// Emit the tree for `funcs[a..=b]`.
    fn emit_node(&mut self, a: usize, b: usize) -> Result<()> {
        if a == b {
            return self.emit_leaf(self.funcs[a]);
        }
        let pivot = (b - a) / 2;
        self.emit_cmp(self.funcs[a + pivot]);

        // Try a short `jg upper` first; redo with the near form if the
        // lower half does not fit.
        let jg = self.buf.len();
        self.asm().jcc_rel8(Cond::G, 0);
        self.emit_node(a, a + pivot)?;
        self.align();
        let rel = self.buf.len() as i64 - (jg as i64 + 2);
        if is_imm8(rel) {
            self.buf.patch_u8(jg + 1, rel as u8);
        } else {
            self.buf.truncate(jg);
            self.asm().jcc_rel32(Cond::G, 0);
            self.emit_node(a, a + pivot)?;
            self.align();
            let rel = self.buf.len() - (jg + 6);
            self.buf.patch_u32(jg + 2, rel as u32);
        }

        self.emit_node(a + pivot + 1, b)
    }
}

/// Emit a dispatcher over `funcs` for an image at `image_base`. Without a
/// base the jump displacements are placeholders; the length matches any
/// 16-byte aligned base.
pub fn emit_dispatcher(funcs: &[usize], image_base: Option<usize>) -> Result<Vec<u8>> {
    let mut sorted: Vec<i64> = funcs.iter().map(|&f| f as i64).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut emitter = DispatchEmitter {
        funcs: &sorted,
        buf: CodeBuffer::new(),
        base: image_base,
    };
    if sorted.is_empty() {
        emitter.asm().jmp_r(Reg::Rdx);
    } else {
        emitter.emit_node(0, sorted.len() - 1)?;
    }
    Ok(emitter.buf.into_code())
}

/// An installed dispatcher.
#[derive(Debug)]
pub struct DispatcherImage {
    mem: ExecutableMemory,
    len: usize,
}

impl DispatcherImage {
    pub fn entry(&self) -> usize {
        self.mem.addr()
    }

    pub fn code(&self) -> &[u8] {
        self.mem.bytes(0, self.len)
    }
}

pub fn build_dispatcher(funcs: &[usize], allocator: &dyn ImageAllocator) -> Result<DispatcherImage> {
    let sized = emit_dispatcher(funcs, None)?;
    let mut mem = allocator.alloc(sized.len())?;
    if mem.addr() % BRANCH_ALIGN != 0 {
        return Err(JitError::internal("dispatcher image is not 16-byte aligned"));
    }
    mem.fill(TRAP_FILL)?;
    let code = emit_dispatcher(funcs, Some(mem.addr()))?;
    if code.len() != sized.len() {
        return Err(JitError::internal(format!(
            "dispatcher length changed from {} to {}",
            sized.len(),
            code.len()
        )));
    }
    mem.write(0, &code)?;
    mem.make_executable()?;
    tracing::debug!(funcs = funcs.len(), len = code.len(), "dispatcher installed");
    Ok(DispatcherImage { mem, len: code.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_leaf() {
        let code = emit_dispatcher(&[0x2000], Some(0x1000)).unwrap();
        assert_eq!(
            code,
            vec![
                0x48, 0x81, 0xFA, 0x00, 0x20, 0x00, 0x00, // cmp rdx, 0x2000
                0x0F, 0x84, 0xF3, 0x0F, 0x00, 0x00, // je 0x2000
                0xFF, 0xE2, // jmp rdx
            ]
        );
    }

    #[test]
    fn test_empty_falls_through() {
        assert_eq!(emit_dispatcher(&[], None).unwrap(), vec![0xFF, 0xE2]);
    }

    #[test]
    fn test_wide_address_uses_r11() {
        let code = emit_dispatcher(&[0x5555_0000_1000], None).unwrap();
        assert_eq!(&code[..2], &[0x49, 0xBB]);
        assert_eq!(&code[10..13], &[0x4C, 0x39, 0xDA]);
    }

    #[test]
    fn test_two_funcs_short_branch() {
        let code = emit_dispatcher(&[0x3000, 0x2000], Some(0)).unwrap();
        // cmp rdx, 0x2000; jg upper; leaf(0x2000); align; leaf(0x3000)
        assert_eq!(&code[..3], &[0x48, 0x81, 0xFA]);
        assert_eq!(u32::from_le_bytes(code[3..7].try_into().unwrap()), 0x2000);
        assert_eq!(code[7], 0x7F);
        let upper = 9 + code[8] as usize;
        assert_eq!(upper % BRANCH_ALIGN, 0);
        assert!(code[9 + 15..upper].iter().all(|&b| b == TRAP_FILL));
        assert_eq!(u32::from_le_bytes(code[upper + 3..upper + 7].try_into().unwrap()), 0x3000);
    }

    #[test]
    fn test_large_tree_uses_near_branch() {
        let funcs: Vec<usize> = (0..16).map(|i| 0x10_0000 + i * 0x100).collect();
        let code = emit_dispatcher(&funcs, Some(0)).unwrap();
        // root compare then a near jg: the lower half exceeds 127 bytes
        assert_eq!(&code[7..9], &[0x0F, 0x8F]);
        let rel = i32::from_le_bytes(code[9..13].try_into().unwrap()) as usize;
        assert_eq!((13 + rel) % BRANCH_ALIGN, 0);
    }

    #[test]
    fn test_out_of_range_target() {
        let err = emit_dispatcher(&[0x7fff_0000_0000], Some(0x1000)).unwrap_err();
        assert!(matches!(err, JitError::OutOfRange { .. }));
    }
}
