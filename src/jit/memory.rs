//! Executable memory management using mmap.
//!
//! Code images are mapped read/write, filled, then switched to read/execute.
//! Mappings are placed close to this crate's own text when possible so that
//! rel32 calls from generated code can reach host helpers.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Byte used to fill unused space: `int3`, so stray jumps trap immediately.
pub const TRAP_FILL: u8 = 0xCC;

/// Error type for memory operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A block of executable memory allocated via mmap.
///
/// The memory is initially writable. Call `make_executable()` to make it
/// executable (and read-only) before calling the generated code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let aligned_size = size.next_multiple_of(page_size());
        let ptr = mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Address of the first byte.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fill the whole block with `byte`.
    pub fn fill(&mut self, byte: u8) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.size);
        }
        Ok(())
    }

    /// Write bytes to the memory at the given offset.
    /// Returns an error if the memory is executable or if the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }

        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Read back `len` bytes at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Make the memory executable (and read-only).
    /// After this call, the memory can no longer be written to.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        protect(self.ptr.as_ptr(), self.size, Protection::ReadExec)?;
        self.executable = true;
        Ok(())
    }

    /// Check if the memory is executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size)
            .field("executable", &self.executable)
            .finish()
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// ExecutableMemory owns its mapping; mutation after `make_executable` only
// happens through the serialized text-poke path.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// Source of code images for the JIT.
pub trait ImageAllocator: Send + Sync {
    /// Allocate a writable block of at least `size` bytes.
    fn alloc(&self, size: usize) -> Result<ExecutableMemory, MemoryError>;
}

/// Default allocator backed by [`ExecutableMemory::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapAllocator;

impl ImageAllocator for MmapAllocator {
    fn alloc(&self, size: usize) -> Result<ExecutableMemory, MemoryError> {
        ExecutableMemory::new(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    ReadExec,
    ReadWriteExec,
}

/// Get the page size for the current system.
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Change protection of the pages covering `[addr, addr + len)`.
pub(crate) fn protect(addr: *mut u8, len: usize, prot: Protection) -> Result<(), MemoryError> {
    let page = page_size();
    let start = (addr as usize) & !(page - 1);
    let end = (addr as usize + len).next_multiple_of(page);
    let flags = match prot {
        Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    };
    let result = unsafe { libc::mprotect(start as *mut libc::c_void, end - start, flags) };
    if result != 0 {
        return Err(MemoryError::ProtectionFailed);
    }
    Ok(())
}

/// Images go in `[text + NEAR_START, text + NEAR_END)`, above the heap of a
/// typical process and close enough that images reach each other too.
const NEAR_START: usize = 0x4000_0000;
const NEAR_END: usize = 0x7000_0000;

/// Hint skip after landing on an occupied range.
const MISS_STRIDE: usize = 1 << 20;
const HINT_ATTEMPTS: usize = 64;

/// Next address to hint at. Moves up through the near range and wraps.
static NEXT_HINT: AtomicUsize = AtomicUsize::new(0);

/// Allocate memory using mmap, preferring addresses near this crate's code.
fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let page = page_size();
    let anchor = mmap_alloc as usize;
    let low = (anchor + NEAR_START) & !(page - 1);
    let high = anchor + NEAR_END;
    let len = size.next_multiple_of(page);

    for _ in 0..HINT_ATTEMPTS {
        let mut hint = NEXT_HINT.load(Ordering::Relaxed);
        if hint < low || hint + len > high {
            hint = low;
        }
        if let Some(ptr) = map_at(hint, size) {
            let addr = ptr.as_ptr() as usize;
            if addr >= low && addr + len <= high {
                NEXT_HINT.store(addr + len, Ordering::Relaxed);
                return Ok(ptr);
            }
            // The kernel ignores a hint that overlaps an existing mapping.
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
            }
        }
        NEXT_HINT.store(hint + len.max(MISS_STRIDE), Ordering::Relaxed);
    }
    tracing::warn!(size, "no executable memory near text, helpers may be out of range");
    map_at(0, size).ok_or(MemoryError::AllocationFailed)
}

fn map_at(hint: usize, size: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr as *mut u8)
}
