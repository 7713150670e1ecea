//! Code buffer for building JIT code.
//!
//! Machine code is built into an owned byte vector and only copied into
//! executable memory once complete. Forward references are recorded as
//! offsets into the buffer and patched in place once the target is known.

/// A buffer for building machine code.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit the low `width` bytes of `value`.
    pub fn emit_sized(&mut self, value: u32, width: u8) {
        self.code
            .extend_from_slice(&value.to_le_bytes()[..width as usize]);
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Overwrite one already-emitted byte.
    pub fn patch_u8(&mut self, at: usize, value: u8) {
        self.code[at] = value;
    }

    /// Overwrite an already-emitted 32-bit field.
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Discard everything emitted after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.code.truncate(len);
    }

    /// Pad with `fill` up to the given power-of-two boundary, measured from
    /// `base` (the address the buffer will be loaded at).
    pub fn align(&mut self, base: usize, alignment: usize, fill: u8) {
        let current = base + self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        self.code.resize(self.code.len() + (aligned - current), fill);
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}
