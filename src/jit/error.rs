//! Compilation failures.
//!
//! Every error aborts the current compilation; callers fall back to
//! interpreting the program. No partially built image is ever returned.

use thiserror::Error;

use super::memory::MemoryError;

#[derive(Debug, Error)]
pub enum JitError {
    /// A displacement or immediate does not fit its fixed-width encoding.
    #[error("{what} out of range: {value:#x}")]
    OutOfRange { what: &'static str, value: i64 },

    #[error("out of memory: {0}")]
    OutOfMemory(#[from] MemoryError),

    /// The program or the compiler broke an assumption that earlier stages
    /// guarantee. Always a defect somewhere upstream.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl JitError {
    pub fn out_of_range(what: &'static str, value: i64) -> Self {
        JitError::OutOfRange { what, value }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "jit internal error");
        JitError::Internal(msg)
    }
}

pub type Result<T> = std::result::Result<T, JitError>;
