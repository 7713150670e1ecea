//! sbjit - x86-64 JIT backend for a sandboxed register VM
//!
//! Programs ([`program::Program`]) are assumed verified. The
//! [`jit::JitCompiler`] turns them into executable images; the same
//! encoding layer also builds function trampolines and dispatchers.

pub mod config;
pub mod jit;
pub mod program;

pub use config::JitConfig;
pub use jit::{CompileOutcome, CompiledProgram, JitCompiler, JitError};
pub use program::{Insn, Program};
