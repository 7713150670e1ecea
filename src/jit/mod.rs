//! Native code generation for x86-64.
//!
//! - Encoding primitives and the code buffer
//! - Instruction emitter and multi-pass driver
//! - Tail calls, live patching, trampolines and dispatchers
//! - Executable memory and the exception table

pub mod abi;
mod codebuf;
pub mod dispatcher;
pub mod driver;
pub mod emit;
pub mod error;
pub mod extable;
pub mod memory;
pub mod regs;
pub mod tail_call;
pub mod text_poke;
pub mod trampoline;
pub mod x86_64;

pub use codebuf::CodeBuffer;
pub use driver::{
    CallResolver, CallSite, CompileOutcome, CompiledProgram, HelperTable, JitCompiler, JitContext,
    PendingProgram, ProgramFn,
};
pub use error::{JitError, Result};
pub use memory::{ExecutableMemory, ImageAllocator, MmapAllocator};
