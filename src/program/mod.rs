//! Virtual programs handed to the JIT.
//!
//! A [`Program`] is assumed to have been certified by an external validator:
//! register indices are in range, jumps land on instruction boundaries and
//! the program terminates.

pub mod insn;
pub mod loader;

use std::sync::Arc;

use crate::jit::tail_call::{PokeSite, TailCallTable};
pub use insn::Insn;

/// A direct tail-call site descriptor.
///
/// The verifier creates one per direct tail call with `site == None`; the
/// pass driver fills in `site` once the final image address is known.
#[derive(Debug, Clone)]
pub struct TailCallPoke {
    pub table: Arc<TailCallTable>,
    pub key: u32,
    pub site: Option<PokeSite>,
}

impl TailCallPoke {
    pub fn new(table: Arc<TailCallTable>, key: u32) -> Self {
        Self { table, key, site: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub name: String,
    pub insns: Vec<Insn>,
    /// Bytes of stack the program addresses below its frame pointer.
    pub stack_depth: u32,
    /// Compiled as a callee of another sub-program rather than an entry.
    pub is_subprog: bool,
    /// Some path from this program reaches a tail call.
    pub tail_call_reachable: bool,
    pub poke_tab: Vec<TailCallPoke>,
}

impl Program {
    pub fn new(name: impl Into<String>, insns: Vec<Insn>) -> Self {
        Self {
            name: name.into(),
            insns,
            ..Default::default()
        }
    }

    /// Decode a program from its raw instruction stream.
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % insn::INSN_SIZE != 0 {
            return None;
        }
        let insns = bytes
            .chunks_exact(insn::INSN_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; insn::INSN_SIZE];
                raw.copy_from_slice(chunk);
                Insn::decode(&raw)
            })
            .collect();
        Some(Self::new(name, insns))
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Number of fault-tolerant loads, i.e. exception-table entries needed.
    pub fn num_exentries(&self) -> usize {
        self.insns.iter().filter(|i| i.is_probe_load()).count()
    }
}
