//! Program description files (TOML).
//!
//! ```toml
//! name = "ret5"
//! stack_depth = 8
//! insns = ["b7 00 00 00 05 00 00 00", "95 00 00 00 00 00 00 00"]
//!
//! [[helper]]
//! id = 1
//! addr = 0x401000
//!
//! [[poke]]
//! key = 0
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::insn::{INSN_SIZE, Insn};
use super::{Program, TailCallPoke};
use crate::jit::tail_call::TailCallTable;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse program file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("instruction {index}: {reason}")]
    BadInsn { index: usize, reason: String },
}

/// On-disk program description.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgramFile {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub stack_depth: u32,
    #[serde(default)]
    pub is_subprog: bool,
    #[serde(default)]
    pub tail_call_reachable: bool,
    /// Hex-encoded instructions, 8 bytes each, whitespace ignored.
    pub insns: Vec<String>,
    #[serde(default, rename = "helper")]
    pub helpers: Vec<HelperEntry>,
    #[serde(default, rename = "poke")]
    pub pokes: Vec<PokeEntry>,
}

fn default_name() -> String {
    "prog".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HelperEntry {
    pub id: i32,
    pub addr: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PokeEntry {
    pub key: u32,
}

impl ProgramFile {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, LoadError> {
        Ok(toml::from_str(content)?)
    }

    /// Build the in-memory program. Direct tail calls get an empty table
    /// large enough for their key.
    pub fn to_program(&self) -> Result<Program, LoadError> {
        let insns = self
            .insns
            .iter()
            .enumerate()
            .map(|(index, text)| parse_insn(text).map_err(|reason| LoadError::BadInsn { index, reason }))
            .collect::<Result<Vec<_>, _>>()?;

        let poke_tab = self
            .pokes
            .iter()
            .map(|p| TailCallPoke::new(Arc::new(TailCallTable::new(p.key + 1)), p.key))
            .collect();

        Ok(Program {
            name: self.name.clone(),
            insns,
            stack_depth: self.stack_depth,
            is_subprog: self.is_subprog,
            tail_call_reachable: self.tail_call_reachable,
            poke_tab,
        })
    }
}

fn parse_insn(text: &str) -> Result<Insn, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        return Err(format!("non-hex character in '{digits}'"));
    }
    if digits.len() != INSN_SIZE * 2 {
        return Err(format!("expected {} hex digits, got {}", INSN_SIZE * 2, digits.len()));
    }
    let mut raw = [0u8; INSN_SIZE];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
            .map_err(|e| format!("bad hex '{}': {}", &digits[i * 2..i * 2 + 2], e))?;
    }
    Ok(Insn::decode(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::insn::asm;

    #[test]
    fn test_parse_program_file() {
        let file = ProgramFile::parse(
            r#"
name = "ret5"
stack_depth = 16
insns = ["b7 00 00 00 05 00 00 00", "9500000000000000"]

[[helper]]
id = 1
addr = 4096
"#,
        )
        .unwrap();
        let prog = file.to_program().unwrap();
        assert_eq!(prog.name, "ret5");
        assert_eq!(prog.stack_depth, 16);
        assert_eq!(prog.insns, vec![asm::mov64_imm(0, 5), asm::exit()]);
        assert_eq!(file.helpers[0].addr, 4096);
    }

    #[test]
    fn test_bad_insn_reports_index() {
        let file = ProgramFile::parse(r#"insns = ["9500000000000000", "b7 00"]"#).unwrap();
        match file.to_program() {
            Err(LoadError::BadInsn { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {:?}", other.map(|p| p.name)),
        }
    }

    #[test]
    fn test_non_ascii_insn_is_rejected() {
        let file = ProgramFile::parse(r#"insns = ["0é0000000000000"]"#).unwrap();
        match file.to_program() {
            Err(LoadError::BadInsn { index, .. }) => assert_eq!(index, 0),
            other => panic!("unexpected: {:?}", other.map(|p| p.name)),
        }
    }

    #[test]
    fn test_pokes_create_tables() {
        let file = ProgramFile::parse(
            r#"
insns = ["9500000000000000"]
[[poke]]
key = 3
"#,
        )
        .unwrap();
        let prog = file.to_program().unwrap();
        assert_eq!(prog.poke_tab.len(), 1);
        assert_eq!(prog.poke_tab[0].key, 3);
        assert_eq!(prog.poke_tab[0].table.max_entries(), 4);
    }
}
