//! Exception table for fault-tolerant loads.
//!
//! One entry per probe load, stored right after the code (4-byte aligned).
//! Entries use relative addressing so the table is position independent:
//! `insn` is the distance from the entry's own `insn` field to the load.

use super::error::{JitError, Result};

/// Marks entries produced by this JIT.
pub const EX_TYPE_JIT: i32 = 1;

/// Size of one serialized [`ExtableEntry`].
pub const EXTABLE_ENTRY_SIZE: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtableEntry {
    pub insn: i32,
    /// Low 8 bits: bytes to skip. Upper bits: register slot to zero.
    pub fixup: u32,
    pub kind: i32,
}

impl ExtableEntry {
    pub fn skip_len(&self) -> u8 {
        (self.fixup & 0xff) as u8
    }

    pub fn reg_slot(&self) -> u32 {
        self.fixup >> 8
    }

    pub fn to_bytes(&self) -> [u8; EXTABLE_ENTRY_SIZE] {
        let mut out = [0u8; EXTABLE_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.insn.to_le_bytes());
        out[4..8].copy_from_slice(&self.fixup.to_le_bytes());
        out[8..12].copy_from_slice(&self.kind.to_le_bytes());
        out
    }
}

/// A probe load recorded by the emitter, relative to the image start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSite {
    pub insn_off: usize,
    pub insn_len: usize,
    pub reg_slot: u8,
}

impl ProbeSite {
    pub fn fixup(&self) -> Result<u32> {
        if self.insn_len > 0xff {
            return Err(JitError::internal(format!(
                "probe load of {} bytes cannot be encoded in fixup",
                self.insn_len
            )));
        }
        Ok(self.insn_len as u32 | (self.reg_slot as u32) << 8)
    }
}

/// Build the table that will live at `table_off` within the image.
pub fn build(sites: &[ProbeSite], table_off: usize) -> Result<Vec<ExtableEntry>> {
    sites
        .iter()
        .enumerate()
        .map(|(i, site)| {
            let entry_off = table_off + i * EXTABLE_ENTRY_SIZE;
            let delta = site.insn_off as i64 - entry_off as i64;
            if delta != delta as i32 as i64 {
                return Err(JitError::out_of_range("exception table delta", delta));
            }
            Ok(ExtableEntry {
                insn: delta as i32,
                fixup: site.fixup()?,
                kind: EX_TYPE_JIT,
            })
        })
        .collect()
}

/// How to resume after a fault on a probe load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub resume_ip: usize,
    pub reg_slot: u32,
}

/// An installed exception table.
#[derive(Debug, Clone, Default)]
pub struct ExceptionTable {
    addr: usize,
    entries: Vec<ExtableEntry>,
}

impl ExceptionTable {
    pub fn new(addr: usize, entries: Vec<ExtableEntry>) -> Self {
        Self { addr, entries }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn entries(&self) -> &[ExtableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute address of the load covered by entry `index`.
    pub fn insn_addr(&self, index: usize) -> usize {
        let field = self.addr + index * EXTABLE_ENTRY_SIZE;
        (field as i64 + self.entries[index].insn as i64) as usize
    }

    /// Look up the fixup for a fault at `fault_ip`.
    pub fn search(&self, fault_ip: usize) -> Option<Fixup> {
        (0..self.entries.len())
            .find(|&i| self.insn_addr(i) == fault_ip)
            .map(|i| Fixup {
                resume_ip: fault_ip + self.entries[i].skip_len() as usize,
                reg_slot: self.entries[i].reg_slot(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixup_packing() {
        let site = ProbeSite {
            insn_off: 0x20,
            insn_len: 4,
            reg_slot: 13,
        };
        assert_eq!(site.fixup().unwrap(), 4 | 13 << 8);
    }

    #[test]
    fn test_oversized_load_rejected() {
        let site = ProbeSite {
            insn_off: 0,
            insn_len: 0x100,
            reg_slot: 0,
        };
        assert!(matches!(site.fixup(), Err(JitError::Internal(_))));
    }

    #[test]
    fn test_build_and_search() {
        let sites = [
            ProbeSite {
                insn_off: 0x10,
                insn_len: 4,
                reg_slot: 13,
            },
            ProbeSite {
                insn_off: 0x18,
                insn_len: 5,
                reg_slot: 8,
            },
        ];
        let entries = build(&sites, 0x40).unwrap();
        assert_eq!(entries[0].insn, 0x10 - 0x40);
        assert_eq!(entries[1].insn, 0x18 - 0x4C);

        let table = ExceptionTable::new(0x1040, entries);
        assert_eq!(table.insn_addr(1), 0x1018);
        let fixup = table.search(0x1018).unwrap();
        assert_eq!(fixup.resume_ip, 0x101D);
        assert_eq!(fixup.reg_slot, 8);
        assert!(table.search(0x1011).is_none());
    }

    #[test]
    fn test_entry_bytes() {
        let entry = ExtableEntry {
            insn: -4,
            fixup: 0x0d04,
            kind: EX_TYPE_JIT,
        };
        assert_eq!(entry.to_bytes(), [0xFC, 0xFF, 0xFF, 0xFF, 0x04, 0x0D, 0, 0, 1, 0, 0, 0]);
        assert_eq!(std::mem::size_of::<ExtableEntry>(), EXTABLE_ENTRY_SIZE);
    }
}
