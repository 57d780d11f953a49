// Symbol index of the running binary. The patch is resolved against this
// binary at build time, so all that is needed here is a flat, ordered view
// of its symbol table, logically partitioned into translation-unit blocks
// by STT_FILE symbols.

use anyhow::{ensure, Context, Result};
use goblin::elf::Elf;
use log::debug;

use crate::model::{STB_GLOBAL, STB_LOCAL, STT_FILE, STT_FUNC, STT_OBJECT, STT_SECTION};

#[derive(Debug, Clone)]
pub struct RunningSym {
    pub name: String,
    pub ty: u8,
    pub bind: u8,
    pub st_value: u64,
    pub st_size: u64,
}

impl RunningSym {
    pub fn is_file(&self) -> bool {
        self.ty == STT_FILE
    }
}

/// Ordered symbol sequence of the running ELF. Position `i` of a STT_FILE
/// symbol starts a block that extends to the next STT_FILE symbol; local
/// symbols of one translation unit always sit inside one block.
#[derive(Debug)]
pub struct RunningElf {
    pub syms: Vec<RunningSym>,
}

impl RunningElf {
    /// The running binary may be any ELF with a usable symbol table; a
    /// stripped executable still carries `.dynsym`.
    pub fn load(bytes: &[u8], origin: &str) -> Result<Self> {
        let elf = Elf::parse(bytes).with_context(|| format!("{}: not a valid ELF", origin))?;

        let (symtab, strtab) = if !elf.syms.is_empty() {
            (&elf.syms, &elf.strtab)
        } else {
            (&elf.dynsyms, &elf.dynstrtab)
        };
        ensure!(
            !symtab.is_empty(),
            "{}: running binary has no symbol table",
            origin
        );

        let mut syms = Vec::new();
        for sym in symtab.iter() {
            let ty = sym.st_type();
            let bind = sym.st_bind();
            let wanted = ty == STT_FILE
                || ((bind == STB_LOCAL || bind == STB_GLOBAL)
                    && (ty == STT_FUNC || ty == STT_OBJECT || ty == STT_SECTION));
            if !wanted {
                continue;
            }
            syms.push(RunningSym {
                name: strtab.get_at(sym.st_name).unwrap_or_default().to_string(),
                ty,
                bind,
                st_value: sym.st_value,
                st_size: sym.st_size,
            });
        }

        debug!("{}: indexed {} running symbols", origin, syms.len());
        Ok(RunningElf { syms })
    }

    /// Indices of every STT_FILE symbol, in table order.
    pub fn file_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.syms
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_file())
            .map(|(i, _)| i)
    }

    /// The local FUNC/OBJECT symbols of the block started by the STT_FILE
    /// symbol at `file_idx`.
    pub fn block_locals(&self, file_idx: usize) -> impl Iterator<Item = &RunningSym> {
        self.syms[file_idx + 1..]
            .iter()
            .take_while(|s| !s.is_file())
            .filter(|s| s.bind == STB_LOCAL && (s.ty == STT_FUNC || s.ty == STT_OBJECT))
    }

    /// Resolve a global symbol by name (and type, when the caller knows it).
    pub fn lookup_global(&self, name: &str, ty: u8) -> Option<&RunningSym> {
        self.syms
            .iter()
            .find(|s| s.bind == STB_GLOBAL && s.ty == ty && s.name == name)
    }

    /// Resolve a global by name alone; undefined symbols in a relocatable
    /// object are typeless, so the type cannot narrow the search.
    pub fn lookup_global_by_name(&self, name: &str) -> Option<&RunningSym> {
        self.syms
            .iter()
            .find(|s| s.bind == STB_GLOBAL && s.ty != STT_SECTION && s.name == name)
    }

    /// Resolve a local symbol inside the block of `file_idx`. Returns the
    /// matched symbol and its symbol position: 1-based occurrence among
    /// same-named local symbols of the whole table, or 0 when the name is
    /// unique. The position lets the loader pick the right copy when two
    /// translation units define the same static.
    pub fn lookup_local(&self, file_idx: usize, name: &str) -> Option<(&RunningSym, u64)> {
        let mut in_block = None;
        for (i, sym) in self.syms.iter().enumerate().skip(file_idx + 1) {
            if sym.is_file() {
                break;
            }
            if sym.bind == STB_LOCAL && sym.name == name {
                in_block = Some(i);
                break;
            }
        }
        let matched = in_block?;

        let occurrences: Vec<usize> = self
            .syms
            .iter()
            .enumerate()
            .filter(|(_, s)| s.bind == STB_LOCAL && s.name == name)
            .map(|(i, _)| i)
            .collect();
        let sympos = if occurrences.len() > 1 {
            occurrences.iter().position(|&i| i == matched).unwrap_or(0) as u64 + 1
        } else {
            0
        };
        Some((&self.syms[matched], sympos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, ty: u8, bind: u8, value: u64) -> RunningSym {
        RunningSym {
            name: name.to_string(),
            ty,
            bind,
            st_value: value,
            st_size: 8,
        }
    }

    fn two_unit_index() -> RunningElf {
        RunningElf {
            syms: vec![
                sym("a.c", STT_FILE, STB_LOCAL, 0),
                sym("counter", STT_OBJECT, STB_LOCAL, 0x1000),
                sym("helper", STT_FUNC, STB_LOCAL, 0x2000),
                sym("b.c", STT_FILE, STB_LOCAL, 0),
                sym("counter", STT_OBJECT, STB_LOCAL, 0x3000),
                sym("main", STT_FUNC, STB_GLOBAL, 0x4000),
            ],
        }
    }

    #[test]
    fn blocks_split_on_file_symbols() {
        let relf = two_unit_index();
        let files: Vec<usize> = relf.file_indices().collect();
        assert_eq!(files, vec![0, 3]);
        let first: Vec<&str> = relf.block_locals(0).map(|s| s.name.as_str()).collect();
        assert_eq!(first, vec!["counter", "helper"]);
        let second: Vec<&str> = relf.block_locals(3).map(|s| s.name.as_str()).collect();
        assert_eq!(second, vec!["counter"]);
    }

    #[test]
    fn local_lookup_disambiguates_by_block() {
        let relf = two_unit_index();
        let (sym, pos) = relf.lookup_local(3, "counter").unwrap();
        assert_eq!(sym.st_value, 0x3000);
        assert_eq!(pos, 2);
        let (sym, pos) = relf.lookup_local(0, "counter").unwrap();
        assert_eq!(sym.st_value, 0x1000);
        assert_eq!(pos, 1);
        let (_, pos) = relf.lookup_local(0, "helper").unwrap();
        assert_eq!(pos, 0);
    }

    #[test]
    fn global_lookup_skips_locals() {
        let relf = two_unit_index();
        assert!(relf.lookup_global("counter", STT_OBJECT).is_none());
        let main = relf.lookup_global("main", STT_FUNC).unwrap();
        assert_eq!(main.st_value, 0x4000);
    }
}
