// With -ffunction-sections/-fdata-sections almost every symbol gets a
// dedicated section; such "bundled" symbols are the unit the differencing
// works in. This module attaches each bundled symbol to its section and
// cross-references compiler-generated subfunctions with their parents.

use anyhow::{bail, Result};
use log::debug;

use crate::model::{
    is_except_section, ObjectElf, SymId, STT_FUNC, STT_OBJECT, STT_SECTION,
};

const FUNC_PREFIXES: &[&str] = &[".text.unlikely.", ".text.hot.", ".text."];
const OBJ_PREFIXES: &[&str] = &[
    ".data.rel.ro.",
    ".data.rel.",
    ".data.",
    ".rodata.",
    ".bss.",
];
const UNLIKELY_PREFIX: &str = ".text.unlikely.";

fn strip_any_prefix<'a>(name: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| name.strip_prefix(p))
}

fn is_bundleable(elf: &ObjectElf, id: SymId) -> bool {
    let sym = elf.sym(id);
    let sec = match sym.sec() {
        Some(sec) => elf.sec(sec),
        None => return false,
    };

    let suffix = match sym.ty {
        STT_FUNC => strip_any_prefix(&sec.name, FUNC_PREFIXES),
        STT_OBJECT => strip_any_prefix(&sec.name, OBJ_PREFIXES),
        _ => None,
    };
    let suffix = match suffix {
        Some(s) => s,
        None => return false,
    };

    if suffix == sym.name {
        return true;
    }

    // Cold subfunctions keep the parent name in the section suffix while
    // the symbol name carries the .cold marker and possibly a counter.
    sym.ty == STT_FUNC
        && sec.name.starts_with(UNLIKELY_PREFIX)
        && sym.name.contains(".cold")
        && sym.name.starts_with(suffix)
}

/// Attach every bundled symbol to its dedicated section. Exception-handling
/// sections have no named owner; their section symbol takes that role.
pub fn bundle_symbols(elf: &mut ObjectElf) -> Result<()> {
    for id in elf.sym_ids().collect::<Vec<_>>() {
        if is_bundleable(elf, id) {
            let sym = elf.sym(id);
            if sym.st_value != 0 && !elf.arch.is_gcc6_localentry_bundled_sym(sym) {
                bail!(
                    "symbol {} at offset {} within section {}, expected 0",
                    sym.name,
                    sym.st_value,
                    elf.sec(sym.sec().unwrap()).name
                );
            }
            let sec = elf.sym(id).sec().unwrap();
            elf.sec_mut(sec).bundled_sym = Some(id);
        } else if elf.sym(id).ty == STT_SECTION {
            if let Some(sec) = elf.sym(id).sec() {
                if is_except_section(&elf.sec(sec).name) {
                    elf.sec_mut(sec).bundled_sym = Some(id);
                }
            }
        }
    }
    Ok(())
}

/// The optimizer may split a function into `.cold` and `.part` subfunctions.
/// Link each subfunction to its parent so status and inclusion decisions can
/// travel between them.
pub fn detect_child_functions(elf: &mut ObjectElf) {
    for id in elf.sym_ids().collect::<Vec<_>>() {
        if elf.sym(id).ty != STT_FUNC {
            continue;
        }
        let name = elf.sym(id).name.clone();
        let marker = [".cold", ".part"]
            .iter()
            .filter_map(|m| name.find(m))
            .min();
        let pos = match marker {
            Some(pos) if pos > 0 => pos,
            _ => continue,
        };

        if let Some(parent) = elf.find_symbol_by_name(&name[..pos]) {
            if parent != id {
                debug!("linking {} as child of {}", name, &name[..pos]);
                elf.sym_mut(id).parent = Some(parent);
                elf.sym_mut(parent).children.push(id);
            }
        }
    }
}
