// Assembly of the output object: the included sub-graph migrates out of the
// patched graph, the .upatch.* metadata sections are synthesized, symbols
// are reordered and stripped, everything is reindexed, and the undefined
// remainder is resolved against the running binary.

use anyhow::{bail, Context, Result};
use log::debug;
use scroll::Pwrite;
use std::collections::{HashMap, HashSet};

use crate::model::{
    ObjectElf, SecId, Section, SectionHeaderInfo, SectionKind, Status, StringPool, StripPolicy,
    SymId, Symbol, SymbolPlace, SHT_PROGBITS, SHT_RELA, STB_LOCAL, STT_FILE, STT_FUNC,
    STT_NOTYPE, STT_SECTION,
};
use crate::running::RunningElf;

/// Size of one record in `.upatch.funcs`: new_addr, new_size, old_addr,
/// old_size, sympos, name.
pub const PATCH_FUNC_ENTSIZE: u64 = 48;
/// Size of one record in `.upatch.symbols`: addr, sympos, name.
pub const PATCH_SYMBOL_ENTSIZE: u64 = 24;
/// Layout descriptor in `.upatch.arch`: magic, version, machine, func count,
/// padding.
pub const ARCH_SECTION_SIZE: u64 = 24;
pub const ARCH_SECTION_MAGIC: &[u8; 8] = b"UPATCH\0\0";
pub const METADATA_LAYOUT_VERSION: u32 = 1;

const SHF_ALLOC: u64 = 0x2;

pub const STRINGS_SECTION: &str = ".upatch.strings";
pub const FUNCS_SECTION: &str = ".upatch.funcs";
pub const SYMBOLS_SECTION: &str = ".upatch.symbols";
pub const ARCH_SECTION: &str = ".upatch.arch";

/// Move every included section and symbol into a fresh object graph. The
/// donor arenas are emptied; links into the non-included remainder are
/// severed, which is what turns an unchanged external into an undefined
/// symbol of the output.
pub fn migrate_included_elements(patched: &mut ObjectElf) -> Result<ObjectElf> {
    let sections = std::mem::take(&mut patched.sections);
    let symbols = std::mem::take(&mut patched.symbols);

    let mut sec_map: Vec<Option<SecId>> = vec![None; sections.len()];
    let mut sym_map: Vec<Option<SymId>> = vec![None; symbols.len()];

    let mut out = ObjectElf {
        header: patched.header.clone(),
        endian: patched.endian,
        arch: patched.arch,
        sections: Vec::new(),
        symbols: Vec::new(),
        strings: StringPool::default(),
    };

    for (pos, sec) in sections.into_iter().enumerate() {
        if !sec.include {
            continue;
        }
        sec_map[pos] = Some(SecId(out.sections.len()));
        out.sections.push(sec);
    }
    for (pos, sym) in symbols.into_iter().enumerate() {
        if !sym.include {
            continue;
        }
        sym_map[pos] = Some(SymId(out.symbols.len()));
        out.symbols.push(sym);
    }

    for pos in 0..out.sections.len() {
        let sec = &mut out.sections[pos];
        sec.twin = None;
        sec.base = match sec.base {
            Some(b) => match sec_map[b.0] {
                Some(nb) => Some(nb),
                None => bail!(
                    "rela section {} was included without its base section",
                    sec.name
                ),
            },
            None => None,
        };
        sec.rela = sec.rela.and_then(|r| sec_map[r.0]);
        sec.secsym = sec.secsym.and_then(|s| sym_map[s.0]);
        sec.bundled_sym = sec.bundled_sym.and_then(|s| sym_map[s.0]);
        for rela in sec.relas.iter_mut() {
            rela.sym = match sym_map[rela.sym.0] {
                Some(ns) => ns,
                None => bail!(
                    "relocation at {:#x} references a symbol that was not included",
                    rela.offset
                ),
            };
        }
    }

    for sym in out.symbols.iter_mut() {
        sym.twin = None;
        sym.strip = StripPolicy::Default;
        sym.place = match sym.place {
            SymbolPlace::Section(s) => match sec_map[s.0] {
                Some(ns) => SymbolPlace::Section(ns),
                // The section stayed behind; the symbol is now external.
                None => SymbolPlace::Undef,
            },
            other => other,
        };
        sym.parent = sym.parent.and_then(|p| sym_map[p.0]);
        sym.children = sym
            .children
            .iter()
            .filter_map(|c| sym_map[c.0])
            .collect();
    }

    debug!(
        "migrated {} sections, {} symbols",
        out.sections.len(),
        out.symbols.len()
    );
    Ok(out)
}

fn create_section(out: &mut ObjectElf, name: &str, entsize: u64, addralign: u64) -> SecId {
    let id = SecId(out.sections.len());
    out.sections.push(Section {
        name: name.to_string(),
        index: 0,
        sh: SectionHeaderInfo {
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC,
            sh_size: 0,
            sh_entsize: entsize,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: addralign,
        },
        kind: SectionKind::Progbits,
        data: Vec::new(),
        relas: Vec::new(),
        base: None,
        rela: None,
        secsym: None,
        bundled_sym: None,
        include: true,
        ignore: false,
        grouped: false,
        status: Status::New,
        twin: None,
    });
    id
}

fn create_rela_section(out: &mut ObjectElf, base: SecId) -> SecId {
    let name = format!(".rela{}", out.sec(base).name);
    let id = SecId(out.sections.len());
    out.sections.push(Section {
        name,
        index: 0,
        sh: SectionHeaderInfo {
            sh_type: SHT_RELA,
            sh_flags: 0,
            sh_size: 0,
            sh_entsize: 24,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 8,
        },
        kind: SectionKind::Rela,
        data: Vec::new(),
        relas: Vec::new(),
        base: Some(base),
        rela: None,
        secsym: None,
        bundled_sym: None,
        include: true,
        ignore: false,
        grouped: false,
        status: Status::New,
        twin: None,
    });
    out.sec_mut(base).rela = Some(id);
    id
}

fn create_section_symbol(out: &mut ObjectElf, sec: SecId) -> SymId {
    let id = SymId(out.symbols.len());
    out.symbols.push(Symbol {
        name: out.sec(sec).name.clone(),
        index: id.0,
        bind: STB_LOCAL,
        ty: STT_SECTION,
        st_other: 0,
        st_value: 0,
        st_size: 0,
        place: SymbolPlace::Section(sec),
        include: true,
        strip: StripPolicy::Keep,
        status: Status::New,
        twin: None,
        parent: None,
        children: Vec::new(),
        file_twin: None,
    });
    out.sec_mut(sec).secsym = Some(id);
    id
}

/// The string pool section every metadata record points into.
pub fn create_strings_elements(out: &mut ObjectElf) {
    let sec = create_section(out, STRINGS_SECTION, 1, 1);
    create_section_symbol(out, sec);
}

/// One record per changed function: where the new body lives in the patch
/// (a relocation), and where the old body lives in the running binary
/// (resolved here, at build time). Subfunctions fold into their parents.
pub fn create_patches_sections(out: &mut ObjectElf, relf: &RunningElf) -> Result<()> {
    let strings_secsym = out
        .find_section_by_name(STRINGS_SECTION)
        .and_then(|sec| out.sec(sec).secsym)
        .context("string pool section missing")?;
    let endian = out.endian;
    let abs64 = out.arch.abs64_reloc_type();

    let funcs: Vec<SymId> = out
        .sym_ids()
        .filter(|&id| {
            let sym = out.sym(id);
            sym.ty == STT_FUNC && sym.status == Status::Changed && sym.parent.is_none()
        })
        .collect();

    let mut data = vec![0u8; funcs.len() * PATCH_FUNC_ENTSIZE as usize];
    let mut relas = Vec::new();

    for (i, &func_id) in funcs.iter().enumerate() {
        let rec = i * PATCH_FUNC_ENTSIZE as usize;
        let (name, bind, st_size, file_twin) = {
            let sym = out.sym(func_id);
            (sym.name.clone(), sym.bind, sym.st_size, sym.file_twin)
        };

        let (old_addr, old_size, sympos) = if bind == STB_LOCAL {
            let file_idx = file_twin.with_context(|| {
                format!("local function {} has no running-file attribution", name)
            })?;
            let (rsym, sympos) = relf.lookup_local(file_idx, &name).with_context(|| {
                format!("cannot find local function {} in the running binary", name)
            })?;
            (rsym.st_value, rsym.st_size, sympos)
        } else {
            let rsym = relf.lookup_global(&name, STT_FUNC).with_context(|| {
                format!("cannot find function {} in the running binary", name)
            })?;
            (rsym.st_value, rsym.st_size, 0)
        };
        debug!("patch record for {}: old address {:#x}", name, old_addr);

        data.pwrite_with(st_size, rec + 8, endian)?;
        data.pwrite_with(old_addr, rec + 16, endian)?;
        data.pwrite_with(old_size, rec + 24, endian)?;
        data.pwrite_with(sympos, rec + 32, endian)?;

        let name_off = out.strings.intern(&name);
        relas.push(crate::model::Rela {
            offset: rec as u64,
            rtype: abs64,
            // The linked symbol value already carries any local-entry
            // offset (ppc64 ELFv2); a non-zero addend would count it twice.
            addend: 0,
            sym: func_id,
        });
        relas.push(crate::model::Rela {
            offset: rec as u64 + 40,
            rtype: abs64,
            addend: name_off as i64,
            sym: strings_secsym,
        });
    }

    let funcs_sec = create_section(out, FUNCS_SECTION, PATCH_FUNC_ENTSIZE, 8);
    out.sec_mut(funcs_sec).sh.sh_size = data.len() as u64;
    out.sec_mut(funcs_sec).data = data;
    let rela_sec = create_rela_section(out, funcs_sec);
    out.sec_mut(rela_sec).relas = relas;
    Ok(())
}

/// Offsets of the `.upatch.symbols` records, keyed by symbol name, so the
/// resolution pass can fill the addresses in after reorder/strip/reindex
/// have shuffled the arena.
pub struct ExternalRecords {
    by_name: HashMap<String, usize>,
}

/// One record per referenced undefined symbol: the runtime address slot
/// (filled by [`partly_resolve`]), the symbol position, and the name.
pub fn create_intermediate_sections(out: &mut ObjectElf) -> Result<ExternalRecords> {
    let strings_secsym = out
        .find_section_by_name(STRINGS_SECTION)
        .and_then(|sec| out.sec(sec).secsym)
        .context("string pool section missing")?;
    let abs64 = out.arch.abs64_reloc_type();

    let mut referenced: HashSet<SymId> = HashSet::new();
    for id in out.sec_ids() {
        for rela in &out.sec(id).relas {
            referenced.insert(rela.sym);
        }
    }

    let undefined: Vec<SymId> = out
        .sym_ids()
        .filter(|&id| {
            id.0 != 0 && out.sym(id).place == SymbolPlace::Undef && referenced.contains(&id)
        })
        .collect();

    let mut data = vec![0u8; undefined.len() * PATCH_SYMBOL_ENTSIZE as usize];
    let mut relas = Vec::new();
    let mut by_name = HashMap::new();

    for (i, &sym_id) in undefined.iter().enumerate() {
        let rec = i * PATCH_SYMBOL_ENTSIZE as usize;
        let name = out.sym(sym_id).name.clone();
        out.sym_mut(sym_id).strip = StripPolicy::Keep;

        let name_off = out.strings.intern(&name);
        relas.push(crate::model::Rela {
            offset: rec as u64 + 16,
            rtype: abs64,
            addend: name_off as i64,
            sym: strings_secsym,
        });
        by_name.insert(name, rec);
    }

    let sec = create_section(out, SYMBOLS_SECTION, PATCH_SYMBOL_ENTSIZE, 8);
    out.sec_mut(sec).sh.sh_size = data.len() as u64;
    out.sec_mut(sec).data = std::mem::take(&mut data);
    let rela_sec = create_rela_section(out, sec);
    out.sec_mut(rela_sec).relas = relas;
    Ok(ExternalRecords { by_name })
}

/// The architecture descriptor stamps the metadata layout version the
/// runtime loader has to agree with.
pub fn create_arch_section(out: &mut ObjectElf, changed_funcs: usize) -> Result<()> {
    let endian = out.endian;
    let mut data = vec![0u8; ARCH_SECTION_SIZE as usize];
    data[..8].copy_from_slice(ARCH_SECTION_MAGIC);
    data.pwrite_with(METADATA_LAYOUT_VERSION, 8, endian)?;
    data.pwrite_with(out.header.e_machine as u32, 12, endian)?;
    data.pwrite_with(changed_funcs as u32, 16, endian)?;

    let sec = create_section(out, ARCH_SECTION, ARCH_SECTION_SIZE, 8);
    out.sec_mut(sec).sh.sh_size = data.len() as u64;
    out.sec_mut(sec).data = data;
    Ok(())
}

/// Turn the interned pool into the `.upatch.strings` payload.
pub fn build_strings_section_data(out: &mut ObjectElf) -> Result<()> {
    let sec = out
        .find_section_by_name(STRINGS_SECTION)
        .context("string pool section missing")?;
    let pool = std::mem::take(&mut out.strings);
    let bytes = pool.into_bytes();
    out.sec_mut(sec).sh.sh_size = bytes.len() as u64;
    out.sec_mut(sec).data = bytes;
    Ok(())
}

fn remap_symbol_ids(out: &mut ObjectElf, remap: &[Option<usize>]) {
    for sec in out.sections.iter_mut() {
        sec.secsym = sec.secsym.and_then(|s| remap[s.0].map(SymId));
        sec.bundled_sym = sec.bundled_sym.and_then(|s| remap[s.0].map(SymId));
        for rela in sec.relas.iter_mut() {
            // Referenced symbols are never stripped; the map always hits.
            if let Some(ns) = remap[rela.sym.0] {
                rela.sym = SymId(ns);
            }
        }
    }
    for sym in out.symbols.iter_mut() {
        sym.parent = sym.parent.and_then(|p| remap[p.0].map(SymId));
        sym.children = sym
            .children
            .iter()
            .filter_map(|c| remap[c.0].map(SymId))
            .collect();
    }
}

/// Linker-compliant symbol order: the null entry, section symbols, STT_FILE
/// symbols, the remaining locals, then GLOBAL/WEAK. The sort is stable, so
/// relative order inside each group survives.
pub fn reorder_symbols(out: &mut ObjectElf) {
    let group = |pos: usize, sym: &Symbol| -> u8 {
        if pos == 0 {
            0
        } else if sym.bind != STB_LOCAL {
            4
        } else if sym.ty == STT_SECTION {
            1
        } else if sym.ty == STT_FILE {
            2
        } else {
            3
        }
    };

    let mut order: Vec<usize> = (0..out.symbols.len()).collect();
    order.sort_by_key(|&pos| group(pos, &out.symbols[pos]));

    let mut remap: Vec<Option<usize>> = vec![None; out.symbols.len()];
    for (new_pos, &old_pos) in order.iter().enumerate() {
        remap[old_pos] = Some(new_pos);
    }

    let mut old: Vec<Option<Symbol>> = std::mem::take(&mut out.symbols)
        .into_iter()
        .map(Some)
        .collect();
    out.symbols = order
        .iter()
        .map(|&pos| old[pos].take().expect("permutation visits each slot once"))
        .collect();

    remap_symbol_ids(out, &remap);
}

/// Drop symbols nothing needs: unreferenced no-type symbols and section
/// symbols whose section did not make it into the image. STT_FILE symbols
/// and anything referenced by a relocation always stay.
pub fn strip_unneeded_syms(out: &mut ObjectElf) {
    let mut referenced: HashSet<SymId> = HashSet::new();
    for id in out.sec_ids() {
        for rela in &out.sec(id).relas {
            referenced.insert(rela.sym);
        }
    }

    let mut remap: Vec<Option<usize>> = vec![None; out.symbols.len()];
    let mut kept = Vec::new();
    for (pos, sym) in std::mem::take(&mut out.symbols).into_iter().enumerate() {
        let strip = pos != 0
            && sym.strip != StripPolicy::Keep
            && (sym.strip == StripPolicy::Strip
                || (sym.ty == STT_NOTYPE && !referenced.contains(&SymId(pos)))
                || (sym.ty == STT_SECTION && sym.sec().is_none()));
        if strip {
            debug!("stripping unneeded symbol {}", sym.name);
            continue;
        }
        remap[pos] = Some(kept.len());
        kept.push(sym);
    }
    out.symbols = kept;

    remap_symbol_ids(out, &remap);
}

/// Assign the final contiguous indices and rewrite every cross-index field
/// the section headers carry.
pub fn reindex_elements(out: &mut ObjectElf) -> Result<()> {
    for pos in 0..out.sections.len() {
        out.sections[pos].index = pos + 1;
    }
    for pos in 0..out.symbols.len() {
        out.symbols[pos].index = pos;
    }

    let symtab = out
        .find_section_by_name(".symtab")
        .context("output has no .symtab")?;
    let strtab = out
        .find_section_by_name(".strtab")
        .context("output has no .strtab")?;

    let first_global = out
        .symbols
        .iter()
        .position(|s| s.bind != STB_LOCAL)
        .unwrap_or(out.symbols.len());

    {
        let symtab_idx = out.sec(symtab).index as u32;
        let strtab_idx = out.sec(strtab).index as u32;
        let sec = out.sec_mut(symtab);
        sec.sh.sh_link = strtab_idx;
        sec.sh.sh_info = first_global as u32;
        sec.sh.sh_entsize = 24;

        for id in out.sec_ids().collect::<Vec<_>>() {
            if !out.sec(id).is_rela() {
                continue;
            }
            let base_idx = match out.sec(id).base {
                Some(base) => out.sec(base).index as u32,
                None => bail!("rela section {} has no base section", out.sec(id).name),
            };
            let sec = out.sec_mut(id);
            sec.sh.sh_link = symtab_idx;
            sec.sh.sh_info = base_idx;
            sec.sh.sh_entsize = 24;
        }
    }

    // Payload sizes follow the owned data; rela and symbol table sizes are
    // recomputed when the image is serialized.
    for id in out.sec_ids().collect::<Vec<_>>() {
        let sec = out.sec_mut(id);
        if sec.kind != SectionKind::Nobits && !sec.is_rela() && sec.kind != SectionKind::Symtab {
            sec.sh.sh_size = sec.data.len() as u64;
        }
    }

    Ok(())
}

/// Closure soundness: every relocation must point at a symbol of the image
/// and at an offset inside its base section.
pub fn check_relocations(out: &ObjectElf) -> Result<()> {
    for id in out.sec_ids() {
        let sec = out.sec(id);
        if !sec.is_rela() {
            continue;
        }
        let base = sec
            .base
            .with_context(|| format!("rela section {} has no base", sec.name))?;
        let base_size = if out.sec(base).kind == SectionKind::Nobits {
            out.sec(base).sh.sh_size
        } else {
            out.sec(base).data.len() as u64
        };
        for rela in &sec.relas {
            if rela.sym.0 >= out.symbols.len() {
                bail!("{}+{:#x}: dangling relocation referent", sec.name, rela.offset);
            }
            let slot = out.arch.reloc_slot_size(rela.rtype).max(1) as u64;
            if rela.offset + slot > base_size {
                bail!(
                    "{}+{:#x}: relocation outside section {} (size {:#x})",
                    sec.name,
                    rela.offset,
                    out.sec(base).name,
                    base_size
                );
            }
        }
    }
    Ok(())
}

/// Resolve every undefined symbol against the running binary. The resolved
/// address lands in `st_value` and in the symbol's metadata record; the
/// symbol itself stays undefined so a plain linker still treats the patch
/// as a relocatable object.
pub fn partly_resolve(
    out: &mut ObjectElf,
    relf: &RunningElf,
    records: &ExternalRecords,
) -> Result<()> {
    let endian = out.endian;
    let symbols_sec = out.find_section_by_name(SYMBOLS_SECTION);

    for pos in 0..out.symbols.len() {
        if pos == 0 || out.symbols[pos].place != SymbolPlace::Undef {
            continue;
        }
        let (name, bind, file_twin) = {
            let sym = &out.symbols[pos];
            (sym.name.clone(), sym.bind, sym.file_twin)
        };
        if name.is_empty() {
            continue;
        }

        let (addr, sympos) = if bind == STB_LOCAL {
            let file_idx = file_twin.with_context(|| {
                format!("local symbol {} has no running-file attribution", name)
            })?;
            let (rsym, sympos) = relf.lookup_local(file_idx, &name).with_context(|| {
                format!("cannot resolve local symbol {} against the running binary", name)
            })?;
            (rsym.st_value, sympos)
        } else {
            let rsym = relf.lookup_global_by_name(&name).with_context(|| {
                format!("cannot resolve symbol {} against the running binary", name)
            })?;
            (rsym.st_value, 0)
        };

        debug!("resolved {} to {:#x}", name, addr);
        out.symbols[pos].st_value = addr;

        if let (Some(sec), Some(&rec)) = (symbols_sec, records.by_name.get(&name)) {
            let data = &mut out.sec_mut(sec).data;
            data.pwrite_with(addr, rec, endian)?;
            data.pwrite_with(sympos, rec + 8, endian)?;
        }
    }
    Ok(())
}
