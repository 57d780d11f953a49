// Relocations come in two shapes: based on a named symbol, or based on the
// section symbol of the section the target lives in. The second shape is
// common for static objects and makes two compilations impossible to compare
// entry-by-entry, so every section-based relocation is rewritten here into
// its named-symbol equivalent before correlation runs.

use anyhow::{bail, Result};
use log::debug;

use crate::model::{
    is_debug_section, is_string_literal_section, is_text_section_name, ObjectElf, Rela, SecId,
    STT_SECTION,
};

/// Rewrite every section-symbol relocation of `elf` to point at the symbol
/// whose value range covers the relocation target. Running this twice is a
/// no-op: rewritten entries no longer reference section symbols.
pub fn replace_section_syms(elf: &mut ObjectElf) -> Result<()> {
    for relasec_id in elf.sec_ids().collect::<Vec<_>>() {
        if !elf.sec(relasec_id).is_rela() || is_debug_section(&elf.sec(relasec_id).name) {
            continue;
        }

        let mut relas = std::mem::take(&mut elf.sec_mut(relasec_id).relas);
        let result = rewrite_relas(elf, relasec_id, &mut relas);
        elf.sec_mut(relasec_id).relas = relas;
        result?;
    }
    Ok(())
}

fn rewrite_relas(elf: &ObjectElf, relasec_id: SecId, relas: &mut [Rela]) -> Result<()> {
    for rela in relas.iter_mut() {
        let refsym = elf.sym(rela.sym);
        if refsym.ty != STT_SECTION {
            continue;
        }
        let target_sec = match refsym.sec() {
            Some(sec) => sec,
            None => continue,
        };

        debug!("found replaceable section symbol {}", refsym.name);

        // A bundled section is its symbol; the rewrite is direct.
        if let Some(owner) = elf.sec(target_sec).bundled_sym {
            let owner_sym = elf.sym(owner);
            debug!(
                "replacing {} reference with bundled symbol {}",
                elf.sec(target_sec).name,
                owner_sym.name
            );
            if owner_sym.st_value != 0 && !elf.arch.is_gcc6_localentry_bundled_sym(owner_sym) {
                bail!(
                    "{}+{:#x}: bundled symbol {} sits at non-zero offset {}",
                    elf.diag_section_name(relasec_id),
                    rela.offset,
                    owner_sym.name,
                    owner_sym.st_value
                );
            }
            rela.sym = owner;
            continue;
        }

        let target_off = elf.arch.rela_target_offset(rela);
        let mut found = false;
        for cand_id in elf.sym_ids() {
            let cand = elf.sym(cand_id);
            if cand.ty == STT_SECTION || cand.sec() != Some(target_sec) {
                continue;
            }

            let start = cand.st_value as i64;
            let end = start + cand.st_size as i64;
            let sec_size = elf.sec(target_sec).sh.sh_size as i64;

            // A text-to-data reference landing exactly on the end of the
            // data section indicates a known miscompile; refuse it rather
            // than emit a patch that corrupts a neighbouring object.
            let base = elf.sec(relasec_id).base;
            let base_is_text = base
                .map(|b| is_text_section_name(&elf.sec(b).name))
                .unwrap_or(false);
            if base_is_text
                && !is_text_section_name(&elf.sec(target_sec).name)
                && elf.arch.is_abs_data_ref(rela.rtype)
                && rela.addend == sec_size
                && end == sec_size
            {
                bail!(
                    "{}+{:#x}: relocation refers to the end of data section {}",
                    elf.diag_section_name(relasec_id),
                    rela.offset,
                    elf.sec(target_sec).name
                );
            }

            if target_off == start && target_off == end {
                if elf.arch.is_mapping_symbol(cand) {
                    continue;
                }
                debug!("relocation reference for empty symbol {}", cand.name);
            } else if target_off < start || target_off >= end {
                continue;
            }

            debug!(
                "{}: replacing {}+{} reference with {}+{}",
                elf.sec(relasec_id).name,
                refsym.name,
                rela.addend,
                cand.name,
                rela.addend - start
            );
            rela.sym = cand_id;
            rela.addend -= start;
            found = true;
            break;
        }

        // Only plain .rodata/.data and string-literal pools may keep raw
        // section references: gcc emits those for oversized local string
        // tables and the data sections are refused for inclusion later
        // anyway.
        if !found
            && !is_string_literal_section(&elf.sec(target_sec).name)
            && !elf.sec(target_sec).name.starts_with(".rodata")
            && !elf.sec(target_sec).name.starts_with(".data")
        {
            bail!(
                "{}+{:#x}: cannot find replacement symbol for {}+{} reference",
                elf.diag_section_name(relasec_id),
                rela.offset,
                refsym.name,
                rela.addend
            );
        }
    }
    Ok(())
}
