// The inclusion engine selects the least sub-graph of the patched object
// that has to appear in the output: changed functions and everything their
// relocations transitively depend on, plus the standard ELF furniture.

use anyhow::{bail, Result};
use log::{debug, error, warn};

use crate::model::{
    is_except_section, is_string_literal_section, ObjectElf, SecId, Status, SymId,
    SYM_OTHER_PLACEHOLDER, SHT_GROUP, STB_GLOBAL, STB_LOCAL, STT_FILE, STT_FUNC, STT_SECTION,
};

enum Item {
    Sym(SymId),
    Sec(SecId),
}

/// Include a symbol and everything it forces. A function or object symbol
/// only drags its section in when the section actually changed; an
/// unchanged referent stays external and is resolved against the running
/// binary later. Section symbols always pull their section, since a raw
/// section reference cannot be resolved externally.
fn include_symbol(elf: &mut ObjectElf, start: SymId) {
    let mut worklist = vec![Item::Sym(start)];

    while let Some(item) = worklist.pop() {
        match item {
            Item::Sym(id) => {
                if elf.sym(id).include {
                    continue;
                }
                elf.sym_mut(id).include = true;

                let sec = match elf.sym(id).sec() {
                    Some(sec) => sec,
                    None => continue,
                };
                let sym = elf.sym(id);
                if sym.ty == STT_SECTION || sym.status != Status::Same {
                    worklist.push(Item::Sec(sec));
                } else if sym.bind == STB_LOCAL && sym.ty == STT_FUNC {
                    // An unchanged local function referenced from changed
                    // code cannot be linked externally; keep its symbol
                    // with an emptied section and mark it so the runtime
                    // resolves the real body from the running binary.
                    elf.sym_mut(id).st_other |= SYM_OTHER_PLACEHOLDER;
                    let sec_ref = elf.sec_mut(sec);
                    sec_ref.include = true;
                    sec_ref.data = Vec::new();
                    sec_ref.sh.sh_size = 0;
                    if let Some(secsym) = sec_ref.secsym {
                        elf.sym_mut(secsym).include = true;
                    }
                }
            }
            Item::Sec(id) => {
                if elf.sec(id).include || elf.sec(id).ignore {
                    continue;
                }
                elf.sec_mut(id).include = true;
                if let Some(secsym) = elf.sec(id).secsym {
                    elf.sym_mut(secsym).include = true;
                }
                if let Some(rela) = elf.sec(id).rela {
                    elf.sec_mut(rela).include = true;
                    for i in 0..elf.sec(rela).relas.len() {
                        worklist.push(Item::Sym(elf.sec(rela).relas[i].sym));
                    }
                }
            }
        }
    }
}

fn include_section(elf: &mut ObjectElf, id: SecId) {
    if elf.sec(id).include || elf.sec(id).ignore {
        return;
    }
    elf.sec_mut(id).include = true;
    if let Some(secsym) = elf.sec(id).secsym {
        elf.sym_mut(secsym).include = true;
    }
    if let Some(rela) = elf.sec(id).rela {
        elf.sec_mut(rela).include = true;
        for i in 0..elf.sec(rela).relas.len() {
            let sym = elf.sec(rela).relas[i].sym;
            include_symbol(elf, sym);
        }
    }
}

/// The ELF furniture every relocatable output needs, plus `.rodata` and
/// the string-literal pools whose section references are tolerated by the
/// rewriter.
pub fn include_standard_elements(elf: &mut ObjectElf) {
    for id in elf.sec_ids().collect::<Vec<_>>() {
        let name = elf.sec(id).name.clone();
        if name == ".shstrtab"
            || name == ".strtab"
            || name == ".symtab"
            || name == ".rodata"
            || is_string_literal_section(&name)
        {
            include_section(elf, id);
        }
    }

    for id in elf.sym_ids().collect::<Vec<_>>() {
        if let Some(sec) = elf.sym(id).sec() {
            if is_string_literal_section(&elf.sec(sec).name) {
                elf.sym_mut(id).include = true;
            }
        }
    }

    // The null symbol heads every symbol table.
    elf.sym_mut(SymId(0)).include = true;
}

/// Seed the closure with every changed function, count them, and keep all
/// STT_FILE symbols so translation-unit attribution survives into the
/// output.
pub fn include_changed_functions(elf: &mut ObjectElf) -> usize {
    let mut changed = 0;

    for id in elf.sym_ids().collect::<Vec<_>>() {
        let sym = elf.sym(id);
        if sym.status == Status::Changed && sym.ty == STT_FUNC {
            changed += 1;
            include_symbol(elf, id);
        } else if sym.status == Status::Changed && sym.ty == STT_SECTION {
            if let Some(sec) = sym.sec() {
                if is_except_section(&elf.sec(sec).name) {
                    warn!("found changed exception section {}", elf.sec(sec).name);
                    changed += 1;
                    include_symbol(elf, id);
                }
            }
        }

        if elf.sym(id).ty == STT_FILE {
            elf.sym_mut(id).include = true;
        }
    }

    changed
}

pub fn include_new_globals(elf: &mut ObjectElf) -> usize {
    let mut count = 0;
    for id in elf.sym_ids().collect::<Vec<_>>() {
        let sym = elf.sym(id);
        if sym.bind == STB_GLOBAL && sym.status == Status::New && sym.sec().is_some() {
            include_symbol(elf, id);
            count += 1;
        }
    }
    count
}

/// Refuse patch shapes the runtime cannot apply safely. All refusals are
/// enumerated before aborting so a build log shows the whole picture.
pub fn verify_patchability(elf: &ObjectElf) -> Result<()> {
    let mut errs = 0;

    for id in elf.sec_ids() {
        let sec = elf.sec(id);
        if sec.ignore {
            continue;
        }

        if sec.status == Status::Changed && !sec.include {
            error!("changed section {} not selected for inclusion", sec.name);
            errs += 1;
        }

        if sec.status != Status::Same && sec.grouped {
            error!("changed section {} is part of a section group", sec.name);
            errs += 1;
        }

        if sec.sh.sh_type == SHT_GROUP && sec.status != Status::Same {
            error!("new/changed group section {} is not supported", sec.name);
            errs += 1;
        }

        // Only two whitelisted data sections may carry state into a patch;
        // anything else would overwrite live process data on load.
        if sec.include
            && sec.status != Status::New
            && (sec.name.starts_with(".data") || sec.name.starts_with(".bss"))
            && sec.name != ".data.unlikely"
            && sec.name != ".data.once"
        {
            error!("data section {} selected for inclusion", sec.name);
            errs += 1;
        }
    }

    if errs > 0 {
        bail!("{} unsupported section changes", errs);
    }
    Ok(())
}

/// Debug listing of the verdicts, printed before the output is assembled.
pub fn print_changes(elf: &ObjectElf) {
    for id in elf.sym_ids() {
        let sym = elf.sym(id);
        match sym.status {
            Status::Changed => debug!("changed symbol: {}", sym.name),
            Status::New if sym.include => debug!("new symbol: {}", sym.name),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{R_X86_64_64, R_X86_64_PLT32};
    use crate::model::{StripPolicy, STB_LOCAL};
    use crate::testgraph::GraphBuilder;

    #[test]
    fn changed_function_closure_pulls_referenced_sections() {
        let mut b = GraphBuilder::new();
        let text = b.progbits(".text.f", &[0; 8]);
        let f = b.func("f", text, 0, 8, STB_GLOBAL);
        let rodata = b.progbits(".rodata.tbl", &[0; 16]);
        let tbl = b.object("tbl", rodata, 0, 16, STB_LOCAL);
        let relasec = b.rela_sec(text);
        b.rela(relasec, 2, R_X86_64_64, 0, tbl);
        let mut elf = b.build();

        elf.sym_mut(f).status = Status::Changed;
        elf.sec_mut(text).status = Status::Changed;
        elf.sym_mut(tbl).status = Status::Changed;
        elf.sec_mut(rodata).status = Status::Changed;

        let changed = include_changed_functions(&mut elf);
        assert_eq!(changed, 1);
        assert!(elf.sec(text).include);
        assert!(elf.sec(relasec).include);
        assert!(elf.sym(tbl).include);
        assert!(elf.sec(rodata).include);
    }

    #[test]
    fn same_referent_stays_external() {
        let mut b = GraphBuilder::new();
        let text = b.progbits(".text.f", &[0; 8]);
        let f = b.func("f", text, 0, 8, STB_GLOBAL);
        let gtext = b.progbits(".text.g", &[0; 8]);
        let g = b.func("g", gtext, 0, 8, STB_GLOBAL);
        let relasec = b.rela_sec(text);
        b.rela(relasec, 2, R_X86_64_PLT32, -4, g);
        let mut elf = b.build();

        elf.sym_mut(f).status = Status::Changed;
        elf.sec_mut(text).status = Status::Changed;
        elf.sym_mut(g).status = Status::Same;
        elf.sec_mut(gtext).status = Status::Same;

        include_changed_functions(&mut elf);
        assert!(elf.sym(g).include);
        // g did not change, so its body stays out of the patch.
        assert!(!elf.sec(gtext).include);
    }

    #[test]
    fn same_local_function_becomes_placeholder() {
        let mut b = GraphBuilder::new();
        let text = b.progbits(".text.f", &[0; 8]);
        let f = b.func("f", text, 0, 8, STB_GLOBAL);
        let htext = b.progbits(".text.helper", &[1, 2, 3, 4]);
        let helper = b.func("helper", htext, 0, 4, STB_LOCAL);
        let relasec = b.rela_sec(text);
        b.rela(relasec, 2, R_X86_64_PLT32, -4, helper);
        let mut elf = b.build();

        elf.sym_mut(f).status = Status::Changed;
        elf.sec_mut(text).status = Status::Changed;
        elf.sym_mut(helper).status = Status::Same;
        elf.sec_mut(htext).status = Status::Same;

        include_changed_functions(&mut elf);
        assert!(elf.sym(helper).include);
        assert!(elf.sec(htext).include);
        assert!(elf.sec(htext).data.is_empty());
        assert_eq!(elf.sec(htext).sh.sh_size, 0);
        assert_ne!(elf.sym(helper).st_other & SYM_OTHER_PLACEHOLDER, 0);
    }

    #[test]
    fn changed_unincluded_section_fails_verification() {
        let mut b = GraphBuilder::new();
        let text = b.progbits(".text.f", &[0; 8]);
        b.func("f", text, 0, 8, STB_GLOBAL);
        let mut elf = b.build();
        elf.sec_mut(text).status = Status::Changed;

        let err = verify_patchability(&elf).unwrap_err();
        assert!(err.to_string().contains("unsupported section changes"));
    }

    #[test]
    fn included_data_section_fails_verification() {
        let mut b = GraphBuilder::new();
        let data = b.progbits(".data", &[1, 2, 3, 4]);
        let mut elf = b.build();
        elf.sec_mut(data).status = Status::Changed;
        elf.sec_mut(data).include = true;

        let err = verify_patchability(&elf).unwrap_err();
        assert!(err.to_string().contains("unsupported section changes"));
    }

    #[test]
    fn whitelisted_data_sections_pass() {
        let mut b = GraphBuilder::new();
        let data = b.progbits(".data.once", &[1]);
        let mut elf = b.build();
        elf.sec_mut(data).status = Status::Changed;
        elf.sec_mut(data).include = true;
        verify_patchability(&elf).unwrap();
    }

    #[test]
    fn standard_elements_and_null_symbol_are_included() {
        let mut b = GraphBuilder::new();
        let rodata = b.progbits(".rodata", &[0; 4]);
        let strs = b.progbits(".rodata.str1.1", b"hi\0");
        let mut elf = b.build();
        include_standard_elements(&mut elf);
        assert!(elf.sec(rodata).include);
        assert!(elf.sec(strs).include);
        assert!(elf.sym(SymId(0)).include);
        assert_eq!(elf.sym(SymId(0)).strip, StripPolicy::Default);
    }
}
