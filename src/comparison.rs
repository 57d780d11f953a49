// Classification of every correlated entity as SAME or CHANGED. Anything
// without a twin keeps its NEW status. Only the patched graph is annotated;
// the source graph is read-only here and discarded right after.

use anyhow::Result;
use log::debug;

use crate::model::{ObjectElf, SecId, SectionKind, Status};

/// `.discard*` sections carry compile-time-only content and never take part
/// in differencing or inclusion.
pub fn mark_ignored_sections(patched: &mut ObjectElf) {
    for id in patched.sec_ids().collect::<Vec<_>>() {
        let name = &patched.sec(id).name;
        if name.starts_with(".discard") || name.starts_with(".rela.discard") {
            debug!("found discard section {}", name);
            patched.sec_mut(id).ignore = true;
        }
    }
}

/// Compare every correlated section and symbol of `patched` against its
/// source twin and record the verdict on the patched side.
pub fn compare_correlated_elements(patched: &mut ObjectElf, source: &ObjectElf) -> Result<()> {
    for id in patched.sec_ids().collect::<Vec<_>>() {
        let status = match patched.sec(id).twin {
            Some(twin) => compare_sections(patched, id, source, twin),
            None => Status::New,
        };
        if status == Status::Changed {
            debug!("section {} changed", patched.sec(id).name);
        }
        patched.sec_mut(id).status = status;
    }

    for id in patched.sym_ids().collect::<Vec<_>>() {
        let status = match patched.sym(id).twin {
            Some(twin) => compare_symbols(patched, id, source, twin),
            None => Status::New,
        };
        if status == Status::Changed {
            debug!("symbol {} changed", patched.sym(id).name);
        }
        patched.sym_mut(id).status = status;
    }

    // A function whose subfunction changed has changed itself: the shared
    // control flow between the two bodies cannot be split.
    for id in patched.sym_ids().collect::<Vec<_>>() {
        if patched.sym(id).status == Status::Same
            && patched
                .sym(id)
                .children
                .iter()
                .any(|&child| patched.sym(child).status != Status::Same)
        {
            debug!(
                "symbol {} changed through a subfunction",
                patched.sym(id).name
            );
            patched.sym_mut(id).status = Status::Changed;
        }
    }

    Ok(())
}

fn compare_sections(
    patched: &ObjectElf,
    p_id: SecId,
    source: &ObjectElf,
    s_id: SecId,
) -> Status {
    let p = patched.sec(p_id);
    let s = source.sec(s_id);

    if p.sh.sh_type != s.sh.sh_type
        || p.sh.sh_flags != s.sh.sh_flags
        || p.sh.sh_entsize != s.sh.sh_entsize
    {
        return Status::Changed;
    }

    if p.is_rela() {
        return compare_rela_sections(patched, p_id, source, s_id);
    }

    if p.sh.sh_size != s.sh.sh_size {
        return Status::Changed;
    }
    if p.kind == SectionKind::Nobits {
        return Status::Same;
    }

    if masked_bytes_equal(patched, p_id, source, s_id) {
        Status::Same
    } else {
        Status::Changed
    }
}

fn compare_rela_sections(
    patched: &ObjectElf,
    p_id: SecId,
    source: &ObjectElf,
    s_id: SecId,
) -> Status {
    let p_relas = &patched.sec(p_id).relas;
    let s_relas = &source.sec(s_id).relas;
    if p_relas.len() != s_relas.len() {
        return Status::Changed;
    }

    for (p_rela, s_rela) in p_relas.iter().zip(s_relas.iter()) {
        if p_rela.offset != s_rela.offset
            || p_rela.rtype != s_rela.rtype
            || p_rela.addend != s_rela.addend
        {
            return Status::Changed;
        }
        // The referents must be the same entity, i.e. correlated twins.
        if source.sym(s_rela.sym).twin != Some(p_rela.sym) {
            return Status::Changed;
        }
    }
    Status::Same
}

/// Byte-compare two section payloads with every relocation slot masked out.
/// The relocated fields hold link-time scratch values; whether the referent
/// itself changed is judged by the rela-section comparison, not by the bytes
/// it happens to leave behind.
fn masked_bytes_equal(patched: &ObjectElf, p_id: SecId, source: &ObjectElf, s_id: SecId) -> bool {
    let p = patched.sec(p_id);
    let s = source.sec(s_id);
    if p.data.len() != s.data.len() {
        return false;
    }

    let mut p_data = p.data.clone();
    let mut s_data = s.data.clone();
    if let Some(rela) = p.rela {
        mask_slots(&mut p_data, patched, rela);
    }
    if let Some(rela) = s.rela {
        mask_slots(&mut s_data, source, rela);
    }
    p_data == s_data
}

fn mask_slots(data: &mut [u8], elf: &ObjectElf, relasec: SecId) {
    for rela in &elf.sec(relasec).relas {
        let slot = elf.arch.reloc_slot_size(rela.rtype);
        let start = rela.offset as usize;
        let end = (start + slot).min(data.len());
        if start < data.len() {
            data[start..end].fill(0);
        }
    }
}

fn compare_symbols(patched: &ObjectElf, p_id: crate::model::SymId, source: &ObjectElf, s_id: crate::model::SymId) -> Status {
    let p = patched.sym(p_id);
    let s = source.sym(s_id);

    if p.ty != s.ty || p.bind != s.bind || p.st_size != s.st_size {
        return Status::Changed;
    }

    // The owning section carries the verdict for the payload; its rela
    // companion carries the verdict for the references.
    if let Some(sec) = p.sec() {
        if patched.sec(sec).status == Status::Changed {
            return Status::Changed;
        }
        if let Some(rela) = patched.sec(sec).rela {
            if patched.sec(rela).status == Status::Changed {
                return Status::Changed;
            }
        }
        // A symbol that moved to an uncorrelated section has changed even
        // though its own attributes match.
        if patched.sec(sec).twin.is_none() {
            return Status::Changed;
        }
    }

    Status::Same
}
