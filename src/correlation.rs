// Correlation pairs every entity of the source object with its counterpart
// in the patched object, and every STT_FILE block of the source object with
// the translation-unit block of the running binary it came from. Everything
// downstream only looks at the patched graph; the twin links carry what it
// needs to know about the source side.

use anyhow::{bail, Result};
use log::debug;

use crate::model::{ObjectElf, SecId, SymId, STB_LOCAL, STT_FILE, STT_FUNC, STT_OBJECT};
use crate::running::RunningElf;

/// Pair sections by name, then symbols by name and (type, binding). The
/// first unmatched candidate wins, so duplicate names can never pair twice.
/// Matched source locals hand their running-file link over to the patched
/// twin.
pub fn correlate_elfs(source: &mut ObjectElf, patched: &mut ObjectElf) {
    for s_id in source.sec_ids().collect::<Vec<_>>() {
        let name = source.sec(s_id).name.clone();
        let twin = patched
            .sec_ids()
            .find(|&p_id| patched.sec(p_id).twin.is_none() && patched.sec(p_id).name == name);
        if let Some(p_id) = twin {
            source.sec_mut(s_id).twin = Some(p_id);
            patched.sec_mut(p_id).twin = Some(s_id);
        }
    }

    for s_id in source.sym_ids().collect::<Vec<_>>() {
        let (name, ty, bind) = {
            let sym = source.sym(s_id);
            (sym.name.clone(), sym.ty, sym.bind)
        };
        let twin = patched.sym_ids().find(|&p_id| {
            let p = patched.sym(p_id);
            p.twin.is_none() && p.ty == ty && p.bind == bind && p.name == name
        });
        if let Some(p_id) = twin {
            source.sym_mut(s_id).twin = Some(p_id);
            let file_twin = source.sym(s_id).file_twin;
            let p = patched.sym_mut(p_id);
            p.twin = Some(s_id);
            if p.file_twin.is_none() {
                p.file_twin = file_twin;
            }
        }
    }
}

/// Static locals may carry compiler-mangled suffixes that differ between
/// the two compilations (`counter.123` vs `counter.456`). Pair the leftover
/// local objects and functions on the name stem when their dedicated
/// sections agree structurally, and pair those sections along with them.
pub fn correlate_static_local_variables(source: &mut ObjectElf, patched: &mut ObjectElf) {
    for s_id in source.sym_ids().collect::<Vec<_>>() {
        if !is_mangled_static_local(source, s_id) || source.sym(s_id).twin.is_some() {
            continue;
        }
        let s_stem = name_stem(&source.sym(s_id).name).to_string();
        let s_sec = source.sym(s_id).sec().unwrap();
        let s_sec_stem = strip_mangle_suffix(&source.sec(s_sec).name).to_string();
        let (ty, bind) = (source.sym(s_id).ty, source.sym(s_id).bind);

        let candidate = patched.sym_ids().find(|&p_id| {
            let p = patched.sym(p_id);
            if p.twin.is_some() || p.ty != ty || p.bind != bind {
                return false;
            }
            if !is_mangled_static_local(patched, p_id) || name_stem(&p.name) != s_stem {
                return false;
            }
            let p_sec = p.sec().unwrap();
            patched.sec(p_sec).twin.is_none()
                && strip_mangle_suffix(&patched.sec(p_sec).name) == s_sec_stem
        });

        if let Some(p_id) = candidate {
            debug!(
                "correlating static local {} with {}",
                source.sym(s_id).name,
                patched.sym(p_id).name
            );
            let p_sec = patched.sym(p_id).sec().unwrap();
            source.sym_mut(s_id).twin = Some(p_id);
            let file_twin = source.sym(s_id).file_twin;
            {
                let p = patched.sym_mut(p_id);
                p.twin = Some(s_id);
                if p.file_twin.is_none() {
                    p.file_twin = file_twin;
                }
            }
            source.sec_mut(s_sec).twin = Some(p_sec);
            patched.sec_mut(p_sec).twin = Some(s_sec);
            correlate_companions(source, s_sec, patched, p_sec);
        }
    }
}

/// Twin the rela sections and section symbols of a freshly paired section
/// pair, mirroring what name-based pairing would have done had the names
/// matched.
fn correlate_companions(source: &mut ObjectElf, s_sec: SecId, patched: &mut ObjectElf, p_sec: SecId) {
    if let (Some(s_rela), Some(p_rela)) = (source.sec(s_sec).rela, patched.sec(p_sec).rela) {
        if source.sec(s_rela).twin.is_none() && patched.sec(p_rela).twin.is_none() {
            source.sec_mut(s_rela).twin = Some(p_rela);
            patched.sec_mut(p_rela).twin = Some(s_rela);
        }
    }
    if let (Some(s_sym), Some(p_sym)) = (source.sec(s_sec).secsym, patched.sec(p_sec).secsym) {
        if source.sym(s_sym).twin.is_none() && patched.sym(p_sym).twin.is_none() {
            source.sym_mut(s_sym).twin = Some(p_sym);
            patched.sym_mut(p_sym).twin = Some(s_sym);
        }
    }
}

fn is_mangled_static_local(elf: &ObjectElf, id: SymId) -> bool {
    let sym = elf.sym(id);
    if sym.bind != STB_LOCAL || (sym.ty != STT_OBJECT && sym.ty != STT_FUNC) {
        return false;
    }
    let sec = match sym.sec() {
        Some(sec) => sec,
        None => return false,
    };
    // Only bundled statics are eligible; the mangle shows up in both the
    // symbol and its dedicated section name.
    if elf.sec(sec).bundled_sym != Some(id) {
        return false;
    }
    match sym.name.split_once('.') {
        Some((stem, suffix)) => {
            !stem.is_empty() && suffix.chars().next().is_some_and(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn name_stem(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Drop a trailing `.NNN` mangle from a section name, if present.
fn strip_mangle_suffix(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos)
            if pos + 1 < name.len()
                && name[pos + 1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            &name[..pos]
        }
        _ => name,
    }
}

/// Locate, for every STT_FILE symbol of the source object, the unique
/// translation-unit block of the running binary whose local symbols
/// set-match the block that follows it. The winner is stored on every local
/// symbol of the block for later resolution.
pub fn find_file_symbol(source: &mut ObjectElf, relf: &RunningElf) -> Result<()> {
    for pos in 0..source.symbols.len() {
        if source.symbols[pos].ty == STT_FILE {
            find_local_syms(source, pos, relf)?;
        }
    }
    Ok(())
}

fn find_local_syms(source: &mut ObjectElf, file_pos: usize, relf: &RunningElf) -> Result<()> {
    let file_name = source.symbols[file_pos].name.clone();
    let mut winner = None;

    for file_idx in relf.file_indices() {
        if relf.syms[file_idx].name != file_name {
            continue;
        }
        if !locals_match(source, file_pos, relf, file_idx) {
            continue;
        }
        if winner.is_some() {
            bail!(
                "found duplicate matches for {} local symbols in running elf",
                file_name
            );
        }
        winner = Some(file_idx);
    }

    let winner = match winner {
        Some(idx) => idx,
        None => bail!(
            "could not find matching {} local symbols in running elf",
            file_name
        ),
    };

    debug!("matched file block {} at running index {}", file_name, winner);
    for sym in source.symbols[file_pos + 1..].iter_mut() {
        if sym.ty == STT_FILE {
            break;
        }
        sym.file_twin = Some(winner);
    }
    Ok(())
}

/// Two-way set containment of the LOCAL FUNC/OBJECT symbols of the source
/// block against the running block: every name/type pair must appear on the
/// other side.
fn locals_match(source: &ObjectElf, file_pos: usize, relf: &RunningElf, file_idx: usize) -> bool {
    let block_locals = |elf: &ObjectElf| -> Vec<(String, u8)> {
        elf.symbols[file_pos + 1..]
            .iter()
            .take_while(|s| s.ty != STT_FILE)
            .filter(|s| s.bind == STB_LOCAL && (s.ty == STT_FUNC || s.ty == STT_OBJECT))
            .map(|s| (s.name.clone(), s.ty))
            .collect()
    };
    let ours = block_locals(source);

    for running in relf.block_locals(file_idx) {
        if !ours
            .iter()
            .any(|(name, ty)| *ty == running.ty && *name == running.name)
        {
            debug!("cannot find {} in the object block", running.name);
            return false;
        }
    }

    for (name, ty) in &ours {
        if !relf
            .block_locals(file_idx)
            .any(|running| running.ty == *ty && running.name == *name)
        {
            debug!("cannot find {} in the running block", name);
            return false;
        }
    }

    true
}
