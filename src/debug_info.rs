// Debug information is included wholesale and then trimmed: relocations
// against entities that stayed out of the patch are dropped, and the
// .eh_frame record stream is compacted so only FDEs covering included
// functions survive.

use anyhow::{bail, ensure, Context, Result};
use log::debug;
use scroll::{Pread, Pwrite};
use std::collections::HashMap;

use crate::model::{is_debug_section, is_eh_frame, ObjectElf, Rela, SecId};

/// Include every `.debug_*` section (and `.eh_frame`) plus their rela
/// sections, rebuild the FDE list, then prune relocation entries whose
/// referent did not make it into the patch.
pub fn include_debug_sections(elf: &mut ObjectElf) -> Result<()> {
    let mut eh_sec = None;

    for id in elf.sec_ids().collect::<Vec<_>>() {
        if !is_debug_section(&elf.sec(id).name) {
            continue;
        }
        elf.sec_mut(id).include = true;
        if !elf.sec(id).is_rela() {
            if let Some(secsym) = elf.sec(id).secsym {
                elf.sym_mut(secsym).include = true;
            }
            if is_eh_frame(&elf.sec(id).name) {
                eh_sec = Some(id);
            }
        }
    }

    if let Some(eh) = eh_sec {
        rebuild_eh_frame(elf, eh).context("rebuilding .eh_frame")?;
    }

    for id in elf.sec_ids().collect::<Vec<_>>() {
        if !elf.sec(id).is_rela() || !is_debug_section(&elf.sec(id).name) {
            continue;
        }
        let keep: Vec<Rela> = elf
            .sec(id)
            .relas
            .iter()
            .filter(|rela| {
                let sym = elf.sym(rela.sym);
                match sym.sec() {
                    Some(sec) => elf.sec(sec).include,
                    None => sym.include,
                }
            })
            .cloned()
            .collect();
        let dropped = elf.sec(id).relas.len() - keep.len();
        if dropped > 0 {
            debug!("pruned {} relocations from {}", dropped, elf.sec(id).name);
        }
        elf.sec_mut(id).relas = keep;
    }

    Ok(())
}

/// Walk the CIE/FDE record stream of `.eh_frame`. CIEs are always kept;
/// an FDE survives only when the function section its pc-begin relocation
/// points at is included. Surviving records are compacted, the FDE→CIE
/// back-pointers are recomputed for the new layout, and relocation offsets
/// shift along with their records.
fn rebuild_eh_frame(elf: &mut ObjectElf, eh: SecId) -> Result<()> {
    let endian = elf.endian;
    let data = std::mem::take(&mut elf.sec_mut(eh).data);
    let relasec = elf.sec(eh).rela;
    let relas = match relasec {
        Some(rs) => std::mem::take(&mut elf.sec_mut(rs).relas),
        None => Vec::new(),
    };

    let mut new_data: Vec<u8> = Vec::with_capacity(data.len());
    let mut new_relas: Vec<Rela> = Vec::new();
    let mut new_record_pos: HashMap<usize, usize> = HashMap::new();

    let mut pos = 0;
    while pos + 4 <= data.len() {
        let length: u32 = data.pread_with(pos, endian)?;
        if length == 0 {
            // Zero terminator; nothing may follow it.
            break;
        }
        ensure!(
            length != u32::MAX,
            ".eh_frame at {:#x}: extended-length records are not supported",
            pos
        );
        let rec_end = pos + 4 + length as usize;
        ensure!(
            rec_end <= data.len() && pos + 8 <= rec_end,
            ".eh_frame record at {:#x} is truncated",
            pos
        );

        let cie_field: u32 = data.pread_with(pos + 4, endian)?;
        let keep = if cie_field == 0 {
            true
        } else {
            fde_function_included(elf, &relas, pos)
        };

        if keep {
            let new_pos = new_data.len();
            new_record_pos.insert(pos, new_pos);
            new_data.extend_from_slice(&data[pos..rec_end]);

            if cie_field != 0 {
                // The field holds the distance from itself back to its CIE.
                let old_cie_pos = (pos + 4)
                    .checked_sub(cie_field as usize)
                    .with_context(|| format!(".eh_frame FDE at {:#x}: bad CIE pointer", pos))?;
                let new_cie_pos = *new_record_pos
                    .get(&old_cie_pos)
                    .with_context(|| format!(".eh_frame FDE at {:#x}: dangling CIE pointer", pos))?;
                let new_field = (new_pos + 4 - new_cie_pos) as u32;
                new_data.pwrite_with(new_field, new_pos + 4, endian)?;
            }

            for rela in &relas {
                let off = rela.offset as usize;
                if off >= pos && off < rec_end {
                    let mut moved = rela.clone();
                    moved.offset = (off - pos + new_pos) as u64;
                    new_relas.push(moved);
                }
            }
        } else {
            debug!("dropping .eh_frame FDE at {:#x}", pos);
        }

        pos = rec_end;
    }

    if pos + 4 <= data.len() {
        let tail: u32 = data.pread_with(pos, endian)?;
        if tail == 0 {
            new_data.extend_from_slice(&data[pos..pos + 4]);
        }
    } else if pos != data.len() {
        bail!(".eh_frame has {} trailing bytes", data.len() - pos);
    }

    let size = new_data.len() as u64;
    let sec = elf.sec_mut(eh);
    sec.data = new_data;
    sec.sh.sh_size = size;
    if let Some(rs) = relasec {
        elf.sec_mut(rs).relas = new_relas;
    }
    Ok(())
}

/// The pc-begin field of an FDE sits 8 bytes into the record and carries a
/// relocation to the covered function (or its section symbol). An FDE with
/// no such relocation is kept: there is nothing to prune it against.
fn fde_function_included(elf: &ObjectElf, relas: &[Rela], record_pos: usize) -> bool {
    let pc_begin = (record_pos + 8) as u64;
    match relas.iter().find(|rela| rela.offset == pc_begin) {
        Some(rela) => {
            let sym = elf.sym(rela.sym);
            match sym.sec() {
                Some(sec) => elf.sec(sec).include,
                None => sym.include,
            }
        }
        None => true,
    }
}
