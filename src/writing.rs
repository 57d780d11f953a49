// Serialization of the output graph into ELF64 bytes. The image layout is
// the plain relocatable shape: file header, section payloads in arena
// order, then the section header table. The same goblin structures that
// parsed the inputs serialize the output.

use anyhow::{ensure, Context, Result};
use goblin::elf64::header::{Header, SIZEOF_EHDR};
use goblin::elf64::reloc::{Rela as Rela64, SIZEOF_RELA};
use goblin::elf64::section_header::{SectionHeader as Shdr64, SIZEOF_SHDR};
use goblin::elf64::sym::{Sym as Sym64, SIZEOF_SYM};
use scroll::Pwrite;
use std::collections::HashMap;

use crate::model::{ObjectElf, SectionKind, SymbolPlace, STT_SECTION};

const ET_REL: u16 = 1;
const SHN_ABS: u16 = 0xfff1;

/// Serialize the finished output graph. The graph must be reordered,
/// stripped, and reindexed already; this stage only assembles bytes.
pub fn write_output_elf(out: &mut ObjectElf) -> Result<Vec<u8>> {
    build_symtab_and_strtab(out)?;
    build_rela_payloads(out)?;
    let sh_names = build_shstrtab(out)?;
    serialize(out, &sh_names)
}

/// A single deduplicating ELF string table. Offset 0 is the empty string.
fn build_string_table<'a>(names: impl Iterator<Item = &'a str>) -> (Vec<u8>, HashMap<String, u32>) {
    let mut data = vec![0u8];
    let mut map = HashMap::new();
    for name in names {
        if name.is_empty() || map.contains_key(name) {
            continue;
        }
        map.insert(name.to_string(), data.len() as u32);
        data.extend_from_slice(name.as_bytes());
        data.push(0);
    }
    (data, map)
}

fn build_symtab_and_strtab(out: &mut ObjectElf) -> Result<()> {
    let endian = out.endian;
    // Section symbols carry no name of their own in the string table.
    let (strtab_data, name_offsets) = build_string_table(
        out.symbols
            .iter()
            .filter(|s| s.ty != STT_SECTION)
            .map(|s| s.name.as_str()),
    );

    let mut data = vec![0u8; out.symbols.len() * SIZEOF_SYM];
    for (i, s) in out.symbols.iter().enumerate() {
        let st_name = if i == 0 || s.ty == STT_SECTION {
            0
        } else {
            name_offsets.get(s.name.as_str()).copied().unwrap_or(0)
        };
        let st_shndx = match s.place {
            SymbolPlace::Undef => 0,
            SymbolPlace::Abs => SHN_ABS,
            SymbolPlace::Section(sec) => {
                let index = out.sec(sec).index;
                ensure!(index < 0xff00, "section index {} overflows st_shndx", index);
                index as u16
            }
        };
        let entry = Sym64 {
            st_name,
            st_info: (s.bind << 4) | (s.ty & 0xf),
            st_other: s.st_other,
            st_shndx,
            st_value: s.st_value,
            st_size: s.st_size,
        };
        data.pwrite_with(entry, i * SIZEOF_SYM, endian)?;
    }

    let symtab = out
        .find_section_by_name(".symtab")
        .context("output has no .symtab")?;
    out.sec_mut(symtab).sh.sh_size = data.len() as u64;
    out.sec_mut(symtab).data = data;

    let strtab = out
        .find_section_by_name(".strtab")
        .context("output has no .strtab")?;
    out.sec_mut(strtab).sh.sh_size = strtab_data.len() as u64;
    out.sec_mut(strtab).data = strtab_data;
    Ok(())
}

fn build_rela_payloads(out: &mut ObjectElf) -> Result<()> {
    let endian = out.endian;
    for id in out.sec_ids().collect::<Vec<_>>() {
        if !out.sec(id).is_rela() {
            continue;
        }
        let mut data = vec![0u8; out.sec(id).relas.len() * SIZEOF_RELA];
        for (i, rela) in out.sec(id).relas.iter().enumerate() {
            let sym_index = out.sym(rela.sym).index as u64;
            let entry = Rela64 {
                r_offset: rela.offset,
                r_info: (sym_index << 32) | rela.rtype as u64,
                r_addend: rela.addend,
            };
            data.pwrite_with(entry, i * SIZEOF_RELA, endian)?;
        }
        out.sec_mut(id).sh.sh_size = data.len() as u64;
        out.sec_mut(id).data = data;
    }
    Ok(())
}

fn build_shstrtab(out: &mut ObjectElf) -> Result<HashMap<String, u32>> {
    let (data, map) = build_string_table(out.sections.iter().map(|s| s.name.as_str()));
    let shstrtab = out
        .find_section_by_name(".shstrtab")
        .context("output has no .shstrtab")?;
    out.sec_mut(shstrtab).sh.sh_size = data.len() as u64;
    out.sec_mut(shstrtab).data = data;
    Ok(map)
}

fn serialize(out: &ObjectElf, sh_names: &HashMap<String, u32>) -> Result<Vec<u8>> {
    let endian = out.endian;
    let shnum = out.sections.len() + 1;

    let mut offset = SIZEOF_EHDR;
    let mut sh_offsets = vec![0u64; out.sections.len()];
    for (pos, sec) in out.sections.iter().enumerate() {
        let align = sec.sh.sh_addralign.max(1) as usize;
        offset = offset.div_ceil(align) * align;
        sh_offsets[pos] = offset as u64;
        if sec.kind != SectionKind::Nobits {
            offset += sec.data.len();
        }
    }
    let shoff = offset.div_ceil(8) * 8;
    let total = shoff + shnum * SIZEOF_SHDR;
    let mut buf = vec![0u8; total];

    let shstrndx = out
        .find_section_by_name(".shstrtab")
        .map(|id| out.sec(id).index)
        .context("output has no .shstrtab")?;

    let h = &out.header;
    let ehdr = Header {
        e_ident: h.ident,
        e_type: ET_REL,
        e_machine: h.e_machine,
        e_version: h.e_version,
        e_entry: 0,
        e_phoff: 0,
        e_shoff: shoff as u64,
        e_flags: h.e_flags,
        e_ehsize: SIZEOF_EHDR as u16,
        e_phentsize: 0,
        e_phnum: 0,
        e_shentsize: SIZEOF_SHDR as u16,
        e_shnum: shnum as u16,
        e_shstrndx: shstrndx as u16,
    };
    buf.pwrite_with(ehdr, 0, endian)?;

    for (pos, sec) in out.sections.iter().enumerate() {
        if sec.kind != SectionKind::Nobits && !sec.data.is_empty() {
            let start = sh_offsets[pos] as usize;
            buf[start..start + sec.data.len()].copy_from_slice(&sec.data);
        }
    }

    // Entry 0 of the header table stays zeroed.
    for (pos, sec) in out.sections.iter().enumerate() {
        let sh_size = if sec.kind == SectionKind::Nobits {
            sec.sh.sh_size
        } else {
            sec.data.len() as u64
        };
        let shdr = Shdr64 {
            sh_name: sh_names.get(sec.name.as_str()).copied().unwrap_or(0),
            sh_type: sec.sh.sh_type,
            sh_flags: sec.sh.sh_flags,
            sh_addr: 0,
            sh_offset: sh_offsets[pos],
            sh_size,
            sh_link: sec.sh.sh_link,
            sh_info: sec.sh.sh_info,
            sh_addralign: sec.sh.sh_addralign,
            sh_entsize: sec.sh.sh_entsize,
        };
        buf.pwrite_with(shdr, shoff + (pos + 1) * SIZEOF_SHDR, endian)?;
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::reindex_elements;
    use crate::model::{SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL};
    use crate::testgraph::GraphBuilder;

    fn writable_graph() -> ObjectElf {
        let mut b = GraphBuilder::new();
        let text = b.progbits(".text.f", &[0x90, 0x90, 0xc3]);
        b.func("f", text, 0, 3, STB_GLOBAL);
        let symtab = b.progbits(".symtab", &[]);
        let strtab = b.progbits(".strtab", &[]);
        let shstrtab = b.progbits(".shstrtab", &[]);
        let mut elf = b.build();
        for (id, sh_type, kind) in [
            (symtab, SHT_SYMTAB, SectionKind::Symtab),
            (strtab, SHT_STRTAB, SectionKind::Strtab),
            (shstrtab, SHT_STRTAB, SectionKind::Strtab),
        ] {
            elf.sec_mut(id).sh.sh_type = sh_type;
            elf.sec_mut(id).kind = kind;
            elf.sec_mut(id).sh.sh_addralign = 8;
        }
        reindex_elements(&mut elf).unwrap();
        elf
    }

    #[test]
    fn output_round_trips_through_goblin() {
        let mut elf = writable_graph();
        let bytes = write_output_elf(&mut elf).unwrap();

        let parsed = goblin::elf::Elf::parse(&bytes).unwrap();
        assert_eq!(parsed.header.e_type, ET_REL);
        assert_eq!(parsed.header.e_machine, crate::arch::EM_X86_64);
        assert_eq!(parsed.header.e_phnum, 0);

        let names: Vec<&str> = parsed
            .section_headers
            .iter()
            .filter_map(|sh| parsed.shdr_strtab.get_at(sh.sh_name))
            .collect();
        assert!(names.contains(&".text.f"));
        assert!(names.contains(&".symtab"));

        let f = parsed
            .syms
            .iter()
            .find(|s| parsed.strtab.get_at(s.st_name) == Some("f"))
            .unwrap();
        assert_eq!(f.st_size, 3);
        assert_eq!(f.st_bind(), STB_GLOBAL);
    }

    #[test]
    fn relocation_entries_survive_round_trip() {
        let mut b = GraphBuilder::new();
        let text = b.progbits(".text.f", &[0x90; 8]);
        let f = b.func("f", text, 0, 8, STB_GLOBAL);
        let relasec = b.rela_sec(text);
        b.rela(relasec, 4, crate::arch::R_X86_64_PC32, -4, f);
        let symtab = b.progbits(".symtab", &[]);
        let strtab = b.progbits(".strtab", &[]);
        let shstrtab = b.progbits(".shstrtab", &[]);
        let mut elf = b.build();
        for (id, sh_type, kind) in [
            (symtab, SHT_SYMTAB, SectionKind::Symtab),
            (strtab, SHT_STRTAB, SectionKind::Strtab),
            (shstrtab, SHT_STRTAB, SectionKind::Strtab),
        ] {
            elf.sec_mut(id).sh.sh_type = sh_type;
            elf.sec_mut(id).kind = kind;
        }
        reindex_elements(&mut elf).unwrap();
        let f_index = elf.sym(f).index;

        let bytes = write_output_elf(&mut elf).unwrap();
        let parsed = goblin::elf::Elf::parse(&bytes).unwrap();

        let rela_sh = parsed
            .section_headers
            .iter()
            .find(|sh| parsed.shdr_strtab.get_at(sh.sh_name) == Some(".rela.text.f"))
            .unwrap();
        assert_eq!(rela_sh.sh_entsize, 24);
        let ctx = goblin::container::Ctx::new(
            goblin::container::Container::Big,
            goblin::container::Endian::Little,
        );
        let relas = goblin::elf::reloc::RelocSection::parse(
            &bytes,
            rela_sh.sh_offset as usize,
            rela_sh.sh_size as usize,
            true,
            ctx,
        )
        .unwrap();
        let rela = relas.iter().next().unwrap();
        assert_eq!(rela.r_offset, 4);
        assert_eq!(rela.r_addend, Some(-4));
        assert_eq!(rela.r_sym, f_index);
        assert_eq!(rela.r_type, crate::arch::R_X86_64_PC32);
    }
}
