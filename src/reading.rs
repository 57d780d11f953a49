// Loading of relocatable objects into the arena graph. Parsing is done with
// goblin; the raw file bytes are only needed here, everything downstream
// works on the owned graph.

use anyhow::{bail, ensure, Context, Result};
use goblin::container::{Container, Ctx};
use goblin::elf::Elf;
use log::debug;
use scroll::Endian;

use crate::arch::Arch;
use crate::model::{
    check_rela_links, HeaderInfo, ObjectElf, Rela, SecId, Section, SectionHeaderInfo,
    SectionKind, StringPool, StripPolicy, Status, SymId, Symbol, SymbolPlace, SHT_REL,
    STT_SECTION,
};

const EI_DATA: usize = 5;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const SHN_UNDEF_IDX: usize = 0;
const SHN_LORESERVE: usize = 0xff00;
const SHN_ABS_IDX: usize = 0xfff1;
const SHN_COMMON_IDX: usize = 0xfff2;

/// Parse a relocatable object into an [`ObjectElf`] graph. `origin` names
/// the file in diagnostics.
pub fn load_object(bytes: &[u8], origin: &str) -> Result<ObjectElf> {
    let elf = Elf::parse(bytes).with_context(|| format!("{}: not a valid ELF", origin))?;

    ensure!(elf.is_64, "{}: only 64-bit objects are supported", origin);
    let endian = match elf.header.e_ident[EI_DATA] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        other => bail!("{}: unknown ELF data encoding {}", origin, other),
    };
    let arch = Arch::from_machine(elf.header.e_machine)
        .with_context(|| format!("{}: unsupported machine", origin))?;

    let header = HeaderInfo {
        ident: elf.header.e_ident,
        e_type: elf.header.e_type,
        e_machine: elf.header.e_machine,
        e_version: elf.header.e_version,
        e_entry: elf.header.e_entry,
        e_phoff: elf.header.e_phoff,
        e_flags: elf.header.e_flags,
        e_ehsize: elf.header.e_ehsize,
        e_phentsize: elf.header.e_phentsize,
        e_shentsize: elf.header.e_shentsize,
        e_phnum: elf.header.e_phnum,
    };

    let mut obj = ObjectElf {
        header,
        endian,
        arch,
        sections: Vec::new(),
        symbols: Vec::new(),
        strings: StringPool::default(),
    };

    // The null section header entry carries no content; arena positions
    // therefore start at ELF index 1 and `Section::index` keeps the real
    // section table index.
    for (index, sh) in elf.section_headers.iter().enumerate().skip(1) {
        let name = elf
            .shdr_strtab
            .get_at(sh.sh_name)
            .unwrap_or_default()
            .to_string();
        let kind = SectionKind::from_sh_type(sh.sh_type);
        if sh.sh_type == SHT_REL {
            bail!("{}: section {} uses REL relocations", origin, name);
        }

        let data = if kind == SectionKind::Nobits {
            Vec::new()
        } else {
            let start = sh.sh_offset as usize;
            let end = start + sh.sh_size as usize;
            ensure!(
                end <= bytes.len(),
                "{}: section {} extends past the end of the file",
                origin,
                name
            );
            bytes[start..end].to_vec()
        };

        obj.sections.push(Section {
            name,
            index,
            sh: SectionHeaderInfo {
                sh_type: sh.sh_type,
                sh_flags: sh.sh_flags,
                sh_size: sh.sh_size,
                sh_entsize: sh.sh_entsize,
                sh_link: sh.sh_link,
                sh_info: sh.sh_info,
                sh_addralign: sh.sh_addralign,
            },
            kind,
            data,
            relas: Vec::new(),
            base: None,
            rela: None,
            secsym: None,
            bundled_sym: None,
            include: false,
            ignore: false,
            grouped: false,
            status: Status::New,
            twin: None,
        });
    }

    // Tie every rela section to the section named by its sh_info.
    for id in obj.sec_ids().collect::<Vec<_>>() {
        if obj.sec(id).kind != SectionKind::Rela {
            continue;
        }
        let info = obj.sec(id).sh.sh_info as usize;
        let base = obj
            .find_section_by_index(info)
            .with_context(|| format!("{}: rela section {} has no base", origin, obj.sec(id).name))?;
        obj.sec_mut(id).base = Some(base);
        obj.sec_mut(base).rela = Some(id);
    }

    load_symbols(&mut obj, &elf, origin)?;
    load_relas(&mut obj, &elf, bytes, origin)?;
    check_rela_links(&obj)?;

    debug!(
        "{}: {} sections, {} symbols",
        origin,
        obj.sections.len(),
        obj.symbols.len()
    );
    Ok(obj)
}

fn load_symbols(obj: &mut ObjectElf, elf: &Elf<'_>, origin: &str) -> Result<()> {
    for (index, sym) in elf.syms.iter().enumerate() {
        let place = match sym.st_shndx {
            SHN_UNDEF_IDX => SymbolPlace::Undef,
            SHN_ABS_IDX => SymbolPlace::Abs,
            SHN_COMMON_IDX => {
                let name = elf.strtab.get_at(sym.st_name).unwrap_or_default();
                bail!("{}: COMMON symbol {} is not supported", origin, name);
            }
            idx if idx >= SHN_LORESERVE => {
                bail!("{}: symbol {} uses reserved section index {:#x}", origin, index, idx)
            }
            idx => SymbolPlace::Section(
                obj.find_section_by_index(idx)
                    .with_context(|| format!("{}: symbol {} names a bad section", origin, index))?,
            ),
        };

        let mut name = elf
            .strtab
            .get_at(sym.st_name)
            .unwrap_or_default()
            .to_string();
        // Section symbols have no strtab name of their own; they go by the
        // name of the section they stand for.
        if sym.st_type() == STT_SECTION {
            if let SymbolPlace::Section(sec) = place {
                name = obj.sec(sec).name.clone();
            }
        }

        let id = SymId(obj.symbols.len());
        obj.symbols.push(Symbol {
            name,
            index,
            bind: sym.st_bind(),
            ty: sym.st_type(),
            st_other: sym.st_other,
            st_value: sym.st_value,
            st_size: sym.st_size,
            place,
            include: false,
            strip: StripPolicy::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            file_twin: None,
        });

        if sym.st_type() == STT_SECTION {
            if let SymbolPlace::Section(sec) = place {
                obj.sec_mut(sec).secsym = Some(id);
            }
        }
    }
    Ok(())
}

fn load_relas(obj: &mut ObjectElf, elf: &Elf<'_>, bytes: &[u8], origin: &str) -> Result<()> {
    let container = Container::Big;
    let endian = match obj.endian {
        Endian::Little => goblin::container::Endian::Little,
        Endian::Big => goblin::container::Endian::Big,
    };
    let ctx = Ctx::new(container, endian);

    for id in obj.sec_ids().collect::<Vec<_>>() {
        if obj.sec(id).kind != SectionKind::Rela {
            continue;
        }
        let (offset, size) = {
            let sh = &elf.section_headers[obj.sec(id).index];
            (sh.sh_offset as usize, sh.sh_size as usize)
        };
        let relocs = goblin::elf::reloc::RelocSection::parse(bytes, offset, size, true, ctx)
            .with_context(|| {
                format!("{}: bad relocations in {}", origin, obj.sec(id).name)
            })?;

        let mut relas = Vec::new();
        for reloc in relocs.iter() {
            ensure!(
                reloc.r_sym < obj.symbols.len(),
                "{}: {}+{:#x}: relocation names symbol {} beyond the symbol table",
                origin,
                obj.sec(id).name,
                reloc.r_offset,
                reloc.r_sym
            );
            relas.push(Rela {
                offset: reloc.r_offset,
                rtype: reloc.r_type,
                addend: reloc.r_addend.unwrap_or(0),
                sym: SymId(reloc.r_sym),
            });
        }
        obj.sec_mut(id).relas = relas;
    }
    Ok(())
}

/// Only relocatable objects are legal input; anything carrying program
/// headers has been linked already.
pub fn check_program_headers(obj: &ObjectElf, origin: &str) -> Result<()> {
    ensure!(
        obj.header.e_phnum == 0,
        "{}: ELF contains program headers",
        origin
    );
    Ok(())
}

/// The source and patched objects must come out of the same compiler
/// invocation shape; any drift in the identity fields makes the diff
/// meaningless.
pub fn compare_elf_headers(source: &ObjectElf, patched: &ObjectElf) -> Result<()> {
    let a = &source.header;
    let b = &patched.header;
    if a.ident != b.ident
        || a.e_type != b.e_type
        || a.e_machine != b.e_machine
        || a.e_version != b.e_version
        || a.e_entry != b.e_entry
        || a.e_phoff != b.e_phoff
        || a.e_flags != b.e_flags
        || a.e_ehsize != b.e_ehsize
        || a.e_phentsize != b.e_phentsize
        || a.e_shentsize != b.e_shentsize
    {
        bail!("source and patched ELF headers differ");
    }
    Ok(())
}

/// Group sections list their members as section indices in the payload;
/// mark every member so patchability verification can refuse changes to
/// grouped content.
pub fn mark_grouped_sections(obj: &mut ObjectElf) -> Result<()> {
    use scroll::Pread;

    let group_ids: Vec<SecId> = obj
        .sec_ids()
        .filter(|&id| obj.sec(id).kind == SectionKind::Group)
        .collect();
    for id in group_ids {
        let data = obj.sec(id).data.clone();
        let endian = obj.endian;
        // The first word is the flag word (e.g. GRP_COMDAT).
        let mut off = 4;
        while off + 4 <= data.len() {
            let member: u32 = data.pread_with(off, endian)?;
            off += 4;
            let sec = obj
                .find_section_by_index(member as usize)
                .with_context(|| format!("group section member {} not found", member))?;
            obj.sec_mut(sec).grouped = true;
            debug!(
                "marking section {} ({}) as grouped",
                obj.sec(sec).name,
                obj.sec(sec).index
            );
        }
    }
    Ok(())
}
