// This module contains the in-memory representation of a relocatable ELF
// object as used by the differencing pipeline. Sections, symbols and
// relocations live in flat arenas and refer to each other through integer
// ids, so the graph can be mutated and migrated without chasing pointer
// cycles.

use anyhow::{bail, Result};
use scroll::Endian;

use crate::arch::Arch;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;
pub const SHT_GROUP: u32 = 17;

pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;

/// Marker bit set in `st_other` of a placeholder function so the runtime
/// loader knows the body has to be resolved from the running binary.
pub const SYM_OTHER_PLACEHOLDER: u8 = 0x40;

/// Index of a section in its owning [`ObjectElf`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecId(pub usize);

/// Index of a symbol in its owning [`ObjectElf`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(pub usize);

/// Classification of an entity relative to its twin in the other object.
/// Everything starts out `New` and is downgraded by the comparison pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Same,
    Changed,
    New,
}

/// Structural kind of a section, derived from `sh_type` at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Progbits,
    Nobits,
    Rela,
    Symtab,
    Strtab,
    Group,
    Note,
    Other,
}

impl SectionKind {
    pub fn from_sh_type(sh_type: u32) -> SectionKind {
        match sh_type {
            SHT_PROGBITS => SectionKind::Progbits,
            SHT_NOBITS => SectionKind::Nobits,
            SHT_RELA => SectionKind::Rela,
            SHT_SYMTAB => SectionKind::Symtab,
            SHT_STRTAB => SectionKind::Strtab,
            SHT_GROUP => SectionKind::Group,
            7 => SectionKind::Note,
            _ => SectionKind::Other,
        }
    }
}

/// What to do with a symbol when the output symbol table is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripPolicy {
    Default,
    Keep,
    Strip,
}

/// Where a symbol is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolPlace {
    /// `SHN_UNDEF`: the symbol has to be resolved externally.
    Undef,
    /// `SHN_ABS`: absolute value, used by `STT_FILE` symbols.
    Abs,
    /// Defined in a section of this object.
    Section(SecId),
}

/// Retained section-header fields. `sh_name` and `sh_offset` are assigned
/// when the output image is laid out and are not carried here.
#[derive(Debug, Clone, Default)]
pub struct SectionHeaderInfo {
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_size: u64,
    pub sh_entsize: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
}

/// One relocation entry of a rela section. The referent is a symbol id in
/// the owning object's arena.
#[derive(Debug, Clone)]
pub struct Rela {
    pub offset: u64,
    pub rtype: u32,
    pub addend: i64,
    pub sym: SymId,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    /// Index in the ELF the section was loaded from; reassigned for output.
    pub index: usize,
    pub sh: SectionHeaderInfo,
    pub kind: SectionKind,
    pub data: Vec<u8>,
    /// Relocation entries, only populated for `SectionKind::Rela`.
    pub relas: Vec<Rela>,
    /// For a rela section, the section it applies to.
    pub base: Option<SecId>,
    /// For a base section, its companion rela section.
    pub rela: Option<SecId>,
    /// The `STT_SECTION` symbol of this section.
    pub secsym: Option<SymId>,
    /// The bundled function/object symbol owning this section, if any.
    pub bundled_sym: Option<SymId>,
    pub include: bool,
    pub ignore: bool,
    pub grouped: bool,
    pub status: Status,
    pub twin: Option<SecId>,
}

impl Section {
    pub fn is_rela(&self) -> bool {
        self.kind == SectionKind::Rela
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Index in the symbol table the symbol was loaded from.
    pub index: usize,
    pub bind: u8,
    pub ty: u8,
    pub st_other: u8,
    pub st_value: u64,
    pub st_size: u64,
    pub place: SymbolPlace,
    pub include: bool,
    pub strip: StripPolicy,
    pub status: Status,
    pub twin: Option<SymId>,
    /// Parent function for `.cold`/`.part` subfunctions.
    pub parent: Option<SymId>,
    pub children: Vec<SymId>,
    /// Index into the running-ELF symbol sequence of the `STT_FILE` symbol
    /// whose block this local symbol belongs to. Set during correlation and
    /// used to disambiguate static locals at resolution time.
    pub file_twin: Option<usize>,
}

impl Symbol {
    pub fn sec(&self) -> Option<SecId> {
        match self.place {
            SymbolPlace::Section(id) => Some(id),
            _ => None,
        }
    }
}

/// ELF header fields that have to agree between the source and the patched
/// object, and that are replicated into the output image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_shentsize: u16,
    pub e_phnum: u16,
}

/// Deduplicating string pool backing the `.upatch.strings` section. Offsets
/// handed out by [`StringPool::intern`] become relocation addends against
/// the pool's section symbol.
#[derive(Debug, Default)]
pub struct StringPool {
    data: Vec<u8>,
}

impl StringPool {
    pub fn intern(&mut self, s: &str) -> u64 {
        let needle = s.as_bytes();
        let mut off = 0;
        while off + needle.len() < self.data.len() {
            let end = off + needle.len();
            if &self.data[off..end] == needle && self.data[end] == 0 {
                return off as u64;
            }
            match self.data[off..].iter().position(|&b| b == 0) {
                Some(nul) => off += nul + 1,
                None => break,
            }
        }
        let off = self.data.len() as u64;
        self.data.extend_from_slice(needle);
        self.data.push(0);
        off
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// An in-memory relocatable object: the parsed form of the source and
/// patched inputs, and the build form of the output.
#[derive(Debug)]
pub struct ObjectElf {
    pub header: HeaderInfo,
    pub endian: Endian,
    pub arch: Arch,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    /// Metadata string pool; only used while assembling the output object.
    pub strings: StringPool,
}

impl ObjectElf {
    pub fn sec(&self, id: SecId) -> &Section {
        &self.sections[id.0]
    }

    pub fn sec_mut(&mut self, id: SecId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn sym(&self, id: SymId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn sym_mut(&mut self, id: SymId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    pub fn sec_ids(&self) -> impl Iterator<Item = SecId> {
        (0..self.sections.len()).map(SecId)
    }

    pub fn sym_ids(&self) -> impl Iterator<Item = SymId> {
        (0..self.symbols.len()).map(SymId)
    }

    pub fn find_section_by_name(&self, name: &str) -> Option<SecId> {
        self.sec_ids().find(|&id| self.sec(id).name == name)
    }

    pub fn find_section_by_index(&self, index: usize) -> Option<SecId> {
        self.sec_ids().find(|&id| self.sec(id).index == index)
    }

    pub fn find_symbol_by_name(&self, name: &str) -> Option<SymId> {
        self.sym_ids()
            .find(|&id| self.sym(id).ty != STT_SECTION && self.sym(id).name == name)
    }

    /// The section name a diagnostic should carry for a relocation owned by
    /// `relasec`: the base section when there is one.
    pub fn diag_section_name(&self, relasec: SecId) -> &str {
        match self.sec(relasec).base {
            Some(base) => &self.sec(base).name,
            None => &self.sec(relasec).name,
        }
    }
}

/// Sections holding compiler-generated exception-handling tables. Their
/// section symbols are treated as bundled.
pub fn is_except_section(name: &str) -> bool {
    name == ".eh_frame"
        || name.starts_with(".gcc_except_table")
        || name.starts_with(".ARM.extab")
}

/// Debug info in the wide sense: DWARF sections plus the frame tables,
/// which follow the same include-then-prune path.
pub fn is_debug_section(name: &str) -> bool {
    name.starts_with(".debug_")
        || name.starts_with(".rela.debug_")
        || name == ".eh_frame"
        || name == ".rela.eh_frame"
}

pub fn is_eh_frame(name: &str) -> bool {
    name == ".eh_frame"
}

pub fn is_string_literal_section(name: &str) -> bool {
    name.starts_with(".rodata") && name.contains(".str")
}

pub fn is_text_section_name(name: &str) -> bool {
    name == ".text" || name.starts_with(".text.")
}

/// Validate the invariant that every rela section points at exactly one
/// base section and vice versa.
pub fn check_rela_links(elf: &ObjectElf) -> Result<()> {
    for id in elf.sec_ids() {
        let sec = elf.sec(id);
        if sec.is_rela() {
            match sec.base {
                Some(base) if elf.sec(base).rela == Some(id) => {}
                _ => bail!("rela section {} has no consistent base section", sec.name),
            }
        } else if let Some(rela) = sec.rela {
            if elf.sec(rela).base != Some(id) {
                bail!("section {} has an inconsistent rela companion", sec.name);
            }
        }
    }
    Ok(())
}
