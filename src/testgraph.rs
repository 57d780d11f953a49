// Test-only builder for hand-made object graphs, so phase-level tests can
// exercise the pipeline without going through ELF bytes on disk.

#![allow(dead_code)]

use scroll::Endian;

use crate::arch::Arch;
use crate::model::{
    HeaderInfo, ObjectElf, Rela, SecId, Section, SectionHeaderInfo, SectionKind, StringPool,
    StripPolicy, Status, SymId, Symbol, SymbolPlace, SHT_NOBITS, SHT_PROGBITS, SHT_RELA,
    STB_LOCAL, STT_FILE, STT_FUNC, STT_OBJECT, STT_SECTION,
};

pub struct GraphBuilder {
    elf: ObjectElf,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        ident[4] = 2; // ELFCLASS64
        ident[5] = 1; // ELFDATA2LSB
        ident[6] = 1;
        let mut elf = ObjectElf {
            header: HeaderInfo {
                ident,
                e_type: 1, // ET_REL
                e_machine: crate::arch::EM_X86_64,
                e_version: 1,
                e_entry: 0,
                e_phoff: 0,
                e_flags: 0,
                e_ehsize: 64,
                e_phentsize: 0,
                e_shentsize: 64,
                e_phnum: 0,
            },
            endian: Endian::Little,
            arch: Arch::X86_64,
            sections: Vec::new(),
            symbols: Vec::new(),
            strings: StringPool::default(),
        };
        // The null symbol every symbol table starts with.
        elf.symbols.push(Symbol {
            name: String::new(),
            index: 0,
            bind: STB_LOCAL,
            ty: 0,
            st_other: 0,
            st_value: 0,
            st_size: 0,
            place: SymbolPlace::Undef,
            include: false,
            strip: StripPolicy::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            file_twin: None,
        });
        GraphBuilder { elf }
    }

    fn push_section(&mut self, name: &str, sh_type: u32, data: Vec<u8>, flags: u64) -> SecId {
        let id = SecId(self.elf.sections.len());
        let size = data.len() as u64;
        self.elf.sections.push(Section {
            name: name.to_string(),
            index: id.0 + 1,
            sh: SectionHeaderInfo {
                sh_type,
                sh_flags: flags,
                sh_size: size,
                sh_entsize: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
            },
            kind: SectionKind::from_sh_type(sh_type),
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
        id
    }

    fn push_symbol(&mut self, sym: Symbol) -> SymId {
        let id = SymId(self.elf.symbols.len());
        self.elf.symbols.push(sym);
        id
    }

    fn section_symbol(&mut self, sec: SecId) -> SymId {
        let name = self.elf.sec(sec).name.clone();
        let id = self.push_symbol(Symbol {
            name,
            index: self.elf.symbols.len(),
            bind: STB_LOCAL,
            ty: STT_SECTION,
            st_other: 0,
            st_value: 0,
            st_size: 0,
            place: SymbolPlace::Section(sec),
            include: false,
            strip: StripPolicy::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            file_twin: None,
        });
        self.elf.sec_mut(sec).secsym = Some(id);
        id
    }

    /// The section symbol created alongside a section.
    pub fn secsym_of(&self, sec: SecId) -> SymId {
        self.elf.sec(sec).secsym.unwrap()
    }

    /// A progbits section together with its section symbol.
    pub fn progbits(&mut self, name: &str, data: &[u8]) -> SecId {
        let id = self.push_section(name, SHT_PROGBITS, data.to_vec(), 0);
        self.section_symbol(id);
        id
    }

    pub fn nobits(&mut self, name: &str, size: u64) -> SecId {
        let id = self.push_section(name, SHT_NOBITS, Vec::new(), 0);
        self.elf.sec_mut(id).sh.sh_size = size;
        self.section_symbol(id);
        id
    }

    /// A rela section applying to `base`.
    pub fn rela_sec(&mut self, base: SecId) -> SecId {
        let name = format!(".rela{}", self.elf.sec(base).name);
        let id = self.push_section(&name, SHT_RELA, Vec::new(), 0);
        self.elf.sec_mut(id).base = Some(base);
        self.elf.sec_mut(base).rela = Some(id);
        id
    }

    pub fn rela(&mut self, relasec: SecId, offset: u64, rtype: u32, addend: i64, sym: SymId) {
        self.elf.sec_mut(relasec).relas.push(Rela {
            offset,
            rtype,
            addend,
            sym,
        });
    }

    fn defined(&mut self, name: &str, ty: u8, sec: SecId, value: u64, size: u64, bind: u8) -> SymId {
        self.push_symbol(Symbol {
            name: name.to_string(),
            index: self.elf.symbols.len(),
            bind,
            ty,
            st_other: 0,
            st_value: value,
            st_size: size,
            place: SymbolPlace::Section(sec),
            include: false,
            strip: StripPolicy::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            file_twin: None,
        })
    }

    pub fn func(&mut self, name: &str, sec: SecId, value: u64, size: u64, bind: u8) -> SymId {
        self.defined(name, STT_FUNC, sec, value, size, bind)
    }

    pub fn object(&mut self, name: &str, sec: SecId, value: u64, size: u64, bind: u8) -> SymId {
        self.defined(name, STT_OBJECT, sec, value, size, bind)
    }

    pub fn file_sym(&mut self, name: &str) -> SymId {
        self.push_symbol(Symbol {
            name: name.to_string(),
            index: self.elf.symbols.len(),
            bind: STB_LOCAL,
            ty: STT_FILE,
            st_other: 0,
            st_value: 0,
            st_size: 0,
            place: SymbolPlace::Abs,
            include: false,
            strip: StripPolicy::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            file_twin: None,
        })
    }

    pub fn undef(&mut self, name: &str, ty: u8, bind: u8) -> SymId {
        self.push_symbol(Symbol {
            name: name.to_string(),
            index: self.elf.symbols.len(),
            bind,
            ty,
            st_other: 0,
            st_value: 0,
            st_size: 0,
            place: SymbolPlace::Undef,
            include: false,
            strip: StripPolicy::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            file_twin: None,
        })
    }

    pub fn build(self) -> ObjectElf {
        self.elf
    }
}
