// Byte-level ELF64 builder for test fixtures. Produces little-endian
// x86_64 relocatable objects (and plain executables for the running-binary
// role) without going through the crate under test.

#![allow(dead_code)]

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_PLT32: u32 = 4;

pub enum Shndx {
    Undef,
    Abs,
    Sec(usize),
}

struct Sec {
    name: String,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
    entsize: u64,
    relas: Vec<(u64, u32, i64, usize)>,
}

struct Sym {
    name: String,
    ty: u8,
    bind: u8,
    shndx: Shndx,
    value: u64,
    size: u64,
}

pub struct ElfBuilder {
    e_type: u16,
    sections: Vec<Sec>,
    symbols: Vec<Sym>,
}

impl ElfBuilder {
    pub fn new(e_type: u16) -> ElfBuilder {
        ElfBuilder {
            e_type,
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// An allocated progbits section. Returns a handle used by symbol and
    /// relocation helpers; the final ELF index is `handle + 1`.
    pub fn section(&mut self, name: &str, data: &[u8]) -> usize {
        self.sections.push(Sec {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            flags: 0x2,
            data: data.to_vec(),
            entsize: 0,
            relas: Vec::new(),
        });
        self.sections.len() - 1
    }

    pub fn section_sym(&mut self, sec: usize) -> usize {
        self.symbols.push(Sym {
            name: String::new(),
            ty: STT_SECTION,
            bind: STB_LOCAL,
            shndx: Shndx::Sec(sec),
            value: 0,
            size: 0,
        });
        self.symbols.len() - 1
    }

    pub fn file_sym(&mut self, name: &str) -> usize {
        self.symbols.push(Sym {
            name: name.to_string(),
            ty: STT_FILE,
            bind: STB_LOCAL,
            shndx: Shndx::Abs,
            value: 0,
            size: 0,
        });
        self.symbols.len() - 1
    }

    pub fn sym(&mut self, name: &str, sec: usize, value: u64, size: u64, ty: u8, bind: u8) -> usize {
        self.symbols.push(Sym {
            name: name.to_string(),
            ty,
            bind,
            shndx: Shndx::Sec(sec),
            value,
            size,
        });
        self.symbols.len() - 1
    }

    pub fn undef_sym(&mut self, name: &str, bind: u8) -> usize {
        self.symbols.push(Sym {
            name: name.to_string(),
            ty: STT_NOTYPE,
            bind,
            shndx: Shndx::Undef,
            value: 0,
            size: 0,
        });
        self.symbols.len() - 1
    }

    pub fn rela(&mut self, sec: usize, offset: u64, rtype: u32, addend: i64, sym: usize) {
        self.sections[sec].relas.push((offset, rtype, addend, sym));
    }

    pub fn build(&self) -> Vec<u8> {
        // Final section table: null, user sections, one rela section per
        // user section carrying relocations, .symtab, .strtab, .shstrtab.
        let user = self.sections.len();
        let rela_secs: Vec<usize> = (0..user).filter(|&i| !self.sections[i].relas.is_empty()).collect();
        let symtab_index = 1 + user + rela_secs.len();
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let shnum = shstrtab_index + 1;

        // Symbol string table.
        let mut strtab = vec![0u8];
        let mut sym_name_off = Vec::new();
        for sym in &self.symbols {
            if sym.name.is_empty() {
                sym_name_off.push(0u32);
            } else {
                sym_name_off.push(strtab.len() as u32);
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
            }
        }

        // Symbol table; entry 0 is the null symbol.
        let mut symtab = vec![0u8; 24];
        for (i, sym) in self.symbols.iter().enumerate() {
            let mut entry = Vec::with_capacity(24);
            entry.extend_from_slice(&sym_name_off[i].to_le_bytes());
            entry.push((sym.bind << 4) | sym.ty);
            entry.push(0);
            let shndx: u16 = match sym.shndx {
                Shndx::Undef => 0,
                Shndx::Abs => 0xfff1,
                Shndx::Sec(sec) => (sec + 1) as u16,
            };
            entry.extend_from_slice(&shndx.to_le_bytes());
            entry.extend_from_slice(&sym.value.to_le_bytes());
            entry.extend_from_slice(&sym.size.to_le_bytes());
            symtab.extend_from_slice(&entry);
        }
        let first_global = self
            .symbols
            .iter()
            .position(|s| s.bind != STB_LOCAL)
            .map(|p| p + 1)
            .unwrap_or(self.symbols.len() + 1);

        // Section name table and headers, assembled in parallel.
        struct Header {
            name_off: u32,
            sh_type: u32,
            flags: u64,
            data: Vec<u8>,
            link: u32,
            info: u32,
            addralign: u64,
            entsize: u64,
        }
        let mut shstrtab = vec![0u8];
        let mut intern = |name: &str, shstrtab: &mut Vec<u8>| -> u32 {
            let off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            off
        };

        let mut headers: Vec<Header> = Vec::new();
        for sec in &self.sections {
            headers.push(Header {
                name_off: intern(&sec.name, &mut shstrtab),
                sh_type: sec.sh_type,
                flags: sec.flags,
                data: sec.data.clone(),
                link: 0,
                info: 0,
                addralign: 1,
                entsize: sec.entsize,
            });
        }
        for &base in &rela_secs {
            let mut data = Vec::new();
            for &(offset, rtype, addend, sym) in &self.sections[base].relas {
                data.extend_from_slice(&offset.to_le_bytes());
                let info = (((sym + 1) as u64) << 32) | rtype as u64;
                data.extend_from_slice(&info.to_le_bytes());
                data.extend_from_slice(&addend.to_le_bytes());
            }
            headers.push(Header {
                name_off: intern(&format!(".rela{}", self.sections[base].name), &mut shstrtab),
                sh_type: SHT_RELA,
                flags: 0,
                data,
                link: symtab_index as u32,
                info: (base + 1) as u32,
                addralign: 8,
                entsize: 24,
            });
        }
        headers.push(Header {
            name_off: intern(".symtab", &mut shstrtab),
            sh_type: SHT_SYMTAB,
            flags: 0,
            data: symtab,
            link: strtab_index as u32,
            info: first_global as u32,
            addralign: 8,
            entsize: 24,
        });
        headers.push(Header {
            name_off: intern(".strtab", &mut shstrtab),
            sh_type: SHT_STRTAB,
            flags: 0,
            data: strtab,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
        let shstrtab_name_off = intern(".shstrtab", &mut shstrtab);
        headers.push(Header {
            name_off: shstrtab_name_off,
            sh_type: SHT_STRTAB,
            flags: 0,
            data: std::mem::take(&mut shstrtab),
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });

        // Layout: ehdr, payloads, section header table.
        let mut offset = 64usize;
        let mut sh_offsets = Vec::new();
        for header in &headers {
            let align = header.addralign.max(1) as usize;
            offset = (offset + align - 1) / align * align;
            sh_offsets.push(offset);
            offset += header.data.len();
        }
        let shoff = (offset + 7) / 8 * 8;
        let mut buf = vec![0u8; shoff + shnum * 64];

        // ELF header.
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1; // EV_CURRENT
        buf[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        buf[52..54].copy_from_slice(&64u16.to_le_bytes());
        buf[58..60].copy_from_slice(&64u16.to_le_bytes());
        buf[60..62].copy_from_slice(&(shnum as u16).to_le_bytes());
        buf[62..64].copy_from_slice(&(shstrtab_index as u16).to_le_bytes());

        for (i, header) in headers.iter().enumerate() {
            buf[sh_offsets[i]..sh_offsets[i] + header.data.len()].copy_from_slice(&header.data);
            let sh = shoff + (i + 1) * 64;
            buf[sh..sh + 4].copy_from_slice(&header.name_off.to_le_bytes());
            buf[sh + 4..sh + 8].copy_from_slice(&header.sh_type.to_le_bytes());
            buf[sh + 8..sh + 16].copy_from_slice(&header.flags.to_le_bytes());
            buf[sh + 24..sh + 32].copy_from_slice(&(sh_offsets[i] as u64).to_le_bytes());
            buf[sh + 32..sh + 40].copy_from_slice(&(header.data.len() as u64).to_le_bytes());
            buf[sh + 40..sh + 44].copy_from_slice(&header.link.to_le_bytes());
            buf[sh + 44..sh + 48].copy_from_slice(&header.info.to_le_bytes());
            buf[sh + 48..sh + 56].copy_from_slice(&header.addralign.to_le_bytes());
            buf[sh + 56..sh + 64].copy_from_slice(&header.entsize.to_le_bytes());
        }

        buf
    }
}
