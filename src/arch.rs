// Per-architecture relocation knowledge. The rest of the pipeline never
// matches on relocation type codes directly; it asks the capability object
// selected when the input graphs are constructed.

use anyhow::{bail, Result};

use crate::model::{Rela, Symbol, STB_LOCAL, STT_NOTYPE};

pub const EM_PPC64: u16 = 21;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

// x86_64 relocation types.
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_GOTPCREL: u32 = 9;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;
pub const R_X86_64_TLSGD: u32 = 19;
pub const R_X86_64_TLSLD: u32 = 20;
pub const R_X86_64_DTPOFF32: u32 = 21;
pub const R_X86_64_GOTTPOFF: u32 = 22;
pub const R_X86_64_TPOFF32: u32 = 23;
pub const R_X86_64_PC64: u32 = 24;
pub const R_X86_64_GOTOFF64: u32 = 25;
pub const R_X86_64_GOTPC32: u32 = 26;
pub const R_X86_64_GOTPCRELX: u32 = 41;
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

// aarch64 relocation types.
pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_ABS32: u32 = 258;
pub const R_AARCH64_PREL64: u32 = 260;
pub const R_AARCH64_PREL32: u32 = 261;
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
pub const R_AARCH64_LDST8_ABS_LO12_NC: u32 = 278;
pub const R_AARCH64_CONDBR19: u32 = 280;
pub const R_AARCH64_JUMP26: u32 = 282;
pub const R_AARCH64_CALL26: u32 = 283;
pub const R_AARCH64_LDST16_ABS_LO12_NC: u32 = 284;
pub const R_AARCH64_LDST32_ABS_LO12_NC: u32 = 285;
pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;
pub const R_AARCH64_LDST128_ABS_LO12_NC: u32 = 299;
pub const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
pub const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;

// ppc64 relocation types.
pub const R_PPC64_REL24: u32 = 10;
pub const R_PPC64_ADDR64: u32 = 38;
pub const R_PPC64_REL64: u32 = 44;
pub const R_PPC64_TOC16_HA: u32 = 50;
pub const R_PPC64_TOC: u32 = 51;
pub const R_PPC64_TOC16_DS: u32 = 63;
pub const R_PPC64_TOC16_LO_DS: u32 = 64;

/// Mask of the ppc64 ELFv2 local-entry bits in `st_other`.
const STO_PPC64_LOCAL_MASK: u8 = 0xe0;

/// Target architecture of the objects being diffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Ppc64,
}

impl Arch {
    pub fn from_machine(e_machine: u16) -> Result<Arch> {
        match e_machine {
            EM_X86_64 => Ok(Arch::X86_64),
            EM_AARCH64 => Ok(Arch::Aarch64),
            EM_PPC64 => Ok(Arch::Ppc64),
            other => bail!("unsupported ELF machine {}", other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Ppc64 => "ppc64",
        }
    }

    /// Whether a relocation's stored addend is biased by the distance from
    /// the relocated field to the next instruction.
    pub fn is_pc_relative(&self, rtype: u32) -> bool {
        match self {
            Arch::X86_64 => matches!(
                rtype,
                R_X86_64_PC32
                    | R_X86_64_PLT32
                    | R_X86_64_GOTPCREL
                    | R_X86_64_GOTPC32
                    | R_X86_64_GOTPCRELX
                    | R_X86_64_REX_GOTPCRELX
                    | R_X86_64_TLSGD
                    | R_X86_64_TLSLD
                    | R_X86_64_GOTTPOFF
                    | R_X86_64_PC64
            ),
            // On aarch64 and ppc64 the addend already names the target
            // offset; branch displacements are computed by the linker.
            Arch::Aarch64 | Arch::Ppc64 => false,
        }
    }

    /// The offset inside the referent section that a relocation points at,
    /// used by the section-symbol rewriter to find the covering symbol.
    pub fn rela_target_offset(&self, rela: &Rela) -> i64 {
        if !self.is_pc_relative(rela.rtype) {
            return rela.addend;
        }
        match rela.rtype {
            R_X86_64_PC64 => rela.addend + 8,
            _ => rela.addend + 4,
        }
    }

    /// Number of bytes the relocated field occupies in the section payload.
    /// Used to mask relocation slots out of the byte comparison. Unknown
    /// types report zero so nothing is masked for them.
    pub fn reloc_slot_size(&self, rtype: u32) -> usize {
        match self {
            Arch::X86_64 => match rtype {
                R_X86_64_64 | R_X86_64_PC64 | R_X86_64_GOTOFF64 => 8,
                R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL | R_X86_64_32
                | R_X86_64_32S | R_X86_64_TLSGD | R_X86_64_TLSLD | R_X86_64_DTPOFF32
                | R_X86_64_GOTTPOFF | R_X86_64_TPOFF32 | R_X86_64_GOTPC32
                | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => 4,
                _ => 0,
            },
            Arch::Aarch64 => match rtype {
                R_AARCH64_ABS64 | R_AARCH64_PREL64 => 8,
                R_AARCH64_ABS32
                | R_AARCH64_PREL32
                | R_AARCH64_ADR_PREL_PG_HI21
                | R_AARCH64_ADD_ABS_LO12_NC
                | R_AARCH64_LDST8_ABS_LO12_NC
                | R_AARCH64_CONDBR19
                | R_AARCH64_JUMP26
                | R_AARCH64_CALL26
                | R_AARCH64_LDST16_ABS_LO12_NC
                | R_AARCH64_LDST32_ABS_LO12_NC
                | R_AARCH64_LDST64_ABS_LO12_NC
                | R_AARCH64_LDST128_ABS_LO12_NC
                | R_AARCH64_ADR_GOT_PAGE
                | R_AARCH64_LD64_GOT_LO12_NC => 4,
                _ => 0,
            },
            Arch::Ppc64 => match rtype {
                R_PPC64_ADDR64 | R_PPC64_REL64 | R_PPC64_TOC => 8,
                R_PPC64_REL24 => 4,
                R_PPC64_TOC16_HA | R_PPC64_TOC16_DS | R_PPC64_TOC16_LO_DS => 2,
                _ => 0,
            },
        }
    }

    /// The pointer-sized absolute relocation used for synthesized metadata
    /// records.
    pub fn abs64_reloc_type(&self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_64,
            Arch::Aarch64 => R_AARCH64_ABS64,
            Arch::Ppc64 => R_PPC64_ADDR64,
        }
    }

    /// Absolute data-reference types that participate in the
    /// end-of-data-section miscompile check.
    pub fn is_abs_data_ref(&self, rtype: u32) -> bool {
        match self {
            Arch::X86_64 => matches!(rtype, R_X86_64_32 | R_X86_64_32S),
            Arch::Aarch64 => rtype == R_AARCH64_ABS64,
            Arch::Ppc64 => false,
        }
    }

    /// aarch64 assemblers emit `$x`/`$d` mapping symbols that carry no
    /// payload of their own and must not win the containment search.
    pub fn is_mapping_symbol(&self, sym: &Symbol) -> bool {
        *self == Arch::Aarch64
            && sym.name.starts_with('$')
            && sym.ty == STT_NOTYPE
            && sym.bind == STB_LOCAL
            && sym.st_size == 0
    }

    /// ppc64 ELFv2 functions compiled by gcc >= 6 carry a local entry point
    /// 8 bytes into their section; such bundled symbols legitimately sit at
    /// a non-zero offset.
    pub fn is_gcc6_localentry_bundled_sym(&self, sym: &Symbol) -> bool {
        *self == Arch::Ppc64
            && (sym.st_other & STO_PPC64_LOCAL_MASK) != 0
            && sym.st_value == 8
    }
}
