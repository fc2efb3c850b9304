//! Relocatable object buffers.
//!
//! This module decodes the object-file format handed over by the
//! compiled-object producer: ELF64 relocatable objects matched to the host
//! architecture, carrying sections, a RELA relocation table, and a symbol
//! table with linkage flags.
//!
//! The decoder is *checked*: every offset and length embedded in the buffer
//! is validated against the buffer bounds before it is trusted. A malformed
//! buffer fails with [`RuntimeError::Format`] and is never retried.
//!
//! # Layout captured per object
//!
//! ```text
//! ObjectBuffer
//!  ├─ sections[]     name, placement (code/rodata/rwdata/bss), size, align,
//!  │                 COMDAT membership, file offset of the section header
//!  ├─ symbols[]      name, binding (local/global/weak), visibility, kind,
//!  │                 defining section, value, size
//!  └─ relocations[]  target section + offset, kind, symbol, addend
//! ```

use crate::error::{RuntimeError, RuntimeResult};

// =============================================================================
// ELF constants (subset used by relocatable objects)
// =============================================================================

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_REL: u16 = 1;

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = 62; // EM_X86_64

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;
const SHT_GROUP: u32 = 17;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

const GRP_COMDAT: u32 = 1;

const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;
const SHN_COMMON: u16 = 0xfff2;
const SHN_LORESERVE: u16 = 0xff00;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;
const STT_FILE: u8 = 4;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

/// Byte offset of `sh_addr` inside a section header. The debug registrar
/// patches load addresses into a copy of the buffer at this offset.
pub const SHDR_ADDR_OFFSET: usize = 16;

// =============================================================================
// Decoded metadata
// =============================================================================

/// Where a section's bytes land in the loaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionPlacement {
    /// Executable code (`.text` and friends)
    Code,
    /// Allocated, read-only after finalization (`.rodata`, `.eh_frame`)
    ReadOnly,
    /// Allocated, writable (`.data`)
    ReadWrite,
    /// Allocated, zero-initialized (`.bss`)
    Uninitialized,
    /// Not loaded (debug info, symbol tables, metadata)
    None,
}

/// One section of a relocatable object
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// Index in the object's section header table
    pub index: usize,
    pub name: String,
    pub placement: SectionPlacement,
    /// File offset of the section contents (zero for `.bss`)
    pub offset: usize,
    pub size: usize,
    pub align: usize,
    /// Member of a COMDAT group: duplicate-eliminated across units
    pub comdat: bool,
    /// File offset of this section's header, for debug-copy address patching
    pub header_offset: usize,
}

/// Symbol binding, from the symbol table's linkage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
}

/// ELF symbol visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolVisibility {
    Default,
    Hidden,
    Protected,
}

/// Symbol kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    None,
    Object,
    Function,
    Section,
}

/// Where a symbol is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSection {
    Undefined,
    Absolute,
    Common,
    Section(usize),
}

/// One entry of the object's symbol table
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub binding: SymbolBinding,
    pub visibility: SymbolVisibility,
    pub kind: SymbolKind,
    pub section: SymbolSection,
    /// Offset within the defining section (alignment for common symbols)
    pub value: u64,
    pub size: u64,
    /// Defined inside a COMDAT group section
    pub in_comdat: bool,
}

impl SymbolInfo {
    /// Candidate for export: defined with non-local binding
    pub fn is_candidate_export(&self) -> bool {
        !matches!(self.binding, SymbolBinding::Local)
            && !matches!(self.section, SymbolSection::Undefined)
            && !matches!(self.kind, SymbolKind::Section)
    }
}

/// Supported x86-64 relocation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// R_X86_64_64: S + A, 8 bytes
    Abs64,
    /// R_X86_64_PC32: S + A - P, 4 bytes signed
    Pc32,
    /// R_X86_64_PLT32: resolved as PC32 (no PLT; L = S)
    Plt32,
    /// R_X86_64_32: S + A, 4 bytes zero-extended
    Abs32,
    /// R_X86_64_32S: S + A, 4 bytes sign-extended
    Abs32Signed,
}

impl RelocKind {
    fn from_elf(code: u32) -> Option<Self> {
        match code {
            1 => Some(RelocKind::Abs64),
            2 => Some(RelocKind::Pc32),
            4 => Some(RelocKind::Plt32),
            10 => Some(RelocKind::Abs32),
            11 => Some(RelocKind::Abs32Signed),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelocKind::Abs64 => "R_X86_64_64",
            RelocKind::Pc32 => "R_X86_64_PC32",
            RelocKind::Plt32 => "R_X86_64_PLT32",
            RelocKind::Abs32 => "R_X86_64_32",
            RelocKind::Abs32Signed => "R_X86_64_32S",
        }
    }
}

/// One relocation against a loaded section
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Section header index of the section being patched
    pub section: usize,
    /// Offset of the patched field within that section
    pub offset: u64,
    pub kind: RelocKind,
    /// Index into [`ObjectBuffer::symbols`]
    pub symbol: usize,
    pub addend: i64,
}

// =============================================================================
// Checked reader
// =============================================================================

/// Bounds-checked little-endian accessor over the raw buffer.
///
/// Offsets come from untrusted embedded fields, so every access validates
/// the range before reading.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn bytes(&self, offset: usize, len: usize) -> RuntimeResult<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| RuntimeError::Format("offset overflow".to_string()))?;
        if end > self.buf.len() {
            return Err(RuntimeError::Format(format!(
                "range {:#x}..{:#x} exceeds buffer of {:#x} bytes",
                offset,
                end,
                self.buf.len()
            )));
        }
        Ok(&self.buf[offset..end])
    }

    fn u16(&self, offset: usize) -> RuntimeResult<u16> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> RuntimeResult<u32> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, offset: usize) -> RuntimeResult<u64> {
        let b = self.bytes(offset, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&self, offset: usize) -> RuntimeResult<i64> {
        Ok(self.u64(offset)? as i64)
    }

    /// NUL-terminated string out of a string table slice
    fn strtab_str(&self, table: (usize, usize), index: usize) -> RuntimeResult<String> {
        let (tab_off, tab_len) = table;
        if index >= tab_len {
            return Err(RuntimeError::Format(format!(
                "string index {:#x} exceeds table of {:#x} bytes",
                index, tab_len
            )));
        }
        let bytes = self.bytes(tab_off + index, tab_len - index)?;
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RuntimeError::Format("unterminated string table entry".to_string()))?;
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| RuntimeError::Format("non-UTF-8 symbol name".to_string()))
    }
}

// =============================================================================
// ObjectBuffer
// =============================================================================

/// An immutable, decoded relocatable object.
///
/// Produced once by the compiled-object producer and consumed once by the
/// linking layer. The raw bytes are retained so the debug registrar can hand
/// the debugger a copy with section load addresses patched in.
#[derive(Debug)]
pub struct ObjectBuffer {
    data: Vec<u8>,
    sections: Vec<SectionInfo>,
    symbols: Vec<SymbolInfo>,
    relocations: Vec<Relocation>,
}

impl ObjectBuffer {
    /// Decode an ELF64 relocatable object, validating every embedded
    /// offset and length against the buffer bounds.
    pub fn parse(data: Vec<u8>) -> RuntimeResult<Self> {
        let r = Reader::new(&data);

        let ident = r.bytes(0, 16)?;
        if ident[..4] != ELF_MAGIC {
            return Err(RuntimeError::Format("bad ELF magic".to_string()));
        }
        if ident[4] != ELFCLASS64 || ident[5] != ELFDATA2LSB {
            return Err(RuntimeError::Format(
                "expected little-endian ELF64".to_string(),
            ));
        }
        if r.u16(16)? != ET_REL {
            return Err(RuntimeError::Format(
                "expected relocatable object (ET_REL)".to_string(),
            ));
        }
        let machine = r.u16(18)?;
        if machine != HOST_MACHINE {
            return Err(RuntimeError::Format(format!(
                "object built for machine {}, host expects {}",
                machine, HOST_MACHINE
            )));
        }

        let shoff = r.u64(40)? as usize;
        let shentsize = r.u16(58)? as usize;
        let shnum = r.u16(60)? as usize;
        let shstrndx = r.u16(62)? as usize;
        if shentsize != SHDR_SIZE {
            return Err(RuntimeError::Format(format!(
                "unexpected section header size {}",
                shentsize
            )));
        }
        if shnum == 0 || shoff < EHDR_SIZE {
            return Err(RuntimeError::Format("missing section headers".to_string()));
        }
        // Validate the whole header table up front.
        r.bytes(shoff, shnum * SHDR_SIZE)?;

        let shdr = |idx: usize| -> usize { shoff + idx * SHDR_SIZE };

        // Section-name string table.
        if shstrndx >= shnum {
            return Err(RuntimeError::Format(
                "section string table index out of range".to_string(),
            ));
        }
        let shstr_off = r.u64(shdr(shstrndx) + 24)? as usize;
        let shstr_len = r.u64(shdr(shstrndx) + 32)? as usize;
        r.bytes(shstr_off, shstr_len)?;
        let shstrtab = (shstr_off, shstr_len);

        // First pass: section metadata.
        let mut sections = Vec::with_capacity(shnum);
        let mut symtab: Option<(usize, usize, usize)> = None; // (offset, count, strtab section)
        for idx in 0..shnum {
            let base = shdr(idx);
            let name_idx = r.u32(base)? as usize;
            let sh_type = r.u32(base + 4)?;
            let flags = r.u64(base + 8)?;
            let offset = r.u64(base + 24)? as usize;
            let size = r.u64(base + 32)? as usize;
            let link = r.u32(base + 40)? as usize;
            let align = r.u64(base + 48)? as usize;

            // Contents of loaded PROGBITS sections must be in bounds.
            if sh_type == SHT_PROGBITS && flags & SHF_ALLOC != 0 {
                r.bytes(offset, size)?;
            }

            let placement = match sh_type {
                SHT_PROGBITS if flags & SHF_ALLOC != 0 => {
                    if flags & SHF_EXECINSTR != 0 {
                        SectionPlacement::Code
                    } else if flags & SHF_WRITE != 0 {
                        SectionPlacement::ReadWrite
                    } else {
                        SectionPlacement::ReadOnly
                    }
                }
                SHT_NOBITS if flags & SHF_ALLOC != 0 => SectionPlacement::Uninitialized,
                _ => SectionPlacement::None,
            };

            if sh_type == SHT_SYMTAB {
                if size % SYM_SIZE != 0 {
                    return Err(RuntimeError::Format(
                        "symbol table size not a multiple of entry size".to_string(),
                    ));
                }
                r.bytes(offset, size)?;
                symtab = Some((offset, size / SYM_SIZE, link));
            }

            sections.push(SectionInfo {
                index: idx,
                name: r.strtab_str(shstrtab, name_idx)?,
                placement,
                offset,
                size,
                align: align.max(1),
                comdat: false,
                header_offset: base,
            });
        }

        // COMDAT groups: mark member sections so their symbols get weak
        // duplicate-elimination semantics at link time.
        for idx in 0..shnum {
            let base = shdr(idx);
            if r.u32(base + 4)? != SHT_GROUP {
                continue;
            }
            let offset = r.u64(base + 24)? as usize;
            let size = r.u64(base + 32)? as usize;
            if size < 4 || size % 4 != 0 {
                return Err(RuntimeError::Format("malformed group section".to_string()));
            }
            if r.u32(offset)? & GRP_COMDAT == 0 {
                continue;
            }
            for word in 1..size / 4 {
                let member = r.u32(offset + word * 4)? as usize;
                if member >= shnum {
                    return Err(RuntimeError::Format(
                        "group member section out of range".to_string(),
                    ));
                }
                sections[member].comdat = true;
            }
        }

        // Symbol table.
        let (sym_off, sym_count, strtab_idx) = symtab
            .ok_or_else(|| RuntimeError::Format("object carries no symbol table".to_string()))?;
        if strtab_idx >= shnum {
            return Err(RuntimeError::Format(
                "symbol string table index out of range".to_string(),
            ));
        }
        let str_base = shdr(strtab_idx);
        if r.u32(str_base + 4)? != SHT_STRTAB {
            return Err(RuntimeError::Format(
                "symtab links to a non-strtab section".to_string(),
            ));
        }
        let strtab = (
            r.u64(str_base + 24)? as usize,
            r.u64(str_base + 32)? as usize,
        );
        r.bytes(strtab.0, strtab.1)?;

        let mut symbols = Vec::with_capacity(sym_count);
        for i in 0..sym_count {
            let base = sym_off + i * SYM_SIZE;
            let name_idx = r.u32(base)? as usize;
            let info = r.bytes(base + 4, 1)?[0];
            let other = r.bytes(base + 5, 1)?[0];
            let shndx = r.u16(base + 6)?;
            let value = r.u64(base + 8)?;
            let size = r.u64(base + 16)?;

            let binding = match info >> 4 {
                STB_LOCAL => SymbolBinding::Local,
                STB_GLOBAL => SymbolBinding::Global,
                STB_WEAK => SymbolBinding::Weak,
                other => {
                    return Err(RuntimeError::Format(format!(
                        "unsupported symbol binding {}",
                        other
                    )))
                }
            };
            let kind = match info & 0xf {
                STT_OBJECT => SymbolKind::Object,
                STT_FUNC => SymbolKind::Function,
                STT_SECTION => SymbolKind::Section,
                STT_FILE => {
                    // File symbols carry no linkage information.
                    symbols.push(SymbolInfo {
                        name: String::new(),
                        binding: SymbolBinding::Local,
                        visibility: SymbolVisibility::Default,
                        kind: SymbolKind::None,
                        section: SymbolSection::Absolute,
                        value: 0,
                        size: 0,
                        in_comdat: false,
                    });
                    continue;
                }
                _ => SymbolKind::None,
            };
            let visibility = match other & 0x3 {
                2 => SymbolVisibility::Hidden,
                3 => SymbolVisibility::Protected,
                _ => SymbolVisibility::Default,
            };
            let section = match shndx {
                SHN_UNDEF => SymbolSection::Undefined,
                SHN_ABS => SymbolSection::Absolute,
                SHN_COMMON => SymbolSection::Common,
                idx if idx < SHN_LORESERVE => {
                    let idx = idx as usize;
                    if idx >= shnum {
                        return Err(RuntimeError::Format(format!(
                            "symbol section index {} out of range",
                            idx
                        )));
                    }
                    SymbolSection::Section(idx)
                }
                other => {
                    return Err(RuntimeError::Format(format!(
                        "reserved symbol section index {:#x}",
                        other
                    )))
                }
            };
            let in_comdat = match section {
                SymbolSection::Section(idx) => sections[idx].comdat,
                _ => false,
            };

            symbols.push(SymbolInfo {
                name: r.strtab_str(strtab, name_idx)?,
                binding,
                visibility,
                kind,
                section,
                value,
                size,
                in_comdat,
            });
        }

        // Relocations: RELA sections targeting loaded sections.
        let mut relocations = Vec::new();
        for idx in 0..shnum {
            let base = shdr(idx);
            if r.u32(base + 4)? != SHT_RELA {
                continue;
            }
            let target = r.u32(base + 44)? as usize; // sh_info
            if target >= shnum {
                return Err(RuntimeError::Format(
                    "relocation target section out of range".to_string(),
                ));
            }
            if sections[target].placement == SectionPlacement::None {
                continue;
            }
            let offset = r.u64(base + 24)? as usize;
            let size = r.u64(base + 32)? as usize;
            if size % RELA_SIZE != 0 {
                return Err(RuntimeError::Format(
                    "relocation table size not a multiple of entry size".to_string(),
                ));
            }
            for i in 0..size / RELA_SIZE {
                let rbase = offset + i * RELA_SIZE;
                let r_offset = r.u64(rbase)?;
                let r_info = r.u64(rbase + 8)?;
                let addend = r.i64(rbase + 16)?;
                let sym = (r_info >> 32) as usize;
                let code = (r_info & 0xffff_ffff) as u32;
                if sym >= symbols.len() {
                    return Err(RuntimeError::Format(format!(
                        "relocation references symbol {} of {}",
                        sym,
                        symbols.len()
                    )));
                }
                let kind = RelocKind::from_elf(code).ok_or_else(|| {
                    RuntimeError::Format(format!("unsupported relocation type {}", code))
                })?;
                let width: u64 = match kind {
                    RelocKind::Abs64 => 8,
                    _ => 4,
                };
                if r_offset
                    .checked_add(width)
                    .map_or(true, |end| end > sections[target].size as u64)
                {
                    return Err(RuntimeError::Format(format!(
                        "relocation at {:#x} exceeds section {}",
                        r_offset, sections[target].name
                    )));
                }
                relocations.push(Relocation {
                    section: target,
                    offset: r_offset,
                    kind,
                    symbol: sym,
                    addend,
                });
            }
        }

        Ok(ObjectBuffer {
            data,
            sections,
            symbols,
            relocations,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    pub fn symbols(&self) -> &[SymbolInfo] {
        &self.symbols
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Sections that occupy space in the loaded image
    pub fn loaded_sections(&self) -> impl Iterator<Item = &SectionInfo> {
        self.sections
            .iter()
            .filter(|s| s.placement != SectionPlacement::None)
    }

    /// The unwind-metadata section, if the producer emitted one
    pub fn eh_frame_section(&self) -> Option<&SectionInfo> {
        self.sections
            .iter()
            .find(|s| s.name == ".eh_frame" && s.placement != SectionPlacement::None)
    }

    /// Names of symbols the object leaves undefined
    pub fn undefined_symbols(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.symbols
            .iter()
            .filter(|s| s.section == SymbolSection::Undefined && !s.name.is_empty())
    }

    /// Log the section and symbol layout at debug level.
    pub fn log_contents(&self) {
        tracing::debug!(bytes = self.data.len(), "object buffer");
        for sec in self.loaded_sections() {
            tracing::debug!(
                section = %sec.name,
                size = sec.size,
                align = sec.align,
                placement = ?sec.placement,
                comdat = sec.comdat,
                "  section"
            );
        }
        for sym in &self.symbols {
            if sym.name.is_empty() {
                continue;
            }
            tracing::debug!(
                symbol = %sym.name,
                binding = ?sym.binding,
                kind = ?sym.kind,
                section = ?sym.section,
                value = sym.value,
                "  symbol"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
