//! Test utilities for runtime integration tests.
//!
//! Provides a minimal ELF64 relocatable-object writer and a set of fixed
//! machine-code templates, standing in for the external compiled-object
//! producer: the runtime under test consumes these buffers exactly as it
//! would consume a code generator's output.

#![allow(dead_code)]

// =============================================================================
// ELF64 object writer
// =============================================================================

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;
const SHT_GROUP: u32 = 17;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_GROUP: u64 = 0x200;

const GRP_COMDAT: u32 = 1;

/// Relocation type codes used by the templates
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_PLT32: u32 = 4;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Text,
    Rodata,
    Data,
    Bss,
    EhFrame,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    Local,
    Global,
    Weak,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Func,
    Object,
}

struct Section {
    name: String,
    kind: Kind,
    bytes: Vec<u8>,
    bss_size: usize,
    align: usize,
    comdat: bool,
}

struct Symbol {
    name: String,
    /// Builder section index; None = undefined
    section: Option<usize>,
    value: u64,
    size: u64,
    bind: Bind,
    kind: SymKind,
}

struct Reloc {
    section: usize,
    offset: u64,
    rtype: u32,
    symbol: usize,
    addend: i64,
}

/// Builds ELF64 relocatable objects the way a code generator would emit
/// them: sections, a symbol table with linkage flags, and RELA relocations.
pub struct ObjectWriter {
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    relocs: Vec<Reloc>,
}

impl ObjectWriter {
    pub fn new() -> Self {
        ObjectWriter {
            sections: Vec::new(),
            symbols: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub fn section(&mut self, name: &str, kind: Kind, bytes: Vec<u8>, align: usize) -> usize {
        self.sections.push(Section {
            name: name.to_string(),
            kind,
            bytes,
            bss_size: 0,
            align,
            comdat: false,
        });
        self.sections.len() - 1
    }

    pub fn comdat_section(
        &mut self,
        name: &str,
        kind: Kind,
        bytes: Vec<u8>,
        align: usize,
    ) -> usize {
        let idx = self.section(name, kind, bytes, align);
        self.sections[idx].comdat = true;
        idx
    }

    pub fn bss_section(&mut self, name: &str, size: usize, align: usize) -> usize {
        self.sections.push(Section {
            name: name.to_string(),
            kind: Kind::Bss,
            bytes: Vec::new(),
            bss_size: size,
            align,
            comdat: false,
        });
        self.sections.len() - 1
    }

    pub fn symbol(
        &mut self,
        name: &str,
        section: Option<usize>,
        value: u64,
        size: u64,
        bind: Bind,
        kind: SymKind,
    ) -> usize {
        self.symbols.push(Symbol {
            name: name.to_string(),
            section,
            value,
            size,
            bind,
            kind,
        });
        self.symbols.len() - 1
    }

    pub fn reloc(&mut self, section: usize, offset: u64, rtype: u32, symbol: usize, addend: i64) {
        self.relocs.push(Reloc {
            section,
            offset,
            rtype,
            symbol,
            addend,
        });
    }

    fn sh_name(table: &mut Vec<u8>, name: &str) -> u32 {
        let off = table.len() as u32;
        table.extend_from_slice(name.as_bytes());
        table.push(0);
        off
    }

    #[allow(clippy::too_many_arguments)]
    fn header(
        out: &mut Vec<u8>,
        name: u32,
        stype: u32,
        flags: u64,
        offset: usize,
        size: usize,
        link: u32,
        info: u32,
        align: u64,
        entsize: u64,
    ) {
        out.extend_from_slice(&name.to_le_bytes());
        out.extend_from_slice(&stype.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
        out.extend_from_slice(&(offset as u64).to_le_bytes());
        out.extend_from_slice(&(size as u64).to_le_bytes());
        out.extend_from_slice(&link.to_le_bytes());
        out.extend_from_slice(&info.to_le_bytes());
        out.extend_from_slice(&align.to_le_bytes());
        out.extend_from_slice(&entsize.to_le_bytes());
    }

    pub fn build(&self) -> Vec<u8> {
        // Locals must precede globals in the symbol table; remember where
        // each builder symbol lands (+1 for the leading null symbol).
        let mut order: Vec<usize> = (0..self.symbols.len()).collect();
        order.sort_by_key(|&i| matches!(self.symbols[i].bind, Bind::Global | Bind::Weak) as u8);
        let mut symtab_index = vec![0u32; self.symbols.len()];
        for (pos, &i) in order.iter().enumerate() {
            symtab_index[i] = pos as u32 + 1;
        }
        let first_global = order
            .iter()
            .position(|&i| matches!(self.symbols[i].bind, Bind::Global | Bind::Weak))
            .map(|p| p + 1)
            .unwrap_or(self.symbols.len() + 1);

        // String tables.
        let mut strtab = vec![0u8];
        let mut sym_name_off = Vec::with_capacity(self.symbols.len());
        for sym in &self.symbols {
            sym_name_off.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        let rela_sections: Vec<usize> = {
            let mut targets: Vec<usize> = self.relocs.iter().map(|r| r.section).collect();
            targets.sort_unstable();
            targets.dedup();
            targets
        };
        let group_sections: Vec<usize> = (0..self.sections.len())
            .filter(|&i| self.sections[i].comdat)
            .collect();

        // Header index layout:
        //   0 null, 1..=S user, then rela, then groups, then symtab,
        //   strtab, shstrtab
        let s = self.sections.len();
        let rela_base = 1 + s;
        let group_base = rela_base + rela_sections.len();
        let symtab_idx = group_base + group_sections.len();
        let strtab_idx = symtab_idx + 1;
        let shstrtab_idx = strtab_idx + 1;
        let header_count = shstrtab_idx + 1;

        let mut shstrtab = vec![0u8];
        let user_names: Vec<u32> = self
            .sections
            .iter()
            .map(|sec| Self::sh_name(&mut shstrtab, &sec.name))
            .collect();
        let rela_names: Vec<u32> = rela_sections
            .iter()
            .map(|&t| Self::sh_name(&mut shstrtab, &format!(".rela{}", self.sections[t].name)))
            .collect();
        let group_names: Vec<u32> = group_sections
            .iter()
            .map(|_| Self::sh_name(&mut shstrtab, ".group"))
            .collect();
        let symtab_name = Self::sh_name(&mut shstrtab, ".symtab");
        let strtab_name = Self::sh_name(&mut shstrtab, ".strtab");
        let shstrtab_name = Self::sh_name(&mut shstrtab, ".shstrtab");

        // Content layout after the ELF header.
        let mut out = vec![0u8; 64];
        let align_to = |out: &mut Vec<u8>, align: usize| {
            while out.len() % align != 0 {
                out.push(0);
            }
        };

        let mut user_offsets = Vec::with_capacity(s);
        for sec in &self.sections {
            align_to(&mut out, sec.align.max(1));
            user_offsets.push(out.len());
            if sec.kind != Kind::Bss {
                out.extend_from_slice(&sec.bytes);
            }
        }

        // Symbol table: null entry first, then locals, then globals.
        align_to(&mut out, 8);
        let symtab_off = out.len();
        out.extend_from_slice(&[0u8; 24]);
        for &i in &order {
            let sym = &self.symbols[i];
            let bind = match sym.bind {
                Bind::Local => 0u8,
                Bind::Global => 1,
                Bind::Weak => 2,
            };
            let kind = match sym.kind {
                SymKind::Func => 2u8,
                SymKind::Object => 1,
            };
            out.extend_from_slice(&sym_name_off[i].to_le_bytes());
            out.push((bind << 4) | kind);
            out.push(0); // default visibility
            let shndx: u16 = sym.section.map(|sec| sec as u16 + 1).unwrap_or(0);
            out.extend_from_slice(&shndx.to_le_bytes());
            out.extend_from_slice(&sym.value.to_le_bytes());
            out.extend_from_slice(&sym.size.to_le_bytes());
        }
        let symtab_size = out.len() - symtab_off;

        // Relocation tables.
        let mut rela_offsets = Vec::with_capacity(rela_sections.len());
        for &target in &rela_sections {
            align_to(&mut out, 8);
            rela_offsets.push(out.len());
            for r in self.relocs.iter().filter(|r| r.section == target) {
                out.extend_from_slice(&r.offset.to_le_bytes());
                let info = ((symtab_index[r.symbol] as u64) << 32) | r.rtype as u64;
                out.extend_from_slice(&info.to_le_bytes());
                out.extend_from_slice(&r.addend.to_le_bytes());
            }
        }

        // Group sections.
        let mut group_offsets = Vec::with_capacity(group_sections.len());
        for &member in &group_sections {
            align_to(&mut out, 4);
            group_offsets.push(out.len());
            out.extend_from_slice(&GRP_COMDAT.to_le_bytes());
            out.extend_from_slice(&(member as u32 + 1).to_le_bytes());
        }

        let strtab_off = out.len();
        out.extend_from_slice(&strtab);
        let shstrtab_off = out.len();
        out.extend_from_slice(&shstrtab);

        // Section header table.
        align_to(&mut out, 8);
        let shoff = out.len();
        let header = Self::header;

        header(&mut out, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        for (i, sec) in self.sections.iter().enumerate() {
            let (stype, flags, size) = match sec.kind {
                Kind::Text => (SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, sec.bytes.len()),
                Kind::Rodata | Kind::EhFrame => (SHT_PROGBITS, SHF_ALLOC, sec.bytes.len()),
                Kind::Data => (SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, sec.bytes.len()),
                Kind::Bss => (SHT_NOBITS, SHF_ALLOC | SHF_WRITE, sec.bss_size),
            };
            let flags = if sec.comdat { flags | SHF_GROUP } else { flags };
            header(
                &mut out,
                user_names[i],
                stype,
                flags,
                user_offsets[i],
                size,
                0,
                0,
                sec.align as u64,
                0,
            );
        }
        for (pos, &target) in rela_sections.iter().enumerate() {
            let count = self.relocs.iter().filter(|r| r.section == target).count();
            header(
                &mut out,
                rela_names[pos],
                SHT_RELA,
                0,
                rela_offsets[pos],
                count * 24,
                symtab_idx as u32,
                target as u32 + 1,
                8,
                24,
            );
        }
        for (pos, _) in group_sections.iter().enumerate() {
            header(
                &mut out,
                group_names[pos],
                SHT_GROUP,
                0,
                group_offsets[pos],
                8,
                symtab_idx as u32,
                0,
                4,
                4,
            );
        }
        header(
            &mut out,
            symtab_name,
            SHT_SYMTAB,
            0,
            symtab_off,
            symtab_size,
            strtab_idx as u32,
            first_global as u32,
            8,
            24,
        );
        header(
            &mut out, strtab_name, SHT_STRTAB, 0, strtab_off, strtab.len(), 0, 0, 1, 0,
        );
        header(
            &mut out,
            shstrtab_name,
            SHT_STRTAB,
            0,
            shstrtab_off,
            shstrtab.len(),
            0,
            0,
            1,
            0,
        );

        // ELF header.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        out[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes());
        out[60..62].copy_from_slice(&(header_count as u16).to_le_bytes());
        out[62..64].copy_from_slice(&(shstrtab_idx as u16).to_le_bytes());

        out
    }
}

// =============================================================================
// Machine-code templates
// =============================================================================

/// `fib(n)` with `fib(1) = fib(2) = 1`. The object defines `fib` itself, so
/// the recursive call relocations bind to the implementation directly once
/// it is linked.
pub fn fib_object() -> Vec<u8> {
    #[rustfmt::skip]
    let code: Vec<u8> = vec![
        0x53,                               // push rbx
        0x55,                               // push rbp
        0x48, 0x83, 0xEC, 0x08,             // sub  rsp, 8
        0x89, 0xFB,                         // mov  ebx, edi
        0xB8, 0x01, 0x00, 0x00, 0x00,       // mov  eax, 1
        0x83, 0xFF, 0x02,                   // cmp  edi, 2
        0x7E, 0x14,                         // jle  .epilogue
        0x8D, 0x7B, 0xFF,                   // lea  edi, [rbx-1]
        0xE8, 0x00, 0x00, 0x00, 0x00,       // call fib          (reloc @22)
        0x89, 0xC5,                         // mov  ebp, eax
        0x8D, 0x7B, 0xFE,                   // lea  edi, [rbx-2]
        0xE8, 0x00, 0x00, 0x00, 0x00,       // call fib          (reloc @32)
        0x01, 0xE8,                         // add  eax, ebp
        0x48, 0x83, 0xC4, 0x08,             // .epilogue: add rsp, 8
        0x5D,                               // pop  rbp
        0x5B,                               // pop  rbx
        0xC3,                               // ret
    ];
    let code_len = code.len() as u64;

    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    let eh = w.section(".eh_frame", Kind::EhFrame, fib_eh_frame(), 8);
    let fib = w.symbol("fib", Some(text), 0, code_len, Bind::Global, SymKind::Func);
    w.reloc(text, 22, R_X86_64_PLT32, fib, -4);
    w.reloc(text, 32, R_X86_64_PLT32, fib, -4);
    // FDE pc_begin is pc-relative to the loaded function.
    w.reloc(eh, 32, R_X86_64_PC32, fib, 0);
    w.build()
}

/// Minimal CIE + FDE describing `fib`'s prologue, with the standard zero
/// terminator. pc_begin (offset 32) is patched by relocation.
fn fib_eh_frame() -> Vec<u8> {
    #[rustfmt::skip]
    let bytes: Vec<u8> = vec![
        // CIE, length 20
        0x14, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,             // CIE id
        0x01,                               // version
        b'z', b'R', 0x00,                   // augmentation
        0x01,                               // code alignment
        0x78,                               // data alignment (-8)
        0x10,                               // return address register
        0x01,                               // augmentation data length
        0x1B,                               // FDE encoding: pcrel | sdata4
        0x0C, 0x07, 0x08,                   // def_cfa rsp, 8
        0x90, 0x01,                         // ra at cfa-8
        0x00, 0x00,                         // padding
        // FDE, length 28
        0x1C, 0x00, 0x00, 0x00,
        0x1C, 0x00, 0x00, 0x00,             // CIE pointer
        0x00, 0x00, 0x00, 0x00,             // pc_begin (relocated)
        0x2D, 0x00, 0x00, 0x00,             // pc_range = 45
        0x00,                               // augmentation data length
        0x41, 0x0E, 0x10, 0x83, 0x02,       // push rbx: cfa 16, rbx at cfa-16
        0x41, 0x0E, 0x18, 0x86, 0x03,       // push rbp: cfa 24, rbp at cfa-24
        0x44, 0x0E, 0x20,                   // sub rsp, 8: cfa 32
        0x00, 0x00,                         // padding
        // terminator
        0x00, 0x00, 0x00, 0x00,
    ];
    bytes
}

/// A leaf function exporting `answer42` that returns 42.
pub fn answer_object() -> Vec<u8> {
    let code = vec![
        0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
        0xC3, // ret
    ];
    let len = code.len() as u64;
    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    w.symbol("answer42", Some(text), 0, len, Bind::Global, SymKind::Func);
    w.build()
}

/// Two exported leaves in one object: `pair_first` -> 1, `pair_second` -> 2.
pub fn pair_object() -> Vec<u8> {
    #[rustfmt::skip]
    let code: Vec<u8> = vec![
        0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3, // pair_first
        0xCC, 0xCC,
        0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3, // pair_second
    ];
    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    w.symbol("pair_first", Some(text), 0, 6, Bind::Global, SymKind::Func);
    w.symbol("pair_second", Some(text), 8, 6, Bind::Global, SymKind::Func);
    w.build()
}

/// Exports `bar` -> 7; used for caller-flag override checks.
pub fn bar_object() -> Vec<u8> {
    let code = vec![0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3];
    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    w.symbol("bar", Some(text), 0, 6, Bind::Global, SymKind::Func);
    w.build()
}

/// `call_host(...)` forwards all arguments to the undefined symbol
/// `extern_name`, which the runtime must resolve through its search order.
pub fn call_extern_object(extern_name: &str) -> Vec<u8> {
    #[rustfmt::skip]
    let code: Vec<u8> = vec![
        0x48, 0x83, 0xEC, 0x08,             // sub  rsp, 8
        0xE8, 0x00, 0x00, 0x00, 0x00,       // call <extern>     (reloc @5)
        0x48, 0x83, 0xC4, 0x08,             // add  rsp, 8
        0xC3,                               // ret
    ];
    let len = code.len() as u64;
    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    w.symbol("call_host", Some(text), 0, len, Bind::Global, SymKind::Func);
    let callee = w.symbol(extern_name, None, 0, 0, Bind::Global, SymKind::Func);
    w.reloc(text, 5, R_X86_64_PLT32, callee, -4);
    w.build()
}

/// `call_host(a, b)` against the embedder-provided `host_add`.
pub fn call_host_object() -> Vec<u8> {
    call_extern_object("host_add")
}

/// `read_value()` loads a 32-bit constant from a local `.rodata` symbol;
/// the constant never becomes an exported name.
pub fn rodata_object() -> Vec<u8> {
    #[rustfmt::skip]
    let code: Vec<u8> = vec![
        0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, // mov eax, [rip+value]  (reloc @2)
        0xC3,                               // ret
    ];
    let len = code.len() as u64;
    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    let rodata = w.section(".rodata", Kind::Rodata, 0x11223344u32.to_le_bytes().to_vec(), 4);
    w.symbol("read_value", Some(text), 0, len, Bind::Global, SymKind::Func);
    let value = w.symbol("value_data", Some(rodata), 0, 4, Bind::Local, SymKind::Object);
    w.reloc(text, 2, R_X86_64_PC32, value, -4);
    w.build()
}

/// `bump()` increments a `.data` counter and returns the new value;
/// exercises writable data placement.
pub fn counter_object() -> Vec<u8> {
    #[rustfmt::skip]
    let code: Vec<u8> = vec![
        0x48, 0xFF, 0x05, 0x00, 0x00, 0x00, 0x00, // inc qword [rip+counter] (reloc @3)
        0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, // mov rax, [rip+counter]  (reloc @10)
        0xC3,                                     // ret
    ];
    let len = code.len() as u64;
    let mut w = ObjectWriter::new();
    let text = w.section(".text", Kind::Text, code, 16);
    let data = w.section(".data", Kind::Data, 0u64.to_le_bytes().to_vec(), 8);
    w.symbol("bump", Some(text), 0, len, Bind::Global, SymKind::Func);
    let counter = w.symbol("counter", Some(data), 0, 8, Bind::Local, SymKind::Object);
    w.reloc(text, 3, R_X86_64_PC32, counter, -4);
    w.reloc(text, 10, R_X86_64_PC32, counter, -4);
    w.build()
}

/// A COMDAT function `shared_const` returning `value`: identical copies may
/// appear in multiple units, first writer wins.
pub fn comdat_object(value: u8) -> Vec<u8> {
    let code = vec![0xB8, value, 0x00, 0x00, 0x00, 0xC3];
    let mut w = ObjectWriter::new();
    let text = w.comdat_section(".text.shared_const", Kind::Text, code, 16);
    w.symbol("shared_const", Some(text), 0, 6, Bind::Global, SymKind::Func);
    w.build()
}
