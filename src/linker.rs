//! Object linking layer.
//!
//! Links one decoded [`ObjectBuffer`] into the process: allocates sections
//! through a [`MemoryManager`], applies relocations, reconciles the object's
//! symbol table against the caller's responsibility set, and resolves
//! undefined references through the runtime's search order.
//!
//! # Invariants
//!
//! - Resolution is all-or-nothing per emit: if any required symbol cannot be
//!   resolved or any relocation is out of range, the operation fails and the
//!   partially-built image (and its pages) is discarded before anything
//!   becomes visible.
//! - Internal (local-binding) symbols are never exposed outside the image.
//! - A caller claim always overrides the flags recorded in the object;
//!   object formats cannot represent every visibility faithfully.
//! - Symbols defined inside COMDAT group sections are weak unless claimed:
//!   identical copies may appear in multiple units and the first writer wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::{MemoryManager, SectionKind, SectionMemoryManager};
use crate::object::{
    ObjectBuffer, RelocKind, SectionPlacement, SymbolBinding, SymbolKind, SymbolSection,
    SymbolVisibility, SHDR_ADDR_OFFSET,
};

// =============================================================================
// Responsibility set
// =============================================================================

/// Flags the caller declares for a symbol it promises to provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolFlags {
    /// Multiple definitions tolerated; first writer wins
    pub weak: bool,
    /// Kept internal to the image even though the object marks it global
    pub hidden: bool,
}

/// The set of symbols a caller has promised to provide from an emit, with
/// the flags the runtime should trust over the object's own.
///
/// Declaring every provided symbol up front gives early, deterministic
/// collision detection; symbols left undeclared are auto-claimed at
/// resolution time when the linking layer is configured to do so.
#[derive(Debug, Clone, Default)]
pub struct ResponsibilitySet {
    claims: HashMap<String, SymbolFlags>,
}

impl ResponsibilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim responsibility for `name` with explicit flags.
    pub fn claim(&mut self, name: impl Into<String>, flags: SymbolFlags) -> &mut Self {
        self.claims.insert(name.into(), flags);
        self
    }

    pub fn get(&self, name: &str) -> Option<SymbolFlags> {
        self.claims.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

// =============================================================================
// Loaded image
// =============================================================================

/// A symbol the image exports under its resolved absolute address
#[derive(Debug, Clone)]
pub struct ExportedSymbol {
    pub name: String,
    pub address: u64,
    pub weak: bool,
}

/// A defined function, for symbol/debug registration
#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// One mapped section of a loaded image
#[derive(Debug, Clone)]
pub struct SectionRange {
    pub name: String,
    pub address: usize,
    pub size: usize,
    pub kind: SectionKind,
}

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

/// The result of linking one object buffer into memory.
///
/// Owns the pages it was linked into (through its memory manager); the
/// resource tracker and the registrars hold references, never ownership.
/// Dropping the image releases its executable memory, so the tracker
/// sequences unwind/debug deregistration strictly before the drop.
pub struct LoadedImage {
    id: u64,
    sections: SmallVec<[SectionRange; 4]>,
    eh_frame: Option<(usize, usize)>,
    exports: Vec<ExportedSymbol>,
    functions: Vec<FunctionSymbol>,
    /// Copy of the object with section load addresses patched in, handed to
    /// the debugger interface
    debug_object: Vec<u8>,
    /// Keeps the mapped pages alive; released on drop
    _memory: Box<dyn MemoryManager>,
}

impl LoadedImage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn exports(&self) -> &[ExportedSymbol] {
        &self.exports
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }

    pub fn sections(&self) -> &[SectionRange] {
        &self.sections
    }

    /// Mapped ranges holding executable code
    pub fn code_ranges(&self) -> impl Iterator<Item = &SectionRange> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Code)
    }

    /// Address range of the unwind-metadata section, if present
    pub fn eh_frame(&self) -> Option<(usize, usize)> {
        self.eh_frame
    }

    pub fn debug_object(&self) -> &[u8] {
        &self.debug_object
    }

    /// Resolve an exported symbol of this image
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.exports
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.address)
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self::for_tests(Vec::new(), Vec::new())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(debug_object: Vec<u8>, functions: Vec<FunctionSymbol>) -> Self {
        LoadedImage {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            sections: SmallVec::new(),
            eh_frame: None,
            exports: Vec::new(),
            functions,
            debug_object,
            _memory: Box::new(SectionMemoryManager::new()),
        }
    }
}

impl std::fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedImage")
            .field("id", &self.id)
            .field("sections", &self.sections.len())
            .field("exports", &self.exports.len())
            .field("eh_frame", &self.eh_frame)
            .finish()
    }
}

// =============================================================================
// Linking layer
// =============================================================================

/// Factory for per-object memory managers, selected at construction
pub type MemoryManagerFactory = Box<dyn Fn() -> Box<dyn MemoryManager> + Send + Sync>;

/// Links object buffers into the process.
///
/// Each emit gets a fresh memory manager from the factory; the manager ends
/// up owned by the resulting [`LoadedImage`].
pub struct ObjectLinkingLayer {
    get_memory_manager: MemoryManagerFactory,
    /// Claim responsibility for exported symbols the caller did not declare.
    /// Convenient, but collisions then surface at resolution time and can be
    /// load-order dependent; up-front claims detect clashes early.
    auto_claim: bool,
}

impl ObjectLinkingLayer {
    pub fn new(auto_claim: bool) -> Self {
        ObjectLinkingLayer {
            get_memory_manager: Box::new(|| Box::new(SectionMemoryManager::new())),
            auto_claim,
        }
    }

    pub fn with_memory_manager_factory(factory: MemoryManagerFactory, auto_claim: bool) -> Self {
        ObjectLinkingLayer {
            get_memory_manager: factory,
            auto_claim,
        }
    }

    /// Link `object` into memory.
    ///
    /// `resolver` supplies addresses for symbols the object leaves
    /// undefined, in the runtime's search order. Returns the loaded image;
    /// on any failure nothing becomes visible and all pages are released.
    pub fn link(
        &self,
        object: &ObjectBuffer,
        responsibility: &ResponsibilitySet,
        resolver: &dyn Fn(&str) -> Option<u64>,
    ) -> RuntimeResult<LoadedImage> {
        object.log_contents();
        let mut memory = (self.get_memory_manager)();

        // --- Section allocation -------------------------------------------
        let section_count = object.sections().len();
        let mut section_addr: Vec<Option<usize>> = vec![None; section_count];
        let mut ranges: SmallVec<[SectionRange; 4]> = SmallVec::new();

        for sec in object.loaded_sections() {
            let kind = match sec.placement {
                SectionPlacement::Code => SectionKind::Code,
                SectionPlacement::ReadOnly => SectionKind::ReadOnlyData,
                SectionPlacement::ReadWrite | SectionPlacement::Uninitialized => {
                    SectionKind::ReadWriteData
                }
                SectionPlacement::None => continue,
            };
            let base = memory.allocate(kind, sec.size, sec.align)?;
            if sec.placement != SectionPlacement::Uninitialized {
                // Bounds were validated by the decoder.
                let bytes = &object.data()[sec.offset..sec.offset + sec.size];
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, sec.size);
                }
            }
            section_addr[sec.index] = Some(base as usize);
            ranges.push(SectionRange {
                name: sec.name.clone(),
                address: base as usize,
                size: sec.size,
                kind,
            });
        }

        // --- Common symbols ------------------------------------------------
        // Tentative definitions share one zeroed read-write block.
        let commons: Vec<(usize, u64, u64)> = object
            .symbols()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.section == SymbolSection::Common)
            .map(|(i, s)| (i, s.size, s.value.max(1)))
            .collect();
        let mut common_addr: HashMap<usize, u64> = HashMap::new();
        if !commons.is_empty() {
            let mut offset = 0usize;
            let mut offsets = Vec::with_capacity(commons.len());
            for &(idx, size, align) in &commons {
                let align = align as usize;
                offset = (offset + align - 1) & !(align - 1);
                offsets.push((idx, offset));
                offset += size as usize;
            }
            let base = memory.allocate(SectionKind::ReadWriteData, offset, 16)? as usize;
            for (idx, off) in offsets {
                common_addr.insert(idx, (base + off) as u64);
            }
        }

        // --- Symbol addresses ---------------------------------------------
        let mut sym_addr: Vec<Option<u64>> = vec![None; object.symbols().len()];
        for (idx, sym) in object.symbols().iter().enumerate() {
            let addr = match sym.section {
                SymbolSection::Section(sec) => {
                    match section_addr[sec] {
                        Some(base) => Some(base as u64 + sym.value),
                        // Symbol in a non-loaded section (e.g. debug data):
                        // harmless unless a relocation needs it.
                        None => None,
                    }
                }
                SymbolSection::Absolute => Some(sym.value),
                SymbolSection::Common => common_addr.get(&idx).copied(),
                SymbolSection::Undefined => {
                    if sym.name.is_empty() {
                        None
                    } else if let Some(addr) = resolver(&sym.name) {
                        Some(addr)
                    } else if sym.binding == SymbolBinding::Weak {
                        // Undefined weak references resolve to null.
                        Some(0)
                    } else {
                        return Err(RuntimeError::UnresolvedSymbol(sym.name.clone()));
                    }
                }
            };
            sym_addr[idx] = addr;
        }

        // --- Relocations ---------------------------------------------------
        for reloc in object.relocations() {
            let target_base = section_addr[reloc.section].ok_or_else(|| {
                RuntimeError::Format(format!(
                    "relocation targets unloaded section {}",
                    reloc.section
                ))
            })?;
            let sym = &object.symbols()[reloc.symbol];
            let s = sym_addr[reloc.symbol].ok_or_else(|| {
                RuntimeError::UnresolvedSymbol(if sym.name.is_empty() {
                    format!("<section symbol {}>", reloc.symbol)
                } else {
                    sym.name.clone()
                })
            })? as i64;
            let a = reloc.addend;
            let p = (target_base as u64 + reloc.offset) as i64;
            let patch_at = (target_base as u64 + reloc.offset) as *mut u8;

            match reloc.kind {
                RelocKind::Abs64 => {
                    let value = s.wrapping_add(a) as u64;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            value.to_le_bytes().as_ptr(),
                            patch_at,
                            8,
                        );
                    }
                }
                RelocKind::Pc32 | RelocKind::Plt32 => {
                    // No PLT is ever emitted; the symbol address itself is
                    // the call target (L = S).
                    let distance = s.wrapping_add(a).wrapping_sub(p);
                    let value = i32::try_from(distance).map_err(|_| {
                        RuntimeError::Relocation {
                            kind: reloc.kind.name(),
                            symbol: sym.name.clone(),
                            distance,
                        }
                    })?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            value.to_le_bytes().as_ptr(),
                            patch_at,
                            4,
                        );
                    }
                }
                RelocKind::Abs32 => {
                    let full = s.wrapping_add(a);
                    let value = u32::try_from(full).map_err(|_| RuntimeError::Relocation {
                        kind: reloc.kind.name(),
                        symbol: sym.name.clone(),
                        distance: full,
                    })?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            value.to_le_bytes().as_ptr(),
                            patch_at,
                            4,
                        );
                    }
                }
                RelocKind::Abs32Signed => {
                    let full = s.wrapping_add(a);
                    let value = i32::try_from(full).map_err(|_| RuntimeError::Relocation {
                        kind: reloc.kind.name(),
                        symbol: sym.name.clone(),
                        distance: full,
                    })?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            value.to_le_bytes().as_ptr(),
                            patch_at,
                            4,
                        );
                    }
                }
            }
        }

        // --- Symbol reconciliation ----------------------------------------
        let mut exports = Vec::new();
        for (idx, sym) in object.symbols().iter().enumerate() {
            if !sym.is_candidate_export() || sym.name.is_empty() {
                continue;
            }
            let address = match sym_addr[idx] {
                Some(a) => a,
                None => continue,
            };
            let flags = match responsibility.get(&sym.name) {
                // Caller-declared flags win over whatever the object says.
                Some(flags) => flags,
                None if self.auto_claim => SymbolFlags {
                    // COMDAT copies are duplicate-eliminated: weak unless
                    // the caller claimed otherwise.
                    weak: sym.binding == SymbolBinding::Weak || sym.in_comdat,
                    hidden: sym.visibility != SymbolVisibility::Default,
                },
                None => {
                    tracing::warn!(
                        symbol = %sym.name,
                        "global symbol not claimed and auto-claim disabled; kept internal"
                    );
                    continue;
                }
            };
            if flags.hidden {
                continue;
            }
            exports.push(ExportedSymbol {
                name: sym.name.clone(),
                address,
                weak: flags.weak,
            });
        }

        // --- Function symbols for debug/profiler registration -------------
        let functions = object
            .symbols()
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.kind == SymbolKind::Function
                    && !s.name.is_empty()
                    && matches!(s.section, SymbolSection::Section(_))
            })
            .filter_map(|(idx, s)| {
                sym_addr[idx].map(|address| FunctionSymbol {
                    name: s.name.clone(),
                    address,
                    size: s.size,
                })
            })
            .collect();

        // --- Debug copy with load addresses patched in --------------------
        let mut debug_object = object.data().to_vec();
        for sec in object.loaded_sections() {
            if let Some(addr) = section_addr[sec.index] {
                let at = sec.header_offset + SHDR_ADDR_OFFSET;
                debug_object[at..at + 8].copy_from_slice(&(addr as u64).to_le_bytes());
            }
        }

        let eh_frame = object
            .eh_frame_section()
            .and_then(|sec| section_addr[sec.index].map(|addr| (addr, sec.size)));

        // --- Finalize protections -----------------------------------------
        memory.finalize()?;

        let image = LoadedImage {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            sections: ranges,
            eh_frame,
            exports,
            functions,
            debug_object,
            _memory: memory,
        };
        tracing::debug!(
            image = image.id,
            sections = image.sections.len(),
            exports = image.exports.len(),
            "linked object"
        );
        Ok(image)
    }
}

// =============================================================================
// Tests
// =============================================================================
