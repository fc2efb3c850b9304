//! Section memory management for loaded objects.
//!
//! This module provides:
//! - Platform-specific page allocation (mmap/mprotect)
//! - A write-then-protect lifecycle: sections are populated while writable,
//!   then protections are finalized (code becomes execute+read, declared
//!   read-only data loses its write bit)
//! - Page ownership: a [`SectionMemoryManager`] owns its mappings until it is
//!   dropped, which is how a resource-key removal releases executable memory
//!
//! # Safety
//! All page management is inherently unsafe. This module encapsulates the
//! unsafety behind checked APIs; function-pointer transmutes stay with the
//! callers that know the code's signature.

use crate::error::{RuntimeError, RuntimeResult};

// =============================================================================
// Platform-specific pages
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate zeroed pages with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Free allocated pages.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make pages executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    /// Make pages read-only.
    pub unsafe fn make_readonly(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ) == 0 }
    }

    /// Make pages writable again (for stub patching).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }
}

pub use platform::PAGE_SIZE;

/// Align a size up to the nearest page boundary.
#[inline]
pub const fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// =============================================================================
// Section kinds
// =============================================================================

/// The three protection classes a loaded object's sections fall into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Execute+read after finalization
    Code,
    /// Read-only after finalization
    ReadOnlyData,
    /// Stays read-write
    ReadWriteData,
}

/// Allocates and protects pages for one loaded object's sections.
///
/// Implementations own the pages they hand out; dropping the manager is the
/// only way the pages are released.
pub trait MemoryManager: Send + Sync {
    /// Allocate a zeroed, writable block of at least `size` bytes for a
    /// section of the given kind. The returned block stays valid until the
    /// manager is dropped.
    fn allocate(&mut self, kind: SectionKind, size: usize, align: usize)
        -> RuntimeResult<*mut u8>;

    /// Apply final protections to everything allocated so far. After this,
    /// code blocks are executable and read-only data is write-protected;
    /// no further allocation or mutation is allowed.
    fn finalize(&mut self) -> RuntimeResult<()>;
}

// =============================================================================
// SectionMemoryManager
// =============================================================================

struct Mapping {
    ptr: *mut u8,
    size: usize,
    kind: SectionKind,
}

/// Mmap-backed [`MemoryManager`]: one fresh manager per emitted object, as
/// the linking layer's memory-manager factory dictates.
pub struct SectionMemoryManager {
    mappings: Vec<Mapping>,
    finalized: bool,
}

// Safety: the raw pointers are exclusively owned mmap regions; nothing
// aliases them outside this manager, and all mutation happens before
// finalization while the manager is exclusively borrowed (&mut self).
unsafe impl Send for SectionMemoryManager {}
unsafe impl Sync for SectionMemoryManager {}

impl SectionMemoryManager {
    pub fn new() -> Self {
        SectionMemoryManager {
            mappings: Vec::new(),
            finalized: false,
        }
    }

    /// Total bytes of pages currently owned.
    pub fn allocated_bytes(&self) -> usize {
        self.mappings.iter().map(|m| m.size).sum()
    }
}

impl Default for SectionMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for SectionMemoryManager {
    fn allocate(
        &mut self,
        kind: SectionKind,
        size: usize,
        align: usize,
    ) -> RuntimeResult<*mut u8> {
        if self.finalized {
            return Err(RuntimeError::Allocation(
                "allocation after finalization".to_string(),
            ));
        }
        if align > PAGE_SIZE {
            return Err(RuntimeError::Allocation(format!(
                "section alignment {} exceeds page size",
                align
            )));
        }
        let rounded = align_to_page(size.max(1));
        let ptr = unsafe { platform::alloc_rw(rounded) };
        if ptr.is_null() {
            return Err(RuntimeError::Allocation(format!(
                "mmap of {} bytes failed",
                rounded
            )));
        }
        self.mappings.push(Mapping {
            ptr,
            size: rounded,
            kind,
        });
        Ok(ptr)
    }

    fn finalize(&mut self) -> RuntimeResult<()> {
        if self.finalized {
            return Ok(());
        }
        for m in &self.mappings {
            let ok = unsafe {
                match m.kind {
                    SectionKind::Code => platform::make_executable(m.ptr, m.size),
                    SectionKind::ReadOnlyData => platform::make_readonly(m.ptr, m.size),
                    SectionKind::ReadWriteData => true,
                }
            };
            if !ok {
                return Err(RuntimeError::Allocation(format!(
                    "mprotect of {:?} block at {:p} failed",
                    m.kind, m.ptr
                )));
            }
        }
        self.finalized = true;
        Ok(())
    }
}

impl Drop for SectionMemoryManager {
    fn drop(&mut self) {
        for m in &self.mappings {
            unsafe {
                platform::free(m.ptr, m.size);
            }
        }
    }
}

// =============================================================================
// Raw page helpers for the stub pools
// =============================================================================

/// A fixed, page-aligned mapping whose protection can be toggled for
/// patching. Used by the lazy materializer for stub and trampoline pages.
pub struct PatchablePages {
    ptr: *mut u8,
    size: usize,
}

// Safety: exclusively owned mapping; callers serialize patching externally.
unsafe impl Send for PatchablePages {}
unsafe impl Sync for PatchablePages {}

impl PatchablePages {
    /// Map `size` bytes (page-rounded) of zeroed read-write memory.
    pub fn new(size: usize) -> RuntimeResult<Self> {
        let size = align_to_page(size);
        let ptr = unsafe { platform::alloc_rw(size) };
        if ptr.is_null() {
            return Err(RuntimeError::Allocation(format!(
                "mmap of {} bytes failed",
                size
            )));
        }
        Ok(PatchablePages { ptr, size })
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Make the whole mapping executable (and read-only).
    pub fn protect_executable(&self) -> RuntimeResult<()> {
        if unsafe { platform::make_executable(self.ptr, self.size) } {
            Ok(())
        } else {
            Err(RuntimeError::Allocation(
                "mprotect to RX failed".to_string(),
            ))
        }
    }

    /// Make a page-aligned sub-range executable, leaving the rest untouched.
    pub fn protect_range_executable(&self, offset: usize, len: usize) -> RuntimeResult<()> {
        assert!(offset % PAGE_SIZE == 0, "range must be page-aligned");
        assert!(offset + len <= self.size, "range out of bounds");
        if unsafe { platform::make_executable(self.ptr.add(offset), len) } {
            Ok(())
        } else {
            Err(RuntimeError::Allocation(
                "mprotect of range to RX failed".to_string(),
            ))
        }
    }

    /// Make the whole mapping writable for patching.
    pub fn protect_writable(&self) -> RuntimeResult<()> {
        if unsafe { platform::make_writable(self.ptr, self.size) } {
            Ok(())
        } else {
            Err(RuntimeError::Allocation(
                "mprotect to RW failed".to_string(),
            ))
        }
    }

    /// Write `bytes` at `offset` while the mapping is writable.
    ///
    /// # Panics
    /// Panics if the range is out of bounds; offsets here are computed from
    /// in-process layout, not from untrusted input.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.size, "patch out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }
}

impl Drop for PatchablePages {
    fn drop(&mut self) {
        unsafe {
            platform::free(self.ptr, self.size);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
