//! Debugger and profiler registration for loaded code.
//!
//! External tools cannot map addresses inside JIT-generated code back to
//! names on their own; the runtime has to tell them. Two registrars cover
//! the host platform's conventions:
//!
//! - [`GdbRegistrar`] speaks the GDB JIT interface: a process-global
//!   descriptor holds a linked list of in-memory object files, and the
//!   debugger breaks on `__jit_debug_register_code` to pick up changes.
//!   Each entry carries a copy of the emitted object whose section headers
//!   have the runtime load addresses patched in, so the debugger can place
//!   every symbol.
//! - [`PerfMapRegistrar`] appends (address, size, name) triples to the
//!   platform profiler map (`/tmp/perf-<pid>.map`), the convention sampling
//!   profilers use to attribute JIT frames.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::ptr;

use parking_lot::Mutex;

use crate::linker::LoadedImage;
use crate::unwind::LoadListener;

// =============================================================================
// GDB JIT interface
// =============================================================================

// This must be kept in sync with gdb's jit.h.
const JIT_REGISTER_FN: u32 = 1;
const JIT_UNREGISTER_FN: u32 = 2;

#[repr(C)]
struct JitCodeEntry {
    next_entry: *mut JitCodeEntry,
    prev_entry: *mut JitCodeEntry,
    symfile_addr: *const u8,
    symfile_size: u64,
}

#[repr(C)]
struct JitDescriptor {
    version: u32,
    // Kept u32 rather than an enum to pin the bit-width of the contract.
    action_flag: u32,
    relevant_entry: *mut JitCodeEntry,
    first_entry: *mut JitCodeEntry,
}

// The debugger reads this global and checks the version before the process
// ever sets it, so the version must be static. These two symbols must be
// unique across the linked executable.
#[no_mangle]
#[allow(non_upper_case_globals)]
static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor {
    version: 1,
    action_flag: 0,
    relevant_entry: ptr::null_mut(),
    first_entry: ptr::null_mut(),
};

/// Debuggers put a breakpoint in this function to observe registrations.
#[no_mangle]
#[inline(never)]
extern "C" fn __jit_debug_register_code() {
    // Empty on purpose; the barrier keeps the call from being elided.
    unsafe {
        std::arch::asm!("", options(nostack, preserves_flags));
    }
}

/// Serializes all registration events; they mutate process globals.
static JIT_DEBUG_LOCK: Mutex<()> = Mutex::new(());

struct RegisteredObject {
    entry: *mut JitCodeEntry,
    /// The object copy the descriptor points into; must outlive the entry
    _symfile: Box<[u8]>,
}

/// Registers loaded objects with the GDB JIT interface.
pub struct GdbRegistrar {
    objects: Mutex<HashMap<u64, RegisteredObject>>,
}

// Safety: the raw entry pointers are only dereferenced under JIT_DEBUG_LOCK,
// and each is exclusively owned by this registrar until deregistration.
unsafe impl Send for GdbRegistrar {}
unsafe impl Sync for GdbRegistrar {}

impl GdbRegistrar {
    pub fn new() -> Self {
        GdbRegistrar {
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Number of objects currently registered with the debugger.
    pub fn registered_count(&self) -> usize {
        self.objects.lock().len()
    }
}

impl Default for GdbRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert `entry` at the head of the descriptor list and notify the
/// debugger. Caller holds JIT_DEBUG_LOCK.
unsafe fn notify_debugger_register(entry: *mut JitCodeEntry) {
    let descriptor = ptr::addr_of_mut!(__jit_debug_descriptor);
    unsafe {
        (*entry).prev_entry = ptr::null_mut();
        let next = (*descriptor).first_entry;
        (*entry).next_entry = next;
        if !next.is_null() {
            (*next).prev_entry = entry;
        }
        (*descriptor).first_entry = entry;
        (*descriptor).relevant_entry = entry;
        (*descriptor).action_flag = JIT_REGISTER_FN;
    }
    __jit_debug_register_code();
}

/// Unlink `entry` from the descriptor list and notify the debugger.
/// Caller holds JIT_DEBUG_LOCK.
unsafe fn notify_debugger_unregister(entry: *mut JitCodeEntry) {
    let descriptor = ptr::addr_of_mut!(__jit_debug_descriptor);
    unsafe {
        let prev = (*entry).prev_entry;
        let next = (*entry).next_entry;
        if !next.is_null() {
            (*next).prev_entry = prev;
        }
        if !prev.is_null() {
            (*prev).next_entry = next;
        } else {
            debug_assert_eq!((*descriptor).first_entry, entry);
            (*descriptor).first_entry = next;
        }
        (*descriptor).relevant_entry = entry;
        (*descriptor).action_flag = JIT_UNREGISTER_FN;
    }
    __jit_debug_register_code();
}

impl LoadListener for GdbRegistrar {
    fn on_image_loaded(&self, image: &LoadedImage) {
        if image.debug_object().is_empty() {
            return;
        }
        let mut objects = self.objects.lock();
        if objects.contains_key(&image.id()) {
            tracing::warn!(image = image.id(), "duplicate debug registration ignored");
            return;
        }

        let symfile: Box<[u8]> = image.debug_object().to_vec().into_boxed_slice();
        let entry = Box::into_raw(Box::new(JitCodeEntry {
            next_entry: ptr::null_mut(),
            prev_entry: ptr::null_mut(),
            symfile_addr: symfile.as_ptr(),
            symfile_size: symfile.len() as u64,
        }));

        {
            let _locked = JIT_DEBUG_LOCK.lock();
            unsafe { notify_debugger_register(entry) };
        }
        objects.insert(
            image.id(),
            RegisteredObject {
                entry,
                _symfile: symfile,
            },
        );
        tracing::debug!(
            image = image.id(),
            bytes = image.debug_object().len(),
            "object registered with the debugger interface"
        );
    }

    fn on_image_unloaded(&self, image: &LoadedImage) {
        let Some(registered) = self.objects.lock().remove(&image.id()) else {
            return;
        };
        {
            let _locked = JIT_DEBUG_LOCK.lock();
            unsafe { notify_debugger_unregister(registered.entry) };
        }
        // Safety: the entry was created by Box::into_raw at registration
        // and is unlinked from the descriptor list above.
        drop(unsafe { Box::from_raw(registered.entry) });
        tracing::debug!(image = image.id(), "object deregistered from the debugger interface");
    }
}

impl Drop for GdbRegistrar {
    fn drop(&mut self) {
        // Unregister anything still listed so the descriptor never points
        // into freed memory.
        let objects = std::mem::take(&mut *self.objects.lock());
        if objects.is_empty() {
            return;
        }
        let _locked = JIT_DEBUG_LOCK.lock();
        for (_, registered) in objects {
            unsafe {
                notify_debugger_unregister(registered.entry);
                drop(Box::from_raw(registered.entry));
            }
        }
    }
}

// =============================================================================
// Perf map
// =============================================================================

/// Appends function symbols to the platform profiler map.
///
/// The map format is append-only by convention; unload is a no-op because
/// profilers snapshot the file rather than track removals.
pub struct PerfMapRegistrar {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
    /// Set once the map failed to open, so the warning is not repeated
    failed: std::sync::atomic::AtomicBool,
}

impl PerfMapRegistrar {
    pub fn new() -> Self {
        Self::with_path(std::env::temp_dir().join(format!("perf-{}.map", std::process::id())))
    }

    pub fn with_path(path: PathBuf) -> Self {
        PerfMapRegistrar {
            path,
            file: Mutex::new(None),
            failed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Default for PerfMapRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadListener for PerfMapRegistrar {
    fn on_image_loaded(&self, image: &LoadedImage) {
        use std::sync::atomic::Ordering;

        if image.functions().is_empty() {
            return;
        }
        let mut file = self.file.lock();
        if file.is_none() {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                Ok(opened) => *file = Some(opened),
                Err(err) => {
                    if !self.failed.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %err,
                            "profiler map unavailable; symbols will not resolve in profiles"
                        );
                    }
                    return;
                }
            }
        }
        let out = file.as_mut().expect("file opened above");
        for func in image.functions() {
            // perf map line format: <start> <size> <name>
            if let Err(err) = writeln!(out, "{:x} {:x} {}", func.address, func.size, func.name) {
                tracing::warn!(error = %err, "profiler map write failed");
                return;
            }
        }
        let _ = out.flush();
    }

    fn on_image_unloaded(&self, _image: &LoadedImage) {}
}

// =============================================================================
// Tests
// =============================================================================
