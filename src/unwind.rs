//! Unwind registration for loaded code.
//!
//! A stack walk or thrown exception passing through JIT-generated frames
//! needs the image's unwind tables registered with the host unwinder, or the
//! walk corrupts the stack. This module registers each image's `.eh_frame`
//! section through the OS-supported entry points and reverses the
//! registration exactly once, before the image's pages are released.
//!
//! The unwind bytes are never parsed here; the host's own registration API
//! consumes them. The entry points are resolved dynamically, so a host
//! without them degrades to a logged registration failure: the code still
//! runs, it just cannot be unwound through.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::linker::LoadedImage;

// =============================================================================
// Load listener seam
// =============================================================================

/// Receives image load/unload notifications.
///
/// Registrations made in `on_image_loaded` must be reversed exactly once in
/// `on_image_unloaded`; the resource tracker guarantees unload runs before
/// the image's memory is released.
pub trait LoadListener: Send + Sync {
    fn on_image_loaded(&self, image: &LoadedImage);
    fn on_image_unloaded(&self, image: &LoadedImage);
}

// =============================================================================
// EH-frame registrar
// =============================================================================

type RegisterFrameFn = unsafe extern "C" fn(*const u8);

/// Registers `.eh_frame` sections with the in-process unwinder.
///
/// Uses `__register_frame`/`__deregister_frame` on the whole section, the
/// convention the GNU unwinder expects for frame data registered at
/// runtime.
pub struct EhFrameRegistrar {
    register: Option<RegisterFrameFn>,
    deregister: Option<RegisterFrameFn>,
    /// image id -> registered section base; presence is the pairing token
    registered: Mutex<HashMap<u64, usize>>,
}

impl EhFrameRegistrar {
    pub fn new() -> Self {
        EhFrameRegistrar {
            register: lookup_entry_point(b"__register_frame\0"),
            deregister: lookup_entry_point(b"__deregister_frame\0"),
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the host exposes the registration entry points.
    pub fn is_available(&self) -> bool {
        self.register.is_some() && self.deregister.is_some()
    }

    /// Number of images whose unwind info is currently registered.
    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }
}

impl Default for EhFrameRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_entry_point(name: &'static [u8]) -> Option<RegisterFrameFn> {
    debug_assert!(name.ends_with(b"\0"));
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr().cast()) };
    if addr.is_null() {
        None
    } else {
        // Safety: the unwinder's registration entry points have this
        // signature on every supported host.
        Some(unsafe { std::mem::transmute::<*mut libc::c_void, RegisterFrameFn>(addr) })
    }
}

impl LoadListener for EhFrameRegistrar {
    fn on_image_loaded(&self, image: &LoadedImage) {
        let Some((addr, len)) = image.eh_frame() else {
            return;
        };
        if len == 0 {
            return;
        }
        let Some(register) = self.register else {
            tracing::warn!(
                image = image.id(),
                "no __register_frame in this process; image runs without unwind info"
            );
            return;
        };

        let mut registered = self.registered.lock();
        if registered.contains_key(&image.id()) {
            // Pairing invariant: a second registration for the same image
            // would be undefined behavior in the unwinder.
            tracing::warn!(image = image.id(), "duplicate unwind registration ignored");
            return;
        }
        unsafe { register(addr as *const u8) };
        registered.insert(image.id(), addr);
        tracing::debug!(
            image = image.id(),
            eh_frame = addr as u64,
            bytes = len,
            "unwind info registered"
        );
    }

    fn on_image_unloaded(&self, image: &LoadedImage) {
        let Some(addr) = self.registered.lock().remove(&image.id()) else {
            return;
        };
        if let Some(deregister) = self.deregister {
            unsafe { deregister(addr as *const u8) };
            tracing::debug!(image = image.id(), "unwind info deregistered");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_points_resolve_on_gnu_hosts() {
        // Rust binaries on glibc hosts link the GNU unwinder, which exports
        // the registration entry points.
        let registrar = EhFrameRegistrar::new();
        assert!(registrar.is_available());
    }

    #[test]
    fn test_image_without_eh_frame_is_ignored() {
        let registrar = EhFrameRegistrar::new();
        let image = LoadedImage::empty_for_tests();
        registrar.on_image_loaded(&image);
        assert!(registrar.registered.lock().is_empty());
        // Unload without a prior registration is a no-op, not a crash.
        registrar.on_image_unloaded(&image);
    }
}
