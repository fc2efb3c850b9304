//! Resource lifecycle tracking.
//!
//! Every loaded image is registered under a [`ResourceKey`] at creation.
//! Removing a key tears down everything it owns (unwind/debug registrations
//! first, then the pages) without disturbing images under other keys.
//! Transferring moves all images from one key to another without gaps, for
//! the case where one compilation unit's lifetime subsumes a dependency's.
//!
//! Removal is the *only* path that releases executable memory. Leaking a key
//! leaks memory; removing a key whose code another thread is still executing
//! is a caller error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::linker::LoadedImage;

// =============================================================================
// ResourceKey
// =============================================================================

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque handle grouping the images and memory owned by one logical
/// compilation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey(u64);

impl ResourceKey {
    /// Mint a fresh key, unique for the process lifetime.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        ResourceKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// ResourceTracker
// =============================================================================

/// Tracks which loaded images belong to which resource key.
///
/// One critical section guards the whole table: no lookup can observe a
/// half-removed key, because removal takes the key's entire entry out of the
/// map in one locked step and tears it down afterwards.
pub struct ResourceTracker {
    images: Mutex<HashMap<ResourceKey, Vec<Arc<LoadedImage>>>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        ResourceTracker {
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Record `image` as owned by `key`.
    pub fn register(&self, key: ResourceKey, image: Arc<LoadedImage>) {
        self.images.lock().entry(key).or_default().push(image);
    }

    /// Detach and return everything owned by `key`.
    ///
    /// After this returns, lookups no longer see the key; the caller is
    /// responsible for deregistering and then dropping the images, in that
    /// order.
    pub fn remove(&self, key: ResourceKey) -> Vec<Arc<LoadedImage>> {
        self.images.lock().remove(&key).unwrap_or_default()
    }

    /// Move every image under `src` to `dst`, without duplication or loss.
    pub fn transfer(&self, dst: ResourceKey, src: ResourceKey) {
        if dst == src {
            return;
        }
        let mut images = self.images.lock();
        if let Some(moved) = images.remove(&src) {
            images.entry(dst).or_default().extend(moved);
        }
    }

    /// Images currently registered under `key`.
    pub fn images_under(&self, key: ResourceKey) -> Vec<Arc<LoadedImage>> {
        self.images
            .lock()
            .get(&key)
            .map(|v| v.to_vec())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.images.lock().contains_key(&key)
    }

    /// Total number of live images across all keys.
    pub fn image_count(&self) -> usize {
        self.images.lock().values().map(|v| v.len()).sum()
    }
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
