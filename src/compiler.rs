//! The compiled-object producer seam and the on-disk object cache.
//!
//! Code generation is an external collaborator: the runtime hands a
//! [`CompilationUnit`] to an [`ObjectCompiler`] and gets back a relocatable
//! object buffer. The unit is consumed by the call (ownership transfers
//! across the stage boundary, never shares) and is destroyed once its
//! object bytes exist.
//!
//! The optional [`DiskObjectCache`] persists produced objects keyed by the
//! unit's identity, so re-runs skip code generation for unchanged units.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::error::RuntimeResult;

// =============================================================================
// Compilation units
// =============================================================================

/// One unit of IR paired with its definitional context.
///
/// `I` is whatever module representation the embedder's code generator
/// consumes; the runtime never looks inside it.
pub struct CompilationUnit<I> {
    pub name: String,
    pub ir: I,
}

impl<I> CompilationUnit<I> {
    pub fn new(name: impl Into<String>, ir: I) -> Self {
        CompilationUnit {
            name: name.into(),
            ir,
        }
    }

    /// Identity of this unit, for object-cache keying.
    pub fn identity(&self) -> u64
    where
        I: Hash,
    {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.ir.hash(&mut hasher);
        hasher.finish()
    }
}

/// Lowers one compilation unit to a relocatable object buffer.
///
/// Selected at engine construction; the runtime treats the produced bytes
/// as an opaque object-file buffer until the linking layer decodes them.
pub trait ObjectCompiler: Send + Sync {
    type Ir;

    /// Consume `unit` and produce its object bytes.
    fn compile(&self, unit: CompilationUnit<Self::Ir>) -> RuntimeResult<Vec<u8>>;
}

// =============================================================================
// Disk object cache
// =============================================================================

/// Object cache keyed by compilation-unit identity.
///
/// Best-effort: a miss or an IO failure falls back to compiling; a corrupt
/// entry is the embedder's to avoid (AOT-cache correctness is out of
/// scope).
pub struct DiskObjectCache {
    dir: PathBuf,
}

impl DiskObjectCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DiskObjectCache { dir: dir.into() }
    }

    fn object_path(&self, name: &str, identity: u64) -> PathBuf {
        self.dir.join(format!("{}-{:016x}.o", name, identity))
    }

    /// Load a previously stored object, if one exists for this identity.
    pub fn load(&self, name: &str, identity: u64) -> Option<Vec<u8>> {
        let path = self.object_path(name, identity);
        match std::fs::read(&path) {
            Ok(bytes) => {
                tracing::debug!(unit = name, path = %path.display(), "object cache hit");
                Some(bytes)
            }
            Err(_) => {
                tracing::debug!(unit = name, "no cached object; compiling");
                None
            }
        }
    }

    /// Store freshly produced object bytes under this identity.
    pub fn store(&self, name: &str, identity: u64, object: &[u8]) {
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "cannot create object cache dir");
            return;
        }
        let path = self.object_path(name, identity);
        if let Err(err) = std::fs::write(&path, object) {
            tracing::warn!(path = %path.display(), error = %err, "cannot write cached object");
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// =============================================================================
// Tests
// =============================================================================
