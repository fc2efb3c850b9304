//! The execution engine: the embedder-facing boundary of the runtime.
//!
//! Wires the lazy materializer, the object linking layer, the resource
//! tracker, and the unwind/debug registrars into one facade:
//!
//! ```text
//! caller ──declare_function──> stub address (permanent)
//!   first call ─> resolver ─> compile action ─> emit object ─> link
//!      ─> tracker records ownership ─> registrars publish metadata
//!      ─> stub repointed ─> call resumes at the implementation
//! ```
//!
//! Symbol search order for undefined references at link time:
//! 1. symbols and stubs already known to this runtime instance,
//! 2. absolute symbols registered by the embedder,
//! 3. the host process's own exported symbols.

use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::compiler::{CompilationUnit, DiskObjectCache, ObjectCompiler};
use crate::error::{RuntimeError, RuntimeResult};
use crate::linker::{LoadedImage, ObjectLinkingLayer, ResponsibilitySet};
use crate::object::ObjectBuffer;
use crate::resources::{ResourceKey, ResourceTracker};
use crate::stubs::LazyMaterializer;
use crate::unwind::{EhFrameRegistrar, LoadListener};
use crate::debug::{GdbRegistrar, PerfMapRegistrar};

// =============================================================================
// Configuration
// =============================================================================

/// Engine construction options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Claim responsibility for exported symbols the emitting caller did
    /// not declare up front. Convenient; trades away early deterministic
    /// clash detection.
    pub auto_claim_symbols: bool,
    /// Register `.eh_frame` data with the host unwinder
    pub register_eh_frames: bool,
    /// Publish loaded objects through the GDB JIT interface
    pub register_with_debugger: bool,
    /// Append function symbols to the platform profiler map
    pub write_perf_map: bool,
    /// Persist produced objects keyed by compilation-unit identity
    pub object_cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            auto_claim_symbols: true,
            register_eh_frames: true,
            register_with_debugger: true,
            write_perf_map: true,
            object_cache_dir: None,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of engine activity
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub objects_loaded: u64,
    pub objects_removed: u64,
    pub live_images: u64,
    pub stubs_created: u64,
    pub materializations: u64,
}

#[derive(Default)]
struct EngineCounters {
    objects_loaded: AtomicU64,
    objects_removed: AtomicU64,
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Clone, Copy)]
struct MaterializedSymbol {
    address: u64,
    key: ResourceKey,
    weak: bool,
}

struct EngineInner {
    linker: ObjectLinkingLayer,
    /// Materialized symbols only; stubs stay out so a lookup before first
    /// call reports NotFound
    symbols: DashMap<String, MaterializedSymbol>,
    /// Host-provided addresses (intrinsics, callbacks)
    absolutes: DashMap<String, u64>,
    stubs: LazyMaterializer,
    tracker: ResourceTracker,
    listeners: RwLock<Vec<Arc<dyn LoadListener>>>,
    cache: Option<DiskObjectCache>,
    counters: EngineCounters,
}

/// The lazy JIT runtime.
///
/// Cheap to clone; clones share one runtime instance.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut listeners: Vec<Arc<dyn LoadListener>> = Vec::new();
        if config.register_eh_frames {
            listeners.push(Arc::new(EhFrameRegistrar::new()));
        }
        if config.register_with_debugger {
            listeners.push(Arc::new(GdbRegistrar::new()));
        }
        if config.write_perf_map {
            listeners.push(Arc::new(PerfMapRegistrar::new()));
        }
        let cache = config.object_cache_dir.clone().map(DiskObjectCache::new);

        ExecutionEngine {
            inner: Arc::new(EngineInner {
                linker: ObjectLinkingLayer::new(config.auto_claim_symbols),
                symbols: DashMap::new(),
                absolutes: DashMap::new(),
                stubs: LazyMaterializer::new(),
                tracker: ResourceTracker::new(),
                listeners: RwLock::new(listeners),
                cache,
                counters: EngineCounters::default(),
            }),
        }
    }

    /// Register an additional load listener.
    pub fn add_listener(&self, listener: Arc<dyn LoadListener>) {
        self.inner.listeners.write().push(listener);
    }

    // -------------------------------------------------------------------------
    // Lazy materialization
    // -------------------------------------------------------------------------

    /// Register a lazily-materialized function and return its permanent
    /// call address.
    ///
    /// `action` runs exactly once, on the first call through the returned
    /// address, and must produce the implementation address, typically by
    /// producing an object buffer and emitting it through this engine. The
    /// action must not call through its own stub; that would deadlock the
    /// in-flight materialization.
    pub fn declare_function<F>(&self, name: &str, action: F) -> RuntimeResult<usize>
    where
        F: FnOnce(&ExecutionEngine) -> RuntimeResult<u64> + Send + 'static,
    {
        let address = self.inner.stubs.request_stub(name)?;
        let runtime = Arc::downgrade(&self.inner);
        let name_for_action = name.to_string();
        self.inner.stubs.set_compile_action(
            name,
            Box::new(move || {
                let inner =
                    runtime
                        .upgrade()
                        .ok_or_else(|| RuntimeError::CompileActionFailed {
                            name: name_for_action.clone(),
                            reason: "runtime torn down before first call".to_string(),
                        })?;
                action(&ExecutionEngine { inner })
            }),
        )?;
        Ok(address)
    }

    /// Register a host-provided symbol resolvable by the linking layer.
    pub fn define_absolute_symbol(&self, name: &str, address: u64) -> RuntimeResult<()> {
        if let Some(existing) = self.inner.absolutes.get(name) {
            if *existing != address {
                return Err(RuntimeError::SymbolClash(name.to_string()));
            }
            return Ok(());
        }
        self.inner.absolutes.insert(name.to_string(), address);
        Ok(())
    }

    /// Resolve a currently-materialized symbol. A declared-but-uncalled
    /// function is not yet materialized and reports `None`.
    pub fn lookup_symbol(&self, name: &str) -> Option<u64> {
        if let Some(sym) = self.inner.symbols.get(name) {
            return Some(sym.address);
        }
        self.inner.absolutes.get(name).map(|a| *a)
    }

    /// The stub address for a declared function, if one exists.
    pub fn stub_address(&self, name: &str) -> Option<usize> {
        self.inner.stubs.stub_address(name)
    }

    // -------------------------------------------------------------------------
    // Object emission
    // -------------------------------------------------------------------------

    /// Emit an already-produced relocatable object under `key`.
    pub fn add_object(&self, key: ResourceKey, bytes: &[u8]) -> RuntimeResult<()> {
        self.add_object_with_responsibility(key, bytes, &ResponsibilitySet::new())
    }

    /// Emit an object, trusting the caller's declared symbol flags over the
    /// object's own where they overlap.
    pub fn add_object_with_responsibility(
        &self,
        key: ResourceKey,
        bytes: &[u8],
        responsibility: &ResponsibilitySet,
    ) -> RuntimeResult<()> {
        let object = ObjectBuffer::parse(bytes.to_vec())?;
        self.emit_object(key, &object, responsibility)?;
        Ok(())
    }

    /// Compile `unit` (through the cache, when one is configured) and emit
    /// the result under `key`.
    pub fn emit_unit<C>(
        &self,
        key: ResourceKey,
        compiler: &C,
        unit: CompilationUnit<C::Ir>,
    ) -> RuntimeResult<()>
    where
        C: ObjectCompiler,
        C::Ir: Hash,
    {
        let identity = unit.identity();
        let name = unit.name.clone();
        if let Some(cache) = &self.inner.cache {
            if let Some(bytes) = cache.load(&name, identity) {
                return self.add_object(key, &bytes);
            }
        }
        let bytes = compiler.compile(unit)?;
        if let Some(cache) = &self.inner.cache {
            cache.store(&name, identity, &bytes);
        }
        self.add_object(key, &bytes)
    }

    fn emit_object(
        &self,
        key: ResourceKey,
        object: &ObjectBuffer,
        responsibility: &ResponsibilitySet,
    ) -> RuntimeResult<Arc<LoadedImage>> {
        let inner = &self.inner;
        let resolver = |name: &str| self.resolve_for_link(name);
        let image = Arc::new(inner.linker.link(object, responsibility, &resolver)?);

        // All-or-nothing publication: detect strong clashes before any of
        // this image's symbols become visible.
        for export in image.exports() {
            if export.weak {
                continue;
            }
            if let Some(existing) = inner.symbols.get(&export.name) {
                if !existing.weak {
                    return Err(RuntimeError::SymbolClash(export.name.clone()));
                }
            }
        }
        for export in image.exports() {
            if export.weak && inner.symbols.contains_key(&export.name) {
                // First writer wins for duplicate-eliminated definitions.
                continue;
            }
            inner.symbols.insert(
                export.name.clone(),
                MaterializedSymbol {
                    address: export.address,
                    key,
                    weak: export.weak,
                },
            );
        }

        inner.tracker.register(key, Arc::clone(&image));
        for listener in inner.listeners.read().iter() {
            listener.on_image_loaded(&image);
        }
        inner.counters.objects_loaded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            key = key.as_u64(),
            image = image.id(),
            exports = image.exports().len(),
            "object emitted"
        );
        Ok(image)
    }

    /// Link-time resolution in the runtime's search order.
    fn resolve_for_link(&self, name: &str) -> Option<u64> {
        if let Some(sym) = self.inner.symbols.get(name) {
            return Some(sym.address);
        }
        if let Some(stub) = self.inner.stubs.stub_address(name) {
            return Some(stub as u64);
        }
        if let Some(addr) = self.inner.absolutes.get(name) {
            return Some(*addr);
        }
        host_symbol(name)
    }

    // -------------------------------------------------------------------------
    // Resource lifecycle
    // -------------------------------------------------------------------------

    /// Release all code and memory associated with `key`.
    ///
    /// Unwind and debugger registrations are reversed before any page is
    /// released; the key's exported symbols stop resolving. The caller must
    /// ensure no in-flight call still targets the code being removed.
    pub fn remove_compilation_unit(&self, key: ResourceKey) {
        let images = self.inner.tracker.remove(key);
        if images.is_empty() {
            return;
        }
        for image in &images {
            for export in image.exports() {
                self.inner
                    .symbols
                    .remove_if(&export.name, |_, sym| sym.key == key);
            }
            for listener in self.inner.listeners.read().iter() {
                listener.on_image_unloaded(image);
            }
        }
        self.inner
            .counters
            .objects_removed
            .fetch_add(images.len() as u64, Ordering::Relaxed);
        tracing::debug!(key = key.as_u64(), images = images.len(), "resources removed");
        // Dropping the images releases their pages, strictly after the
        // deregistrations above.
        drop(images);
    }

    /// Move everything owned by `src` under `dst`, for when one unit's
    /// lifetime subsumes a dependency's.
    pub fn transfer_compilation_unit(&self, dst: ResourceKey, src: ResourceKey) {
        self.inner.tracker.transfer(dst, src);
        for mut entry in self.inner.symbols.iter_mut() {
            if entry.key == src {
                entry.key = dst;
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        let stubs = self.inner.stubs.stats();
        EngineStats {
            objects_loaded: self.inner.counters.objects_loaded.load(Ordering::Relaxed),
            objects_removed: self.inner.counters.objects_removed.load(Ordering::Relaxed),
            live_images: self.inner.tracker.image_count() as u64,
            stubs_created: stubs.stubs_created,
            materializations: stubs.materializations,
        }
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a symbol exported by the host process itself.
fn host_symbol(name: &str) -> Option<u64> {
    let cname = std::ffi::CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_engine() -> ExecutionEngine {
        ExecutionEngine::with_config(EngineConfig {
            write_perf_map: false,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_absolute_symbols_resolve() {
        let engine = quiet_engine();
        engine
            .define_absolute_symbol("host_callback", 0x1234)
            .expect("define");
        assert_eq!(engine.lookup_symbol("host_callback"), Some(0x1234));
    }

    #[test]
    fn test_absolute_symbol_redefinition() {
        let engine = quiet_engine();
        engine.define_absolute_symbol("cb", 0x10).expect("define");
        // Same address is idempotent, a different one clashes.
        engine.define_absolute_symbol("cb", 0x10).expect("same");
        let err = engine.define_absolute_symbol("cb", 0x20).unwrap_err();
        assert!(matches!(err, RuntimeError::SymbolClash(_)));
    }

    #[test]
    fn test_declared_function_is_not_yet_materialized() {
        let engine = quiet_engine();
        let addr = engine
            .declare_function("lazy_fn", |_| Ok(0x5000))
            .expect("declare");
        assert_ne!(addr, 0);
        assert_eq!(engine.lookup_symbol("lazy_fn"), None);
        assert_eq!(engine.stub_address("lazy_fn"), Some(addr));
    }

    #[test]
    fn test_host_symbols_resolve_through_search_order() {
        // malloc is exported by every host this runtime supports.
        assert!(host_symbol("malloc").is_some());
        assert!(host_symbol("definitely_not_a_symbol_xyzzy").is_none());
    }

    #[test]
    fn test_remove_unknown_key_is_noop() {
        let engine = quiet_engine();
        engine.remove_compilation_unit(ResourceKey::new());
        assert_eq!(engine.stats().objects_removed, 0);
    }
}
