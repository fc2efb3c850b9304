//! latejit - Lazy JIT Execution Runtime
//!
//! This library compiles function definitions to native code on their first
//! invocation, links the result into the running process, and makes it
//! callable through stable entry points. Code generation itself is an
//! external collaborator (an [`ObjectCompiler`] producing a relocatable
//! object buffer); the library is the runtime machinery around it.
//!
//! # Architecture
//!
//! ```text
//! declare_function(name, action) ──> permanent stub address
//!        │ first call
//!        ▼
//! stubs::LazyMaterializer ── single-flight compile action
//!        │ object bytes
//!        ▼
//! linker::ObjectLinkingLayer ── symbol reconciliation + relocations
//!        │ LoadedImage                 (memory::SectionMemoryManager)
//!        ▼
//! resources::ResourceTracker ── per-key ownership, atomic removal
//!        │
//!        ▼
//! unwind/debug registrars ── OS unwinder, GDB interface, perf map
//! ```
//!
//! - [`stubs`]: address-stable redirection stubs and the PENDING ->
//!   COMPILING -> READY materialization state machine
//! - [`object`]: checked decoder for relocatable object buffers
//! - [`linker`]: section allocation, relocation, symbol resolution
//! - [`memory`]: page allocation and write-then-protect lifecycles
//! - [`resources`]: resource keys grouping images and their memory
//! - [`unwind`] / [`debug`]: unwinder, debugger, and profiler registration
//! - [`engine`]: the embedder facade tying the pieces together
//!
//! # Example
//!
//! ```no_run
//! use latejit::{ExecutionEngine, ResourceKey, RuntimeError};
//!
//! let engine = ExecutionEngine::new();
//! let key = ResourceKey::new();
//!
//! // The compile action runs once, on the first call through the stub.
//! let stub = engine
//!     .declare_function("answer", move |rt| {
//!         let object_bytes: Vec<u8> = produce_object_somehow();
//!         rt.add_object(key, &object_bytes)?;
//!         rt.lookup_symbol("answer")
//!             .ok_or_else(|| RuntimeError::UnresolvedSymbol("answer".into()))
//!     })
//!     .unwrap();
//!
//! let answer: unsafe extern "C" fn() -> i64 = unsafe { std::mem::transmute(stub) };
//! let value = unsafe { answer() };
//! # fn produce_object_somehow() -> Vec<u8> { Vec::new() }
//! ```
//!
//! # Concurrency
//!
//! Multiple native threads may call through materialized or unmaterialized
//! stubs concurrently. Per stub, exactly one compile action runs across all
//! racing callers and every caller observes the identical resolved address;
//! independent functions compile concurrently. Compile actions execute
//! outside every table lock.

pub mod compiler;
pub mod debug;
pub mod engine;
pub mod error;
pub mod linker;
pub mod memory;
pub mod object;
pub mod resources;
pub mod stubs;
pub mod unwind;

pub use compiler::{CompilationUnit, DiskObjectCache, ObjectCompiler};
pub use debug::{GdbRegistrar, PerfMapRegistrar};
pub use engine::{EngineConfig, EngineStats, ExecutionEngine};
pub use error::{RuntimeError, RuntimeResult};
pub use linker::{
    ExportedSymbol, FunctionSymbol, LoadedImage, ObjectLinkingLayer, ResponsibilitySet,
    SymbolFlags,
};
pub use memory::{MemoryManager, SectionKind, SectionMemoryManager};
pub use object::ObjectBuffer;
pub use resources::{ResourceKey, ResourceTracker};
pub use stubs::{CompileAction, LazyMaterializer, StubEntry};
pub use unwind::{EhFrameRegistrar, LoadListener};
