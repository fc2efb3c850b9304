//! Runtime error types.
//!
//! This module defines [`RuntimeError`] and [`RuntimeResult`] for object
//! loading, linking, materialization, and registration error handling.
//!
//! Linking and compilation errors are local to one compilation unit and are
//! reported synchronously to whoever triggered materialization; there is no
//! global error channel. Registration errors degrade gracefully (logged,
//! execution proceeds without crash-handler support for that image).

use std::fmt;

// =============================================================================
// RuntimeResult and RuntimeError
// =============================================================================

/// Error types for object loading, linking, and lazy materialization
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Malformed object buffer (bad magic, truncated header, out-of-bounds
    /// offset, unsupported machine). Never retried.
    Format(String),

    /// A required symbol could not be resolved at link time
    UnresolvedSymbol(String),

    /// A relocation target does not fit its displacement field
    Relocation {
        kind: &'static str,
        symbol: String,
        distance: i64,
    },

    /// The memory manager could not satisfy a section request
    Allocation(String),

    /// Two linked units claimed the same strong symbol name
    SymbolClash(String),

    /// The compile action attached to a stub failed; the stub is
    /// permanently failed and is never silently retried
    CompileActionFailed { name: String, reason: String },

    /// Unwind/debug registration failed; non-fatal, the image runs
    /// without crash-handler support
    Registration(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Format(msg) => write!(f, "malformed object: {}", msg),
            RuntimeError::UnresolvedSymbol(name) => {
                write!(f, "unresolved symbol: {}", name)
            }
            RuntimeError::Relocation {
                kind,
                symbol,
                distance,
            } => write!(
                f,
                "relocation {} against {} out of range (distance {:#x})",
                kind, symbol, distance
            ),
            RuntimeError::Allocation(msg) => write!(f, "allocation failed: {}", msg),
            RuntimeError::SymbolClash(name) => {
                write!(f, "duplicate strong definition of symbol: {}", name)
            }
            RuntimeError::CompileActionFailed { name, reason } => {
                write!(f, "compile action for {} failed: {}", name, reason)
            }
            RuntimeError::Registration(msg) => write!(f, "registration failed: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
