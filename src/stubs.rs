//! Lazy materialization through redirection stubs.
//!
//! Each not-yet-compiled function gets a canonical, address-stable stub. The
//! stub is an indirect jump through a per-stub redirect cell: while the
//! function is unmaterialized the cell targets a resolver trampoline, and
//! after the first call it targets the real implementation. The stub address
//! never changes; only the cell does, with a single atomic store, so
//! concurrent callers never observe half-updated code.
//!
//! # Pool layout (x86-64)
//!
//! Stubs are carved out of fixed four-page pools:
//!
//! ```text
//! page 0  stubs      jmp [rip+disp] -> redirect cell        (8 bytes/slot)
//! page 1  redirects  one atomic u64 per slot                 (always RW)
//! page 2  thunks     mov r10, [rip+disp]  ; stub identity
//!                    jmp [rip+disp]       ; shared resolver (16 bytes/slot)
//! page 3  data       per-slot StubEntry pointer + the shared
//!                    resolver-entry address cell              (always RW)
//! ```
//!
//! Both code pages are written once at pool construction and protected
//! execute-only-plus-read before any slot is handed out; activating a slot
//! only ever writes the two data pages. The shared resolver entry saves the
//! full C-ABI argument state (integer and SSE argument registers plus `rax`),
//! runs the resolve path, restores, and tail-jumps to the implementation, so
//! the original call completes as if it had gone straight there. `r10` and
//! `r11` are scratch under the System V ABI and are the only registers the
//! call-through clobbers.
//!
//! # Single-flight
//!
//! Per stub: PENDING -> COMPILING -> READY (or FAILED). The first caller
//! runs the compile action outside every lock; racers block on the stub's
//! condition variable and observe the identical resolved address. A failed
//! action marks the stub FAILED permanently and the call path aborts loudly;
//! a garbage address is never returned and the action is never silently
//! retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::{PatchablePages, PAGE_SIZE};

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("latejit stubs require an x86-64 Unix host");

// =============================================================================
// Pool geometry
// =============================================================================

const STUB_SIZE: usize = 8;
const THUNK_SIZE: usize = 16;
/// Slots per pool, limited by the thunk page
const POOL_CAPACITY: usize = PAGE_SIZE / THUNK_SIZE;

const STUBS_OFFSET: usize = 0;
const REDIRECTS_OFFSET: usize = PAGE_SIZE;
const THUNKS_OFFSET: usize = 2 * PAGE_SIZE;
const DATA_OFFSET: usize = 3 * PAGE_SIZE;
/// The shared resolver-entry address cell lives after the per-slot entries
const RESOLVER_CELL_OFFSET: usize = DATA_OFFSET + POOL_CAPACITY * 8;

const POOL_BYTES: usize = 4 * PAGE_SIZE;

// =============================================================================
// Compile actions and stub state
// =============================================================================

/// Zero-argument closure producing the implementation address for one stub.
/// Invoked exactly once, on the first call through the stub.
pub type CompileAction = Box<dyn FnOnce() -> RuntimeResult<u64> + Send + 'static>;

/// Materialization state of one stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubState {
    /// Not yet called; compile action pending
    Pending,
    /// A caller is running the compile action
    Compiling,
    /// Materialized at the given implementation address
    Ready(u64),
    /// The compile action failed; permanent
    Failed,
}

/// One address-stable indirection point.
///
/// The entry outlives everything: once a stub is handed out its address is a
/// process-lifetime contract, so entries are kept alive both by the
/// materializer's registry and by the raw pointer embedded in the pool's
/// data page.
pub struct StubEntry {
    name: String,
    stub_addr: usize,
    /// The redirect cell inside the pool's always-writable page
    redirect: *const AtomicU64,
    state: Mutex<StubState>,
    materialized: Condvar,
    action: Mutex<Option<CompileAction>>,
}

// Safety: the redirect pointer targets a pool page that lives as long as
// the materializer; all mutation goes through the atomic cell or the mutex.
unsafe impl Send for StubEntry {}
unsafe impl Sync for StubEntry {}

impl StubEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical call address; permanent for the process lifetime
    pub fn address(&self) -> usize {
        self.stub_addr
    }

    /// The materialized implementation address, if the stub is READY
    pub fn resolved(&self) -> Option<u64> {
        match *self.state.lock() {
            StubState::Ready(addr) => Some(addr),
            _ => None,
        }
    }

    /// Point the stub at `target`. Atomic with respect to concurrent
    /// callers: they jump either to the old or to the new target, never
    /// through a torn cell.
    fn repoint(&self, target: u64) {
        // Safety: redirect stays valid for the pool's (= process) lifetime.
        unsafe { (*self.redirect).store(target, Ordering::Release) };
    }
}

// =============================================================================
// Shared resolver entry (x86-64 System V)
// =============================================================================

// The per-stub thunk parks the StubEntry pointer in r10 and jumps here with
// the stack exactly as the original caller left it: return address on top,
// argument registers live. Everything an integer/SSE argument could live in
// is preserved across the resolve call; the implementation address comes
// back in rax and is tail-jumped so the frame the callee sees is the
// original caller's.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".p2align 4",
    ".hidden latejit_resolver_entry",
    ".globl latejit_resolver_entry",
    "latejit_resolver_entry:",
    "push rbp",
    "mov rbp, rsp",
    "sub rsp, 192",
    "mov qword ptr [rsp], rdi",
    "mov qword ptr [rsp + 8], rsi",
    "mov qword ptr [rsp + 16], rdx",
    "mov qword ptr [rsp + 24], rcx",
    "mov qword ptr [rsp + 32], r8",
    "mov qword ptr [rsp + 40], r9",
    "mov qword ptr [rsp + 48], rax",
    "movdqa xmmword ptr [rsp + 64], xmm0",
    "movdqa xmmword ptr [rsp + 80], xmm1",
    "movdqa xmmword ptr [rsp + 96], xmm2",
    "movdqa xmmword ptr [rsp + 112], xmm3",
    "movdqa xmmword ptr [rsp + 128], xmm4",
    "movdqa xmmword ptr [rsp + 144], xmm5",
    "movdqa xmmword ptr [rsp + 160], xmm6",
    "movdqa xmmword ptr [rsp + 176], xmm7",
    "mov rdi, r10",
    "call {resolve}",
    "mov r11, rax",
    "movdqa xmm7, xmmword ptr [rsp + 176]",
    "movdqa xmm6, xmmword ptr [rsp + 160]",
    "movdqa xmm5, xmmword ptr [rsp + 144]",
    "movdqa xmm4, xmmword ptr [rsp + 128]",
    "movdqa xmm3, xmmword ptr [rsp + 112]",
    "movdqa xmm2, xmmword ptr [rsp + 96]",
    "movdqa xmm1, xmmword ptr [rsp + 80]",
    "movdqa xmm0, xmmword ptr [rsp + 64]",
    "mov rax, qword ptr [rsp + 48]",
    "mov r9, qword ptr [rsp + 40]",
    "mov r8, qword ptr [rsp + 32]",
    "mov rcx, qword ptr [rsp + 24]",
    "mov rdx, qword ptr [rsp + 16]",
    "mov rsi, qword ptr [rsp + 8]",
    "mov rdi, qword ptr [rsp]",
    "mov rsp, rbp",
    "pop rbp",
    "jmp r11",
    resolve = sym latejit_resolve_stub,
);

extern "C" {
    fn latejit_resolver_entry();
}

/// Resolve path entered from the shared trampoline on a stub's first call.
///
/// Must not unwind: failure aborts the process after logging, per the
/// contract that a failed materialization never yields a jumpable address.
extern "C" fn latejit_resolve_stub(entry: *const StubEntry) -> u64 {
    // Safety: the pointer was embedded at slot activation and the entry is
    // kept alive for the process lifetime by the materializer registry.
    let entry = unsafe { &*entry };

    let mut state = entry.state.lock();
    loop {
        match *state {
            StubState::Ready(addr) => return addr,
            StubState::Failed => {
                drop(state);
                tracing::error!(
                    stub = %entry.name,
                    "call through permanently failed stub"
                );
                std::process::abort();
            }
            StubState::Compiling => {
                entry.materialized.wait(&mut state);
            }
            StubState::Pending => {
                *state = StubState::Compiling;
                break;
            }
        }
    }
    drop(state);

    // Run the compile action outside every lock so unrelated lookups and
    // independent compilations proceed concurrently.
    let action = entry.action.lock().take();
    let result = match action {
        Some(action) => action(),
        None => Err(RuntimeError::CompileActionFailed {
            name: entry.name.clone(),
            reason: "no compile action attached".to_string(),
        }),
    };

    let mut state = entry.state.lock();
    match result {
        Ok(addr) if addr != 0 => {
            entry.repoint(addr);
            *state = StubState::Ready(addr);
            entry.materialized.notify_all();
            tracing::debug!(stub = %entry.name, address = addr, "stub materialized");
            addr
        }
        Ok(_) => {
            *state = StubState::Failed;
            entry.materialized.notify_all();
            drop(state);
            tracing::error!(stub = %entry.name, "compile action returned a null address");
            std::process::abort();
        }
        Err(err) => {
            *state = StubState::Failed;
            entry.materialized.notify_all();
            drop(state);
            tracing::error!(stub = %entry.name, error = %err, "materialization failed");
            std::process::abort();
        }
    }
}

// =============================================================================
// Stub pools
// =============================================================================

struct StubPool {
    pages: PatchablePages,
    used: usize,
}

impl StubPool {
    fn new() -> RuntimeResult<Self> {
        let pages = PatchablePages::new(POOL_BYTES)?;
        let base = pages.addr();

        // Every stub slot is the same instruction: the redirect cell sits
        // exactly one page further at the same slot offset.
        let disp = (PAGE_SIZE - 6) as u32;
        let mut stub = [0u8; STUB_SIZE];
        stub[0] = 0xFF;
        stub[1] = 0x25; // jmp [rip+disp32]
        stub[2..6].copy_from_slice(&disp.to_le_bytes());
        stub[6] = 0xCC;
        stub[7] = 0xCC;
        for slot in 0..POOL_CAPACITY {
            pages.write(STUBS_OFFSET + slot * STUB_SIZE, &stub);
        }

        // Thunks load their slot's StubEntry pointer and jump to the shared
        // resolver entry through the cell on the data page.
        for slot in 0..POOL_CAPACITY {
            let at = THUNKS_OFFSET + slot * THUNK_SIZE;
            let mut thunk = [0u8; THUNK_SIZE];
            // mov r10, [rip + d1] ; -> data slot
            let end_mov = at + 7;
            let d1 = (DATA_OFFSET + slot * 8) as i64 - end_mov as i64;
            thunk[0] = 0x4C;
            thunk[1] = 0x8B;
            thunk[2] = 0x15;
            thunk[3..7].copy_from_slice(&(d1 as i32).to_le_bytes());
            // jmp [rip + d2] ; -> resolver-entry cell
            let end_jmp = at + 13;
            let d2 = RESOLVER_CELL_OFFSET as i64 - end_jmp as i64;
            thunk[7] = 0xFF;
            thunk[8] = 0x25;
            thunk[9..13].copy_from_slice(&(d2 as i32).to_le_bytes());
            thunk[13] = 0xCC;
            thunk[14] = 0xCC;
            thunk[15] = 0xCC;
            pages.write(at, &thunk);
        }

        pages.write(
            RESOLVER_CELL_OFFSET,
            &(latejit_resolver_entry as usize as u64).to_le_bytes(),
        );

        // Code pages become executable once, before any slot is visible;
        // the redirect and data pages stay writable for the pool lifetime.
        pages.protect_range_executable(STUBS_OFFSET, PAGE_SIZE)?;
        pages.protect_range_executable(THUNKS_OFFSET, PAGE_SIZE)?;

        tracing::debug!(base = base as u64, "stub pool mapped");
        Ok(StubPool { pages, used: 0 })
    }

    fn is_full(&self) -> bool {
        self.used == POOL_CAPACITY
    }

    /// Activate the next free slot for `entry`. Returns the stub address
    /// and the redirect cell.
    fn activate(&mut self, entry: *const StubEntry) -> (usize, *const AtomicU64) {
        debug_assert!(!self.is_full());
        let slot = self.used;
        self.used += 1;
        let base = self.pages.addr();

        self.pages
            .write(DATA_OFFSET + slot * 8, &(entry as u64).to_le_bytes());

        let redirect = (base + REDIRECTS_OFFSET + slot * 8) as *const AtomicU64;
        let thunk_addr = (base + THUNKS_OFFSET + slot * THUNK_SIZE) as u64;
        // Publish the thunk as the initial redirect target. Release pairs
        // with the hardware load the stub's indirect jump performs.
        unsafe { (*redirect).store(thunk_addr, Ordering::Release) };

        (base + STUBS_OFFSET + slot * STUB_SIZE, redirect)
    }
}

// =============================================================================
// LazyMaterializer
// =============================================================================

/// Snapshot of materializer counters
#[derive(Debug, Clone, Default)]
pub struct StubStats {
    pub stubs_created: u64,
    pub materializations: u64,
}

/// Owns the stub pools and the name -> stub registry.
pub struct LazyMaterializer {
    /// Registry and pools share one critical section; compile actions run
    /// outside it.
    inner: Mutex<MaterializerInner>,
    stubs_created: AtomicU64,
    /// Shared with dispatched compile actions, which may outlive a borrow
    materializations: Arc<AtomicU64>,
}

struct MaterializerInner {
    entries: HashMap<String, Arc<StubEntry>>,
    pools: Vec<StubPool>,
}

impl LazyMaterializer {
    pub fn new() -> Self {
        LazyMaterializer {
            inner: Mutex::new(MaterializerInner {
                entries: HashMap::new(),
                pools: Vec::new(),
            }),
            stubs_created: AtomicU64::new(0),
            materializations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create (or return the existing) stub for `name`.
    ///
    /// The returned address is permanent for the process lifetime.
    pub fn request_stub(&self, name: &str) -> RuntimeResult<usize> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(name) {
            return Ok(entry.address());
        }

        if inner.pools.last().map_or(true, StubPool::is_full) {
            inner.pools.push(StubPool::new()?);
        }

        // The entry is constructed first, then wired into the pool's data
        // page, and only becomes callable once the redirect cell points at
        // its thunk.
        let mut entry = Arc::new(StubEntry {
            name: name.to_string(),
            stub_addr: 0,
            redirect: std::ptr::null(),
            state: Mutex::new(StubState::Pending),
            materialized: Condvar::new(),
            action: Mutex::new(None),
        });
        let raw = Arc::as_ptr(&entry);
        let pool = inner.pools.last_mut().expect("pool exists");
        let (stub_addr, redirect) = pool.activate(raw);
        {
            // No other reference exists yet; the Arc was just created.
            let e = Arc::get_mut(&mut entry).expect("unshared entry");
            e.stub_addr = stub_addr;
            e.redirect = redirect;
        }

        // The data page holds a raw pointer to the entry, so the entry must
        // never be dropped: keep one strong count forever.
        std::mem::forget(Arc::clone(&entry));
        inner.entries.insert(name.to_string(), entry);
        self.stubs_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stub = %name, address = stub_addr as u64, "stub created");
        Ok(stub_addr)
    }

    /// Attach the compile action run on `name`'s first call.
    ///
    /// The stub must exist and must not have started materializing.
    pub fn set_compile_action(&self, name: &str, action: CompileAction) -> RuntimeResult<()> {
        let entry = self.get(name).ok_or_else(|| {
            RuntimeError::CompileActionFailed {
                name: name.to_string(),
                reason: "no stub for this name".to_string(),
            }
        })?;
        let state = entry.state.lock();
        if *state != StubState::Pending {
            return Err(RuntimeError::CompileActionFailed {
                name: name.to_string(),
                reason: "stub already materializing".to_string(),
            });
        }
        let counter = Arc::clone(&self.materializations);
        *entry.action.lock() = Some(Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            action()
        }));
        Ok(())
    }

    /// Look up a stub entry by name.
    pub fn get(&self, name: &str) -> Option<Arc<StubEntry>> {
        self.inner.lock().entries.get(name).cloned()
    }

    /// The materialized address for `name`, if its stub is READY.
    pub fn resolved_address(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|e| e.resolved())
    }

    /// The stub address for `name`, if a stub exists.
    pub fn stub_address(&self, name: &str) -> Option<usize> {
        self.get(name).map(|e| e.address())
    }

    pub fn stats(&self) -> StubStats {
        StubStats {
            stubs_created: self.stubs_created.load(Ordering::Relaxed),
            materializations: self.materializations.load(Ordering::Relaxed),
        }
    }
}

impl Default for LazyMaterializer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
