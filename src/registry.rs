//! Registry of code regions containing compiled guest code.
//!
//! The signal handler uses this to decide whether a faulting program counter
//! belongs to guest code, and to translate it to a trap code. Signal handlers
//! run with no information about the thread's context other than its
//! registers, so the registry is process-wide state rather than per-store.

use crate::trap::TrapCode;
use anyhow::{Result, bail, ensure};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use wasmtime_jit_debug::GdbJitImageRegistration;

/// Lookups from program counters to information about guest code.
///
/// [`is_guest_code`](CodeLookup::is_guest_code) and
/// [`lookup_trap_code`](CodeLookup::lookup_trap_code) are called from within
/// signal handlers, so implementations of them must not allocate or take
/// locks that the faulting thread could already hold.
pub trait CodeLookup: Sync {
    /// Returns whether `pc` lies within a region of compiled guest code.
    fn is_guest_code(&self, pc: usize) -> bool;

    /// Returns the trap code recorded for the instruction at `pc`, if the
    /// compiler emitted one.
    fn lookup_trap_code(&self, pc: usize) -> Option<TrapCode> {
        let _ = pc;
        None
    }

    /// Returns the name of the function containing `pc`, if debug
    /// information is available.
    ///
    /// This is only called after an unwind has completed, never from signal
    /// context.
    fn lookup_func_name(&self, pc: usize) -> Option<String> {
        let _ = pc;
        None
    }
}

/// A trap site in compiled code: the offset of a trapping instruction from the
/// start of its code region and the trap it raises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapInformation {
    /// Offset of the faulting instruction within its code region.
    pub code_offset: u32,
    /// The trap raised when this instruction faults.
    pub trap_code: TrapCode,
}

/// A function within a registered code region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Offset of the function's first instruction within its code region.
    pub start: u32,
    /// Length in bytes of the function's body.
    pub len: u32,
    /// Name of the function, if one is known.
    pub name: Option<String>,
}

/// A contiguous region of compiled guest code.
#[derive(Clone, Debug)]
pub struct CodeRegion {
    start: usize,
    len: usize,
    traps: Vec<TrapInformation>,
    functions: Vec<FunctionInfo>,
    debug_image: Option<Vec<u8>>,
}

impl CodeRegion {
    /// Describes the `len` bytes of code starting at `start`.
    pub fn new(start: *const u8, len: usize) -> CodeRegion {
        CodeRegion {
            start: start as usize,
            len,
            traps: Vec::new(),
            functions: Vec::new(),
            debug_image: None,
        }
    }

    /// Attaches the trap table of this region.
    pub fn with_traps(mut self, mut traps: Vec<TrapInformation>) -> CodeRegion {
        traps.sort_by_key(|t| t.code_offset);
        self.traps = traps;
        self
    }

    /// Attaches the function table of this region.
    pub fn with_functions(mut self, mut functions: Vec<FunctionInfo>) -> CodeRegion {
        functions.sort_by_key(|f| f.start);
        self.functions = functions;
        self
    }

    /// Attaches an in-memory object file with debug information for this
    /// region, which is announced to debuggers through the GDB JIT
    /// interface when the region is first registered.
    pub fn with_debug_image(mut self, image: Vec<u8>) -> CodeRegion {
        self.debug_image = Some(image);
        self
    }

    /// The first address of this region.
    pub fn start(&self) -> usize {
        self.start
    }

    /// The size in bytes of this region.
    pub fn len(&self) -> usize {
        self.len
    }

    // Inclusive, since the last byte of the region is a valid pc.
    fn end(&self) -> usize {
        self.start + self.len - 1
    }

    fn text_offset(&self, pc: usize) -> Option<usize> {
        if pc < self.start || self.end() < pc {
            return None;
        }
        Some(pc - self.start)
    }

    fn trap_code(&self, text_offset: usize) -> Option<TrapCode> {
        let offset = u32::try_from(text_offset).ok()?;
        let index = self
            .traps
            .binary_search_by_key(&offset, |t| t.code_offset)
            .ok()?;
        Some(self.traps[index].trap_code)
    }

    fn func_name(&self, text_offset: usize) -> Option<&str> {
        let offset = u32::try_from(text_offset).ok()?;
        let index = match self.functions.binary_search_by_key(&offset, |f| f.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let func = &self.functions[index];
        if offset - func.start >= func.len {
            return None;
        }
        func.name.as_deref()
    }
}

struct RegisteredRegion {
    region: CodeRegion,
    /// The same code may be registered by several owners, for example once
    /// per instantiation; it's only removed once all of them are gone.
    references: usize,
    _debug: Option<GdbJitImageRegistration>,
}

type Regions = BTreeMap<usize, RegisteredRegion>;

/// A set of code regions keyed by their (inclusive) end address, so that a
/// range query from `pc` finds the only candidate region.
pub struct CodeRegistry {
    regions: RwLock<Regions>,
}

thread_local! {
    /// Whether this thread currently holds a lock on a registry.
    static HOLDING: Cell<bool> = const { Cell::new(false) };
}

/// A lock guard which marks the current thread as holding a registry lock
/// until it's released.
struct Held<G> {
    guard: ManuallyDrop<G>,
    prev: bool,
}

impl<G> Held<G> {
    fn acquire(lock: impl FnOnce() -> G) -> Held<G> {
        // Set before blocking on the lock, since a fault while waiting for it
        // is still a fault on a thread that holds nothing else.
        let prev = HOLDING.replace(true);
        Held {
            guard: ManuallyDrop::new(lock()),
            prev,
        }
    }
}

impl<G: Deref> Deref for Held<G> {
    type Target = G::Target;

    fn deref(&self) -> &G::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Held<G> {
    fn deref_mut(&mut self) -> &mut G::Target {
        &mut self.guard
    }
}

impl<G> Drop for Held<G> {
    fn drop(&mut self) {
        // Release the lock before clearing the flag.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        HOLDING.set(self.prev);
    }
}

static GLOBAL_CODE: CodeRegistry = CodeRegistry::new();

impl CodeRegistry {
    /// Creates an empty registry.
    pub const fn new() -> CodeRegistry {
        CodeRegistry {
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    /// The process-wide registry consulted by [`catch_traps`](crate::catch_traps)
    /// and [`call_guarded`](crate::call_guarded).
    pub fn global() -> &'static CodeRegistry {
        &GLOBAL_CODE
    }

    /// Registers a region of guest code, returning a handle which removes it
    /// again when dropped.
    ///
    /// Registering exactly the same range again only bumps a reference count.
    /// Any other overlap with an existing region is an error.
    pub fn register(&self, mut region: CodeRegion) -> Result<CodeRegistration<'_>> {
        ensure!(region.len > 0, "cannot register an empty code region");
        ensure!(
            region.start.checked_add(region.len).is_some(),
            "code region {:#x}+{:#x} wraps the address space",
            region.start,
            region.len
        );
        let start = region.start;
        let end = region.end();

        let mut regions = self.write();
        if let Some(existing) = regions.get_mut(&end) {
            if existing.region.start != start {
                bail!(
                    "code region {start:#x}..={end:#x} overlaps {:#x}..={end:#x}",
                    existing.region.start
                );
            }
            existing.references += 1;
            return Ok(CodeRegistration { registry: self, end });
        }

        // The first region ending at or after `start` is the only one which
        // can collide with this one, whether it overlaps an edge or lies
        // entirely within it.
        if let Some((prev_end, prev)) = regions.range(start..).next() {
            if prev.region.start <= end {
                bail!(
                    "code region {start:#x}..={end:#x} overlaps {:#x}..={prev_end:#x}",
                    prev.region.start
                );
            }
        }

        log::trace!(
            "registering code region {start:#x}..={end:#x} with {} trap sites",
            region.traps.len()
        );
        let image = region.debug_image.take();
        regions.insert(
            end,
            RegisteredRegion {
                region,
                references: 1,
                _debug: None,
            },
        );
        drop(regions);

        // The debugger notifier runs embedder code, so it's called without
        // the registry locked. The region can't be removed in the meantime
        // since its first registration hasn't been handed out yet.
        if let Some(image) = image {
            log::debug!(
                "announcing {} byte debug image to the JIT debug interface",
                image.len()
            );
            let debug = GdbJitImageRegistration::register(image);
            if let Some(info) = self.write().get_mut(&end) {
                info._debug = Some(debug);
            }
        }
        Ok(CodeRegistration { registry: self, end })
    }

    fn unregister(&self, end: usize) {
        let mut regions = self.write();
        let Some(info) = regions.get_mut(&end) else {
            return;
        };
        info.references -= 1;
        if info.references == 0 {
            log::trace!("unregistering code region ending at {end:#x}");
            regions.remove(&end);
        }
    }

    fn write(&self) -> Held<RwLockWriteGuard<'_, Regions>> {
        Held::acquire(|| self.regions.write().unwrap_or_else(PoisonError::into_inner))
    }

    fn read(&self) -> Held<RwLockReadGuard<'_, Regions>> {
        Held::acquire(|| self.regions.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Runs `f` with the region containing `pc` and `pc`'s offset within it.
    ///
    /// This is used from signal handlers. If the faulting thread already
    /// holds a lock on a registry it was executing registry code, not guest
    /// code, and waiting for the lock could deadlock, so the lookup finds
    /// nothing. Otherwise it waits for writers on other threads to finish.
    fn with_region<R>(&self, pc: usize, f: impl FnOnce(&CodeRegion, usize) -> R) -> Option<R> {
        if HOLDING.get() {
            return None;
        }
        let regions = self.read();
        let (_, info) = regions.range(pc..).next()?;
        let offset = info.region.text_offset(pc)?;
        Some(f(&info.region, offset))
    }
}

impl Default for CodeRegistry {
    fn default() -> CodeRegistry {
        CodeRegistry::new()
    }
}

impl CodeLookup for CodeRegistry {
    fn is_guest_code(&self, pc: usize) -> bool {
        self.with_region(pc, |_, _| ()).is_some()
    }

    fn lookup_trap_code(&self, pc: usize) -> Option<TrapCode> {
        self.with_region(pc, |region, offset| region.trap_code(offset))
            .flatten()
    }

    fn lookup_func_name(&self, pc: usize) -> Option<String> {
        let regions = self.read();
        let (_, info) = regions.range(pc..).next()?;
        let offset = info.region.text_offset(pc)?;
        info.region.func_name(offset).map(|s| s.to_string())
    }
}

/// Keeps a code region registered; dropping it unregisters the region.
#[must_use = "dropping the registration immediately unregisters the code"]
pub struct CodeRegistration<'a> {
    registry: &'a CodeRegistry,
    end: usize,
}

impl Drop for CodeRegistration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.end);
    }
}
