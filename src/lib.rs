//! Synchronous trap handling for JIT-compiled WebAssembly.
//!
//! This crate turns hardware faults raised by guest code (out-of-bounds
//! accesses hitting guard pages, stack overflow, `ud2`-style unreachable
//! instructions, integer division faults) into typed [`Trap`] values returned
//! to the host instead of crashing the process. It is made of three cooperating
//! pieces:
//!
//! * a per-thread alternate signal stack so that handlers can run even after
//!   the main stack has been exhausted,
//! * per-thread state recording whether guest code is currently executing and
//!   where execution should resume if it faults,
//! * a `setjmp`/`longjmp` trampoline which establishes that resume point
//!   before guest code runs and jumps back to it from a signal handler.
//!
//! Embedders call [`init_traps`] once, late in process startup and after any
//! other crash handlers have been installed, then wrap every call into guest
//! code with [`catch_traps`] or [`call_guarded`]. Compiled code must be
//! registered with the [`CodeRegistry`] (or an embedder-provided
//! [`CodeLookup`]) for faults in it to be attributed to the guest.

#![deny(missing_docs)]

mod config;
mod registry;
mod sys;
mod trap;
mod traphandlers;
mod unwind;

pub use crate::config::Config;
pub use crate::registry::{
    CodeLookup, CodeRegion, CodeRegistration, CodeRegistry, FunctionInfo, TrapInformation,
};
pub use crate::trap::{Trap, TrapCode, TrapReason};
pub use crate::traphandlers::{
    Fault, GuestEntry, Outcome, SignalHandler, call_guarded, catch_traps,
    ensure_eager_signal_handlers, init_traps, last_fault, raise_trap, raise_user_trap,
    resume_panic, tls_eager_initialize,
};
#[cfg(unix)]
pub use crate::sys::unix::altstack::live_alt_stacks;
#[cfg(windows)]
pub use crate::sys::windows::current_fiber;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
