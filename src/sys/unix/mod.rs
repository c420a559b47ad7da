//! Trap handling on unix platforms through POSIX signals.

pub mod altstack;
mod signals;

use crate::trap::Trap;
use crate::traphandlers;

pub use signals::SignalHandler;
pub(crate) use signals::platform_init;

/// Per-thread setup required before guest code runs on a thread.
pub(crate) fn lazy_per_thread_init() -> Result<(), Trap> {
    let config = traphandlers::config();
    if !config.signals_based_traps {
        return Ok(());
    }
    altstack::ensure_installed(config)
}

/// Prints `msg` and aborts the process.
///
/// This only uses async-signal-safe functions and can be called from a signal
/// handler.
pub(crate) fn abort(msg: &str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::abort()
    }
}
