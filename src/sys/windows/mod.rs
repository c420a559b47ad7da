//! Trap handling on Windows through a vectored exception handler.
//!
//! Exceptions are delivered on the faulting thread's own stack, which keeps
//! some space in reserve for handling stack overflows, so no alternate stack
//! is needed here.

use crate::config::Config;
use crate::trap::{Trap, TrapCode};
use crate::traphandlers::{TrapTest, tls};
use crate::unwind;
use std::ffi::c_void;
use std::io;
use windows_sys::Win32::Foundation::*;
use windows_sys::Win32::System::Diagnostics::Debug::*;

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;

unsafe extern "C" {
    fn wasmtime_traps_current_fiber() -> *mut c_void;
}

/// Function which may handle custom signals while processing traps.
pub type SignalHandler<'a> = dyn Fn(*mut EXCEPTION_POINTERS) -> bool + Send + Sync + 'a;

/// Returns the fiber the calling thread is currently running, or null if the
/// thread was never converted to a fiber.
///
/// Guarded-call state is per thread, so embedders which switch fibers in
/// guest code use this to check they are resuming on the fiber a guarded call
/// started on.
pub fn current_fiber() -> *mut c_void {
    unsafe { wasmtime_traps_current_fiber() }
}

pub(crate) unsafe fn platform_init(_config: &Config) {
    // our trap handler needs to go first, so that we can recover from
    // guest faults and continue execution, so pass `1` as a true value
    // here.
    if unsafe { AddVectoredExceptionHandler(1, Some(exception_handler)) }.is_null() {
        panic!(
            "failed to add exception handler: {}",
            io::Error::last_os_error()
        );
    }
}

pub(crate) fn lazy_per_thread_init() -> Result<(), Trap> {
    Ok(())
}

unsafe extern "system" fn exception_handler(exception_info: *mut EXCEPTION_POINTERS) -> i32 {
    // Check the kind of exception, since we only handle a subset within
    // guest code. If anything else happens we want to defer to whatever
    // the rest of the system wants to do for this exception.
    let record = unsafe { &*(*exception_info).ExceptionRecord };
    let fallback = match record.ExceptionCode {
        EXCEPTION_ACCESS_VIOLATION => TrapCode::MemoryOutOfBounds,
        EXCEPTION_STACK_OVERFLOW => TrapCode::StackOverflow,
        EXCEPTION_ILLEGAL_INSTRUCTION => TrapCode::UnreachableCodeReached,
        EXCEPTION_INT_DIVIDE_BY_ZERO => TrapCode::IntegerDivisionByZero,
        EXCEPTION_INT_OVERFLOW => TrapCode::IntegerOverflow,
        _ => return EXCEPTION_CONTINUE_SEARCH,
    };

    // This is basically the same as the unix version, only with a few
    // parameters tweaked here and there.
    tls::with(|info| {
        let Some(info) = info else {
            return EXCEPTION_CONTINUE_SEARCH;
        };
        let context = unsafe { &*(*exception_info).ContextRecord };
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                let pc = context.Rip as usize;
            } else if #[cfg(target_arch = "aarch64")] {
                let pc = context.Pc as usize;
            } else {
                compile_error!("unsupported platform");
            }
        }
        // For access violations the first element in `ExceptionInformation` is
        // an indicator as to whether the fault was a read/write. The second
        // element is the address of the inaccessible data causing this
        // violation.
        let faulting_addr = if record.ExceptionCode == EXCEPTION_ACCESS_VIOLATION
            && record.NumberParameters >= 2
        {
            Some(record.ExceptionInformation[1])
        } else {
            None
        };
        match info.test_if_trap(pc, faulting_addr, Some(fallback), |handler| {
            handler(exception_info)
        }) {
            TrapTest::NotWasm => EXCEPTION_CONTINUE_SEARCH,
            TrapTest::HandledByEmbedder => EXCEPTION_CONTINUE_EXECUTION,
            TrapTest::Trap(point) => unsafe { unwind::trigger_unwind(point) },
        }
    })
}
