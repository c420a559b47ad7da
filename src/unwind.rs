//! Bindings to the `setjmp`/`longjmp` trampoline in `helpers.c`.

use std::marker;
use std::ptr::NonNull;

/// Function signature of guest code entered through
/// [`call_guarded`](crate::call_guarded).
///
/// `callee` and `caller` are the opaque contexts of the function being called
/// and of its caller; `args` points at the argument/return buffer.
pub type GuestEntry = unsafe extern "C" fn(callee: *mut u8, caller: *mut u8, args: *mut u8);

unsafe extern "C" {
    fn wasmtime_traps_setjmp(
        jmp_buf: *mut *const u8,
        body: GuestEntry,
        callee: *mut u8,
        caller: *mut u8,
        args: *mut u8,
    ) -> i32;

    fn wasmtime_traps_longjmp(jmp_buf: *const u8) -> !;
}

/// A saved execution context which a faulting guest call resumes at.
///
/// A recovery point lives in the native frame of the trampoline that created
/// it and is only valid while that frame is on the stack. It must only ever be
/// used from the thread that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecoveryPoint {
    jmp_buf: NonNull<u8>,
    _not_send: marker::PhantomData<*const u8>,
}

impl RecoveryPoint {
    pub(crate) fn from_raw(jmp_buf: *const u8) -> Option<RecoveryPoint> {
        Some(RecoveryPoint {
            jmp_buf: NonNull::new(jmp_buf.cast_mut())?,
            _not_send: marker::PhantomData,
        })
    }

    /// The address of the underlying platform jump buffer.
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.jmp_buf.as_ptr()
    }
}

/// Captures a recovery point, stores it into `jmp_buf` and runs `body`.
///
/// Returns `true` if `body` returned normally and `false` if it was abandoned
/// through [`trigger_unwind`].
///
/// # Safety
///
/// `body` must be safe to call with the provided pointers. `jmp_buf` is only
/// valid until this function returns and any native frames between here and
/// a later `trigger_unwind` are discarded without running destructors.
pub(crate) unsafe fn setjmp_and_call(
    jmp_buf: *mut *const u8,
    body: GuestEntry,
    callee: *mut u8,
    caller: *mut u8,
    args: *mut u8,
) -> bool {
    unsafe { wasmtime_traps_setjmp(jmp_buf, body, callee, caller, args) != 0 }
}

/// Transfers control to `point`, which resumes as if the trampoline that
/// created it had returned `false`.
///
/// This is async-signal-safe and may be called from a signal handler running
/// on the alternate signal stack.
///
/// # Safety
///
/// `point` must be the innermost active recovery point of the current thread.
pub(crate) unsafe fn trigger_unwind(point: RecoveryPoint) -> ! {
    unsafe { wasmtime_traps_longjmp(point.as_ptr()) }
}
