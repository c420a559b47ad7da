//! Thread-local state describing the guarded calls active on a thread.
//!
//! A trap handler runs with no context other than the faulting thread's
//! registers, so everything it needs to resume execution is reachable from
//! here. Reads and writes are plain loads and stores to a `const`-initialized
//! thread-local, which is safe to do from a signal handler.

use super::{CallThreadState, Fault};
use crate::sys;
use crate::trap::Trap;
use crate::unwind::RecoveryPoint;
use std::cell::Cell;
use std::mem;
use std::ptr;

pub(crate) type Ptr = *const CallThreadState<'static>;

struct ThreadTrapState {
    /// Innermost active guarded call; the rest are linked through `prev`.
    active: Cell<Ptr>,
    last_fault: Cell<Option<Fault>>,
    /// Whether the lazy per-thread setup has run.
    initialized: Cell<bool>,
}

thread_local! {
    static STATE: ThreadTrapState = const {
        ThreadTrapState {
            active: Cell::new(ptr::null()),
            last_fault: Cell::new(None),
            initialized: Cell::new(false),
        }
    };
}

/// Runs the per-thread setup if it hasn't run on this thread yet.
pub(crate) fn eager_initialize() -> Result<(), Trap> {
    STATE.with(|state| {
        if !state.initialized.get() {
            sys::lazy_per_thread_init()?;
            state.initialized.set(true);
        }
        Ok(())
    })
}

/// Makes `call` the innermost active guarded call for the duration of
/// `closure`, then restores the previous one.
///
/// The previous call is restored even if `closure` unwinds.
pub(crate) fn set<R>(call: &CallThreadState<'_>, closure: impl FnOnce() -> R) -> Result<R, Trap> {
    struct Reset<'a, 'b>(&'a CallThreadState<'b>);

    impl Drop for Reset<'_, '_> {
        fn drop(&mut self) {
            restore(self.0);
        }
    }

    let prev = publish(call)?;
    call.prev.set(prev);
    let reset = Reset(call);
    let ret = closure();
    drop(reset);
    Ok(ret)
}

fn publish(call: &CallThreadState<'_>) -> Result<Ptr, Trap> {
    eager_initialize()?;
    // The `'static` lifetime never leaks out of this module: `with` only
    // hands out references with an anonymous lifetime.
    let ptr = unsafe { mem::transmute::<*const CallThreadState<'_>, Ptr>(call) };
    Ok(STATE.with(|state| state.active.replace(ptr)))
}

fn restore(call: &CallThreadState<'_>) {
    STATE.with(|state| {
        debug_assert!(ptr::addr_eq(state.active.get(), call));
        state.active.set(call.prev.get());
    });
}

/// Calls `closure` with the innermost active guarded call, if any.
pub(crate) fn with<R>(closure: impl FnOnce(Option<&CallThreadState<'_>>) -> R) -> R {
    STATE.with(|state| {
        let p = state.active.get();
        unsafe { closure(if p.is_null() { None } else { Some(&*p) }) }
    })
}

/// Returns the recovery point of the innermost active guarded call, if it is
/// currently executing guest code.
pub(crate) fn query_active() -> Option<RecoveryPoint> {
    with(|call| RecoveryPoint::from_raw(call?.jmp_buf.get()))
}

/// Records `fault` as this thread's most recent fault and returns where the
/// innermost guarded call resumes.
pub(crate) fn record_fault(fault: Fault) -> Option<RecoveryPoint> {
    STATE.with(|state| state.last_fault.set(Some(fault)));
    query_active()
}

pub(crate) fn last_fault() -> Option<Fault> {
    STATE.with(|state| state.last_fault.get())
}
